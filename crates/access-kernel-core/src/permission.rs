//! Static Role × Resource × Action matrix and per-role sensitivity ceilings.
//!
//! The matrix is data. Any combination not listed here denies.

use std::collections::BTreeSet;

use crate::{Action, ContextSensitivity, Resource, Role};

use Action::{
    Administer, Approve, Audit, Backup, Configure, Create, Delete, Export, Invite, Read, Restore,
    Share, Update,
};

type MatrixRow = (Role, Resource, &'static [Action]);

const MATRIX: &[MatrixRow] = &[
    (Role::Viewer, Resource::Memory, &[Read]),
    (Role::Viewer, Resource::Context, &[Read]),
    (Role::Viewer, Resource::Team, &[Read]),
    (Role::Viewer, Resource::Org, &[Read]),
    (Role::Viewer, Resource::User, &[Read]),
    (Role::Member, Resource::Memory, &[Read, Create, Update, Export]),
    (Role::Member, Resource::Context, &[Read, Create, Export]),
    (Role::Member, Resource::Team, &[Read]),
    (Role::Member, Resource::Org, &[Read]),
    (Role::Member, Resource::User, &[Read]),
    (Role::Member, Resource::Invitation, &[Read]),
    (Role::Member, Resource::Api, &[Read]),
    (Role::Maintainer, Resource::Memory, &[Read, Create, Update, Delete, Share, Export]),
    (Role::Maintainer, Resource::Context, &[Read, Create, Update, Delete, Share, Export]),
    (Role::Maintainer, Resource::Team, &[Read, Invite]),
    (Role::Maintainer, Resource::Org, &[Read]),
    (Role::Maintainer, Resource::User, &[Read]),
    (Role::Maintainer, Resource::Invitation, &[Read, Create, Approve]),
    (Role::Maintainer, Resource::Api, &[Read, Create]),
    (Role::Admin, Resource::Memory, &[Read, Create, Update, Delete, Share, Export, Administer]),
    (Role::Admin, Resource::Context, &[Read, Create, Update, Delete, Share, Export, Administer]),
    (Role::Admin, Resource::Team, &[Read, Update, Invite, Administer, Approve, Configure]),
    (Role::Admin, Resource::Org, &[Read]),
    (Role::Admin, Resource::User, &[Read, Invite, Administer]),
    (Role::Admin, Resource::Invitation, &[Read, Create, Update, Delete, Approve]),
    (Role::Admin, Resource::Backup, &[Read, Backup]),
    (Role::Admin, Resource::Api, &[Read, Create, Update, Delete, Configure]),
    (Role::Admin, Resource::Audit, &[Read]),
    (Role::Owner, Resource::Memory, &[Read, Create, Update, Delete, Share, Export, Administer]),
    (Role::Owner, Resource::Context, &[Read, Create, Update, Delete, Share, Export, Administer]),
    (
        Role::Owner,
        Resource::Team,
        &[Read, Update, Delete, Invite, Administer, Approve, Configure],
    ),
    (Role::Owner, Resource::Org, &[Read, Update, Invite, Administer, Configure]),
    (Role::Owner, Resource::User, &[Read, Invite, Administer]),
    (Role::Owner, Resource::Invitation, &[Read, Create, Update, Delete, Approve]),
    (Role::Owner, Resource::Backup, &[Read, Backup, Restore]),
    (Role::Owner, Resource::Api, &[Read, Create, Update, Delete, Configure]),
    (Role::Owner, Resource::Audit, &[Read, Export, Audit]),
];

fn row(role: Role, resource: Resource) -> &'static [Action] {
    MATRIX
        .iter()
        .find(|(row_role, row_resource, _)| *row_role == role && *row_resource == resource)
        .map_or(&[], |(_, _, actions)| *actions)
}

/// Whether the role's base capabilities include `action` on `resource`.
#[must_use]
pub fn base_allows(role: Role, resource: Resource, action: Action) -> bool {
    role == Role::System || row(role, resource).contains(&action)
}

#[must_use]
pub fn allowed_actions(role: Role, resource: Resource) -> BTreeSet<Action> {
    if role == Role::System {
        return Action::ALL.into_iter().collect();
    }
    row(role, resource).iter().copied().collect()
}

/// Highest sensitivity tier the role may act on.
#[must_use]
pub fn max_sensitivity(role: Role) -> ContextSensitivity {
    match role {
        Role::Viewer | Role::Member => ContextSensitivity::Internal,
        Role::Maintainer | Role::Admin => ContextSensitivity::Confidential,
        Role::Owner | Role::System => ContextSensitivity::Restricted,
    }
}

#[must_use]
pub fn within_ceiling(role: Role, tier: ContextSensitivity) -> bool {
    max_sensitivity(role) >= tier
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn letters(actions: &BTreeSet<Action>) -> String {
        actions
            .iter()
            .map(|action| match action {
                Read => "R",
                Create => "C",
                Update => "U",
                Delete => "D",
                Share => "S",
                Export => "E",
                Administer => "A",
                Invite => "I",
                Approve => "Ap",
                Backup => "B",
                Restore => "Rs",
                Configure => "Cf",
                Audit => "Au",
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    // Test IDs: TPM-001
    #[test]
    fn matrix_matches_canonical_table_exhaustively() {
        let expected: &[(Resource, [&str; 5])] = &[
            (Resource::Memory, ["R", "R C U E", "R C U D S E", "R C U D S E A", "R C U D S E A"]),
            (Resource::Context, ["R", "R C E", "R C U D S E", "R C U D S E A", "R C U D S E A"]),
            (Resource::Team, ["R", "R", "R I", "R U A I Ap Cf", "R U D A I Ap Cf"]),
            (Resource::Org, ["R", "R", "R", "R", "R U A I Cf"]),
            (Resource::User, ["R", "R", "R", "R A I", "R A I"]),
            (Resource::Invitation, ["", "R", "R C Ap", "R C U D Ap", "R C U D Ap"]),
            (Resource::Backup, ["", "", "", "R B", "R B Rs"]),
            (Resource::System, ["", "", "", "", ""]),
            (Resource::Api, ["", "R", "R C", "R C U D Cf", "R C U D Cf"]),
            (Resource::Audit, ["", "", "", "R", "R E Au"]),
        ];
        let roles = [Role::Viewer, Role::Member, Role::Maintainer, Role::Admin, Role::Owner];

        for (resource, cells) in expected {
            for (role, cell) in roles.iter().zip(cells.iter()) {
                assert_eq!(
                    letters(&allowed_actions(*role, *resource)),
                    *cell,
                    "{role:?} on {resource:?}"
                );
            }
        }

        for resource in Resource::ALL {
            for action in Action::ALL {
                for role in roles {
                    assert_eq!(
                        base_allows(role, resource, action),
                        allowed_actions(role, resource).contains(&action)
                    );
                }
                assert!(base_allows(Role::System, resource, action));
            }
        }
    }

    // Test IDs: TPM-002
    #[test]
    fn ceilings_follow_role_order() {
        assert_eq!(max_sensitivity(Role::Viewer), ContextSensitivity::Internal);
        assert_eq!(max_sensitivity(Role::Member), ContextSensitivity::Internal);
        assert_eq!(max_sensitivity(Role::Maintainer), ContextSensitivity::Confidential);
        assert_eq!(max_sensitivity(Role::Admin), ContextSensitivity::Confidential);
        assert_eq!(max_sensitivity(Role::Owner), ContextSensitivity::Restricted);
        assert_eq!(max_sensitivity(Role::System), ContextSensitivity::Restricted);
        assert!(!within_ceiling(Role::Admin, ContextSensitivity::Restricted));
        assert!(within_ceiling(Role::Member, ContextSensitivity::Public));
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    fn resource_strategy() -> impl Strategy<Value = Resource> {
        prop::sample::select(Resource::ALL.to_vec())
    }

    proptest! {
        // Test IDs: TPM-003
        #[test]
        fn matrix_is_monotone_in_role_order(
            lower in role_strategy(),
            higher in role_strategy(),
            resource in resource_strategy(),
        ) {
            prop_assume!(lower <= higher);
            let lower_actions = allowed_actions(lower, resource);
            let higher_actions = allowed_actions(higher, resource);
            prop_assert!(lower_actions.is_subset(&higher_actions));
            prop_assert!(max_sensitivity(lower) <= max_sensitivity(higher));
        }
    }
}
