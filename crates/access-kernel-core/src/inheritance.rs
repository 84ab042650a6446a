//! Effective permission set: role grants merged along a scope chain.
//!
//! The highest bound level holding any applicable grant decides and lower
//! levels are ignored. Grants at the same level union their capabilities.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::permission::{allowed_actions, within_ceiling};
use crate::{
    Action, CallerContext, ContextSensitivity, DenyReason, PolicySnapshot, Resource, Role,
    ScopeChain, ScopeLevel,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EffectivePermissionSet {
    pub resource: Resource,
    pub tier: ContextSensitivity,
    /// Level that won precedence, if any grant applied.
    pub level: Option<ScopeLevel>,
    /// Most permissive role at the winning level.
    pub role_used: Option<Role>,
    pub actions: BTreeSet<Action>,
    /// Actions that were withheld only because of a sensitivity ceiling.
    pub capped_actions: BTreeSet<Action>,
    /// Actions granted through an active share.
    pub share_actions: BTreeSet<Action>,
    /// Actions an expired share would have granted.
    pub expired_share_actions: BTreeSet<Action>,
}

impl EffectivePermissionSet {
    #[must_use]
    pub fn empty(resource: Resource, tier: ContextSensitivity) -> Self {
        Self {
            resource,
            tier,
            level: None,
            role_used: None,
            actions: BTreeSet::new(),
            capped_actions: BTreeSet::new(),
            share_actions: BTreeSet::new(),
            expired_share_actions: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn allows(&self, action: Action) -> bool {
        self.actions.contains(&action) || self.share_actions.contains(&action)
    }

    #[must_use]
    pub fn tier_capped(&self) -> bool {
        !self.capped_actions.is_empty()
    }

    fn holds_anything(&self) -> bool {
        self.role_used.is_some() || !self.share_actions.is_empty()
    }

    /// Resolve one action against the set, picking the denial reason by
    /// precedence `tier_exceeded > expired_share > action_not_permitted > no_assignment`.
    #[must_use]
    pub fn decide(&self, action: Action) -> EffectivePermission {
        let via_share = !self.actions.contains(&action) && self.share_actions.contains(&action);
        let reason = if self.allows(action) {
            None
        } else if self.capped_actions.contains(&action) {
            Some(DenyReason::TierExceeded)
        } else if self.expired_share_actions.contains(&action) {
            Some(DenyReason::ExpiredShare)
        } else if self.holds_anything() {
            Some(DenyReason::ActionNotPermitted)
        } else {
            Some(DenyReason::NoAssignment)
        };
        EffectivePermission {
            resource: self.resource,
            action,
            tier: self.tier,
            role_used: self.role_used,
            level: self.level,
            allowed: reason.is_none(),
            via_share,
            tier_capped: self.capped_actions.contains(&action),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EffectivePermission {
    pub resource: Resource,
    pub action: Action,
    pub tier: ContextSensitivity,
    pub role_used: Option<Role>,
    pub level: Option<ScopeLevel>,
    pub allowed: bool,
    pub via_share: bool,
    pub tier_capped: bool,
    pub reason: Option<DenyReason>,
}

/// Compute role-derived capabilities of `caller` on `resource` at `tier`.
#[must_use]
pub fn effective_permission_set(
    caller: &CallerContext,
    snapshot: &PolicySnapshot,
    chain: &ScopeChain,
    resource: Resource,
    tier: ContextSensitivity,
    now: OffsetDateTime,
) -> EffectivePermissionSet {
    let applicable: Vec<(Role, ScopeLevel)> = caller
        .active_grants(&snapshot.assignments, now)
        .into_iter()
        .filter(|(_, binding)| chain.contains(*binding))
        .map(|(role, binding)| (role, binding.level()))
        .collect();

    let mut eps = EffectivePermissionSet::empty(resource, tier);
    let Some(level) = ScopeLevel::PRECEDENCE
        .into_iter()
        .find(|level| applicable.iter().any(|(_, grant_level)| grant_level == level))
    else {
        return eps;
    };

    eps.level = Some(level);
    for (role, _) in applicable.iter().filter(|(_, grant_level)| *grant_level == level) {
        eps.role_used = eps.role_used.max(Some(*role));
        let granted = allowed_actions(*role, resource);
        if within_ceiling(*role, tier) {
            eps.actions.extend(granted);
        } else {
            eps.capped_actions.extend(granted);
        }
    }
    let actions = eps.actions.clone();
    eps.capped_actions.retain(|action| !actions.contains(action));
    eps
}

/// Decide one action from role grants alone.
#[must_use]
pub fn effective_permission(
    caller: &CallerContext,
    snapshot: &PolicySnapshot,
    chain: &ScopeChain,
    resource: Resource,
    action: Action,
    tier: ContextSensitivity,
    now: OffsetDateTime,
) -> EffectivePermission {
    effective_permission_set(caller, snapshot, chain, resource, tier, now).decide(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssignmentId, OrgId, RoleAssignment, ScopeBinding, Team, TeamId, UserId};
    use proptest::prelude::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn grant(user_id: UserId, role: Role, scope: ScopeBinding) -> RoleAssignment {
        RoleAssignment {
            assignment_id: AssignmentId::new(),
            user_id,
            role,
            scope,
            granted_by: UserId::new(),
            granted_at: fixture_time(),
            expires_at: None,
            active: true,
            revoked_at: None,
            revoked_by: None,
        }
    }

    fn team_in(org_id: OrgId) -> Team {
        Team {
            team_id: TeamId::new(),
            org_id: Some(org_id),
            name: "ops".to_string(),
            created_at: fixture_time(),
        }
    }

    // Test IDs: TINH-001
    #[test]
    fn org_grant_overrides_team_grant() {
        let org_id = OrgId::new();
        let team = team_in(org_id);
        let caller = CallerContext::user(UserId::new());
        let snapshot = PolicySnapshot {
            assignments: vec![
                grant(caller.user_id, Role::Viewer, ScopeBinding::Org(org_id)),
                grant(caller.user_id, Role::Admin, ScopeBinding::Team(team.team_id)),
            ],
            teams: vec![team.clone()],
            ..PolicySnapshot::default()
        };
        let chain = ScopeChain::for_team(&team);

        let eps = effective_permission_set(
            &caller,
            &snapshot,
            &chain,
            Resource::Context,
            ContextSensitivity::Internal,
            fixture_time(),
        );
        assert_eq!(eps.level, Some(ScopeLevel::Org));
        assert_eq!(eps.role_used, Some(Role::Viewer));
        assert_eq!(eps.decide(Action::Delete).reason, Some(DenyReason::ActionNotPermitted));
        assert!(eps.decide(Action::Read).allowed);
    }

    // Test IDs: TINH-002
    #[test]
    fn grants_at_same_level_union() {
        let org_id = OrgId::new();
        let team = team_in(org_id);
        let caller = CallerContext::user(UserId::new()).with_team_role(team.team_id, Role::Member);
        let snapshot = PolicySnapshot {
            assignments: vec![grant(
                caller.user_id,
                Role::Maintainer,
                ScopeBinding::Team(team.team_id),
            )],
            ..PolicySnapshot::default()
        };

        let eps = effective_permission_set(
            &caller,
            &snapshot,
            &ScopeChain::for_team(&team),
            Resource::Memory,
            ContextSensitivity::Internal,
            fixture_time(),
        );
        assert_eq!(eps.role_used, Some(Role::Maintainer));
        assert!(eps.allows(Action::Delete));
        assert!(eps.allows(Action::Export));
    }

    // Test IDs: TINH-003
    #[test]
    fn ceiling_caps_admin_on_restricted_tier() {
        let org_id = OrgId::new();
        let caller = CallerContext::user(UserId::new()).with_org_role(org_id, Role::Admin);
        let permission = effective_permission(
            &caller,
            &PolicySnapshot::default(),
            &ScopeChain::for_org(org_id),
            Resource::Context,
            Action::Read,
            ContextSensitivity::Restricted,
            fixture_time(),
        );
        assert!(!permission.allowed);
        assert!(permission.tier_capped);
        assert_eq!(permission.reason, Some(DenyReason::TierExceeded));
        assert_eq!(permission.role_used, Some(Role::Admin));
    }

    // Test IDs: TINH-004
    #[test]
    fn no_grant_in_chain_is_no_assignment() {
        let caller = CallerContext::user(UserId::new()).with_org_role(OrgId::new(), Role::Owner);
        let permission = effective_permission(
            &caller,
            &PolicySnapshot::default(),
            &ScopeChain::for_org(OrgId::new()),
            Resource::Context,
            Action::Read,
            ContextSensitivity::Public,
            fixture_time(),
        );
        assert_eq!(permission.reason, Some(DenyReason::NoAssignment));
        assert_eq!(permission.role_used, None);
    }

    // Test IDs: TINH-005
    #[test]
    fn expired_and_revoked_assignments_do_not_apply() {
        let caller = CallerContext::user(UserId::new());
        let mut expired = grant(caller.user_id, Role::Owner, ScopeBinding::Global);
        expired.expires_at = Some(fixture_time());
        let mut revoked = grant(caller.user_id, Role::Owner, ScopeBinding::Global);
        revoked.active = false;
        revoked.revoked_at = Some(fixture_time() - Duration::minutes(1));
        let snapshot =
            PolicySnapshot { assignments: vec![expired, revoked], ..PolicySnapshot::default() };

        let permission = effective_permission(
            &caller,
            &snapshot,
            &ScopeChain::global(),
            Resource::Audit,
            Action::Read,
            ContextSensitivity::Public,
            fixture_time(),
        );
        assert_eq!(permission.reason, Some(DenyReason::NoAssignment));
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    fn level_strategy() -> impl Strategy<Value = ScopeLevel> {
        prop::sample::select(ScopeLevel::PRECEDENCE.to_vec())
    }

    proptest! {
        // Test IDs: TINH-006
        #[test]
        fn winning_level_is_highest_bound_level(
            grants in prop::collection::vec((role_strategy(), level_strategy()), 1..8),
        ) {
            let org_id = OrgId::new();
            let team = team_in(org_id);
            let context_id = crate::ContextId::new();
            let caller = CallerContext::user(UserId::new());
            let assignments = grants
                .iter()
                .map(|(role, level)| {
                    let scope = match level {
                        ScopeLevel::Global => ScopeBinding::Global,
                        ScopeLevel::Org => ScopeBinding::Org(org_id),
                        ScopeLevel::Team => ScopeBinding::Team(team.team_id),
                        ScopeLevel::Context => ScopeBinding::Context(context_id),
                    };
                    grant(caller.user_id, *role, scope)
                })
                .collect();
            let snapshot = PolicySnapshot { assignments, ..PolicySnapshot::default() };
            let chain = ScopeChain::for_team(&team).with(ScopeBinding::Context(context_id));

            let eps = effective_permission_set(
                &caller,
                &snapshot,
                &chain,
                Resource::Context,
                ContextSensitivity::Public,
                fixture_time(),
            );
            let top = grants.iter().map(|(_, level)| *level).min();
            prop_assert_eq!(eps.level, top);
            let top_roles = grants
                .iter()
                .filter(|(_, level)| Some(*level) == top)
                .map(|(role, _)| *role);
            prop_assert_eq!(eps.role_used, top_roles.max());
        }
    }
}
