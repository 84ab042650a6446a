use time::OffsetDateTime;

use crate::inheritance::effective_permission_set;
use crate::scope::{chain_for_context, ScopeChain};
use crate::sharing::apply_shares;
use crate::{
    Action, CallerContext, Context, ContextSensitivity, EffectivePermission,
    EffectivePermissionSet, IntegrityError, OrgId, PolicySnapshot, Resource, Team,
};

/// What a decision is about.
#[derive(Debug, Clone, Copy)]
pub enum AccessTarget<'a> {
    Global,
    Org(OrgId),
    Team(&'a Team),
    Context(&'a Context),
}

impl AccessTarget<'_> {
    #[must_use]
    pub fn resource_id(&self) -> Option<String> {
        match self {
            Self::Global => None,
            Self::Org(org_id) => Some(org_id.to_string()),
            Self::Team(team) => Some(team.team_id.to_string()),
            Self::Context(context) => Some(context.context_id.to_string()),
        }
    }

    /// # Errors
    /// Propagates [`IntegrityError`] from the scope resolver.
    pub fn chain(&self, snapshot: &PolicySnapshot) -> Result<ScopeChain, IntegrityError> {
        match self {
            Self::Global => Ok(ScopeChain::global()),
            Self::Org(org_id) => Ok(ScopeChain::for_org(*org_id)),
            Self::Team(team) => Ok(ScopeChain::for_team(team)),
            Self::Context(context) => chain_for_context(context, &snapshot.teams),
        }
    }

    /// A context target always carries its own tier.
    #[must_use]
    pub fn tier(&self, requested: Option<ContextSensitivity>) -> ContextSensitivity {
        match self {
            Self::Context(context) => context.sensitivity_tier,
            _ => requested.unwrap_or(ContextSensitivity::Public),
        }
    }
}

/// Full EPS for a target: role grants along the chain plus shares for contexts.
///
/// # Errors
/// Propagates [`IntegrityError`] for malformed ownership or unknown teams.
pub fn effective_set_for(
    caller: &CallerContext,
    snapshot: &PolicySnapshot,
    resource: Resource,
    target: AccessTarget<'_>,
    tier: Option<ContextSensitivity>,
    now: OffsetDateTime,
) -> Result<(ScopeChain, EffectivePermissionSet), IntegrityError> {
    let chain = target.chain(snapshot)?;
    let tier = target.tier(tier);
    let eps = effective_permission_set(caller, snapshot, &chain, resource, tier, now);
    let eps = match target {
        AccessTarget::Context(context) => apply_shares(
            eps,
            context.context_id,
            &caller.scopes(&snapshot.assignments, now),
            &snapshot.shares,
            now,
        ),
        _ => eps,
    };
    Ok((chain, eps))
}

/// Decide one `(resource, action)` request against a target.
///
/// # Errors
/// Propagates [`IntegrityError`]; every business outcome is in the returned
/// [`EffectivePermission`].
pub fn evaluate(
    caller: &CallerContext,
    snapshot: &PolicySnapshot,
    resource: Resource,
    action: Action,
    target: AccessTarget<'_>,
    tier: Option<ContextSensitivity>,
    now: OffsetDateTime,
) -> Result<(ScopeChain, EffectivePermission), IntegrityError> {
    let (chain, eps) = effective_set_for(caller, snapshot, resource, target, tier, now)?;
    Ok((chain, eps.decide(action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AssignmentId, ContextId, ContextScope, ContextShare, DenyReason, OwnerRef,
        PermissionLevel, Role, RoleAssignment, ScopeBinding, ShareId, ShareTarget, TeamId, UserId,
    };
    use std::collections::BTreeMap;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn personal_context(owner: UserId, tier: ContextSensitivity) -> Context {
        Context {
            context_id: ContextId::new(),
            name: "journal".to_string(),
            scope: ContextScope::Personal,
            owner: OwnerRef::User(owner).to_fields(),
            sensitivity_tier: tier,
            active: true,
            metadata: BTreeMap::new(),
            created_at: fixture_time(),
            updated_at: fixture_time(),
            deleted_at: None,
        }
    }

    fn owner_assignment(user_id: UserId, context_id: ContextId) -> RoleAssignment {
        RoleAssignment {
            assignment_id: AssignmentId::new(),
            user_id,
            role: Role::Owner,
            scope: ScopeBinding::Context(context_id),
            granted_by: user_id,
            granted_at: fixture_time(),
            expires_at: None,
            active: true,
            revoked_at: None,
            revoked_by: None,
        }
    }

    // Test IDs: TEV-001
    #[test]
    fn personal_owner_reaches_restricted_context_and_others_do_not() {
        let owner = UserId::new();
        let context = personal_context(owner, ContextSensitivity::Restricted);
        let snapshot = PolicySnapshot {
            assignments: vec![owner_assignment(owner, context.context_id)],
            ..PolicySnapshot::default()
        };

        let decide = |caller: &CallerContext| match evaluate(
            caller,
            &snapshot,
            Resource::Context,
            Action::Delete,
            AccessTarget::Context(&context),
            None,
            fixture_time(),
        ) {
            Ok((_, permission)) => permission,
            Err(err) => panic!("evaluation should not fail: {err}"),
        };

        assert!(decide(&CallerContext::user(owner)).allowed);
        let outsider =
            CallerContext::user(UserId::new()).with_team_role(TeamId::new(), Role::Owner);
        assert_eq!(decide(&outsider).reason, Some(DenyReason::NoAssignment));
    }

    // Test IDs: TEV-002
    #[test]
    fn share_grants_read_to_recipient_on_context_target() {
        let owner = UserId::new();
        let recipient = UserId::new();
        let context = personal_context(owner, ContextSensitivity::Internal);
        let snapshot = PolicySnapshot {
            assignments: vec![owner_assignment(owner, context.context_id)],
            shares: vec![ContextShare {
                share_id: ShareId::new(),
                context_id: context.context_id,
                target: ShareTarget::User(recipient),
                permission_level: PermissionLevel::Read,
                message: None,
                expires_at: None,
                created_by: owner,
                created_at: fixture_time(),
                revoked_at: None,
                revoked_by: None,
            }],
            teams: Vec::new(),
        };

        let (chain, permission) = match evaluate(
            &CallerContext::user(recipient),
            &snapshot,
            Resource::Memory,
            Action::Read,
            AccessTarget::Context(&context),
            Some(ContextSensitivity::Public),
            fixture_time(),
        ) {
            Ok(result) => result,
            Err(err) => panic!("evaluation should not fail: {err}"),
        };
        assert!(permission.allowed);
        assert!(permission.via_share);
        assert_eq!(permission.tier, ContextSensitivity::Internal);
        assert_eq!(chain.labels().len(), 2);
    }
}
