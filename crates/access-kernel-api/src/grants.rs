use access_kernel_core::{
    create_share, validate_share_request, AccessTarget, Action, AssignmentId, CallerContext,
    ContextId, ContextSensitivity, ContextShare, Decision, DenyReason, EffectivePermission, OrgId,
    Resource, Role, RoleAssignment, ScopeBinding, ShareError, ShareId, ShareRequest, Team, TeamId,
    UserId,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    allow_as, deny_as, resource_for_binding, AccessError, AccessKernel, AccessResult,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterTeamRequest {
    pub name: String,
    pub org_id: Option<OrgId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GrantRoleRequest {
    pub user_id: UserId,
    pub role: Role,
    pub scope: ScopeBinding,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// A generic decision request. `sensitivity_tier` is ignored for context
/// targets, which carry their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRequest {
    pub resource: Resource,
    pub action: Action,
    pub target: ScopeBinding,
    #[serde(default)]
    pub sensitivity_tier: Option<ContextSensitivity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionListing {
    pub context_id: ContextId,
    pub assignments: Vec<RoleAssignment>,
    pub shares: Vec<ContextShare>,
}

fn require_future(
    expires_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Result<(), AccessError> {
    match expires_at {
        Some(expires_at) if expires_at <= now => {
            Err(AccessError::Validation("expires_at MUST be in the future".to_string()))
        }
        _ => Ok(()),
    }
}

impl AccessKernel {
    /// Add a team to the directory. Needs ADMINISTER on ORG for the team's org,
    /// or at global scope for a team without one.
    ///
    /// # Errors
    /// [`AccessError::Validation`] for an empty name.
    pub fn register_team(
        &self,
        caller: &CallerContext,
        request: RegisterTeamRequest,
    ) -> AccessResult<Team> {
        if request.name.trim().is_empty() {
            return Err(AccessError::Validation("team name MUST be non-empty".to_string()));
        }

        let mut req = self.begin(caller)?;
        let target = request.org_id.map_or(AccessTarget::Global, AccessTarget::Org);
        if let Decision::Denied(reason) =
            req.authorize(Resource::Org, Action::Administer, target, None)?
        {
            return Ok(Decision::Denied(reason));
        }

        let team = Team {
            team_id: TeamId::new(),
            org_id: request.org_id,
            name: request.name,
            created_at: req.now,
        };
        req.store.insert_team(&team)?;
        tracing::info!(caller = %caller.user_id, team = %team.team_id, "registered team");
        Ok(Decision::Allowed(team))
    }

    /// Grant `role` at `scope`.
    ///
    /// The caller needs ADMINISTER on the resource the scope names and may not
    /// grant a role above its own at that scope.
    ///
    /// # Errors
    /// [`AccessError::Validation`] for an expiry that is not in the future.
    pub fn grant_role(
        &self,
        caller: &CallerContext,
        request: GrantRoleRequest,
    ) -> AccessResult<RoleAssignment> {
        let mut req = self.begin(caller)?;
        require_future(request.expires_at, req.now)?;

        let resolved = match req.resolve_binding(request.scope) {
            Ok(resolved) => resolved,
            Err(reason) => {
                return req.deny(
                    resource_for_binding(request.scope),
                    Action::Administer,
                    request.scope.scope_id(),
                    reason,
                )
            }
        };
        let decision = req.authorize_with(
            resolved.resource(),
            Action::Administer,
            resolved.target(),
            None,
            |eps, permission| {
                if permission.allowed && eps.role_used.map_or(true, |held| request.role > held) {
                    deny_as(permission, DenyReason::ActionNotPermitted);
                }
            },
        )?;
        if let Decision::Denied(reason) = decision {
            return Ok(Decision::Denied(reason));
        }

        let assignment = RoleAssignment {
            assignment_id: AssignmentId::new(),
            user_id: request.user_id,
            role: request.role,
            scope: request.scope,
            granted_by: caller.user_id,
            granted_at: req.now,
            expires_at: request.expires_at,
            active: true,
            revoked_at: None,
            revoked_by: None,
        };
        req.store.insert_assignment(&assignment)?;
        tracing::info!(
            caller = %caller.user_id,
            user = %assignment.user_id,
            role = assignment.role.as_str(),
            scope = assignment.scope.level().as_str(),
            "granted role"
        );
        Ok(Decision::Allowed(assignment))
    }

    /// Soft-revoke an assignment. Revoking twice is allowed and changes nothing.
    ///
    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn revoke_role(
        &self,
        caller: &CallerContext,
        assignment_id: AssignmentId,
    ) -> AccessResult<()> {
        let mut req = self.begin(caller)?;
        let assignment = match req.store.get_assignment(assignment_id) {
            Ok(Some(assignment)) => assignment,
            Ok(None) => {
                return req.deny(
                    Resource::User,
                    Action::Administer,
                    Some(assignment_id.to_string()),
                    DenyReason::NoAssignment,
                )
            }
            Err(err) => {
                tracing::warn!(
                    assignment = %assignment_id,
                    error = %format!("{err:#}"),
                    "failed to load role assignment"
                );
                return req.deny(
                    Resource::User,
                    Action::Administer,
                    Some(assignment_id.to_string()),
                    DenyReason::UpstreamUnavailable,
                );
            }
        };

        let resolved = match req.resolve_binding(assignment.scope) {
            Ok(resolved) => resolved,
            Err(reason) => {
                return req.deny(
                    resource_for_binding(assignment.scope),
                    Action::Administer,
                    assignment.scope.scope_id(),
                    reason,
                )
            }
        };
        if let Decision::Denied(reason) =
            req.authorize(resolved.resource(), Action::Administer, resolved.target(), None)?
        {
            return Ok(Decision::Denied(reason));
        }

        if req.store.revoke_assignment(assignment_id, caller.user_id, req.now)? {
            tracing::info!(caller = %caller.user_id, assignment = %assignment_id, "revoked role");
        } else {
            tracing::debug!(assignment = %assignment_id, "role already revoked");
        }
        Ok(Decision::Allowed(()))
    }

    /// Share a context with a user, team, or org.
    ///
    /// A sharer that can see the context but lacks SHARE is denied
    /// `invalid_target`; an audience whose weakest role cannot see the context's
    /// tier is denied `tier_exceeded`.
    ///
    /// # Errors
    /// [`AccessError::Validation`] for an expiry that is not in the future. No
    /// decision is recorded for a request that fails validation.
    pub fn share_context(
        &self,
        caller: &CallerContext,
        request: ShareRequest,
    ) -> AccessResult<ContextShare> {
        let mut req = self.begin(caller)?;
        let now = req.now;

        let context = match req.lookup_context(request.context_id) {
            Ok(context) => context,
            Err(reason) => {
                return req.deny(
                    Resource::Context,
                    Action::Share,
                    Some(request.context_id.to_string()),
                    reason,
                )
            }
        };
        validate_share_request(&context, &request, now)
            .map_err(|err| AccessError::Validation(err.to_string()))?;
        let max_lifetime = req.config().max_share_lifetime();

        let mut built = None;
        let decision = req.authorize_with(
            Resource::Context,
            Action::Share,
            AccessTarget::Context(&context),
            None,
            |eps, permission| {
                let result =
                    create_share(eps, &context, &request, caller.user_id, now, max_lifetime);
                match &result {
                    Err(ShareError::InvalidTarget(_)) if eps.allows(Action::Read) => {
                        deny_as(permission, DenyReason::InvalidTarget);
                    }
                    Err(ShareError::InvalidSensitivity { .. }) => {
                        deny_as(permission, DenyReason::TierExceeded);
                    }
                    // Never record an allow for a share that will not be written.
                    Err(ShareError::Validation(_)) => {
                        deny_as(permission, DenyReason::InvalidTarget);
                    }
                    Err(ShareError::InvalidTarget(_)) | Ok(_) => {}
                }
                built = Some(result);
            },
        )?;
        if let Decision::Denied(reason) = decision {
            return Ok(Decision::Denied(reason));
        }

        let share = match built {
            Some(Ok(share)) => share,
            Some(Err(err)) => return Err(AccessError::Validation(err.to_string())),
            None => return Ok(Decision::Denied(DenyReason::NoAssignment)),
        };
        req.store.insert_share(&share)?;
        tracing::info!(
            caller = %caller.user_id,
            context = %share.context_id,
            target = share.target.target_type(),
            level = share.permission_level.as_str(),
            "shared context"
        );
        Ok(Decision::Allowed(share))
    }

    /// Soft-revoke a share. Allowed for its creator or any holder of SHARE on
    /// the context; revoking twice changes nothing.
    ///
    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn revoke_share(&self, caller: &CallerContext, share_id: ShareId) -> AccessResult<()> {
        let mut req = self.begin(caller)?;
        let share = match req.store.get_share(share_id) {
            Ok(Some(share)) => share,
            Ok(None) => {
                return req.deny(
                    Resource::Context,
                    Action::Share,
                    Some(share_id.to_string()),
                    DenyReason::NoAssignment,
                )
            }
            Err(err) => {
                tracing::warn!(
                    share = %share_id,
                    error = %format!("{err:#}"),
                    "failed to load context share"
                );
                return req.deny(
                    Resource::Context,
                    Action::Share,
                    Some(share_id.to_string()),
                    DenyReason::UpstreamUnavailable,
                );
            }
        };
        let context = match req.lookup_context(share.context_id) {
            Ok(context) => context,
            Err(reason) => {
                return req.deny(
                    Resource::Context,
                    Action::Share,
                    Some(share.context_id.to_string()),
                    reason,
                )
            }
        };

        let decision = req.authorize_with(
            Resource::Context,
            Action::Share,
            AccessTarget::Context(&context),
            None,
            |_, permission| {
                if share.created_by == caller.user_id {
                    allow_as(permission);
                }
            },
        )?;
        if let Decision::Denied(reason) = decision {
            return Ok(Decision::Denied(reason));
        }

        if req.store.revoke_share(share_id, caller.user_id, req.now)? {
            tracing::info!(caller = %caller.user_id, share = %share_id, "revoked context share");
        } else {
            tracing::debug!(share = %share_id, "share already revoked");
        }
        Ok(Decision::Allowed(()))
    }

    /// Every assignment and share on a context, including inactive ones.
    ///
    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn list_permissions(
        &self,
        caller: &CallerContext,
        context_id: ContextId,
    ) -> AccessResult<PermissionListing> {
        let mut req = self.begin(caller)?;
        if let Decision::Denied(reason) = req.gate_context(context_id, Action::Administer, None)? {
            return Ok(Decision::Denied(reason));
        }
        Ok(Decision::Allowed(PermissionListing {
            context_id,
            assignments: req.store.assignments_for_scope(ScopeBinding::Context(context_id))?,
            shares: req.store.shares_for_context(context_id)?,
        }))
    }

    /// Decide one request without acting on it.
    ///
    /// # Errors
    /// [`AccessError::Integrity`] for a malformed target.
    pub fn check_access(
        &self,
        caller: &CallerContext,
        request: &AccessRequest,
    ) -> AccessResult<EffectivePermission> {
        let mut req = self.begin(caller)?;
        let resolved = match req.resolve_binding(request.target) {
            Ok(resolved) => resolved,
            Err(reason) => {
                return req.deny(request.resource, request.action, request.target.scope_id(), reason)
            }
        };
        let decision = req.authorize(
            request.resource,
            request.action,
            resolved.target(),
            request.sensitivity_tier,
        )?;
        Ok(decision.map(|gate| gate.permission))
    }
}
