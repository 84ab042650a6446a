use std::collections::BTreeMap;

use access_kernel_core::{
    evaluate, validate_on_create, AccessTarget, Action, AssignmentId, CallerContext, Context,
    ContextId, ContextScope, ContextSensitivity, Decision, DecisionId, DecisionOutcome, DenyReason,
    OwnerFields, OwnerRef, PendingDecision, Resource, Role, RoleAssignment, ScopeBinding, UserId,
};
use access_kernel_store_sqlite::{ContextQuery, OwnershipTransfer};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{AccessError, AccessKernel, AccessResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateContextRequest {
    pub name: String,
    pub scope: ContextScope,
    #[serde(flatten)]
    pub owner: OwnerFields,
    pub sensitivity_tier: ContextSensitivity,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Fields left `None` keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextPatch {
    pub name: Option<String>,
    pub sensitivity_tier: Option<ContextSensitivity>,
    pub active: Option<bool>,
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub scope: ContextScope,
    #[serde(flatten)]
    pub owner: OwnerFields,
}

fn owner_grant(
    user_id: UserId,
    context_id: ContextId,
    granted_by: UserId,
    now: OffsetDateTime,
) -> RoleAssignment {
    RoleAssignment {
        assignment_id: AssignmentId::new(),
        user_id,
        role: Role::Owner,
        scope: ScopeBinding::Context(context_id),
        granted_by,
        granted_at: now,
        expires_at: None,
        active: true,
        revoked_at: None,
        revoked_by: None,
    }
}

impl AccessKernel {
    /// Create a context after checking the ownership invariant and CREATE at its scope.
    ///
    /// A personal context also receives a context-scope `OWNER` grant for its owner.
    ///
    /// # Errors
    /// [`AccessError::Integrity`] when the owner fields do not match the scope or
    /// name an unknown team, [`AccessError::Validation`] for an empty name.
    pub fn create_context(
        &self,
        caller: &CallerContext,
        request: CreateContextRequest,
    ) -> AccessResult<Context> {
        let owner = validate_on_create(request.scope, &request.owner)?;
        if request.name.trim().is_empty() {
            return Err(AccessError::Validation("context name MUST be non-empty".to_string()));
        }

        let mut req = self.begin(caller)?;
        let now = req.now;
        let context = Context {
            context_id: ContextId::new(),
            name: request.name,
            scope: request.scope,
            owner: request.owner,
            sensitivity_tier: request.sensitivity_tier,
            active: true,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let grant = match owner {
            OwnerRef::User(user_id) => Some(owner_grant(user_id, context.context_id, user_id, now)),
            OwnerRef::Team(_) | OwnerRef::Org(_) => None,
        };
        if let Some(grant) = grant.as_ref().filter(|grant| grant.user_id == caller.user_id) {
            req.assume_grant(grant.clone());
        }

        let target = AccessTarget::Context(&context);
        let decision = req.authorize(Resource::Context, Action::Create, target, None)?;
        if let Decision::Denied(reason) = decision {
            return Ok(Decision::Denied(reason));
        }
        req.store.insert_context(&context, grant.as_ref())?;
        Ok(Decision::Allowed(context))
    }

    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded;
    /// [`AccessError::Integrity`] for a malformed stored context.
    pub fn get_context(
        &self,
        caller: &CallerContext,
        context_id: ContextId,
    ) -> AccessResult<Context> {
        let mut req = self.begin(caller)?;
        let gated = match req.gate_context(context_id, Action::Read, None)? {
            Decision::Allowed(gated) => gated,
            Decision::Denied(reason) => return Ok(Decision::Denied(reason)),
        };
        match req.store.get_context(context_id, &gated.filter)? {
            Some(context) => Ok(Decision::Allowed(context)),
            None => Ok(Decision::Denied(DenyReason::NoAssignment)),
        }
    }

    /// List contexts visible to `caller`, guardrail-filtered in SQL and then
    /// re-checked one row at a time. One audit record covers the whole call.
    ///
    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn list_contexts(
        &self,
        caller: &CallerContext,
        query: &ContextQuery,
    ) -> AccessResult<Vec<Context>> {
        let mut req = self.begin(caller)?;
        let filter = req.filter();
        let Some(snapshot) = req.take_snapshot() else {
            return req.deny(
                Resource::Context,
                Action::Read,
                None,
                DenyReason::UpstreamUnavailable,
            );
        };
        let rows = match req.store.list_contexts(&filter, query) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(
                    caller = %caller.user_id,
                    error = %format!("{err:#}"),
                    "failed to list contexts"
                );
                return req.deny(
                    Resource::Context,
                    Action::Read,
                    None,
                    DenyReason::UpstreamUnavailable,
                );
            }
        };

        let mut visible = Vec::with_capacity(rows.len());
        let mut role_used = None;
        for context in rows {
            let (_, permission) = evaluate(
                caller,
                &snapshot,
                Resource::Context,
                Action::Read,
                AccessTarget::Context(&context),
                None,
                req.now,
            )?;
            if permission.allowed {
                role_used = role_used.max(permission.role_used);
                visible.push(context);
            }
        }

        req.record(&PendingDecision {
            decision_id: DecisionId::new(),
            timestamp: req.now,
            caller_id: caller.user_id,
            resource: Resource::Context,
            action: Action::Read,
            resource_id: None,
            sensitivity_tier: None,
            decision: DecisionOutcome::Allow,
            reason: None,
            effective_role: role_used,
            scope_chain: Vec::new(),
        })?;
        Ok(Decision::Allowed(visible))
    }

    /// Apply `patch`. Raising the tier is decided against the new tier.
    ///
    /// # Errors
    /// [`AccessError::Validation`] for an empty new name.
    pub fn update_context(
        &self,
        caller: &CallerContext,
        context_id: ContextId,
        patch: ContextPatch,
    ) -> AccessResult<Context> {
        if patch.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(AccessError::Validation("context name MUST be non-empty".to_string()));
        }

        let mut req = self.begin(caller)?;
        let gated = match req.gate_context(context_id, Action::Update, patch.sensitivity_tier)? {
            Decision::Allowed(gated) => gated,
            Decision::Denied(reason) => return Ok(Decision::Denied(reason)),
        };

        let mut updated = gated.context;
        if let Some(name) = patch.name {
            updated.name = name;
        }
        if let Some(tier) = patch.sensitivity_tier {
            updated.sensitivity_tier = tier;
        }
        if let Some(active) = patch.active {
            updated.active = active;
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = req.now;

        if req.store.update_context(&updated, &gated.filter)? {
            Ok(Decision::Allowed(updated))
        } else {
            Ok(Decision::Denied(DenyReason::NoAssignment))
        }
    }

    /// Soft-delete a context.
    ///
    /// # Errors
    /// [`AccessError::AuditUnavailable`] when the decision cannot be recorded.
    pub fn delete_context(
        &self,
        caller: &CallerContext,
        context_id: ContextId,
    ) -> AccessResult<()> {
        let mut req = self.begin(caller)?;
        let gated = match req.gate_context(context_id, Action::Delete, None)? {
            Decision::Allowed(gated) => gated,
            Decision::Denied(reason) => return Ok(Decision::Denied(reason)),
        };
        if req.store.soft_delete_context(context_id, req.now, &gated.filter)? {
            Ok(Decision::Allowed(()))
        } else {
            Ok(Decision::Denied(DenyReason::NoAssignment))
        }
    }

    /// Move a context to a new owner.
    ///
    /// Needs ADMINISTER on the context where it is and CREATE where it lands;
    /// both decisions are audited. Owner fields and owner grants swap in one
    /// transaction.
    ///
    /// # Errors
    /// [`AccessError::Integrity`] when the new owner does not match the new scope.
    pub fn transfer_ownership(
        &self,
        caller: &CallerContext,
        context_id: ContextId,
        request: TransferRequest,
    ) -> AccessResult<Context> {
        let new_owner = validate_on_create(request.scope, &request.owner)?;

        let mut req = self.begin(caller)?;
        let gated = match req.gate_context(context_id, Action::Administer, None)? {
            Decision::Allowed(gated) => gated,
            Decision::Denied(reason) => return Ok(Decision::Denied(reason)),
        };

        let mut moved = gated.context.clone();
        moved.scope = request.scope;
        moved.owner = request.owner;
        moved.updated_at = req.now;
        let grant = match new_owner {
            OwnerRef::User(user_id) => {
                Some(owner_grant(user_id, context_id, caller.user_id, req.now))
            }
            OwnerRef::Team(_) | OwnerRef::Org(_) => None,
        };
        if let Some(grant) = grant.as_ref().filter(|grant| grant.user_id == caller.user_id) {
            req.assume_grant(grant.clone());
        }

        // A team or org destination is decided at that scope alone, so grants on
        // the context itself cannot carry it into another tenant.
        let landing = match new_owner {
            OwnerRef::User(_) => {
                let target = AccessTarget::Context(&moved);
                req.authorize(Resource::Context, Action::Create, target, None)?
            }
            OwnerRef::Team(team_id) => {
                let binding = ScopeBinding::Team(team_id);
                match req.resolve_binding(binding) {
                    Ok(resolved) => req.authorize(
                        Resource::Context,
                        Action::Create,
                        resolved.target(),
                        Some(moved.sensitivity_tier),
                    )?,
                    Err(reason) => {
                        req.deny(Resource::Context, Action::Create, binding.scope_id(), reason)?
                    }
                }
            }
            OwnerRef::Org(org_id) => req.authorize(
                Resource::Context,
                Action::Create,
                AccessTarget::Org(org_id),
                Some(moved.sensitivity_tier),
            )?,
        };
        if let Decision::Denied(reason) = landing {
            return Ok(Decision::Denied(reason));
        }

        let transfer = OwnershipTransfer {
            context: &moved,
            previous_owner_user: gated.context.owner.owner_user_id,
            new_owner_grant: grant.as_ref(),
            transferred_by: caller.user_id,
        };
        if !req.store.transfer_context(&transfer, &gated.filter)? {
            return Ok(Decision::Denied(DenyReason::NoAssignment));
        }
        tracing::info!(
            caller = %caller.user_id,
            context = %context_id,
            from = %gated.context.scope,
            to = %moved.scope,
            "transferred context ownership"
        );
        Ok(Decision::Allowed(moved))
    }
}
