use std::path::PathBuf;
use std::sync::Arc;

use access_kernel_core::{
    effective_set_for, scope_filter_or_nothing, AccessTarget, Action, AssignmentId,
    CallerContext, Clock, Context, ContextId, ContextSensitivity, Decision, DecisionId,
    DecisionOutcome, DenyReason, EffectivePermission, EffectivePermissionSet, IdentityProvider,
    IntegrityError, KernelError, OrgId, PendingDecision, PermissionDecision, PolicySnapshot,
    Predicate, Resource, Role, RoleAssignment, ScopeBinding, ScopeChain, SystemClock, Team,
    UserId,
};
use access_kernel_store_sqlite::{SchemaStatus, SqliteStore, StoreOptions};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod audit_ops;
mod config;
mod contexts;
mod grants;

pub use config::{KernelConfig, DEFAULT_AUDIT_RETENTION_DAYS, DEFAULT_BUSY_TIMEOUT_MS};
pub use contexts::{ContextPatch, CreateContextRequest, TransferRequest};
pub use grants::{AccessRequest, GrantRoleRequest, PermissionListing, RegisterTeamRequest};

pub const API_CONTRACT_VERSION: &str = "access.v1";

pub type AccessResult<T> = Result<Decision<T>, AccessError>;

/// Failures that are not access decisions. Denials travel in [`Decision`].
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("audit log unavailable: {0:#}")]
    AuditUnavailable(anyhow::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<KernelError> for AccessError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Validation(detail) => Self::Validation(detail),
            KernelError::Integrity(err) => Self::Integrity(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AccessKernel {
    db_path: PathBuf,
    config: KernelConfig,
    clock: Arc<dyn Clock>,
}

impl AccessKernel {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, config: KernelConfig::default(), clock: Arc::new(SystemClock) }
    }

    #[must_use]
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open_with(
            &self.db_path,
            StoreOptions { busy_timeout_ms: self.config.busy_timeout_ms },
        )?;
        store.migrate()?;
        Ok(store)
    }

    /// A store that cannot be opened cannot record the decision either.
    fn open_audited_store(&self) -> Result<SqliteStore, AccessError> {
        self.open_store().map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "access store unavailable");
            AccessError::AuditUnavailable(err)
        })
    }

    pub(crate) fn begin<'a>(
        &'a self,
        caller: &'a CallerContext,
    ) -> Result<Request<'a>, AccessError> {
        let mut store = self.open_audited_store()?;
        let snapshot = match store.load_snapshot(caller) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(
                    caller = %caller.user_id,
                    error = %format!("{err:#}"),
                    "failed to load policy snapshot"
                );
                None
            }
        };
        Ok(Request { kernel: self, store, caller, snapshot, now: self.clock.now() })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> anyhow::Result<SchemaStatus> {
        let store = SqliteStore::open_with(
            &self.db_path,
            StoreOptions { busy_timeout_ms: self.config.busy_timeout_ms },
        )?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> anyhow::Result<MigrateResult> {
        let mut store = SqliteStore::open_with(
            &self.db_path,
            StoreOptions { busy_timeout_ms: self.config.busy_timeout_ms },
        )?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Resolve a verified token into a caller.
    ///
    /// An unreachable identity source is an audited `upstream_unavailable` denial
    /// recorded against the nil user id.
    ///
    /// # Errors
    /// Returns [`AccessError::AuditUnavailable`] when the denial cannot be recorded.
    pub fn caller_from_token(
        &self,
        provider: &dyn IdentityProvider,
        token: &str,
    ) -> AccessResult<CallerContext> {
        match provider.get_caller_context(token) {
            Ok(caller) => Ok(Decision::Allowed(caller)),
            Err(err) => {
                tracing::warn!(error = %err, "identity provider unavailable");
                let mut store = self.open_audited_store()?;
                let pending = PendingDecision::denied(
                    UserId(Ulid::nil()),
                    Resource::User,
                    Action::Read,
                    None,
                    DenyReason::UpstreamUnavailable,
                    self.clock.now(),
                );
                append_audited(&mut store, &pending, self.config.audit_retention_days)?;
                Ok(Decision::Denied(DenyReason::UpstreamUnavailable))
            }
        }
    }

    /// Seed the first global `SYSTEM` grant for an empty deployment.
    ///
    /// # Errors
    /// Returns [`AccessError::Validation`] when a global grant already exists.
    pub fn bootstrap_system_user(&self, user_id: UserId) -> Result<RoleAssignment, AccessError> {
        let mut store = self.open_audited_store()?;
        let now = self.clock.now();
        let existing = store.assignments_for_scope(ScopeBinding::Global)?;
        if existing.iter().any(|assignment| assignment.is_active_at(now)) {
            return Err(AccessError::Validation(
                "a global grant already exists; bootstrap is only for empty deployments"
                    .to_string(),
            ));
        }

        let assignment = RoleAssignment {
            assignment_id: AssignmentId::new(),
            user_id,
            role: Role::System,
            scope: ScopeBinding::Global,
            granted_by: user_id,
            granted_at: now,
            expires_at: None,
            active: true,
            revoked_at: None,
            revoked_by: None,
        };
        let pending = PendingDecision {
            decision_id: DecisionId::new(),
            timestamp: now,
            caller_id: user_id,
            resource: Resource::System,
            action: Action::Administer,
            resource_id: None,
            sensitivity_tier: None,
            decision: DecisionOutcome::Allow,
            reason: None,
            effective_role: Some(Role::System),
            scope_chain: ScopeChain::global().labels(),
        };
        append_audited(&mut store, &pending, self.config.audit_retention_days)?;
        store.insert_assignment(&assignment)?;
        tracing::info!(user = %user_id, "bootstrapped system user");
        Ok(assignment)
    }
}

/// One request: a store connection, the caller, and the policy snapshot read for it.
pub(crate) struct Request<'a> {
    kernel: &'a AccessKernel,
    pub(crate) store: SqliteStore,
    pub(crate) caller: &'a CallerContext,
    snapshot: Option<PolicySnapshot>,
    pub(crate) now: OffsetDateTime,
}

/// An allowed decision and the audit row that recorded it.
#[derive(Debug, Clone)]
pub(crate) struct Gate {
    pub(crate) permission: EffectivePermission,
    pub(crate) record: PermissionDecision,
}

/// A context that the caller passed the gate on, with the filter for the gated write.
pub(crate) struct GatedContext {
    pub(crate) context: Context,
    pub(crate) filter: Predicate,
}

/// A resolved role-assignment scope.
pub(crate) enum ResolvedScope {
    Global,
    Org(OrgId),
    Team(Team),
    Context(Context),
}

impl ResolvedScope {
    pub(crate) fn resource(&self) -> Resource {
        match self {
            Self::Global => Resource::System,
            Self::Org(_) => Resource::Org,
            Self::Team(_) => Resource::Team,
            Self::Context(_) => Resource::Context,
        }
    }

    pub(crate) fn target(&self) -> AccessTarget<'_> {
        match self {
            Self::Global => AccessTarget::Global,
            Self::Org(org_id) => AccessTarget::Org(*org_id),
            Self::Team(team) => AccessTarget::Team(team),
            Self::Context(context) => AccessTarget::Context(context),
        }
    }
}

pub(crate) fn resource_for_binding(binding: ScopeBinding) -> Resource {
    match binding {
        ScopeBinding::Global => Resource::System,
        ScopeBinding::Org(_) => Resource::Org,
        ScopeBinding::Team(_) => Resource::Team,
        ScopeBinding::Context(_) => Resource::Context,
    }
}

pub(crate) fn deny_as(permission: &mut EffectivePermission, reason: DenyReason) {
    permission.allowed = false;
    permission.reason = Some(reason);
}

pub(crate) fn allow_as(permission: &mut EffectivePermission) {
    permission.allowed = true;
    permission.reason = None;
}

impl Request<'_> {
    pub(crate) fn config(&self) -> &KernelConfig {
        &self.kernel.config
    }

    /// The isolation predicate for this caller; no snapshot filters out everything.
    pub(crate) fn filter(&self) -> Predicate {
        scope_filter_or_nothing(self.caller, self.snapshot.as_ref().ok_or(()), self.now)
    }

    pub(crate) fn take_snapshot(&mut self) -> Option<PolicySnapshot> {
        self.snapshot.take()
    }

    /// Treat `grant` as held for the rest of this request.
    pub(crate) fn assume_grant(&mut self, grant: RoleAssignment) {
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.assignments.push(grant);
        }
    }

    pub(crate) fn record(
        &mut self,
        pending: &PendingDecision,
    ) -> Result<PermissionDecision, AccessError> {
        if pending.is_allowed() {
            tracing::debug!(
                caller = %pending.caller_id,
                resource = pending.resource.as_str(),
                action = pending.action.as_str(),
                "access allowed"
            );
        } else {
            tracing::warn!(
                caller = %pending.caller_id,
                resource = pending.resource.as_str(),
                action = pending.action.as_str(),
                reason = pending.reason.map(DenyReason::as_str),
                "access denied"
            );
        }
        append_audited(&mut self.store, pending, self.kernel.config.audit_retention_days)
    }

    /// Record a denial that was reached without evaluating grants.
    pub(crate) fn deny<T>(
        &mut self,
        resource: Resource,
        action: Action,
        resource_id: Option<String>,
        reason: DenyReason,
    ) -> AccessResult<T> {
        let pending = PendingDecision::denied(
            self.caller.user_id,
            resource,
            action,
            resource_id,
            reason,
            self.now,
        );
        self.record(&pending)?;
        Ok(Decision::Denied(reason))
    }

    /// Load a live context for a decision. Missing and unreadable both deny.
    pub(crate) fn lookup_context(&self, context_id: ContextId) -> Result<Context, DenyReason> {
        if self.snapshot.is_none() {
            return Err(DenyReason::UpstreamUnavailable);
        }
        match self.store.context_for_decision(context_id) {
            Ok(Some(context)) => Ok(context),
            Ok(None) => Err(DenyReason::NoAssignment),
            Err(err) => {
                tracing::warn!(
                    context = %context_id,
                    error = %format!("{err:#}"),
                    "failed to load context for decision"
                );
                Err(DenyReason::UpstreamUnavailable)
            }
        }
    }

    pub(crate) fn resolve_binding(
        &self,
        binding: ScopeBinding,
    ) -> Result<ResolvedScope, DenyReason> {
        let Some(snapshot) = self.snapshot.as_ref() else {
            return Err(DenyReason::UpstreamUnavailable);
        };
        match binding {
            ScopeBinding::Global => Ok(ResolvedScope::Global),
            ScopeBinding::Org(org_id) => Ok(ResolvedScope::Org(org_id)),
            ScopeBinding::Team(team_id) => snapshot
                .team(team_id)
                .cloned()
                .map(ResolvedScope::Team)
                .ok_or(DenyReason::NoAssignment),
            ScopeBinding::Context(context_id) => {
                self.lookup_context(context_id).map(ResolvedScope::Context)
            }
        }
    }

    pub(crate) fn authorize(
        &mut self,
        resource: Resource,
        action: Action,
        target: AccessTarget<'_>,
        tier: Option<ContextSensitivity>,
    ) -> AccessResult<Gate> {
        self.authorize_with(resource, action, target, tier, |_, _| {})
    }

    /// Evaluate, let `refine` adjust the outcome, then record it.
    pub(crate) fn authorize_with<F>(
        &mut self,
        resource: Resource,
        action: Action,
        target: AccessTarget<'_>,
        tier: Option<ContextSensitivity>,
        refine: F,
    ) -> AccessResult<Gate>
    where
        F: FnOnce(&EffectivePermissionSet, &mut EffectivePermission),
    {
        let resource_id = target.resource_id();
        let Some(snapshot) = self.snapshot.as_ref() else {
            return self.deny(resource, action, resource_id, DenyReason::UpstreamUnavailable);
        };
        let (chain, eps) =
            match effective_set_for(self.caller, snapshot, resource, target, tier, self.now) {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::error!(
                        caller = %self.caller.user_id,
                        resource = resource.as_str(),
                        action = action.as_str(),
                        error = %err,
                        "integrity violation while resolving access"
                    );
                    return Err(err.into());
                }
            };
        let mut permission = eps.decide(action);
        refine(&eps, &mut permission);

        let pending = PendingDecision::from_permission(
            self.caller.user_id,
            &permission,
            resource_id,
            &chain,
            self.now,
        );
        let record = self.record(&pending)?;
        if permission.allowed {
            Ok(Decision::Allowed(Gate { permission, record }))
        } else {
            Ok(Decision::Denied(permission.reason.unwrap_or(DenyReason::NoAssignment)))
        }
    }

    /// Gate `action` on a stored context.
    ///
    /// The engine decides against the unfiltered row, raised to `raise_tier` when
    /// that is higher, and the decision is downgraded to `scope_mismatch` when the
    /// row falls outside the caller's isolation predicate.
    pub(crate) fn gate_context(
        &mut self,
        context_id: ContextId,
        action: Action,
        raise_tier: Option<ContextSensitivity>,
    ) -> AccessResult<GatedContext> {
        let context = match self.lookup_context(context_id) {
            Ok(context) => context,
            Err(reason) => {
                return self.deny(Resource::Context, action, Some(context_id.to_string()), reason)
            }
        };
        let filter = self.filter();
        let mut candidate = context.clone();
        if let Some(raised) = raise_tier.filter(|raised| *raised > context.sensitivity_tier) {
            candidate.sensitivity_tier = raised;
        }

        let decision = self.authorize_with(
            Resource::Context,
            action,
            AccessTarget::Context(&candidate),
            None,
            |_, permission| {
                if permission.allowed && !filter.matches(&context) {
                    deny_as(permission, DenyReason::ScopeMismatch);
                }
            },
        )?;
        Ok(decision.map(|_| GatedContext { context, filter }))
    }
}

fn append_audited(
    store: &mut SqliteStore,
    pending: &PendingDecision,
    retention_days: u32,
) -> Result<PermissionDecision, AccessError> {
    store.append_decision(pending, retention_days).map_err(|err| {
        tracing::error!(
            caller = %pending.caller_id,
            decision_id = %pending.decision_id,
            error = %format!("{err:#}"),
            "failed to record permission decision"
        );
        AccessError::AuditUnavailable(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use access_kernel_core::{ManualClock, StaticIdentityProvider, UpstreamError};
    use anyhow::Result;
    use time::Duration;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("access-kernel-api-{}.sqlite3", Ulid::new()))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    struct OfflineProvider;

    impl IdentityProvider for OfflineProvider {
        fn get_caller_context(&self, _token: &str) -> Result<CallerContext, UpstreamError> {
            Err(UpstreamError("directory timed out".to_string()))
        }
    }

    // Test IDs: TAPI-001
    #[test]
    fn migrate_dry_run_reports_plan_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let kernel = AccessKernel::new(db_path.clone());

        let planned = kernel.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(kernel.schema_status()?.current_version, 0);

        let applied = kernel.migrate(false)?;
        assert_eq!(applied.after_version, Some(applied.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn offline_identity_provider_is_an_audited_denial() -> Result<()> {
        let db_path = unique_temp_db_path();
        let kernel = AccessKernel::new(db_path.clone())
            .with_clock(Arc::new(ManualClock::new(fixture_time())));

        let decision = kernel.caller_from_token(&OfflineProvider, "token-a")?;
        assert_eq!(decision.denial(), Some(DenyReason::UpstreamUnavailable));

        let known = CallerContext::user(UserId::new());
        let provider = StaticIdentityProvider::new().with_caller("token-b", known.clone());
        assert_eq!(kernel.caller_from_token(&provider, "token-b")?, Decision::Allowed(known));

        let store = kernel.open_store()?;
        assert_eq!(store.decision_count()?, 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn bootstrap_only_succeeds_once() -> Result<()> {
        let db_path = unique_temp_db_path();
        let kernel = AccessKernel::new(db_path.clone());

        let root = UserId::new();
        let grant = kernel.bootstrap_system_user(root)?;
        assert_eq!(grant.role, Role::System);
        assert!(matches!(
            kernel.bootstrap_system_user(UserId::new()),
            Err(AccessError::Validation(_))
        ));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn kernel_errors_map_onto_access_errors() {
        let validation: AccessError = KernelError::Validation("bad".to_string()).into();
        assert!(matches!(validation, AccessError::Validation(_)));
        let integrity: AccessError =
            KernelError::Integrity(IntegrityError::UnknownTeam(access_kernel_core::TeamId::new()))
                .into();
        assert!(matches!(integrity, AccessError::Integrity(_)));
    }
}
