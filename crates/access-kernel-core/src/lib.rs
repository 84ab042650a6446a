use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod audit;
pub mod evaluate;
pub mod guardrail;
pub mod identity;
pub mod inheritance;
pub mod permission;
pub mod scope;
pub mod sharing;

pub use audit::{AuditFilter, DecisionOutcome, PendingDecision, PermissionDecision};
pub use evaluate::{effective_set_for, evaluate, AccessTarget};
pub use guardrail::{
    scope_filter, scope_filter_or_nothing, ContextField, Predicate, ScopeFilterBuilder,
};
pub use identity::{
    CallerContext, CallerScopes, IdentityProvider, OrgRole, StaticIdentityProvider, TeamRole,
};
pub use inheritance::{
    effective_permission, effective_permission_set, EffectivePermission, EffectivePermissionSet,
};
pub use permission::{allowed_actions, base_allows, max_sensitivity, within_ceiling};
pub use scope::{
    chain_for_context, chain_for_context_id, resolve_scope, validate_on_create, ScopeChain,
};
pub use sharing::{
    apply_shares, audience_floor, create_share, level_actions, validate_share_request, ShareError,
    ShareRequest,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// A stored row or scope reference violates a structural invariant.
///
/// These are defects in the data, not business outcomes, and must never be
/// folded into a denial.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntegrityError {
    #[error("ownership invariant violated for {scope} scope: {detail}")]
    Ownership { scope: ContextScope, detail: String },
    #[error("scope chain references unknown team {0}")]
    UnknownTeam(TeamId),
    #[error("malformed scope binding: {0}")]
    ScopeBinding(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("upstream unavailable: {0}")]
pub struct UpstreamError(pub String);

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`KernelError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, KernelError> {
                Ulid::from_string(raw).map(Self).map_err(|err| {
                    KernelError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(UserId, "user_id");
ulid_id!(TeamId, "team_id");
ulid_id!(OrgId, "org_id");
ulid_id!(ContextId, "context_id");
ulid_id!(AssignmentId, "assignment_id");
ulid_id!(ShareId, "share_id");
ulid_id!(DecisionId, "decision_id");

/// Role precedence follows declaration order; `System` is the highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Member,
    Maintainer,
    Admin,
    Owner,
    System,
}

impl Role {
    pub const ALL: [Self; 6] =
        [Self::Viewer, Self::Member, Self::Maintainer, Self::Admin, Self::Owner, Self::System];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Member => "member",
            Self::Maintainer => "maintainer",
            Self::Admin => "admin",
            Self::Owner => "owner",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(Self::Viewer),
            "member" => Some(Self::Member),
            "maintainer" => Some(Self::Maintainer),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Share,
    Export,
    Administer,
    Invite,
    Approve,
    Backup,
    Restore,
    Configure,
    Audit,
}

impl Action {
    pub const ALL: [Self; 13] = [
        Self::Read,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Share,
        Self::Export,
        Self::Administer,
        Self::Invite,
        Self::Approve,
        Self::Backup,
        Self::Restore,
        Self::Configure,
        Self::Audit,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Share => "share",
            Self::Export => "export",
            Self::Administer => "administer",
            Self::Invite => "invite",
            Self::Approve => "approve",
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::Configure => "configure",
            Self::Audit => "audit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Memory,
    Context,
    Team,
    Org,
    User,
    Invitation,
    Backup,
    System,
    Api,
    Audit,
}

impl Resource {
    pub const ALL: [Self; 10] = [
        Self::Memory,
        Self::Context,
        Self::Team,
        Self::Org,
        Self::User,
        Self::Invitation,
        Self::Backup,
        Self::System,
        Self::Api,
        Self::Audit,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Context => "context",
            Self::Team => "team",
            Self::Org => "org",
            Self::User => "user",
            Self::Invitation => "invitation",
            Self::Backup => "backup",
            Self::System => "system",
            Self::Api => "api",
            Self::Audit => "audit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|resource| resource.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextSensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl ContextSensitivity {
    pub const ALL: [Self; 4] = [Self::Public, Self::Internal, Self::Confidential, Self::Restricted];

    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Internal => 1,
            Self::Confidential => 2,
            Self::Restricted => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "internal" => Some(Self::Internal),
            "confidential" => Some(Self::Confidential),
            "restricted" => Some(Self::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Personal,
    Team,
    Org,
}

impl ContextScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Team => "team",
            Self::Org => "org",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "personal" => Some(Self::Personal),
            "team" => Some(Self::Team),
            "org" => Some(Self::Org),
            _ => None,
        }
    }
}

impl Display for ContextScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding level of a role grant, listed from highest to lowest precedence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Global,
    Org,
    Team,
    Context,
}

impl ScopeLevel {
    pub const PRECEDENCE: [Self; 4] = [Self::Global, Self::Org, Self::Team, Self::Context];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Org => "org",
            Self::Team => "team",
            Self::Context => "context",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "global" => Some(Self::Global),
            "org" => Some(Self::Org),
            "team" => Some(Self::Team),
            "context" => Some(Self::Context),
            _ => None,
        }
    }
}

/// Where a role assignment applies. `Global` carries no scope id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "scope_type", content = "scope_id", rename_all = "snake_case")]
pub enum ScopeBinding {
    Global,
    Org(OrgId),
    Team(TeamId),
    Context(ContextId),
}

impl ScopeBinding {
    #[must_use]
    pub fn level(self) -> ScopeLevel {
        match self {
            Self::Global => ScopeLevel::Global,
            Self::Org(_) => ScopeLevel::Org,
            Self::Team(_) => ScopeLevel::Team,
            Self::Context(_) => ScopeLevel::Context,
        }
    }

    #[must_use]
    pub fn scope_id(self) -> Option<String> {
        match self {
            Self::Global => None,
            Self::Org(id) => Some(id.to_string()),
            Self::Team(id) => Some(id.to_string()),
            Self::Context(id) => Some(id.to_string()),
        }
    }

    /// Rebuild a binding from its persisted `(scope_type, scope_id)` columns.
    ///
    /// # Errors
    /// Returns [`IntegrityError::ScopeBinding`] when the scope type is unknown, a
    /// non-global binding lacks an id, a global binding carries one, or the id is
    /// not a ULID.
    pub fn from_parts(scope_type: &str, scope_id: Option<&str>) -> Result<Self, IntegrityError> {
        let level = ScopeLevel::parse(scope_type).ok_or_else(|| {
            IntegrityError::ScopeBinding(format!("unknown scope_type {scope_type}"))
        })?;
        let parse = |raw: &str| {
            Ulid::from_string(raw).map_err(|err| {
                IntegrityError::ScopeBinding(format!("invalid scope_id `{raw}`: {err}"))
            })
        };
        match (level, scope_id) {
            (ScopeLevel::Global, None) => Ok(Self::Global),
            (ScopeLevel::Global, Some(raw)) => Err(IntegrityError::ScopeBinding(format!(
                "global binding MUST NOT carry a scope_id (got {raw})"
            ))),
            (_, None) => Err(IntegrityError::ScopeBinding(format!(
                "{scope_type} binding MUST carry a scope_id"
            ))),
            (ScopeLevel::Org, Some(raw)) => parse(raw).map(|id| Self::Org(OrgId(id))),
            (ScopeLevel::Team, Some(raw)) => parse(raw).map(|id| Self::Team(TeamId(id))),
            (ScopeLevel::Context, Some(raw)) => parse(raw).map(|id| Self::Context(ContextId(id))),
        }
    }
}

/// The three nullable owner columns of a context, exactly one of which is set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct OwnerFields {
    pub owner_user_id: Option<UserId>,
    pub owner_team_id: Option<TeamId>,
    pub owner_org_id: Option<OrgId>,
}

/// A resolved owner: the single populated owner field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "owner_type", content = "owner_id", rename_all = "snake_case")]
pub enum OwnerRef {
    User(UserId),
    Team(TeamId),
    Org(OrgId),
}

impl OwnerRef {
    #[must_use]
    pub fn scope(self) -> ContextScope {
        match self {
            Self::User(_) => ContextScope::Personal,
            Self::Team(_) => ContextScope::Team,
            Self::Org(_) => ContextScope::Org,
        }
    }

    #[must_use]
    pub fn to_fields(self) -> OwnerFields {
        match self {
            Self::User(id) => OwnerFields { owner_user_id: Some(id), ..OwnerFields::default() },
            Self::Team(id) => OwnerFields { owner_team_id: Some(id), ..OwnerFields::default() },
            Self::Org(id) => OwnerFields { owner_org_id: Some(id), ..OwnerFields::default() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Context {
    pub context_id: ContextId,
    pub name: String,
    pub scope: ContextScope,
    #[serde(flatten)]
    pub owner: OwnerFields,
    pub sensitivity_tier: ContextSensitivity,
    pub active: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Context {
    /// Validate a context row before it is written.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty name and
    /// [`KernelError::Integrity`] when the owner fields do not match the scope.
    pub fn validate(&self) -> Result<OwnerRef, KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation("context name MUST be non-empty".to_string()));
        }
        Ok(resolve_scope(self)?.1)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Directory entry linking a team to the organization it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Team {
    pub team_id: TeamId,
    pub org_id: Option<OrgId>,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleAssignment {
    pub assignment_id: AssignmentId,
    pub user_id: UserId,
    pub role: Role,
    pub scope: ScopeBinding,
    pub granted_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub granted_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub active: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub revoked_by: Option<UserId>,
}

impl RoleAssignment {
    /// Expiry is evaluated lazily against `now`; `now == expires_at` is expired.
    #[must_use]
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.active
            && self.revoked_at.is_none()
            && self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    Read,
    Write,
    Admin,
}

impl PermissionLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(tag = "target_type", content = "target_id", rename_all = "snake_case")]
pub enum ShareTarget {
    User(UserId),
    Team(TeamId),
    Org(OrgId),
}

impl ShareTarget {
    #[must_use]
    pub fn target_type(self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Team(_) => "team",
            Self::Org(_) => "org",
        }
    }

    #[must_use]
    pub fn target_id(self) -> String {
        match self {
            Self::User(id) => id.to_string(),
            Self::Team(id) => id.to_string(),
            Self::Org(id) => id.to_string(),
        }
    }

    /// Rebuild a target from its persisted `(target_type, target_id)` columns.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for an unknown type or malformed id.
    pub fn from_parts(target_type: &str, target_id: &str) -> Result<Self, KernelError> {
        match target_type {
            "user" => UserId::parse(target_id).map(Self::User),
            "team" => TeamId::parse(target_id).map(Self::Team),
            "org" => OrgId::parse(target_id).map(Self::Org),
            other => Err(KernelError::Validation(format!("unknown share target_type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextShare {
    pub share_id: ShareId,
    pub context_id: ContextId,
    pub target: ShareTarget,
    pub permission_level: PermissionLevel,
    pub message: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub revoked_by: Option<UserId>,
}

impl ContextShare {
    #[must_use]
    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.revoked_at.is_none() && !self.is_expired_at(now)
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// Policy rows fetched for one request. Never cached across requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicySnapshot {
    pub assignments: Vec<RoleAssignment>,
    pub shares: Vec<ContextShare>,
    pub teams: Vec<Team>,
}

impl PolicySnapshot {
    #[must_use]
    pub fn team(&self, team_id: TeamId) -> Option<&Team> {
        self.teams.iter().find(|team| team.team_id == team_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoAssignment,
    TierExceeded,
    ScopeMismatch,
    ExpiredShare,
    InvalidTarget,
    UpstreamUnavailable,
    ActionNotPermitted,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAssignment => "no_assignment",
            Self::TierExceeded => "tier_exceeded",
            Self::ScopeMismatch => "scope_mismatch",
            Self::ExpiredShare => "expired_share",
            Self::InvalidTarget => "invalid_target",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ActionNotPermitted => "action_not_permitted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_assignment" => Some(Self::NoAssignment),
            "tier_exceeded" => Some(Self::TierExceeded),
            "scope_mismatch" => Some(Self::ScopeMismatch),
            "expired_share" => Some(Self::ExpiredShare),
            "invalid_target" => Some(Self::InvalidTarget),
            "upstream_unavailable" => Some(Self::UpstreamUnavailable),
            "action_not_permitted" => Some(Self::ActionNotPermitted),
            _ => None,
        }
    }
}

impl Display for DenyReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller observes: the value, or a reason code and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum Decision<T> {
    Allowed(T),
    Denied(DenyReason),
}

impl<T> Decision<T> {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }

    #[must_use]
    pub fn denial(&self) -> Option<DenyReason> {
        match self {
            Self::Allowed(_) => None,
            Self::Denied(reason) => Some(*reason),
        }
    }

    #[must_use]
    pub fn allowed(self) -> Option<T> {
        match self {
            Self::Allowed(value) => Some(value),
            Self::Denied(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decision<U> {
        match self {
            Self::Allowed(value) => Decision::Allowed(f(value)),
            Self::Denied(reason) => Decision::Denied(reason),
        }
    }
}

/// Source of `now` for lazy expiry and audit timestamps.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        let mut guard = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
