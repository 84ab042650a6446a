//! Decision audit records. Persistence and hash chaining live in the store.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    Action, ContextSensitivity, DecisionId, DenyReason, EffectivePermission, Resource, Role,
    ScopeChain, UserId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Allow,
    Deny,
}

impl DecisionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// A completed decision that has not been appended yet.
///
/// Field order is the canonical serialization order hashed into the chain.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingDecision {
    pub decision_id: DecisionId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub caller_id: UserId,
    pub resource: Resource,
    pub action: Action,
    pub resource_id: Option<String>,
    pub sensitivity_tier: Option<ContextSensitivity>,
    pub decision: DecisionOutcome,
    pub reason: Option<DenyReason>,
    pub effective_role: Option<Role>,
    pub scope_chain: Vec<String>,
}

impl PendingDecision {
    #[must_use]
    pub fn from_permission(
        caller_id: UserId,
        permission: &EffectivePermission,
        resource_id: Option<String>,
        chain: &ScopeChain,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            decision_id: DecisionId::new(),
            timestamp: now,
            caller_id,
            resource: permission.resource,
            action: permission.action,
            resource_id,
            sensitivity_tier: Some(permission.tier),
            decision: if permission.allowed {
                DecisionOutcome::Allow
            } else {
                DecisionOutcome::Deny
            },
            reason: permission.reason,
            effective_role: permission.role_used,
            scope_chain: chain.labels(),
        }
    }

    /// A denial reached without evaluating grants, e.g. missing policy data.
    #[must_use]
    pub fn denied(
        caller_id: UserId,
        resource: Resource,
        action: Action,
        resource_id: Option<String>,
        reason: DenyReason,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            decision_id: DecisionId::new(),
            timestamp: now,
            caller_id,
            resource,
            action,
            resource_id,
            sensitivity_tier: None,
            decision: DecisionOutcome::Deny,
            reason: Some(reason),
            effective_role: None,
            scope_chain: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.decision == DecisionOutcome::Allow
    }
}

/// An appended row of the decision log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PermissionDecision {
    pub seq: i64,
    #[serde(flatten)]
    pub body: PendingDecision,
    #[serde(with = "time::serde::rfc3339")]
    pub retain_until: OffsetDateTime,
    pub prev_hash: String,
    pub record_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditFilter {
    pub caller_id: Option<UserId>,
    pub resource: Option<Resource>,
    pub action: Option<Action>,
    pub outcome: Option<DecisionOutcome>,
    pub resource_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub until: Option<OffsetDateTime>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inheritance::EffectivePermissionSet;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    // Test IDs: TAUD-001
    #[test]
    fn pending_decision_carries_role_reason_and_chain() {
        let mut eps = EffectivePermissionSet::empty(Resource::Audit, ContextSensitivity::Public);
        eps.role_used = Some(Role::Admin);
        eps.actions.insert(Action::Read);
        let permission = eps.decide(Action::Export);
        let caller_id = UserId::new();

        let pending = PendingDecision::from_permission(
            caller_id,
            &permission,
            None,
            &ScopeChain::global(),
            fixture_time(),
        );
        assert!(!pending.is_allowed());
        assert_eq!(pending.reason, Some(DenyReason::ActionNotPermitted));
        assert_eq!(pending.effective_role, Some(Role::Admin));
        assert_eq!(pending.scope_chain, vec!["global".to_string()]);
    }

    // Test IDs: TAUD-002
    #[test]
    fn decision_serializes_to_one_stable_json_line() {
        let pending = PendingDecision::denied(
            UserId::new(),
            Resource::Context,
            Action::Read,
            Some("01J0000000000000000000000A".to_string()),
            DenyReason::UpstreamUnavailable,
            fixture_time(),
        );
        let line = match serde_json::to_string(&pending) {
            Ok(line) => line,
            Err(err) => panic!("decision should serialize: {err}"),
        };
        assert!(!line.contains('\n'));
        assert!(line.contains("\"reason\":\"upstream_unavailable\""));
        assert!(line.contains("\"decision\":\"deny\""));

        let decoded: PendingDecision = match serde_json::from_str(&line) {
            Ok(decoded) => decoded,
            Err(err) => panic!("decision should parse: {err}"),
        };
        assert_eq!(decoded, pending);
    }
}
