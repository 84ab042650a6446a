//! Verified caller identity as handed in by the authentication layer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{OrgId, Role, RoleAssignment, ScopeBinding, ShareTarget, TeamId, UpstreamError, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamRole {
    pub team_id: TeamId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrgRole {
    pub org_id: OrgId,
    pub role: Role,
}

/// The caller of every operation. There is no ambient "current user".
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallerContext {
    pub user_id: UserId,
    #[serde(default)]
    pub team_roles: Vec<TeamRole>,
    #[serde(default)]
    pub org_role: Option<OrgRole>,
}

impl CallerContext {
    #[must_use]
    pub fn user(user_id: UserId) -> Self {
        Self { user_id, team_roles: Vec::new(), org_role: None }
    }

    #[must_use]
    pub fn with_team_role(mut self, team_id: TeamId, role: Role) -> Self {
        self.team_roles.push(TeamRole { team_id, role });
        self
    }

    #[must_use]
    pub fn with_org_role(mut self, org_id: OrgId, role: Role) -> Self {
        self.org_role = Some(OrgRole { org_id, role });
        self
    }

    /// Membership roles as grants at team and org scope.
    pub fn membership_grants(&self) -> impl Iterator<Item = (Role, ScopeBinding)> + '_ {
        self.team_roles
            .iter()
            .map(|membership| (membership.role, ScopeBinding::Team(membership.team_id)))
            .chain(
                self.org_role
                    .iter()
                    .map(|membership| (membership.role, ScopeBinding::Org(membership.org_id))),
            )
    }

    /// Every active grant held by this caller: memberships plus stored assignments.
    #[must_use]
    pub fn active_grants(
        &self,
        assignments: &[RoleAssignment],
        now: OffsetDateTime,
    ) -> Vec<(Role, ScopeBinding)> {
        let stored = assignments
            .iter()
            .filter(|assignment| assignment.user_id == self.user_id && assignment.is_active_at(now))
            .map(|assignment| (assignment.role, assignment.scope));
        self.membership_grants().chain(stored).collect()
    }

    /// The audiences a share may target to reach this caller.
    #[must_use]
    pub fn scopes(&self, assignments: &[RoleAssignment], now: OffsetDateTime) -> CallerScopes {
        let mut scopes = CallerScopes {
            user_id: self.user_id,
            team_ids: BTreeSet::new(),
            org_ids: BTreeSet::new(),
        };
        for (_, binding) in self.active_grants(assignments, now) {
            match binding {
                ScopeBinding::Team(team_id) => {
                    scopes.team_ids.insert(team_id);
                }
                ScopeBinding::Org(org_id) => {
                    scopes.org_ids.insert(org_id);
                }
                ScopeBinding::Global | ScopeBinding::Context(_) => {}
            }
        }
        scopes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CallerScopes {
    pub user_id: UserId,
    pub team_ids: BTreeSet<TeamId>,
    pub org_ids: BTreeSet<OrgId>,
}

impl CallerScopes {
    #[must_use]
    pub fn matches(&self, target: ShareTarget) -> bool {
        match target {
            ShareTarget::User(user_id) => user_id == self.user_id,
            ShareTarget::Team(team_id) => self.team_ids.contains(&team_id),
            ShareTarget::Org(org_id) => self.org_ids.contains(&org_id),
        }
    }
}

/// Resolves a verified token into a caller.
pub trait IdentityProvider: Send + Sync {
    /// # Errors
    /// Returns [`UpstreamError`] when the identity source cannot answer.
    fn get_caller_context(&self, token: &str) -> Result<CallerContext, UpstreamError>;
}

/// In-memory provider keyed by opaque token.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    callers: BTreeMap<String, CallerContext>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_caller(mut self, token: impl Into<String>, caller: CallerContext) -> Self {
        self.callers.insert(token.into(), caller);
        self
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn get_caller_context(&self, token: &str) -> Result<CallerContext, UpstreamError> {
        self.callers
            .get(token)
            .cloned()
            .ok_or_else(|| {
                UpstreamError("token is not recognized by identity provider".to_string())
            })
    }
}
