//! Query-level isolation predicate.
//!
//! Built once per request from the caller's grants and shares. The store ANDs
//! it into every context query so a handler that forgets a check still cannot
//! reach another tenant's rows.
//!
//! The predicate follows the evaluator's level precedence: a global grant
//! outranks org grants, which outrank team grants, which outrank grants on a
//! single context. A row matches exactly when READ on it would be allowed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::permission::{base_allows, max_sensitivity};
use crate::sharing::audience_floor;
use crate::{
    Action, CallerContext, Context, ContextId, ContextSensitivity, OrgId, PolicySnapshot,
    Resource, Role, ScopeBinding, TeamId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    ContextId,
    OwnerUserId,
    OwnerTeamId,
    OwnerOrgId,
}

impl ContextField {
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::ContextId => "context_id",
            Self::OwnerUserId => "owner_user_id",
            Self::OwnerTeamId => "owner_team_id",
            Self::OwnerOrgId => "owner_org_id",
        }
    }

    fn value(self, context: &Context) -> Option<String> {
        match self {
            Self::ContextId => Some(context.context_id.to_string()),
            Self::OwnerUserId => context.owner.owner_user_id.map(|id| id.to_string()),
            Self::OwnerTeamId => context.owner.owner_team_id.map(|id| id.to_string()),
            Self::OwnerOrgId => context.owner.owner_org_id.map(|id| id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Predicate {
    All,
    Nothing,
    Eq(ContextField, String),
    In(ContextField, Vec<String>),
    TierAtMost(ContextSensitivity),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// True when the inner predicate is false, including on a `NULL` owner column.
    Not(Box<Predicate>),
}

impl Predicate {
    #[must_use]
    pub fn matches(&self, context: &Context) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Eq(field, expected) => field.value(context).as_deref() == Some(expected.as_str()),
            Self::In(field, ids) => field
                .value(context)
                .is_some_and(|value| ids.iter().any(|id| *id == value)),
            Self::TierAtMost(tier) => context.sensitivity_tier <= *tier,
            Self::And(parts) => parts.iter().all(|part| part.matches(context)),
            Self::Or(parts) => parts.iter().any(|part| part.matches(context)),
            Self::Not(inner) => !inner.matches(context),
        }
    }

    #[must_use]
    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    fn selector(field: ContextField, ids: BTreeSet<String>) -> Option<Self> {
        if ids.len() > 1 {
            return Some(Self::In(field, ids.into_iter().collect()));
        }
        ids.into_iter().next().map(|id| Self::Eq(field, id))
    }

    fn capped(selector: Self, ceiling: ContextSensitivity) -> Self {
        if ceiling == ContextSensitivity::Restricted {
            selector
        } else {
            Self::And(vec![selector, Self::TierAtMost(ceiling)])
        }
    }
}

/// Accumulates visibility branches, then folds them into one [`Predicate`].
#[derive(Debug, Clone, Default)]
pub struct ScopeFilterBuilder {
    any_tier_at_most: Option<ContextSensitivity>,
    scoped: BTreeMap<(ContextSensitivity, ContextField), BTreeSet<String>>,
    guarded: Vec<Predicate>,
}

impl ScopeFilterBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every context up to `ceiling`, regardless of owner.
    #[must_use]
    pub fn allow_tier(mut self, ceiling: ContextSensitivity) -> Self {
        self.any_tier_at_most = self.any_tier_at_most.max(Some(ceiling));
        self
    }

    #[must_use]
    pub fn allow(mut self, field: ContextField, id: String, ceiling: ContextSensitivity) -> Self {
        self.scoped.entry((ceiling, field)).or_default().insert(id);
        self
    }

    /// Like [`Self::allow`], except for rows that `shadowed` also matches.
    #[must_use]
    pub fn allow_unless(
        mut self,
        field: ContextField,
        id: String,
        ceiling: ContextSensitivity,
        shadowed: &Predicate,
    ) -> Self {
        let guard = Predicate::Not(Box::new(shadowed.clone()));
        let branch = match Predicate::capped(Predicate::Eq(field, id), ceiling) {
            Predicate::And(mut parts) => {
                parts.push(guard);
                Predicate::And(parts)
            }
            selector => Predicate::And(vec![selector, guard]),
        };
        self.guarded.push(branch);
        self
    }

    #[must_use]
    pub fn build(self) -> Predicate {
        if self.any_tier_at_most == Some(ContextSensitivity::Restricted) {
            return Predicate::All;
        }
        let mut branches: Vec<Predicate> =
            self.any_tier_at_most.map(Predicate::TierAtMost).into_iter().collect();
        for ((ceiling, field), ids) in self.scoped {
            if let Some(selector) = Predicate::selector(field, ids) {
                branches.push(Predicate::capped(selector, ceiling));
            }
        }
        branches.extend(self.guarded);
        match branches.len() {
            0 => Predicate::Nothing,
            1 => branches.pop().unwrap_or(Predicate::Nothing),
            _ => Predicate::Or(branches),
        }
    }
}

/// Active grants bucketed by the level they bind at.
#[derive(Debug, Default)]
struct GrantLevels {
    global: Vec<Role>,
    orgs: BTreeMap<OrgId, Vec<Role>>,
    teams: BTreeMap<TeamId, Vec<Role>>,
    contexts: BTreeMap<ContextId, Vec<Role>>,
}

impl GrantLevels {
    fn collect(grants: Vec<(Role, ScopeBinding)>) -> Self {
        let mut levels = Self::default();
        for (role, binding) in grants {
            match binding {
                ScopeBinding::Global => levels.global.push(role),
                ScopeBinding::Org(org_id) => levels.orgs.entry(org_id).or_default().push(role),
                ScopeBinding::Team(team_id) => {
                    levels.teams.entry(team_id).or_default().push(role);
                }
                ScopeBinding::Context(context_id) => {
                    levels.contexts.entry(context_id).or_default().push(role);
                }
            }
        }
        levels
    }
}

/// Highest tier any of `roles` may read; `None` when none of them reads.
fn read_ceiling(roles: &[Role]) -> Option<ContextSensitivity> {
    roles
        .iter()
        .copied()
        .filter(|role| base_allows(*role, Resource::Context, Action::Read))
        .map(max_sensitivity)
        .max()
}

fn scoped_branches(
    levels: &GrantLevels,
    snapshot: &PolicySnapshot,
    mut builder: ScopeFilterBuilder,
) -> ScopeFilterBuilder {
    let mut shadowed_teams = BTreeSet::new();
    let mut shadowed_orgs = BTreeSet::new();

    for (org_id, roles) in &levels.orgs {
        let ceiling = read_ceiling(roles);
        shadowed_orgs.insert(org_id.to_string());
        if let Some(ceiling) = ceiling {
            builder = builder.allow(ContextField::OwnerOrgId, org_id.to_string(), ceiling);
        }
        for team in snapshot.teams.iter().filter(|team| team.org_id == Some(*org_id)) {
            shadowed_teams.insert(team.team_id.to_string());
            if let Some(ceiling) = ceiling {
                let team_id = team.team_id.to_string();
                builder = builder.allow(ContextField::OwnerTeamId, team_id, ceiling);
            }
        }
    }

    // An org grant decides for every team under that org.
    for (team_id, roles) in &levels.teams {
        let org_id = snapshot.team(*team_id).and_then(|team| team.org_id);
        if org_id.is_some_and(|org_id| levels.orgs.contains_key(&org_id)) {
            continue;
        }
        shadowed_teams.insert(team_id.to_string());
        if let Some(org_id) = org_id {
            shadowed_orgs.insert(org_id.to_string());
        }
        let Some(ceiling) = read_ceiling(roles) else {
            continue;
        };
        builder = builder.allow(ContextField::OwnerTeamId, team_id.to_string(), ceiling);
        if let Some(org_id) = org_id {
            builder = builder.allow(ContextField::OwnerOrgId, org_id.to_string(), ceiling);
        }
    }

    let shadowed: Vec<Predicate> = [
        Predicate::selector(ContextField::OwnerTeamId, shadowed_teams),
        Predicate::selector(ContextField::OwnerOrgId, shadowed_orgs),
    ]
    .into_iter()
    .flatten()
    .collect();
    let shadowed = match shadowed.len() {
        0 => None,
        1 => shadowed.into_iter().next(),
        _ => Some(Predicate::Or(shadowed)),
    };

    for (context_id, roles) in &levels.contexts {
        let Some(ceiling) = read_ceiling(roles) else {
            continue;
        };
        let id = context_id.to_string();
        builder = match &shadowed {
            Some(shadowed) => builder.allow_unless(ContextField::ContextId, id, ceiling, shadowed),
            None => builder.allow(ContextField::ContextId, id, ceiling),
        };
    }
    builder
}

/// The visibility predicate for every context query made on behalf of `caller`.
#[must_use]
pub fn scope_filter(
    caller: &CallerContext,
    snapshot: &PolicySnapshot,
    now: OffsetDateTime,
) -> Predicate {
    let levels = GrantLevels::collect(caller.active_grants(&snapshot.assignments, now));
    let mut builder = if levels.global.is_empty() {
        scoped_branches(&levels, snapshot, ScopeFilterBuilder::new())
    } else {
        // A global grant is in every chain, so no scoped grant ever decides.
        match read_ceiling(&levels.global) {
            Some(ceiling) => ScopeFilterBuilder::new().allow_tier(ceiling),
            None => ScopeFilterBuilder::new(),
        }
    };

    let scopes = caller.scopes(&snapshot.assignments, now);
    for share in snapshot
        .shares
        .iter()
        .filter(|share| share.is_active_at(now) && scopes.matches(share.target))
    {
        let ceiling = max_sensitivity(audience_floor(share.target, share.permission_level));
        builder = builder.allow(ContextField::ContextId, share.context_id.to_string(), ceiling);
    }
    builder.build()
}

/// Fail closed: a snapshot that could not be fetched filters out everything.
#[must_use]
pub fn scope_filter_or_nothing<E>(
    caller: &CallerContext,
    snapshot: Result<&PolicySnapshot, E>,
    now: OffsetDateTime,
) -> Predicate {
    match snapshot {
        Ok(snapshot) => scope_filter(caller, snapshot, now),
        Err(_) => Predicate::Nothing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::{evaluate, AccessTarget};
    use crate::{
        AssignmentId, ContextShare, OwnerRef, PermissionLevel, RoleAssignment, ShareId,
        ShareTarget, Team, UserId,
    };
    use proptest::prelude::*;
    use std::collections::BTreeMap as Map;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mk_context(owner: OwnerRef, tier: ContextSensitivity) -> Context {
        Context {
            context_id: ContextId::new(),
            name: "notes".to_string(),
            scope: owner.scope(),
            owner: owner.to_fields(),
            sensitivity_tier: tier,
            active: true,
            metadata: Map::new(),
            created_at: fixture_time(),
            updated_at: fixture_time(),
            deleted_at: None,
        }
    }

    fn mk_team(name: &str, org_id: Option<OrgId>) -> Team {
        Team { team_id: TeamId::new(), org_id, name: name.to_string(), created_at: fixture_time() }
    }

    fn assignment(user_id: UserId, role: Role, scope: ScopeBinding) -> RoleAssignment {
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

    fn engine_reads(caller: &CallerContext, snapshot: &PolicySnapshot, context: &Context) -> bool {
        let target = AccessTarget::Context(context);
        let now = fixture_time();
        match evaluate(caller, snapshot, Resource::Context, Action::Read, target, None, now) {
            Ok((_, permission)) => permission.allowed,
            Err(err) => panic!("contexts are well formed: {err}"),
        }
    }

    // Test IDs: TGR-001
    #[test]
    fn caller_without_grants_sees_nothing() {
        let predicate = scope_filter(
            &CallerContext::user(UserId::new()),
            &PolicySnapshot::default(),
            fixture_time(),
        );
        assert_eq!(predicate, Predicate::Nothing);
        let context = mk_context(OwnerRef::User(UserId::new()), ContextSensitivity::Public);
        assert!(!predicate.matches(&context));
    }

    // Test IDs: TGR-002
    #[test]
    fn global_system_role_sees_everything() {
        let caller = CallerContext::user(UserId::new());
        let snapshot = PolicySnapshot {
            assignments: vec![assignment(caller.user_id, Role::System, ScopeBinding::Global)],
            ..PolicySnapshot::default()
        };
        assert_eq!(scope_filter(&caller, &snapshot, fixture_time()), Predicate::All);
    }

    // Test IDs: TGR-003
    #[test]
    fn team_member_sees_own_team_up_to_ceiling_only() {
        let org_id = OrgId::new();
        let team = mk_team("a", Some(org_id));
        let other_team = TeamId::new();
        let caller = CallerContext::user(UserId::new()).with_team_role(team.team_id, Role::Member);
        let snapshot = PolicySnapshot { teams: vec![team.clone()], ..PolicySnapshot::default() };
        let predicate = scope_filter(&caller, &snapshot, fixture_time());
        let own = |tier| mk_context(OwnerRef::Team(team.team_id), tier);

        assert!(predicate.matches(&own(ContextSensitivity::Internal)));
        assert!(predicate.matches(&mk_context(OwnerRef::Org(org_id), ContextSensitivity::Public)));
        assert!(!predicate.matches(&own(ContextSensitivity::Confidential)));
        let foreign = mk_context(OwnerRef::Team(other_team), ContextSensitivity::Public);
        assert!(!predicate.matches(&foreign));
        let personal = mk_context(OwnerRef::User(caller.user_id), ContextSensitivity::Public);
        assert!(!predicate.matches(&personal));
    }

    // Test IDs: TGR-004
    #[test]
    fn predicate_is_deterministic_and_serializable() {
        let caller = CallerContext::user(UserId::new());
        let first = ContextId::new();
        let second = ContextId::new();
        let snapshot = PolicySnapshot {
            assignments: vec![
                assignment(caller.user_id, Role::Viewer, ScopeBinding::Context(second)),
                assignment(caller.user_id, Role::Viewer, ScopeBinding::Context(first)),
            ],
            ..PolicySnapshot::default()
        };
        let predicate = scope_filter(&caller, &snapshot, fixture_time());
        let mut ids = vec![first.to_string(), second.to_string()];
        ids.sort();
        assert_eq!(
            predicate,
            Predicate::And(vec![
                Predicate::In(ContextField::ContextId, ids),
                Predicate::TierAtMost(ContextSensitivity::Internal),
            ])
        );
        let encoded = match serde_json::to_string(&predicate) {
            Ok(encoded) => encoded,
            Err(err) => panic!("predicate should serialize: {err}"),
        };
        assert!(encoded.contains("\"op\":\"and\""));
    }

    // Test IDs: TGR-005
    #[test]
    fn failed_snapshot_fails_closed() {
        let caller = CallerContext::user(UserId::new()).with_org_role(OrgId::new(), Role::Owner);
        let failed: Result<&PolicySnapshot, &str> = Err("connection refused");
        assert_eq!(scope_filter_or_nothing(&caller, failed, fixture_time()), Predicate::Nothing);
    }

    // Test IDs: TGR-006
    #[test]
    fn expired_share_no_longer_matches() {
        let caller = CallerContext::user(UserId::new());
        let context = mk_context(OwnerRef::User(UserId::new()), ContextSensitivity::Internal);
        let snapshot = PolicySnapshot {
            shares: vec![ContextShare {
                share_id: ShareId::new(),
                context_id: context.context_id,
                target: ShareTarget::User(caller.user_id),
                permission_level: PermissionLevel::Read,
                message: None,
                expires_at: Some(fixture_time() + Duration::minutes(5)),
                created_by: UserId::new(),
                created_at: fixture_time(),
                revoked_at: None,
                revoked_by: None,
            }],
            ..PolicySnapshot::default()
        };
        assert!(scope_filter(&caller, &snapshot, fixture_time()).matches(&context));
        let later = fixture_time() + Duration::minutes(5);
        assert!(!scope_filter(&caller, &snapshot, later).matches(&context));
    }

    // Test IDs: TGR-008
    #[test]
    fn team_bound_system_role_stays_inside_its_team() {
        let org_id = OrgId::new();
        let team = mk_team("ops", Some(org_id));
        let sibling = mk_team("billing", Some(org_id));
        let caller = CallerContext::user(UserId::new());
        let snapshot = PolicySnapshot {
            assignments: vec![assignment(
                caller.user_id,
                Role::System,
                ScopeBinding::Team(team.team_id),
            )],
            teams: vec![team.clone(), sibling.clone()],
            ..PolicySnapshot::default()
        };
        let predicate = scope_filter(&caller, &snapshot, fixture_time());
        assert_ne!(predicate, Predicate::All);

        let inside = mk_context(OwnerRef::Team(team.team_id), ContextSensitivity::Restricted);
        let beside = mk_context(OwnerRef::Team(sibling.team_id), ContextSensitivity::Public);
        let personal = mk_context(OwnerRef::User(UserId::new()), ContextSensitivity::Public);
        for context in [&inside, &beside, &personal] {
            assert_eq!(
                predicate.matches(context),
                engine_reads(&caller, &snapshot, context),
                "{context:?}"
            );
        }
        assert!(predicate.matches(&inside));
        assert!(!predicate.matches(&beside));
        assert!(!predicate.matches(&personal));
    }

    // Test IDs: TGR-009
    #[test]
    fn global_grant_outranks_scoped_grants() {
        let team = mk_team("support", None);
        let caller = CallerContext::user(UserId::new()).with_team_role(team.team_id, Role::Admin);
        let snapshot = PolicySnapshot {
            assignments: vec![assignment(caller.user_id, Role::Viewer, ScopeBinding::Global)],
            teams: vec![team.clone()],
            ..PolicySnapshot::default()
        };
        let predicate = scope_filter(&caller, &snapshot, fixture_time());
        assert_eq!(predicate, Predicate::TierAtMost(ContextSensitivity::Internal));

        let confidential =
            mk_context(OwnerRef::Team(team.team_id), ContextSensitivity::Confidential);
        assert!(!engine_reads(&caller, &snapshot, &confidential));
        assert!(!predicate.matches(&confidential));
        let internal = mk_context(OwnerRef::User(UserId::new()), ContextSensitivity::Internal);
        assert!(engine_reads(&caller, &snapshot, &internal));
        assert!(predicate.matches(&internal));
    }

    // Test IDs: TGR-010
    #[test]
    fn context_grant_is_shadowed_where_a_scoped_grant_decides() {
        let org_id = OrgId::new();
        let team = mk_team("research", Some(org_id));
        let loose = mk_team("guests", None);
        let caller = CallerContext::user(UserId::new())
            .with_org_role(org_id, Role::Viewer)
            .with_team_role(loose.team_id, Role::Viewer);
        let in_org = mk_context(OwnerRef::Team(team.team_id), ContextSensitivity::Confidential);
        let in_loose = mk_context(OwnerRef::Team(loose.team_id), ContextSensitivity::Restricted);
        let personal = mk_context(OwnerRef::User(UserId::new()), ContextSensitivity::Restricted);
        let snapshot = PolicySnapshot {
            assignments: [&in_org, &in_loose, &personal]
                .into_iter()
                .map(|context| {
                    let binding = ScopeBinding::Context(context.context_id);
                    assignment(caller.user_id, Role::Owner, binding)
                })
                .collect(),
            teams: vec![team, loose],
            ..PolicySnapshot::default()
        };
        let predicate = scope_filter(&caller, &snapshot, fixture_time());

        assert!(!predicate.matches(&in_org));
        assert!(!predicate.matches(&in_loose));
        assert!(predicate.matches(&personal));
        for context in [&in_org, &in_loose, &personal] {
            assert_eq!(predicate.matches(context), engine_reads(&caller, &snapshot, context));
        }
    }

    #[derive(Debug, Clone)]
    struct World {
        caller: CallerContext,
        snapshot: PolicySnapshot,
        contexts: Vec<Context>,
    }

    fn world_strategy() -> impl Strategy<Value = World> {
        let role = prop::sample::select(Role::ALL.to_vec());
        let tier = prop::sample::select(ContextSensitivity::ALL.to_vec());
        let level = prop::sample::select(vec![
            PermissionLevel::Read,
            PermissionLevel::Write,
            PermissionLevel::Admin,
        ]);
        (
            prop::collection::vec((role, 0_usize..7), 0..5),
            prop::collection::vec((0_usize..6, tier), 1..8),
            prop::collection::vec((0_usize..8, level, 0_usize..3, any::<bool>()), 0..4),
        )
            .prop_map(|(grants, owned, shared)| {
                let org_id = OrgId::new();
                let teams = vec![
                    mk_team("t0", Some(org_id)),
                    mk_team("t1", Some(org_id)),
                    mk_team("t2", None),
                ];
                let user_id = UserId::new();
                let owners = [
                    OwnerRef::User(user_id),
                    OwnerRef::User(UserId::new()),
                    OwnerRef::Team(teams[0].team_id),
                    OwnerRef::Team(teams[1].team_id),
                    OwnerRef::Team(teams[2].team_id),
                    OwnerRef::Org(org_id),
                ];
                let contexts: Vec<Context> = owned
                    .iter()
                    .map(|(owner, tier)| mk_context(owners[*owner], *tier))
                    .collect();
                let last = contexts.len() - 1;
                let bindings = |slot: usize| match slot {
                    0 => ScopeBinding::Global,
                    1 => ScopeBinding::Org(org_id),
                    2 => ScopeBinding::Team(teams[0].team_id),
                    3 => ScopeBinding::Team(teams[1].team_id),
                    4 => ScopeBinding::Team(teams[2].team_id),
                    5 => ScopeBinding::Context(contexts[0].context_id),
                    _ => ScopeBinding::Context(contexts[last].context_id),
                };
                let assignments = grants
                    .iter()
                    .map(|(role, slot)| assignment(user_id, *role, bindings(*slot)))
                    .collect();
                let audiences = [
                    ShareTarget::User(user_id),
                    ShareTarget::Team(teams[0].team_id),
                    ShareTarget::Org(org_id),
                ];
                let shares = shared
                    .iter()
                    .map(|(index, level, audience, expired)| ContextShare {
                        share_id: ShareId::new(),
                        context_id: contexts[index % contexts.len()].context_id,
                        target: audiences[*audience],
                        permission_level: *level,
                        message: None,
                        expires_at: expired.then(|| fixture_time() - Duration::minutes(1)),
                        created_by: UserId::new(),
                        created_at: fixture_time() - Duration::hours(1),
                        revoked_at: None,
                        revoked_by: None,
                    })
                    .collect();
                World {
                    caller: CallerContext::user(user_id),
                    snapshot: PolicySnapshot { assignments, shares, teams },
                    contexts,
                }
            })
    }

    proptest! {
        // Test IDs: TGR-007
        #[test]
        fn guardrail_matches_exactly_the_engine_allowed_reads(world in world_strategy()) {
            let predicate = scope_filter(&world.caller, &world.snapshot, fixture_time());
            for context in &world.contexts {
                let allowed = engine_reads(&world.caller, &world.snapshot, context);
                prop_assert_eq!(predicate.matches(context), allowed, "{:?}", context);
            }
        }
    }
}
