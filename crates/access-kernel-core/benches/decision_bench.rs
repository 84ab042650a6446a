use std::collections::BTreeMap;

use access_kernel_core::{
    evaluate, scope_filter, AccessTarget, Action, AssignmentId, CallerContext, Context, ContextId,
    ContextScope, ContextSensitivity, ContextShare, OrgId, OwnerRef, PermissionLevel,
    PolicySnapshot, Resource, Role, RoleAssignment, ScopeBinding, ShareId, ShareTarget, Team,
    TeamId, UserId,
};
use criterion::{criterion_group, criterion_main, Criterion};
use time::OffsetDateTime;

fn mk_team(index: usize, org_id: OrgId) -> Team {
    Team {
        team_id: TeamId::new(),
        org_id: Some(org_id),
        name: format!("team-{index}"),
        created_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn mk_assignment(user_id: UserId, index: usize, teams: &[Team]) -> RoleAssignment {
    let role = Role::ALL[index % 5];
    let scope = match index % 3 {
        0 => ScopeBinding::Team(teams[index % teams.len()].team_id),
        1 => ScopeBinding::Context(ContextId::new()),
        _ => ScopeBinding::Org(OrgId::new()),
    };
    RoleAssignment {
        assignment_id: AssignmentId::new(),
        user_id,
        role,
        scope,
        granted_by: user_id,
        granted_at: OffsetDateTime::UNIX_EPOCH,
        expires_at: None,
        active: true,
        revoked_at: None,
        revoked_by: None,
    }
}

fn mk_share(user_id: UserId, context_id: ContextId) -> ContextShare {
    ContextShare {
        share_id: ShareId::new(),
        context_id,
        target: ShareTarget::User(user_id),
        permission_level: PermissionLevel::Read,
        message: None,
        expires_at: None,
        created_by: UserId::new(),
        created_at: OffsetDateTime::UNIX_EPOCH,
        revoked_at: None,
        revoked_by: None,
    }
}

fn fixture() -> (CallerContext, PolicySnapshot, Context) {
    let org_id = OrgId::new();
    let teams = (0..50).map(|index| mk_team(index, org_id)).collect::<Vec<_>>();
    let caller = CallerContext::user(UserId::new()).with_team_role(teams[0].team_id, Role::Member);
    let assignments =
        (0..1_000).map(|index| mk_assignment(caller.user_id, index, &teams)).collect::<Vec<_>>();
    let shares =
        (0..1_000).map(|_| mk_share(caller.user_id, ContextId::new())).collect::<Vec<_>>();
    let context = Context {
        context_id: ContextId::new(),
        name: "bench".to_string(),
        scope: ContextScope::Team,
        owner: OwnerRef::Team(teams[0].team_id).to_fields(),
        sensitivity_tier: ContextSensitivity::Internal,
        active: true,
        metadata: BTreeMap::new(),
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
        deleted_at: None,
    };
    (caller, PolicySnapshot { assignments, shares, teams }, context)
}

fn bench_evaluate(c: &mut Criterion) {
    let (caller, snapshot, context) = fixture();

    c.bench_function("evaluate_context_read_1000_assignments", |b| {
        b.iter(|| {
            let decision = evaluate(
                &caller,
                &snapshot,
                Resource::Context,
                Action::Read,
                AccessTarget::Context(&context),
                None,
                OffsetDateTime::UNIX_EPOCH,
            );
            if let Err(err) = decision {
                panic!("decision benchmark evaluation failed: {err}");
            }
        });
    });
}

fn bench_scope_filter(c: &mut Criterion) {
    let (caller, snapshot, _) = fixture();

    c.bench_function("scope_filter_1000_assignments_1000_shares", |b| {
        b.iter(|| scope_filter(&caller, &snapshot, OffsetDateTime::UNIX_EPOCH));
    });
}

criterion_group!(decision_benches, bench_evaluate, bench_scope_filter);
criterion_main!(decision_benches);
