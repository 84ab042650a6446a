//! Ownership-scope resolution and scope chains. Purely structural; no permission knowledge.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    Context, ContextId, ContextScope, IntegrityError, OrgId, OwnerFields, OwnerRef, ScopeBinding,
    Team, TeamId,
};

/// Return the scope and the single owner of a stored context.
///
/// # Errors
/// Returns [`IntegrityError::Ownership`] when zero or several owner fields are
/// set, or the set field disagrees with the declared scope.
pub fn resolve_scope(context: &Context) -> Result<(ContextScope, OwnerRef), IntegrityError> {
    let owner = validate_on_create(context.scope, &context.owner)?;
    Ok((context.scope, owner))
}

/// Check that exactly one owner field is set and that it matches `scope`.
///
/// # Errors
/// Returns [`IntegrityError::Ownership`] describing the violated invariant.
pub fn validate_on_create(
    scope: ContextScope,
    owner: &OwnerFields,
) -> Result<OwnerRef, IntegrityError> {
    let set = [
        owner.owner_user_id.map(OwnerRef::User),
        owner.owner_team_id.map(OwnerRef::Team),
        owner.owner_org_id.map(OwnerRef::Org),
    ];
    let mut populated = set.into_iter().flatten();
    let Some(owner_ref) = populated.next() else {
        return Err(IntegrityError::Ownership {
            scope,
            detail: "no owner field is set".to_string(),
        });
    };
    if populated.next().is_some() {
        return Err(IntegrityError::Ownership {
            scope,
            detail: "more than one owner field is set".to_string(),
        });
    }
    if owner_ref.scope() != scope {
        return Err(IntegrityError::Ownership {
            scope,
            detail: format!("owner is a {} owner", owner_ref.scope()),
        });
    }
    Ok(owner_ref)
}

/// The scopes whose grants apply to one target. Always contains `Global`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopeChain {
    bindings: BTreeSet<ScopeBinding>,
}

impl ScopeChain {
    #[must_use]
    pub fn global() -> Self {
        Self { bindings: BTreeSet::from([ScopeBinding::Global]) }
    }

    #[must_use]
    pub fn for_org(org_id: OrgId) -> Self {
        Self::global().with(ScopeBinding::Org(org_id))
    }

    #[must_use]
    pub fn for_team(team: &Team) -> Self {
        let chain = Self::global().with(ScopeBinding::Team(team.team_id));
        match team.org_id {
            Some(org_id) => chain.with(ScopeBinding::Org(org_id)),
            None => chain,
        }
    }

    #[must_use]
    pub fn with(mut self, binding: ScopeBinding) -> Self {
        self.bindings.insert(binding);
        self
    }

    #[must_use]
    pub fn contains(&self, binding: ScopeBinding) -> bool {
        self.bindings.contains(&binding)
    }

    pub fn bindings(&self) -> impl Iterator<Item = ScopeBinding> + '_ {
        self.bindings.iter().copied()
    }

    /// Stable `type[:id]` labels, in precedence order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.bindings
            .iter()
            .map(|binding| match binding.scope_id() {
                Some(id) => format!("{}:{id}", binding.level().as_str()),
                None => binding.level().as_str().to_string(),
            })
            .collect()
    }
}

/// Build the scope chain of a context from its owner and the team directory.
///
/// # Errors
/// Propagates ownership violations and returns [`IntegrityError::UnknownTeam`]
/// for a team-owned context whose team is missing from `teams`.
pub fn chain_for_context(context: &Context, teams: &[Team]) -> Result<ScopeChain, IntegrityError> {
    let (_, owner) = resolve_scope(context)?;
    let chain = match owner {
        OwnerRef::User(_) => ScopeChain::global(),
        OwnerRef::Team(team_id) => {
            let team = find_team(teams, team_id)?;
            ScopeChain::for_team(team)
        }
        OwnerRef::Org(org_id) => teams
            .iter()
            .filter(|team| team.org_id == Some(org_id))
            .fold(ScopeChain::for_org(org_id), |chain, team| {
                chain.with(ScopeBinding::Team(team.team_id))
            }),
    };
    Ok(chain.with(ScopeBinding::Context(context.context_id)))
}

/// Chain for a context id alone, used when the context row is not visible.
#[must_use]
pub fn chain_for_context_id(context_id: ContextId) -> ScopeChain {
    ScopeChain::global().with(ScopeBinding::Context(context_id))
}

fn find_team(teams: &[Team], team_id: TeamId) -> Result<&Team, IntegrityError> {
    teams
        .iter()
        .find(|team| team.team_id == team_id)
        .ok_or(IntegrityError::UnknownTeam(team_id))
}
