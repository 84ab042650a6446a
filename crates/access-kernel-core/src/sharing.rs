//! Cross-scope sharing with lazy expiry.
//!
//! Shares are strictly additive on top of role grants and only ever reach the
//! CONTEXT and MEMORY resources of the shared context.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::permission::{max_sensitivity, within_ceiling};
use crate::{
    Action, CallerScopes, Context, ContextId, ContextSensitivity, ContextShare,
    EffectivePermissionSet, PermissionLevel, Resource, Role, ShareId, ShareTarget, UserId,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ShareError {
    #[error("sharer does not hold share on context {0}")]
    InvalidTarget(ContextId),
    #[error("context tier {tier:?} exceeds audience ceiling {ceiling:?}")]
    InvalidSensitivity { tier: ContextSensitivity, ceiling: ContextSensitivity },
    #[error("invalid share request: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShareRequest {
    pub context_id: ContextId,
    pub target: ShareTarget,
    pub permission_level: PermissionLevel,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub message: Option<String>,
}

#[must_use]
pub fn level_actions(level: PermissionLevel) -> BTreeSet<Action> {
    let read = [Action::Read, Action::Export];
    let write = [Action::Create, Action::Update];
    let admin = [Action::Delete, Action::Share, Action::Administer];
    let mut actions: BTreeSet<Action> = read.into_iter().collect();
    if level >= PermissionLevel::Write {
        actions.extend(write);
    }
    if level >= PermissionLevel::Admin {
        actions.extend(admin);
    }
    actions
}

/// Weakest role a member of the share's audience could hold.
///
/// Any member of a team or org may be a viewer, so group targets floor at
/// `Viewer`. A user target floors at the role equivalent of the level.
#[must_use]
pub fn audience_floor(target: ShareTarget, level: PermissionLevel) -> Role {
    match (target, level) {
        (ShareTarget::Team(_) | ShareTarget::Org(_), _)
        | (ShareTarget::User(_), PermissionLevel::Read) => Role::Viewer,
        (ShareTarget::User(_), PermissionLevel::Write) => Role::Member,
        (ShareTarget::User(_), PermissionLevel::Admin) => Role::Admin,
    }
}

/// Layer the caller's active shares on `context_id` onto a role-derived set.
#[must_use]
pub fn apply_shares(
    mut eps: EffectivePermissionSet,
    context_id: ContextId,
    caller_scopes: &CallerScopes,
    shares: &[ContextShare],
    now: OffsetDateTime,
) -> EffectivePermissionSet {
    if !matches!(eps.resource, Resource::Context | Resource::Memory) {
        return eps;
    }
    let reaching = shares.iter().filter(|share| {
        share.context_id == context_id
            && share.revoked_at.is_none()
            && caller_scopes.matches(share.target)
    });
    for share in reaching {
        let actions = level_actions(share.permission_level);
        if share.is_expired_at(now) {
            eps.expired_share_actions.extend(actions);
        } else if within_ceiling(audience_floor(share.target, share.permission_level), eps.tier) {
            eps.share_actions.extend(actions);
        } else {
            eps.capped_actions.extend(actions);
        }
    }
    eps
}

/// Checks on a share request that hold whoever the sharer is.
///
/// # Errors
/// [`ShareError::Validation`] for a mismatched context or an expiry not in the future.
pub fn validate_share_request(
    context: &Context,
    request: &ShareRequest,
    now: OffsetDateTime,
) -> Result<(), ShareError> {
    if request.context_id != context.context_id {
        return Err(ShareError::Validation(format!(
            "request targets context {} but {} was resolved",
            request.context_id, context.context_id
        )));
    }
    if request.expires_at.is_some_and(|expires_at| expires_at <= now) {
        return Err(ShareError::Validation("expires_at MUST be in the future".to_string()));
    }
    Ok(())
}

/// Build a share row after checking the sharer and the audience ceiling.
///
/// `max_lifetime` caps the expiry; a request without expiry gets the cap.
///
/// # Errors
/// [`ShareError::InvalidTarget`] when the sharer lacks SHARE,
/// [`ShareError::InvalidSensitivity`] when the tier exceeds the audience ceiling,
/// [`ShareError::Validation`] for a mismatched context or an expiry not in the future.
pub fn create_share(
    sharer_eps: &EffectivePermissionSet,
    context: &Context,
    request: &ShareRequest,
    created_by: UserId,
    now: OffsetDateTime,
    max_lifetime: Option<Duration>,
) -> Result<ContextShare, ShareError> {
    validate_share_request(context, request, now)?;
    if !sharer_eps.allows(Action::Share) {
        return Err(ShareError::InvalidTarget(context.context_id));
    }
    let ceiling = max_sensitivity(audience_floor(request.target, request.permission_level));
    if context.sensitivity_tier > ceiling {
        return Err(ShareError::InvalidSensitivity { tier: context.sensitivity_tier, ceiling });
    }
    let cap = max_lifetime.map(|lifetime| now + lifetime);
    let expires_at = match (request.expires_at, cap) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (requested, cap) => requested.or(cap),
    };

    Ok(ContextShare {
        share_id: ShareId::new(),
        context_id: context.context_id,
        target: request.target,
        permission_level: request.permission_level,
        message: request.message.clone(),
        expires_at,
        created_by,
        created_at: now,
        revoked_at: None,
        revoked_by: None,
    })
}
