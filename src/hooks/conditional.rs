use std::sync::Arc;

use chrono::NaiveDateTime;

use super::Registry;
use crate::db::models::{AccessRequest, Group, GroupRequest, RoleRequest, Tag, User};

/// Decision returned by a conditional-access hook. `None` from every hook
/// leaves the request pending for a human approver.
#[derive(Clone, Debug)]
pub struct ConditionalAccessResponse {
    pub approved: bool,
    pub reason: String,
    pub ending_at: Option<NaiveDateTime>,
}

impl ConditionalAccessResponse {
    pub fn approve(reason: impl Into<String>, ending_at: Option<NaiveDateTime>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            ending_at,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            ending_at: None,
        }
    }
}

/// Synchronous decision hooks consulted while the request is being created.
/// These are the only hooks allowed to block the commit path.
pub trait ConditionalAccess: Send + Sync {
    fn access_request_created(
        &self,
        request: &AccessRequest,
        group: &Group,
        group_tags: &[Tag],
        requester: &User,
    ) -> Option<ConditionalAccessResponse>;

    fn role_request_created(
        &self,
        request: &RoleRequest,
        role: &Group,
        group: &Group,
        group_tags: &[Tag],
        requester: &User,
    ) -> Option<ConditionalAccessResponse> {
        let _ = (request, role, group, group_tags, requester);
        None
    }

    fn group_request_created(&self, request: &GroupRequest, requester: &User) -> Option<ConditionalAccessResponse> {
        let _ = (request, requester);
        None
    }
}

static HOOKS: Registry<dyn ConditionalAccess> = Registry::new("conditional access");

pub fn register(hook: Arc<dyn ConditionalAccess>) {
    HOOKS.register(hook);
}

/// First decision wins; hooks after it are not consulted
pub fn access_request_created(
    request: &AccessRequest,
    group: &Group,
    group_tags: &[Tag],
    requester: &User,
) -> Option<ConditionalAccessResponse> {
    HOOKS.snapshot().iter().find_map(|h| h.access_request_created(request, group, group_tags, requester))
}

pub fn role_request_created(
    request: &RoleRequest,
    role: &Group,
    group: &Group,
    group_tags: &[Tag],
    requester: &User,
) -> Option<ConditionalAccessResponse> {
    HOOKS.snapshot().iter().find_map(|h| h.role_request_created(request, role, group, group_tags, requester))
}

pub fn group_request_created(request: &GroupRequest, requester: &User) -> Option<ConditionalAccessResponse> {
    HOOKS.snapshot().iter().find_map(|h| h.group_request_created(request, requester))
}
