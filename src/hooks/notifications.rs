use std::sync::Arc;

use chrono::NaiveDateTime;

use super::Registry;
use crate::{
    db::models::{AccessRequest, Group, Membership, RoleGroupMap, RoleRequest, User},
    error::EmptyResult,
    util::format_date,
};

/// Fire-and-forget notification surface. Implementations deliver to chat,
/// mail or tickets; the engine only promises to call them after commit and
/// to swallow whatever they raise.
pub trait Notifier: Send + Sync {
    fn access_request_created(
        &self,
        request: &AccessRequest,
        group: &Group,
        requester: &User,
        approvers: &[User],
    ) -> EmptyResult;

    fn access_request_completed(
        &self,
        request: &AccessRequest,
        group: &Group,
        requester: Option<&User>,
        approvers: &[User],
        notify_requester: bool,
    ) -> EmptyResult;

    fn access_role_request_created(
        &self,
        request: &RoleRequest,
        role: &Group,
        group: &Group,
        requester: &User,
        approvers: &[User],
    ) -> EmptyResult;

    fn access_role_request_completed(
        &self,
        request: &RoleRequest,
        role: &Group,
        group: &Group,
        requester: Option<&User>,
        approvers: &[User],
        notify_requester: bool,
    ) -> EmptyResult;

    fn access_expiring_user(
        &self,
        user: &User,
        groups: &[Group],
        expiration_datetime: NaiveDateTime,
        memberships: &[Membership],
    ) -> EmptyResult;

    fn access_expiring_owner(
        &self,
        owner: &User,
        group_user_associations: &[Membership],
        role_group_associations: &[RoleGroupMap],
        expiration_datetime: NaiveDateTime,
    ) -> EmptyResult;

    fn access_expiring_role_owner(
        &self,
        owner: &User,
        roles: &[RoleGroupMap],
        expiration_datetime: NaiveDateTime,
    ) -> EmptyResult;
}

static NOTIFIERS: Registry<dyn Notifier> = Registry::new("notification");

pub fn register(notifier: Arc<dyn Notifier>) {
    NOTIFIERS.register(notifier);
}

pub fn access_request_created(request: &AccessRequest, group: &Group, requester: &User, approvers: &[User]) {
    NOTIFIERS.dispatch("access_request_created", |h| h.access_request_created(request, group, requester, approvers));
}

pub fn access_request_completed(
    request: &AccessRequest,
    group: &Group,
    requester: Option<&User>,
    approvers: &[User],
    notify_requester: bool,
) {
    NOTIFIERS.dispatch("access_request_completed", |h| {
        h.access_request_completed(request, group, requester, approvers, notify_requester)
    });
}

pub fn access_role_request_created(
    request: &RoleRequest,
    role: &Group,
    group: &Group,
    requester: &User,
    approvers: &[User],
) {
    NOTIFIERS.dispatch("access_role_request_created", |h| {
        h.access_role_request_created(request, role, group, requester, approvers)
    });
}

pub fn access_role_request_completed(
    request: &RoleRequest,
    role: &Group,
    group: &Group,
    requester: Option<&User>,
    approvers: &[User],
    notify_requester: bool,
) {
    NOTIFIERS.dispatch("access_role_request_completed", |h| {
        h.access_role_request_completed(request, role, group, requester, approvers, notify_requester)
    });
}

pub fn access_expiring_user(user: &User, groups: &[Group], expiration_datetime: NaiveDateTime, memberships: &[Membership]) {
    NOTIFIERS.dispatch("access_expiring_user", |h| {
        h.access_expiring_user(user, groups, expiration_datetime, memberships)
    });
}

pub fn access_expiring_owner(
    owner: &User,
    group_user_associations: &[Membership],
    role_group_associations: &[RoleGroupMap],
    expiration_datetime: NaiveDateTime,
) {
    NOTIFIERS.dispatch("access_expiring_owner", |h| {
        h.access_expiring_owner(owner, group_user_associations, role_group_associations, expiration_datetime)
    });
}

pub fn access_expiring_role_owner(owner: &User, roles: &[RoleGroupMap], expiration_datetime: NaiveDateTime) {
    NOTIFIERS.dispatch("access_expiring_role_owner", |h| {
        h.access_expiring_role_owner(owner, roles, expiration_datetime)
    });
}

/// The built-in delivery: structured log lines. Enough for dev setups and
/// for piping into log-based alerting.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn access_request_created(
        &self,
        request: &AccessRequest,
        group: &Group,
        requester: &User,
        approvers: &[User],
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Access request {} created by {} for {} ({} approvers)",
            request.id, requester.email, group.name, approvers.len()
        );
        Ok(())
    }

    fn access_request_completed(
        &self,
        request: &AccessRequest,
        group: &Group,
        requester: Option<&User>,
        _approvers: &[User],
        _notify_requester: bool,
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Access request {} for {} completed as {:?} (requester {})",
            request.id,
            group.name,
            request.status(),
            requester.map(|u| u.email.as_str()).unwrap_or("unknown")
        );
        Ok(())
    }

    fn access_role_request_created(
        &self,
        request: &RoleRequest,
        role: &Group,
        group: &Group,
        requester: &User,
        approvers: &[User],
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Role request {} created by {} to attach {} to {} ({} approvers)",
            request.id, requester.email, role.name, group.name, approvers.len()
        );
        Ok(())
    }

    fn access_role_request_completed(
        &self,
        request: &RoleRequest,
        role: &Group,
        group: &Group,
        _requester: Option<&User>,
        _approvers: &[User],
        _notify_requester: bool,
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Role request {} for {} on {} completed as {:?}",
            request.id, role.name, group.name, request.status()
        );
        Ok(())
    }

    fn access_expiring_user(
        &self,
        user: &User,
        groups: &[Group],
        expiration_datetime: NaiveDateTime,
        _memberships: &[Membership],
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Access for {} to {} group(s) expires before {}",
            user.email, groups.len(), format_date(&expiration_datetime)
        );
        Ok(())
    }

    fn access_expiring_owner(
        &self,
        owner: &User,
        group_user_associations: &[Membership],
        role_group_associations: &[RoleGroupMap],
        expiration_datetime: NaiveDateTime,
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Owner {} has {} member grant(s) and {} role association(s) expiring before {}",
            owner.email,
            group_user_associations.len(),
            role_group_associations.len(),
            format_date(&expiration_datetime)
        );
        Ok(())
    }

    fn access_expiring_role_owner(
        &self,
        owner: &User,
        roles: &[RoleGroupMap],
        expiration_datetime: NaiveDateTime,
    ) -> EmptyResult {
        info!(
            target: "accessward::notifications",
            "Role owner {} has {} association(s) expiring before {}",
            owner.email, roles.len(), format_date(&expiration_datetime)
        );
        Ok(())
    }
}
