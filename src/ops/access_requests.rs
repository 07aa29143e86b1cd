use chrono::{NaiveDateTime, Utc};

use crate::{
    db::{
        models::{AccessRequest, AccessRequestId, Group, GroupId, RequestStatus, User, UserId},
        DbConn,
    },
    error::ApiResult,
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    ops::{constraints, request_approvers, ModifyGroupUsers},
};

/// Files a request for membership or ownership of a managed group. The
/// conditional-access hooks may settle it inline; otherwise the approver
/// tiers are notified.
pub struct CreateAccessRequest {
    requester_user_id: UserId,
    requested_group_id: GroupId,
    request_ownership: bool,
    request_reason: String,
    request_ending_at: Option<NaiveDateTime>,
}

impl CreateAccessRequest {
    pub fn new(requester_user_id: UserId, requested_group_id: GroupId) -> Self {
        Self {
            requester_user_id,
            requested_group_id,
            request_ownership: false,
            request_reason: String::new(),
            request_ending_at: None,
        }
    }

    #[must_use]
    pub fn ownership(mut self) -> Self {
        self.request_ownership = true;
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.request_reason = reason.into();
        self
    }

    #[must_use]
    pub fn ending_at(mut self, ending_at: Option<NaiveDateTime>) -> Self {
        self.request_ending_at = ending_at;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<AccessRequest> {
        let Some(requester) = User::find_by_id(&self.requester_user_id, conn).await else {
            err_not_found!(format!("User {} not found", self.requester_user_id));
        };
        let Some(group) = Group::find_by_id(&self.requested_group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.requested_group_id));
        };

        // Requests against unmanaged groups can never be fulfilled here
        if !group.is_managed {
            err!(format!("Group {} is not managed by this service", group.name));
        }

        let mut request = AccessRequest::new(
            requester.id.clone(),
            group.id.clone(),
            self.request_ownership,
            self.request_reason.clone(),
            self.request_ending_at,
        );
        request.save(conn).await?;

        let approvers = request_approvers(&group.id, &requester.id, conn).await;

        hooks::audit::log_event(
            AuditEvent::new(EventType::AccessCreate, "access_request", request.id.to_string(), "created")
                .actor(Some(&requester.id), Some(requester.email.clone()))
                .target_name(format!("Access request for {}", group.name))
                .reason(self.request_reason.clone())
                .payload(request.to_json()),
        );
        hooks::metrics::increment("access_request.created", &[("ownership", if self.request_ownership { "true" } else { "false" })]);

        // A conditional-access decision settles the request inline, without
        // pinging the approvers
        let tags = Group::active_tags(&group.id, conn).await;
        if let Some(response) = hooks::conditional::access_request_created(&request, &group, &tags, &requester) {
            if response.approved {
                return ApproveAccessRequest::new(request.id.clone(), None)
                    .reason(response.reason)
                    .ending_at(response.ending_at)
                    .silent()
                    .execute(conn)
                    .await;
            }
            return RejectAccessRequest::new(request.id.clone(), None)
                .reason(response.reason)
                .silent()
                .execute(conn)
                .await;
        }

        hooks::notifications::access_request_created(&request, &group, &requester, &approvers);

        Ok(request)
    }
}

/// Approves a pending request by delegating to `ModifyGroupUsers`, which
/// inserts the grant and flips the request in the same pass. Every guard
/// re-runs here: terminal states stay terminal, nobody approves their own
/// request, and the reason gate binds the approver too.
pub struct ApproveAccessRequest {
    access_request_id: AccessRequestId,
    approver_user_id: Option<UserId>,
    approval_reason: String,
    ending_at: Option<NaiveDateTime>,
    notify: bool,
}

impl ApproveAccessRequest {
    pub fn new(access_request_id: AccessRequestId, approver_user_id: Option<UserId>) -> Self {
        Self {
            access_request_id,
            approver_user_id,
            approval_reason: String::new(),
            ending_at: None,
            notify: true,
        }
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.approval_reason = reason.into();
        self
    }

    #[must_use]
    pub fn ending_at(mut self, ending_at: Option<NaiveDateTime>) -> Self {
        self.ending_at = ending_at;
        self
    }

    #[must_use]
    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<AccessRequest> {
        let Some(request) = AccessRequest::find_by_id(&self.access_request_id, conn).await else {
            err_not_found!(format!("Access request {} not found", self.access_request_id));
        };

        // Resolved exactly once
        if !request.is_pending() {
            return Ok(request);
        }

        // Self-approval is never allowed
        if let Some(approver_id) = &self.approver_user_id {
            if request.requester_user_id == *approver_id {
                return Ok(request);
            }
        }

        // The requester must still exist and the group must still be a
        // managed, live group
        if User::find_by_id(&request.requester_user_id, conn).await.is_none() {
            return Ok(request);
        }
        let Some(group) = Group::find_by_id(&request.requested_group_id, conn).await else {
            return Ok(request);
        };
        if !group.is_managed {
            return Ok(request);
        }

        let approver = User::resolve_actor(self.approver_user_id.as_ref(), conn).await;
        let (valid, _) =
            constraints::check_reason_for_group(&group, approver.as_ref(), &self.approval_reason, conn).await;
        if !valid {
            return Ok(request);
        }

        let approver_email = match approver.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::AccessApprove, "access_request", request.id.to_string(), "approved")
                .actor(approver.as_ref(), approver_email)
                .target_name(format!("Access request for {}", group.name))
                .reason(self.approval_reason.clone())
                .payload(request.to_json()),
        );

        // The grant write resolves the request as a side effect
        let op = ModifyGroupUsers::new(group.id.clone(), approver.clone())
            .ended_at(self.ending_at)
            .reason(self.approval_reason.clone());
        let op = if request.request_ownership {
            op.add_owners(vec![request.requester_user_id.clone()])
        } else {
            op.add_members(vec![request.requester_user_id.clone()])
        };
        let op = if self.notify {
            op
        } else {
            op.silent()
        };
        op.execute(conn).await?;

        match AccessRequest::find_by_id(&self.access_request_id, conn).await {
            Some(request) => Ok(request),
            None => Ok(request),
        }
    }
}

/// Terminally rejects a pending request
pub struct RejectAccessRequest {
    access_request_id: AccessRequestId,
    current_actor_id: Option<UserId>,
    rejection_reason: String,
    notify: bool,
    notify_requester: bool,
}

impl RejectAccessRequest {
    pub fn new(access_request_id: AccessRequestId, current_actor_id: Option<UserId>) -> Self {
        Self {
            access_request_id,
            current_actor_id,
            rejection_reason: String::new(),
            notify: true,
            notify_requester: true,
        }
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = reason.into();
        self
    }

    #[must_use]
    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }

    #[must_use]
    pub fn skip_requester_notification(mut self) -> Self {
        self.notify_requester = false;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<AccessRequest> {
        let Some(mut request) = AccessRequest::find_by_id(&self.access_request_id, conn).await else {
            err_not_found!(format!("Access request {} not found", self.access_request_id));
        };

        if !request.is_pending() {
            return Ok(request);
        }

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        request.status = RequestStatus::Rejected as i32;
        request.resolved_at = Some(Utc::now().naive_utc());
        request.resolver_user_id = actor.clone();
        request.resolution_reason = self.rejection_reason.clone();
        request.save(conn).await?;

        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::AccessReject, "access_request", request.id.to_string(), "rejected")
                .actor(actor.as_ref(), actor_email)
                .reason(self.rejection_reason.clone())
                .payload(request.to_json()),
        );

        if self.notify {
            // The group may already be deleted when the rejection cascades
            // from a group delete
            if let Some(group) = Group::find_by_id_including_deleted(&request.requested_group_id, conn).await {
                let requester = User::find_by_id(&request.requester_user_id, conn).await;
                let approvers = request_approvers(&request.requested_group_id, &request.requester_user_id, conn).await;
                hooks::notifications::access_request_completed(
                    &request,
                    &group,
                    requester.as_ref(),
                    &approvers,
                    self.notify_requester,
                );
            }
        }

        Ok(request)
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::{GroupKind, Membership};
    use crate::ops::testutil::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn approving_a_request_grants_access_and_records_the_resolution() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let approver = seed_user(&conn, "u2").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let request = CreateAccessRequest::new(requester.id.clone(), g1.id.clone())
            .reason("covering the on-call shift")
            .execute(&conn)
            .await
            .unwrap();
        assert!(request.is_pending());

        let request = ApproveAccessRequest::new(request.id.clone(), Some(approver.id.clone()))
            .reason("fine by me")
            .execute(&conn)
            .await
            .unwrap();

        assert_eq!(request.status(), RequestStatus::Approved);
        assert_eq!(request.resolver_user_id.as_ref(), Some(&approver.id));
        assert_eq!(request.resolution_reason, "fine by me");
        assert!(request.resolved_at.is_some());
        assert!(request.approved_membership_id.is_some());
        assert!(Membership::has_active(&requester.id, &g1.id, false, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_resolved_request_is_never_re_resolved() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let approver = seed_user(&conn, "u2").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let request =
            CreateAccessRequest::new(requester.id.clone(), g1.id.clone()).execute(&conn).await.unwrap();
        let approved = ApproveAccessRequest::new(request.id.clone(), Some(approver.id.clone()))
            .execute(&conn)
            .await
            .unwrap();
        let resolved_at = approved.resolved_at;

        // A later rejection attempt leaves the terminal state untouched
        let after = RejectAccessRequest::new(request.id.clone(), Some(approver.id.clone()))
            .reason("changed my mind")
            .execute(&conn)
            .await
            .unwrap();
        assert_eq!(after.status(), RequestStatus::Approved);
        assert_eq!(after.resolved_at, resolved_at);
        assert_ne!(after.resolution_reason, "changed my mind");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requesters_cannot_approve_their_own_request() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let request =
            CreateAccessRequest::new(requester.id.clone(), g1.id.clone()).execute(&conn).await.unwrap();
        let after = ApproveAccessRequest::new(request.id.clone(), Some(requester.id.clone()))
            .execute(&conn)
            .await
            .unwrap();

        assert_eq!(after.status(), RequestStatus::Pending);
        assert!(!Membership::has_active(&requester.id, &g1.id, false, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_against_unmanaged_groups_are_refused() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Legacy", GroupKind::Plain, false).await;

        let err = CreateAccessRequest::new(requester.id.clone(), g1.id.clone()).execute(&conn).await.unwrap_err();
        assert!(!err.message().is_empty());
    }
}
