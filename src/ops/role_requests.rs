use chrono::{NaiveDateTime, Utc};

use crate::{
    db::{
        models::{
            coalesce_bool_constraint, App, AppGroup, Group, GroupId, Membership, RequestStatus, RoleRequest,
            RoleRequestId, Tag, User, UserId,
        },
        DbConn,
    },
    error::ApiResult,
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    ops::{constraints, request_approvers, ModifyRoleGroups},
};

/// Files a request to attach the requester's role to a group. Approvers who
/// sit in the requesting role are filtered out when the target group
/// forbids self-added access, because approving would grant themselves
/// access transitively.
pub struct CreateRoleRequest {
    requester_user_id: UserId,
    requester_role_id: GroupId,
    requested_group_id: GroupId,
    request_ownership: bool,
    request_reason: String,
    request_ending_at: Option<NaiveDateTime>,
}

impl CreateRoleRequest {
    pub fn new(requester_user_id: UserId, requester_role_id: GroupId, requested_group_id: GroupId) -> Self {
        Self {
            requester_user_id,
            requester_role_id,
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

    pub async fn execute(self, conn: &DbConn) -> ApiResult<RoleRequest> {
        let Some(requester) = User::find_by_id(&self.requester_user_id, conn).await else {
            err_not_found!(format!("User {} not found", self.requester_user_id));
        };
        let Some(role) = Group::find_by_id(&self.requester_role_id, conn).await else {
            err_not_found!(format!("Role group {} not found", self.requester_role_id));
        };
        if !role.is_role() {
            err!(format!("Group {} is not a role group", role.name));
        }
        let Some(group) = Group::find_by_id(&self.requested_group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.requested_group_id));
        };

        if !group.is_managed {
            err!(format!("Group {} is not managed by this service", group.name));
        }
        // Roles never nest
        if group.is_role() {
            err!("A role group cannot be requested as the target of another role");
        }

        let mut request = RoleRequest::new(
            requester.id.clone(),
            role.id.clone(),
            group.id.clone(),
            self.request_ownership,
            self.request_reason.clone(),
            self.request_ending_at,
        );
        request.save(conn).await?;

        let approvers = self.approvers(&requester, &role, &group, conn).await;

        hooks::audit::log_event(
            AuditEvent::new(EventType::RoleRequestCreate, "role_request", request.id.to_string(), "created")
                .actor(Some(&requester.id), Some(requester.email.clone()))
                .target_name(format!("Role request for {}", group.name))
                .reason(self.request_reason.clone())
                .payload(request.to_json()),
        );
        hooks::metrics::increment("role_request.created", &[]);

        let tags = Group::active_tags(&group.id, conn).await;
        if let Some(response) = hooks::conditional::role_request_created(&request, &role, &group, &tags, &requester) {
            if response.approved {
                return ApproveRoleRequest::new(request.id.clone(), None)
                    .reason(response.reason)
                    .ending_at(response.ending_at)
                    .silent()
                    .execute(conn)
                    .await;
            }
            return RejectRoleRequest::new(request.id.clone(), None)
                .reason(response.reason)
                .silent()
                .execute(conn)
                .await;
        }

        hooks::notifications::access_role_request_created(&request, &role, &group, &requester, &approvers);

        Ok(request)
    }

    /// Group owners, minus role members when the target restricts self-add,
    /// then app managers, then the access admins
    async fn approvers(&self, requester: &User, role: &Group, group: &Group, conn: &DbConn) -> Vec<User> {
        let mut approver_ids = Membership::active_owner_ids(&group.id, conn).await;

        let tags = Group::active_tags(&group.id, conn).await;
        let disallow_key = if self.request_ownership {
            Tag::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY
        } else {
            Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY
        };
        if coalesce_bool_constraint(disallow_key, &tags) {
            let role_member_ids = Membership::active_user_ids(&role.id, false, conn).await;
            approver_ids.retain(|id| !role_member_ids.contains(id));
        }

        if let Some(app_group) = AppGroup::find_by_group(&group.id, conn).await {
            if approver_ids.is_empty() || (approver_ids.len() == 1 && approver_ids[0] == requester.id) {
                approver_ids = App::manager_ids(&app_group.app_id, conn).await;
            }
        }

        if approver_ids.is_empty() || (approver_ids.len() == 1 && approver_ids[0] == requester.id) {
            approver_ids = App::access_admin_ids(conn).await;
        }

        User::find_by_ids(&approver_ids, conn).await
    }
}

/// Approves a pending role request by attaching the role through
/// `ModifyRoleGroups`, which resolves the request in the same pass
pub struct ApproveRoleRequest {
    role_request_id: RoleRequestId,
    approver_user_id: Option<UserId>,
    approval_reason: String,
    ending_at: Option<NaiveDateTime>,
    notify: bool,
}

impl ApproveRoleRequest {
    pub fn new(role_request_id: RoleRequestId, approver_user_id: Option<UserId>) -> Self {
        Self {
            role_request_id,
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

    pub async fn execute(self, conn: &DbConn) -> ApiResult<RoleRequest> {
        let Some(request) = RoleRequest::find_by_id(&self.role_request_id, conn).await else {
            err_not_found!(format!("Role request {} not found", self.role_request_id));
        };

        if !request.is_pending() {
            return Ok(request);
        }

        if let Some(approver_id) = &self.approver_user_id {
            if request.requester_user_id == *approver_id {
                return Ok(request);
            }
        }

        // Role and group must both still be live, and the group managed
        let Some(role) = Group::find_by_id(&request.requester_role_id, conn).await else {
            return Ok(request);
        };
        let Some(group) = Group::find_by_id(&request.requested_group_id, conn).await else {
            return Ok(request);
        };
        if !group.is_managed {
            return Ok(request);
        }

        let approver = User::resolve_actor(self.approver_user_id.as_ref(), conn).await;

        let (member_adds, owner_adds) = if request.request_ownership {
            (Vec::new(), vec![group.id.clone()])
        } else {
            (vec![group.id.clone()], Vec::new())
        };
        let (valid, _) = constraints::check_reason_for_role(
            &role,
            approver.as_ref(),
            &self.approval_reason,
            &member_adds,
            &owner_adds,
            conn,
        )
        .await;
        if !valid {
            return Ok(request);
        }

        let approver_email = match approver.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::RoleRequestApprove, "role_request", request.id.to_string(), "approved")
                .actor(approver.as_ref(), approver_email)
                .target_name(format!("Role request for {}", group.name))
                .reason(self.approval_reason.clone())
                .payload(request.to_json()),
        );

        let op = ModifyRoleGroups::new(role.id.clone(), approver.clone())
            .ended_at(self.ending_at)
            .reason(self.approval_reason.clone());
        let op = if request.request_ownership {
            op.attach_owner_groups(vec![group.id.clone()])
        } else {
            op.attach_groups(vec![group.id.clone()])
        };
        let op = if self.notify {
            op
        } else {
            op.silent()
        };
        op.execute(conn).await?;

        match RoleRequest::find_by_id(&self.role_request_id, conn).await {
            Some(request) => Ok(request),
            None => Ok(request),
        }
    }
}

/// Terminally rejects a pending role request
pub struct RejectRoleRequest {
    role_request_id: RoleRequestId,
    current_actor_id: Option<UserId>,
    rejection_reason: String,
    notify: bool,
    notify_requester: bool,
}

impl RejectRoleRequest {
    pub fn new(role_request_id: RoleRequestId, current_actor_id: Option<UserId>) -> Self {
        Self {
            role_request_id,
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

    pub async fn execute(self, conn: &DbConn) -> ApiResult<RoleRequest> {
        let Some(mut request) = RoleRequest::find_by_id(&self.role_request_id, conn).await else {
            err_not_found!(format!("Role request {} not found", self.role_request_id));
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
            AuditEvent::new(EventType::RoleRequestReject, "role_request", request.id.to_string(), "rejected")
                .actor(actor.as_ref(), actor_email)
                .reason(self.rejection_reason.clone())
                .payload(request.to_json()),
        );

        if self.notify {
            let role = Group::find_by_id_including_deleted(&request.requester_role_id, conn).await;
            let group = Group::find_by_id_including_deleted(&request.requested_group_id, conn).await;
            if let (Some(role), Some(group)) = (role, group) {
                let requester = User::find_by_id(&request.requester_user_id, conn).await;
                let approvers = request_approvers(&request.requested_group_id, &request.requester_user_id, conn).await;
                hooks::notifications::access_role_request_completed(
                    &request,
                    &role,
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
    use crate::db::models::{GroupKind, RoleGroupMap};
    use crate::ops::{testutil::*, CreateApp};

    #[tokio::test(flavor = "multi_thread")]
    async fn approving_a_role_request_attaches_the_role() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let approver = seed_user(&conn, "u2").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &requester, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;

        let request = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), g1.id.clone())
            .reason("oncall needs the pager")
            .execute(&conn)
            .await
            .unwrap();
        assert!(request.is_pending());

        let request = ApproveRoleRequest::new(request.id.clone(), Some(approver.id.clone()))
            .reason("fine by me")
            .execute(&conn)
            .await
            .unwrap();

        assert_eq!(request.status(), RequestStatus::Approved);
        assert_eq!(request.resolver_user_id.as_ref(), Some(&approver.id));

        let maps = RoleGroupMap::find_active_by_role(&role.id, &conn).await;
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].group_id, g1.id);
        assert!(!maps[0].is_owner);
        assert_eq!(request.approved_membership_id.as_ref(), Some(&maps[0].id));

        // The requester held a role membership, so the attach fanned out
        assert!(Membership::has_active(&requester.id, &g1.id, false, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn role_targets_cannot_be_requested() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        let other_role = seed_group(&conn, "Role-Other", GroupKind::Role, true).await;

        let err = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), other_role.id.clone())
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(!err.message().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn approvers_fall_through_owners_then_app_managers_then_access_admins() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "req").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;

        // First tier: the target group's owners
        let owner = seed_user(&conn, "own").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        seed_grant(&conn, &owner, &g1, true).await;

        let op = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), g1.id.clone());
        let approvers = op.approvers(&requester, &role, &g1, &conn).await;
        assert_eq!(approvers.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&owner.id]);

        // Second tier: an ownerless app group falls through to the app
        // managers
        let manager = seed_user(&conn, "mgr").await;
        CreateApp::new(String::from("Chat"), String::new(), None)
            .owner(manager.id.clone())
            .additional_groups(vec![(String::from("Tools"), String::new())])
            .execute(&conn)
            .await
            .unwrap();
        let tools = Group::find_by_name("App-Chat-Tools", &conn).await.unwrap();

        let op = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), tools.id.clone());
        let approvers = op.approvers(&requester, &role, &tools, &conn).await;
        assert_eq!(approvers.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&manager.id]);

        // Third tier: an ownerless plain group lands on the access admins
        let admin = seed_user(&conn, "adm").await;
        CreateApp::new(App::ACCESS_APP_RESERVED_NAME.to_string(), String::new(), None)
            .owner(admin.id.clone())
            .execute(&conn)
            .await
            .unwrap();
        let g2 = seed_group(&conn, "Orphan", GroupKind::Plain, true).await;

        let op = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), g2.id.clone());
        let approvers = op.approvers(&requester, &role, &g2, &conn).await;
        assert_eq!(approvers.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&admin.id]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn role_members_are_filtered_from_approvers_when_self_add_is_restricted() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "req").await;
        let admin = seed_user(&conn, "adm").await;
        CreateApp::new(App::ACCESS_APP_RESERVED_NAME.to_string(), String::new(), None)
            .owner(admin.id.clone())
            .execute(&conn)
            .await
            .unwrap();

        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        // The only group owner also sits in the requesting role
        let dual = seed_user(&conn, "dual").await;
        seed_grant(&conn, &dual, &role, false).await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        seed_grant(&conn, &dual, &g1, true).await;

        let op = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), g1.id.clone());
        let approvers = op.approvers(&requester, &role, &g1, &conn).await;
        assert_eq!(approvers.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&dual.id]);

        // Once the target restricts self-added membership, approving would
        // grant the owner access through their own role, so they are
        // filtered and the tier falls through
        let tag = seed_tag(&conn, "no-self-add", json!({ Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY: true })).await;
        attach_tag(&conn, &g1, &tag).await;

        let op = CreateRoleRequest::new(requester.id.clone(), role.id.clone(), g1.id.clone());
        let approvers = op.approvers(&requester, &role, &g1, &conn).await;
        assert_eq!(approvers.iter().map(|u| &u.id).collect::<Vec<_>>(), vec![&admin.id]);
    }
}
