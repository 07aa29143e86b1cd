use chrono::{NaiveDateTime, Utc};

use crate::{
    db::{
        models::{
            coalesce_ended_at, App, AppId, Group, GroupKind, GroupRequest, GroupRequestId, RequestStatus, Tag, TagId,
            User, UserId,
        },
        DbConn,
    },
    error::ApiResult,
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    ops::{groups::validate_group_name, CreateGroup, ModifyGroupUsers},
};

/// Files a request to create a group. The requested projection is kept on
/// the request so the approver can adjust it before the group is built; an
/// app owner requesting a group under their own app is approved on the
/// spot.
pub struct CreateGroupRequest {
    requester_user_id: UserId,
    requested_group_name: String,
    requested_group_description: String,
    requested_group_kind: GroupKind,
    requested_app_id: Option<AppId>,
    requested_group_tags: Vec<TagId>,
    requested_ownership_ending_at: Option<NaiveDateTime>,
    request_reason: String,
}

impl CreateGroupRequest {
    pub fn new(requester_user_id: UserId, requested_group_name: String, requested_group_kind: GroupKind) -> Self {
        Self {
            requester_user_id,
            requested_group_name,
            requested_group_description: String::new(),
            requested_group_kind,
            requested_app_id: None,
            requested_group_tags: Vec::new(),
            requested_ownership_ending_at: None,
            request_reason: String::new(),
        }
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.requested_group_description = description.into();
        self
    }

    #[must_use]
    pub fn for_app(mut self, app_id: AppId) -> Self {
        self.requested_app_id = Some(app_id);
        self
    }

    #[must_use]
    pub fn tags(mut self, tags: Vec<TagId>) -> Self {
        self.requested_group_tags = tags;
        self
    }

    #[must_use]
    pub fn ownership_ending_at(mut self, ending_at: Option<NaiveDateTime>) -> Self {
        self.requested_ownership_ending_at = ending_at;
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.request_reason = reason.into();
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<GroupRequest> {
        let Some(requester) = User::find_by_id(&self.requester_user_id, conn).await else {
            err_not_found!(format!("User {} not found", self.requester_user_id));
        };

        // The -Owners suffix is reserved for the group every app gets
        if self
            .requested_group_name
            .ends_with(&format!("{}{}", Group::APP_NAME_GROUP_NAME_SEPARATOR, Group::APP_OWNERS_GROUP_NAME_SUFFIX))
        {
            err!("Owner groups are created with their app and cannot be requested");
        }

        // An app id makes sense exactly for app groups, and must be real
        let app = match (&self.requested_group_kind, &self.requested_app_id) {
            (GroupKind::App, Some(app_id)) => match App::find_by_id(app_id, conn).await {
                Some(app) => Some(app),
                None => err!("App for the requested app group does not exist"),
            },
            (GroupKind::App, None) => err!("App groups must belong to an app"),
            (_, Some(_)) => err!("Only app group requests carry an app"),
            (_, None) => None,
        };

        validate_group_name(&self.requested_group_name, self.requested_group_kind, app.as_ref().map(|a| a.name.as_str()))?;

        if Group::find_by_name(&self.requested_group_name, conn).await.is_some() {
            err_conflict!(format!("A group named {} already exists", self.requested_group_name));
        }
        if GroupRequest::find_pending_by_name_and_app(&self.requested_group_name, self.requested_app_id.as_ref(), conn)
            .await
            .is_some()
        {
            err_conflict!(format!("A pending request for {} already exists", self.requested_group_name));
        }

        let tags = Tag::find_by_ids(&self.requested_group_tags, conn).await;
        if tags.len() != self.requested_group_tags.len() {
            err!("One or more requested tags do not exist");
        }

        // Ownership time limits bind the requested end bound already
        let ownership_ending_at = coalesce_ended_at(
            Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY,
            &tags,
            self.requested_ownership_ending_at,
            true,
        );

        let mut request = GroupRequest::new(
            requester.id.clone(),
            self.requested_group_name.clone(),
            self.requested_group_description.clone(),
            self.requested_group_kind.as_str().to_string(),
            self.requested_app_id.clone(),
            self.requested_group_tags.iter().map(ToString::to_string).collect(),
            ownership_ending_at,
            self.request_reason.clone(),
        );
        request.save(conn).await?;

        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupRequestCreate, "group_request", request.id.to_string(), "created")
                .actor(Some(&requester.id), Some(requester.email.clone()))
                .target_name(self.requested_group_name.clone())
                .reason(self.request_reason.clone()),
        );

        // Owners of the parent app may create groups under it directly
        if let Some(app) = &app {
            if App::manager_ids(&app.id, conn).await.contains(&requester.id) {
                return ApproveGroupRequest::new(request.id.clone(), None)
                    .reason("Requester owns the parent app and can create app groups")
                    .execute(conn)
                    .await;
            }
        }

        if let Some(response) = hooks::conditional::group_request_created(&request, &requester) {
            if response.approved {
                return ApproveGroupRequest::new(request.id.clone(), None).reason(response.reason).execute(conn).await;
            }
            return RejectGroupRequest::new(request.id.clone(), None).reason(response.reason).execute(conn).await;
        }

        let approvers = self.approvers(&requester, app.as_ref(), conn).await;
        info!(
            "Group request {} for {} awaits one of {} approver(s)",
            request.id,
            request.requested_group_name,
            approvers.len()
        );

        Ok(request)
    }

    /// App managers for app groups, access admins otherwise, with the usual
    /// requester-only fall-through
    async fn approvers(&self, requester: &User, app: Option<&App>, conn: &DbConn) -> Vec<User> {
        let mut approver_ids = match app {
            Some(app) => App::manager_ids(&app.id, conn).await,
            None => App::access_admin_ids(conn).await,
        };

        if approver_ids.is_empty() || (approver_ids.len() == 1 && approver_ids[0] == requester.id) {
            approver_ids = App::access_admin_ids(conn).await;
        }

        User::find_by_ids(&approver_ids, conn).await
    }
}

/// Builds the requested group and seeds the requester as its first member
/// and owner. The approver may adjust name, description and tags before the
/// group is created.
pub struct ApproveGroupRequest {
    group_request_id: GroupRequestId,
    approver_user_id: Option<UserId>,
    approval_reason: String,
    name_override: Option<String>,
    description_override: Option<String>,
    tags_override: Option<Vec<TagId>>,
    ownership_ending_at_override: Option<Option<NaiveDateTime>>,
}

impl ApproveGroupRequest {
    pub fn new(group_request_id: GroupRequestId, approver_user_id: Option<UserId>) -> Self {
        Self {
            group_request_id,
            approver_user_id,
            approval_reason: String::new(),
            name_override: None,
            description_override: None,
            tags_override: None,
            ownership_ending_at_override: None,
        }
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.approval_reason = reason.into();
        self
    }

    #[must_use]
    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name_override = Some(name.into());
        self
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description_override = Some(description.into());
        self
    }

    #[must_use]
    pub fn tags(mut self, tags: Vec<TagId>) -> Self {
        self.tags_override = Some(tags);
        self
    }

    #[must_use]
    pub fn ownership_ending_at(mut self, ending_at: Option<NaiveDateTime>) -> Self {
        self.ownership_ending_at_override = Some(ending_at);
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<GroupRequest> {
        let Some(mut request) = GroupRequest::find_by_id(&self.group_request_id, conn).await else {
            err_not_found!(format!("Group request {} not found", self.group_request_id));
        };

        if !request.is_pending() {
            return Ok(request);
        }

        if let Some(approver_id) = &self.approver_user_id {
            if request.requester_user_id == *approver_id {
                return Ok(request);
            }
        }

        if User::find_by_id(&request.requester_user_id, conn).await.is_none() {
            return Ok(request);
        }

        let approver = User::resolve_actor(self.approver_user_id.as_ref(), conn).await;

        let name = self.name_override.clone().unwrap_or_else(|| request.requested_group_name.clone());
        let description =
            self.description_override.clone().unwrap_or_else(|| request.requested_group_description.clone());
        let tag_ids: Vec<TagId> = self
            .tags_override
            .clone()
            .unwrap_or_else(|| request.tag_ids().into_iter().map(TagId::from).collect());
        let ownership_ending_at =
            self.ownership_ending_at_override.unwrap_or(request.requested_ownership_ending_at);
        let kind = GroupKind::from_str(&request.requested_group_kind);

        let mut create = CreateGroup::new(kind, name, description, approver.clone()).tags(tag_ids);
        if let Some(app_id) = request.requested_app_id.clone() {
            create = create.for_app(app_id, false);
        }
        let group = create.execute(conn).await?;

        // The requester starts out owning what they asked for
        ModifyGroupUsers::new(group.id.clone(), approver.clone())
            .add_members(vec![request.requester_user_id.clone()])
            .add_owners(vec![request.requester_user_id.clone()])
            .ended_at(ownership_ending_at)
            .reason(self.approval_reason.clone())
            .execute(conn)
            .await?;

        request.status = RequestStatus::Approved as i32;
        request.resolved_at = Some(Utc::now().naive_utc());
        request.resolver_user_id = approver.clone();
        request.resolution_reason = self.approval_reason.clone();
        request.approved_group_id = Some(group.id.clone());
        request.save(conn).await?;

        let approver_email = match approver.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupRequestApprove, "group_request", request.id.to_string(), "approved")
                .actor(approver.as_ref(), approver_email)
                .target_name(group.name.clone())
                .reason(self.approval_reason.clone())
                .payload(json!({ "approvedGroupId": group.id })),
        );

        Ok(request)
    }
}

/// Terminally rejects a pending group request
pub struct RejectGroupRequest {
    group_request_id: GroupRequestId,
    current_actor_id: Option<UserId>,
    rejection_reason: String,
}

impl RejectGroupRequest {
    pub fn new(group_request_id: GroupRequestId, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_request_id,
            current_actor_id,
            rejection_reason: String::new(),
        }
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = reason.into();
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<GroupRequest> {
        let Some(mut request) = GroupRequest::find_by_id(&self.group_request_id, conn).await else {
            err_not_found!(format!("Group request {} not found", self.group_request_id));
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

        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupRequestReject, "group_request", request.id.to_string(), "rejected")
                .actor(actor.as_ref(), None)
                .target_name(request.requested_group_name.clone())
                .reason(self.rejection_reason.clone()),
        );

        Ok(request)
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::{AppGroup, Membership};
    use crate::ops::{testutil::*, CreateApp};
    use chrono::{TimeDelta, Utc};

    #[tokio::test(flavor = "multi_thread")]
    async fn approving_builds_the_group_and_seeds_the_requester() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        let approver = seed_user(&conn, "u2").await;
        let ending = Utc::now().naive_utc() + TimeDelta::days(30);

        let request = CreateGroupRequest::new(requester.id.clone(), String::from("Reporting"), GroupKind::Plain)
            .description("monthly reports")
            .ownership_ending_at(Some(ending))
            .reason("new team")
            .execute(&conn)
            .await
            .unwrap();
        assert!(request.is_pending());

        let request = ApproveGroupRequest::new(request.id.clone(), Some(approver.id.clone()))
            .reason("makes sense")
            .execute(&conn)
            .await
            .unwrap();

        assert_eq!(request.status(), RequestStatus::Approved);
        let group_id = request.approved_group_id.clone().expect("the approved group is recorded");

        let group = Group::find_by_id(&group_id, &conn).await.unwrap();
        assert_eq!(group.name, "Reporting");
        assert_eq!(group.kind(), GroupKind::Plain);

        // The requester starts out as member and owner, bounded by the
        // requested ownership end
        assert!(Membership::has_active(&requester.id, &group.id, false, &conn).await);
        let owners = Membership::find_active_direct(&group.id, true, &conn).await;
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, requester.id);
        assert_eq!(owners[0].ended_at, Some(ending));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_names_and_pending_requests_are_refused() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;
        seed_group(&conn, "Existing", GroupKind::Plain, true).await;

        let err = CreateGroupRequest::new(requester.id.clone(), String::from("Existing"), GroupKind::Plain)
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        CreateGroupRequest::new(requester.id.clone(), String::from("Reporting"), GroupKind::Plain)
            .execute(&conn)
            .await
            .unwrap();
        let err = CreateGroupRequest::new(requester.id.clone(), String::from("Reporting"), GroupKind::Plain)
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn app_owners_get_their_app_groups_on_the_spot() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let owner = seed_user(&conn, "u1").await;
        let app = CreateApp::new(String::from("Chat"), String::new(), None)
            .owner(owner.id.clone())
            .execute(&conn)
            .await
            .unwrap();

        let request = CreateGroupRequest::new(owner.id.clone(), String::from("App-Chat-Dash"), GroupKind::App)
            .for_app(app.id.clone())
            .description("dashboards")
            .reason("self service")
            .execute(&conn)
            .await
            .unwrap();

        // Owning the parent app short-circuits the approval
        assert_eq!(request.status(), RequestStatus::Approved);
        let group_id = request.approved_group_id.clone().expect("the approved group is recorded");
        let group = Group::find_by_id(&group_id, &conn).await.unwrap();
        assert_eq!(group.kind(), GroupKind::App);
        let ext = AppGroup::find_by_group(&group.id, &conn).await.unwrap();
        assert_eq!(ext.app_id, app.id);
        assert!(!ext.is_owner);
        assert!(Membership::has_active(&owner.id, &group.id, true, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn the_owners_suffix_is_reserved() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let requester = seed_user(&conn, "u1").await;

        let err = CreateGroupRequest::new(requester.id.clone(), String::from("Team-Owners"), GroupKind::Plain)
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(!err.message().is_empty());
    }
}
