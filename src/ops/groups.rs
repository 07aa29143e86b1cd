use crate::{
    db::{
        models::{
            AccessRequest, App, AppGroup, AppTagMap, Group, GroupId, GroupKind, GroupTagMap, Membership, RoleGroup,
            RoleGroupMap, RoleRequest, Tag, TagId, User, UserId,
        },
        DbConn,
    },
    error::{ApiResult, EmptyResult},
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    idp,
    ops::{access_requests::RejectAccessRequest, ModifyGroupUsers, ModifyGroupsTimeLimit, ModifyRoleGroups},
    CONFIG,
};

use super::role_requests::RejectRoleRequest;

/// Validates a proposed group name against the configured pattern and the
/// reserved kind prefixes.
pub fn validate_group_name(name: &str, kind: GroupKind, app_name: Option<&str>) -> EmptyResult {
    if !CONFIG.name_regex().is_match(name) {
        err!(CONFIG.name_validation_error());
    }

    match kind {
        GroupKind::Role => {
            if !name.starts_with(Group::ROLE_GROUP_NAME_PREFIX) {
                err!(format!("Role group names must start with {}", Group::ROLE_GROUP_NAME_PREFIX));
            }
        }
        GroupKind::App => {
            let Some(app_name) = app_name else {
                err!("App groups must belong to an app");
            };
            let prefix = Group::app_group_name_prefix(app_name);
            if !name.starts_with(&prefix) {
                err!(format!("App group names must start with {prefix}"));
            }
        }
        GroupKind::Plain => {
            if name.starts_with(Group::ROLE_GROUP_NAME_PREFIX) || name.starts_with(Group::APP_GROUP_NAME_PREFIX) {
                err!("Only role groups and app groups may use the reserved name prefixes");
            }
        }
    }

    Ok(())
}

/// Creates a group here and in the identity provider, adopting an existing
/// provider group of the same name instead of failing. A live group already
/// holding the name is returned unchanged.
pub struct CreateGroup {
    kind: GroupKind,
    name: String,
    description: String,
    app_id: Option<crate::db::models::AppId>,
    app_is_owner: bool,
    tags: Vec<TagId>,
    current_actor_id: Option<UserId>,
}

impl CreateGroup {
    pub fn new(kind: GroupKind, name: String, description: String, current_actor_id: Option<UserId>) -> Self {
        Self {
            kind,
            name,
            description,
            app_id: None,
            app_is_owner: false,
            tags: Vec::new(),
            current_actor_id,
        }
    }

    #[must_use]
    pub fn for_app(mut self, app_id: crate::db::models::AppId, is_owner: bool) -> Self {
        self.app_id = Some(app_id);
        self.app_is_owner = is_owner;
        self
    }

    #[must_use]
    pub fn tags(mut self, tags: Vec<TagId>) -> Self {
        self.tags = tags;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<Group> {
        // A live group already using the name wins, case-insensitively
        if let Some(existing) = Group::find_by_name(&self.name, conn).await {
            return Ok(existing);
        }

        let app = match (&self.kind, &self.app_id) {
            (GroupKind::App, Some(app_id)) => match App::find_by_id(app_id, conn).await {
                Some(app) => Some(app),
                None => err!("App for the app group does not exist"),
            },
            (GroupKind::App, None) => err!("App groups must belong to an app"),
            _ => None,
        };

        validate_group_name(&self.name, self.kind, app.as_ref().map(|a| a.name.as_str()))?;

        if CONFIG.require_group_descriptions() && self.description.trim().is_empty() {
            err!(format!("A description is required to create group {}", self.name));
        }

        let mut group = Group::new(self.kind, self.name.clone(), self.description.clone());

        // The identity provider owns the id: create there first, or adopt
        // the provider group already carrying this name
        match idp::client() {
            Some(client) => {
                let created = match client.create_group(&self.name, &self.description).await? {
                    Some(created) => created,
                    None => match client.find_group_by_name(&self.name).await? {
                        Some(found) => found,
                        None => err!(format!("Identity provider knows no group named {}", self.name)),
                    },
                };
                group.id = created.id;
            }
            None => group.id = GroupId::from(crate::util::get_entity_id()),
        }

        group.save(conn).await?;

        match self.kind {
            GroupKind::Role => RoleGroup::insert(&group.id, conn).await?,
            GroupKind::App => {
                let app_id = self.app_id.clone().expect("checked above");
                AppGroup::new(group.id.clone(), app_id.clone(), self.app_is_owner).save(conn).await?;

                // App tags follow every group of the app
                for app_tag_map in AppTagMap::find_active_by_app(&app_id, conn).await {
                    GroupTagMap::new(group.id.clone(), app_tag_map.tag_id.clone(), Some(app_tag_map.id.clone()))
                        .save(conn)
                        .await?;
                }
            }
            GroupKind::Plain => {}
        }

        for tag in Tag::find_by_ids(&self.tags, conn).await {
            GroupTagMap::new(group.id.clone(), tag.id.clone(), None).save(conn).await?;
        }

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupCreate, "group", group.id.to_string(), "created")
                .actor(actor.as_ref(), actor_email)
                .target_name(group.name.clone())
                .payload(group.to_json()),
        );
        if self.kind == GroupKind::Role {
            let created_by = if actor.is_some() { "admin" } else { "system" };
            hooks::metrics::increment("role.created", &[("created_by_user_type", created_by)]);
        }

        Ok(group)
    }
}

/// Soft-deletes a group and unwinds everything hanging off it: grants,
/// role associations in both directions, tag maps and pending requests.
pub struct DeleteGroup {
    group_id: GroupId,
    sync_to_idp: bool,
    current_actor_id: Option<UserId>,
}

impl DeleteGroup {
    pub fn new(group_id: GroupId, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_id,
            sync_to_idp: true,
            current_actor_id,
        }
    }

    #[must_use]
    pub fn skip_idp_sync(mut self) -> Self {
        self.sync_to_idp = false;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> EmptyResult {
        let Some(mut group) = Group::find_by_id_including_deleted(&self.group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.group_id));
        };

        // The admin app keeps its owner group; everything else would lock
        // every access admin out
        if let Some(app_group) = AppGroup::find_by_group(&group.id, conn).await {
            if app_group.is_owner {
                if let Some(app) = App::find_by_id(&app_group.app_id, conn).await {
                    if app.is_reserved() {
                        err_forbidden!("The owner group of the admin app cannot be deleted");
                    }
                }
            }
        }

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        let mut idp_tasks = idp::IdpTasks::new();

        if self.sync_to_idp && group.is_managed {
            idp::queue_delete_group(&mut idp_tasks, &group.id);
        }

        // Direct members and owners, captured before the edges are ended,
        // drive the identity provider removals on associated groups below
        let direct_member_ids: Vec<_> =
            Membership::find_active_direct(&group.id, false, conn).await.into_iter().map(|m| m.user_id).collect();
        let direct_owner_ids: Vec<_> =
            Membership::find_active_direct(&group.id, true, conn).await.into_iter().map(|m| m.user_id).collect();

        group.soft_delete(conn).await?;

        // End every grant pointing here, direct and derived
        Membership::end_all_for_group(&group.id, conn).await?;

        // End associations where this group is the target
        let maps_as_target: Vec<_> =
            RoleGroupMap::find_active_by_group(&group.id, conn).await.into_iter().map(|m| m.id).collect();
        RoleGroupMap::end_by_ids(&maps_as_target, actor.as_ref(), conn).await?;

        // A deleted role also takes its fan-out with it
        if group.is_role() {
            let managed_maps = RoleGroupMap::find_active_managed_by_role(&group.id, conn).await;
            let all_map_ids: Vec<_> =
                RoleGroupMap::find_active_by_role(&group.id, conn).await.into_iter().map(|m| m.id).collect();

            Membership::end_all_for_role_maps(&all_map_ids, actor.as_ref(), conn).await?;

            if self.sync_to_idp {
                let mut removed_ids = direct_member_ids.clone();
                removed_ids.extend(direct_owner_ids.iter().cloned());
                let associated_group_ids: Vec<_> = managed_maps.iter().map(|m| m.group_id.clone()).collect();
                let still_covered =
                    Membership::active_buckets_for_users_in_groups(&associated_group_ids, &removed_ids, conn).await;

                for map in &managed_maps {
                    if !map.is_owner {
                        for member_id in direct_member_ids.iter().filter(|u| {
                            !still_covered.iter().any(|(cu, cg, owner)| cu == *u && *cg == map.group_id && !*owner)
                        }) {
                            idp::queue_remove_member(&mut idp_tasks, &map.group_id, member_id);
                        }
                    } else {
                        for owner_id in direct_owner_ids.iter().filter(|u| {
                            !still_covered.iter().any(|(cu, cg, owner)| cu == *u && *cg == map.group_id && *owner)
                        }) {
                            idp::queue_remove_owner(&mut idp_tasks, &map.group_id, owner_id);
                        }
                    }
                }
            }

            RoleGroupMap::end_by_ids(&all_map_ids, actor.as_ref(), conn).await?;
        }

        // Pending requests for a deleted group can never be fulfilled
        for request in AccessRequest::find_pending_by_group(&group.id, conn).await {
            RejectAccessRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requested group was deleted")
                .execute(conn)
                .await?;
        }

        GroupTagMap::end_all_for_group(&group.id, conn).await?;

        idp::join_all(idp_tasks).await;

        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupDelete, "group", group.id.to_string(), "deleted")
                .actor(actor.as_ref(), actor_email)
                .target_name(group.name.clone())
                .payload(group.to_json()),
        );

        Ok(())
    }
}

/// Switches a group between its three kinds, preserving the row id.
/// Leaving the role kind first unwinds the fan-out; becoming a role
/// converts role-derived grants into direct ones.
pub struct ModifyGroupType {
    group_id: GroupId,
    new_kind: GroupKind,
    new_app_id: Option<crate::db::models::AppId>,
    new_app_is_owner: bool,
    current_actor_id: Option<UserId>,
}

impl ModifyGroupType {
    pub fn new(group_id: GroupId, new_kind: GroupKind, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_id,
            new_kind,
            new_app_id: None,
            new_app_is_owner: false,
            current_actor_id,
        }
    }

    #[must_use]
    pub fn for_app(mut self, app_id: crate::db::models::AppId, is_owner: bool) -> Self {
        self.new_app_id = Some(app_id);
        self.new_app_is_owner = is_owner;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<Group> {
        let Some(mut group) = Group::find_by_id(&self.group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.group_id));
        };

        let old_kind = group.kind();
        if old_kind == self.new_kind {
            return Ok(group);
        }

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        // Tear down the old kind
        match old_kind {
            GroupKind::Role => {
                // Detaching every association ends the fan-out grants too
                let maps = RoleGroupMap::find_active_by_role(&group.id, conn).await;
                let member_targets: Vec<_> =
                    maps.iter().filter(|m| !m.is_owner).map(|m| m.group_id.clone()).collect();
                let owner_targets: Vec<_> = maps.iter().filter(|m| m.is_owner).map(|m| m.group_id.clone()).collect();

                ModifyRoleGroups::new(group.id.clone(), actor.clone())
                    .detach_groups(member_targets)
                    .detach_owner_groups(owner_targets)
                    .execute(conn)
                    .await?;

                RoleGroup::delete_row(&group.id, conn).await?;
            }
            GroupKind::App => {
                let Some(app_group) = AppGroup::find_by_group(&group.id, conn).await else {
                    err!(format!("App group {} has no app row", group.name));
                };
                if app_group.is_owner {
                    err!("Owner app groups cannot have their type modified");
                }

                // The tags stay, their app linkage goes
                GroupTagMap::detach_from_app_maps(&group.id, conn).await?;
                AppGroup::delete_row(&group.id, conn).await?;
            }
            GroupKind::Plain => {}
        }

        // Build up the new kind
        match self.new_kind {
            GroupKind::Role => {
                // Access through roles becomes direct access so nobody loses
                // their grant mid-switch; the feeding roles are detached after
                let now = chrono::Utc::now().naive_utc();
                let derived: Vec<_> = Membership::find_active_by_group(&group.id, conn)
                    .await
                    .into_iter()
                    .filter(|m| m.role_group_map_id.is_some() && m.is_active_at(now))
                    .collect();

                for grant in &derived {
                    let op = ModifyGroupUsers::new(group.id.clone(), actor.clone()).ended_at(grant.ended_at);
                    let op = if grant.is_owner {
                        op.add_owners(vec![grant.user_id.clone()])
                    } else {
                        op.add_members(vec![grant.user_id.clone()])
                    };
                    op.execute(conn).await?;
                }

                for map in RoleGroupMap::find_active_by_group(&group.id, conn).await {
                    let detach = ModifyRoleGroups::new(map.role_group_id.clone(), actor.clone());
                    let detach = if map.is_owner {
                        detach.detach_owner_groups(vec![map.group_id.clone()])
                    } else {
                        detach.detach_groups(vec![map.group_id.clone()])
                    };
                    detach.execute(conn).await?;
                }

                RoleGroup::insert(&group.id, conn).await?;
            }
            GroupKind::App => {
                let Some(app_id) = self.new_app_id.clone() else {
                    err!("App groups must belong to an app");
                };
                AppGroup::new(group.id.clone(), app_id.clone(), self.new_app_is_owner).save(conn).await?;

                let app_tag_maps = AppTagMap::find_active_by_app(&app_id, conn).await;
                for app_tag_map in &app_tag_maps {
                    GroupTagMap::new(group.id.clone(), app_tag_map.tag_id.clone(), Some(app_tag_map.id.clone()))
                        .save(conn)
                        .await?;
                }

                // Fresh time-limit tags clamp the existing grants right away
                let tag_ids: Vec<_> = app_tag_maps.iter().map(|m| m.tag_id.clone()).collect();
                ModifyGroupsTimeLimit::new(vec![group.id.clone()], tag_ids).execute(conn).await?;
            }
            GroupKind::Plain => {}
        }

        group.set_kind(self.new_kind, conn).await?;

        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupModifyType, "group", group.id.to_string(), "type_modified")
                .actor(actor.as_ref(), actor_email)
                .target_name(group.name.clone())
                .payload(json!({
                    "oldKind": old_kind.as_str(),
                    "newKind": self.new_kind.as_str(),
                })),
        );

        Ok(group)
    }
}

/// Clears everything a group may not have while unmanaged: role
/// associations, derived grants, and pending requests. Used directly and by
/// the integrity repair pass.
pub struct UnmanageGroup {
    group_id: GroupId,
    current_actor_id: Option<UserId>,
}

impl UnmanageGroup {
    pub fn new(group_id: GroupId, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_id,
            current_actor_id,
        }
    }

    pub async fn execute(self, conn: &DbConn) -> EmptyResult {
        let Some(group) = Group::find_by_id(&self.group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.group_id));
        };

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        if group.is_managed {
            Group::set_managed(&group.id, false, conn).await?;
        }

        // Unmanaged groups cannot be populated by roles
        let maps_as_target: Vec<_> =
            RoleGroupMap::find_active_by_group(&group.id, conn).await.into_iter().map(|m| m.id).collect();
        Membership::end_all_for_role_maps(&maps_as_target, actor.as_ref(), conn).await?;
        RoleGroupMap::end_by_ids(&maps_as_target, actor.as_ref(), conn).await?;

        if group.is_role() {
            let maps_as_role: Vec<_> =
                RoleGroupMap::find_active_by_role(&group.id, conn).await.into_iter().map(|m| m.id).collect();
            Membership::end_all_for_role_maps(&maps_as_role, actor.as_ref(), conn).await?;
            RoleGroupMap::end_by_ids(&maps_as_role, actor.as_ref(), conn).await?;
        }

        for request in AccessRequest::find_pending_by_group(&group.id, conn).await {
            RejectAccessRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requested group is not managed by this service")
                .execute(conn)
                .await?;
        }
        for request in RoleRequest::find_pending_by_group(&group.id, conn).await {
            RejectRoleRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requested group is not managed by this service")
                .execute(conn)
                .await?;
        }

        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupUnmanage, "group", group.id.to_string(), "unmanaged")
                .actor(actor.as_ref(), None)
                .target_name(group.name.clone()),
        );

        Ok(())
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::ops::{testutil::*, ModifyRoleGroups};

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_group_ends_every_edge_and_rejects_its_requests() {
        let (_guard, pool, idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let u2 = seed_user(&conn, "u2").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &g1, false).await;
        seed_grant(&conn, &u2, &role, false).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let tag = seed_tag(&conn, "any", json!({})).await;
        attach_tag(&conn, &g1, &tag).await;

        let mut request = AccessRequest::new(u2.id.clone(), g1.id.clone(), false, String::new(), None);
        request.save(&conn).await.unwrap();

        idp.clear();
        DeleteGroup::new(g1.id.clone(), None).execute(&conn).await.unwrap();

        let group = Group::find_by_id_including_deleted(&g1.id, &conn).await.unwrap();
        assert!(group.is_deleted());
        assert!(Membership::find_active_by_group(&g1.id, &conn).await.is_empty());
        assert!(RoleGroupMap::find_active_by_group(&g1.id, &conn).await.is_empty());
        assert!(GroupTagMap::find_active_by_group(&g1.id, &conn).await.is_empty());

        let request = AccessRequest::find_by_id(&request.id, &conn).await.unwrap();
        assert_eq!(request.status(), crate::db::models::RequestStatus::Rejected);

        assert_eq!(idp.count_with_prefix("delete_group"), 1, "got {:?}", idp.calls());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn turning_a_role_into_a_plain_group_converts_nothing_but_detaches_targets() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let changed =
            ModifyGroupType::new(role.id.clone(), GroupKind::Plain, None).execute(&conn).await.unwrap();

        // The id survives the switch and the fan-out is gone
        assert_eq!(changed.id, role.id);
        assert_eq!(changed.kind(), GroupKind::Plain);
        assert!(RoleGroupMap::find_active_by_role(&role.id, &conn).await.is_empty());
        assert!(!Membership::has_active(&u1.id, &g1.id, false, &conn).await);
        // The direct membership of the former role remains
        assert!(Membership::has_active(&u1.id, &role.id, false, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn turning_a_group_into_a_role_converts_derived_grants_to_direct() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let feeder = seed_group(&conn, "Role-Feeder", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &feeder, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;
        ModifyRoleGroups::new(feeder.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let changed = ModifyGroupType::new(g1.id.clone(), GroupKind::Role, None).execute(&conn).await.unwrap();
        assert_eq!(changed.kind(), GroupKind::Role);

        // Access survived as a direct grant; the feeding association is gone
        let active = Membership::find_active_by_group(&g1.id, &conn).await;
        assert_eq!(active.len(), 1);
        assert!(active[0].is_direct());
        assert_eq!(active[0].user_id, u1.id);
        assert!(RoleGroupMap::find_active_by_group(&g1.id, &conn).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unmanaging_a_group_clears_role_plumbing_and_pending_requests() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let mut request = AccessRequest::new(u1.id.clone(), g1.id.clone(), true, String::new(), None);
        request.save(&conn).await.unwrap();

        UnmanageGroup::new(g1.id.clone(), None).execute(&conn).await.unwrap();

        let group = Group::find_by_id(&g1.id, &conn).await.unwrap();
        assert!(!group.is_managed);
        assert!(RoleGroupMap::find_active_by_group(&g1.id, &conn).await.is_empty());
        assert!(!Membership::has_active(&u1.id, &g1.id, false, &conn).await);
        let request = AccessRequest::find_by_id(&request.id, &conn).await.unwrap();
        assert_eq!(request.status(), crate::db::models::RequestStatus::Rejected);
    }

    #[test]
    fn names_follow_the_kind_prefix_rules() {
        assert!(validate_group_name("Payments", GroupKind::Plain, None).is_ok());
        assert!(validate_group_name("Role-Oncall", GroupKind::Role, None).is_ok());
        assert!(validate_group_name("App-Chat-Admins", GroupKind::App, Some("Chat")).is_ok());

        assert!(validate_group_name("Role-Oncall", GroupKind::Plain, None).is_err());
        assert!(validate_group_name("Oncall", GroupKind::Role, None).is_err());
        assert!(validate_group_name("App-Other-Admins", GroupKind::App, Some("Chat")).is_err());
        assert!(validate_group_name("payments", GroupKind::Plain, None).is_err(), "default pattern wants a capital");
        assert!(validate_group_name("Pay ments", GroupKind::Plain, None).is_err());
    }
}
