use chrono::{TimeDelta, Utc};
use serde_json::Value;

use crate::{
    db::{
        models::{
            coalesce_seconds_constraint, App, AppGroup, AppId, AppTagMap, Group, GroupId, GroupKind, GroupTagMap,
            Membership, RoleGroupMap, Tag, TagId, User, UserId,
        },
        DbConn,
    },
    error::{ApiResult, EmptyResult},
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
};

/// Creates a tag after validating its constraint map: only the recognized
/// keys, booleans for the behavioral switches and positive whole seconds
/// for the time limits.
pub struct CreateTag {
    name: String,
    description: String,
    constraints: serde_json::Map<String, Value>,
    current_actor_id: Option<UserId>,
}

impl CreateTag {
    pub fn new(name: String, description: String, current_actor_id: Option<UserId>) -> Self {
        Self {
            name,
            description,
            constraints: serde_json::Map::new(),
            current_actor_id,
        }
    }

    #[must_use]
    pub fn constraints(mut self, constraints: serde_json::Map<String, Value>) -> Self {
        self.constraints = constraints;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<Tag> {
        if self.name.trim().is_empty() {
            err!("Tag names cannot be empty");
        }

        if Tag::find_by_name(&self.name, conn).await.is_some() {
            err_conflict!(format!("A tag named {} already exists", self.name));
        }

        for (key, value) in &self.constraints {
            match key.as_str() {
                Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY | Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY => {
                    if !value.as_i64().is_some_and(|secs| secs > 0) {
                        err!(format!("Constraint {key} must be a positive number of seconds"));
                    }
                }
                Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY
                | Tag::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY
                | Tag::REQUIRE_REASON_CONSTRAINT_KEY
                | Tag::OWNER_CANNOT_ADD_SELF_CONSTRAINT_KEY => {
                    if !value.is_boolean() {
                        err!(format!("Constraint {key} must be a boolean"));
                    }
                }
                _ => err!(format!("Unknown tag constraint {key}")),
            }
        }

        let mut tag = Tag::new(self.name.clone(), self.description.clone(), self.constraints);
        tag.save(conn).await?;

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        hooks::audit::log_event(
            AuditEvent::new(EventType::TagCreate, "tag", tag.id.to_string(), "created")
                .actor(actor.as_ref(), None)
                .target_name(tag.name.clone())
                .payload(tag.to_json()),
        );

        Ok(tag)
    }
}

/// Soft-deletes a tag and ends every edge carrying it
pub struct DeleteTag {
    tag_id: TagId,
    current_actor_id: Option<UserId>,
}

impl DeleteTag {
    pub fn new(tag_id: TagId, current_actor_id: Option<UserId>) -> Self {
        Self {
            tag_id,
            current_actor_id,
        }
    }

    pub async fn execute(self, conn: &DbConn) -> EmptyResult {
        let Some(mut tag) = Tag::find_by_id(&self.tag_id, conn).await else {
            err_not_found!(format!("Tag {} not found", self.tag_id));
        };

        tag.soft_delete(conn).await?;
        GroupTagMap::end_all_for_tag(&tag.id, conn).await?;
        AppTagMap::end_all_for_tag(&tag.id, conn).await?;

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        hooks::audit::log_event(
            AuditEvent::new(EventType::TagDelete, "tag", tag.id.to_string(), "deleted")
                .actor(actor.as_ref(), None)
                .target_name(tag.name.clone()),
        );

        Ok(())
    }
}

/// Attaches and detaches tags on one group. Only directly-attached tags can
/// be removed here; app-propagated ones are governed through the app.
pub struct ModifyGroupTags {
    group_id: GroupId,
    tags_to_add: Vec<TagId>,
    tags_to_remove: Vec<TagId>,
    current_actor_id: Option<UserId>,
}

impl ModifyGroupTags {
    pub fn new(group_id: GroupId, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_id,
            tags_to_add: Vec::new(),
            tags_to_remove: Vec::new(),
            current_actor_id,
        }
    }

    #[must_use]
    pub fn attach(mut self, tags: Vec<TagId>) -> Self {
        self.tags_to_add = tags;
        self
    }

    #[must_use]
    pub fn detach(mut self, tags: Vec<TagId>) -> Self {
        self.tags_to_remove = tags;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<Group> {
        let Some(group) = Group::find_by_id(&self.group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.group_id));
        };

        let tags_to_add = Tag::find_by_ids(&self.tags_to_add, conn).await;
        let already_attached: Vec<TagId> =
            GroupTagMap::find_active_by_group(&group.id, conn).await.into_iter().map(|m| m.tag_id).collect();

        let mut added = Vec::new();
        for tag in &tags_to_add {
            if already_attached.contains(&tag.id) {
                continue;
            }
            GroupTagMap::new(group.id.clone(), tag.id.clone(), None).save(conn).await?;
            added.push(tag.id.clone());
        }

        GroupTagMap::end_direct_for_group_and_tags(&group.id, &self.tags_to_remove, conn).await?;

        // A fresh time-limit tag reins in existing grants right away
        ModifyGroupsTimeLimit::new(vec![group.id.clone()], added.clone()).execute(conn).await?;

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        hooks::audit::log_event(
            AuditEvent::new(EventType::TagModify, "group", group.id.to_string(), "tags_modified")
                .actor(actor.as_ref(), None)
                .target_name(group.name.clone())
                .payload(json!({ "tagsAdded": added, "tagsRemoved": self.tags_to_remove })),
        );

        Ok(group)
    }
}

/// Attaches and detaches tags on an app, fanning the change out to every
/// group of the app as linked group tag maps.
pub struct ModifyAppTags {
    app_id: AppId,
    tags_to_add: Vec<TagId>,
    tags_to_remove: Vec<TagId>,
    current_actor_id: Option<UserId>,
}

impl ModifyAppTags {
    pub fn new(app_id: AppId, current_actor_id: Option<UserId>) -> Self {
        Self {
            app_id,
            tags_to_add: Vec::new(),
            tags_to_remove: Vec::new(),
            current_actor_id,
        }
    }

    #[must_use]
    pub fn attach(mut self, tags: Vec<TagId>) -> Self {
        self.tags_to_add = tags;
        self
    }

    #[must_use]
    pub fn detach(mut self, tags: Vec<TagId>) -> Self {
        self.tags_to_remove = tags;
        self
    }

    pub async fn execute(self, conn: &DbConn) -> ApiResult<App> {
        let Some(app) = App::find_by_id(&self.app_id, conn).await else {
            err_not_found!(format!("App {} not found", self.app_id));
        };

        let app_groups = AppGroup::find_active_by_app(&app.id, conn).await;
        let app_group_ids: Vec<_> = app_groups.iter().map(|g| g.id.clone()).collect();

        let existing_maps = AppTagMap::find_active_by_app(&app.id, conn).await;
        let already_attached: Vec<TagId> = existing_maps.iter().map(|m| m.tag_id.clone()).collect();

        let mut added = Vec::new();
        for tag in Tag::find_by_ids(&self.tags_to_add, conn).await {
            if already_attached.contains(&tag.id) {
                continue;
            }
            let app_tag_map = AppTagMap::new(app.id.clone(), tag.id.clone());
            app_tag_map.save(conn).await?;
            for group_id in &app_group_ids {
                GroupTagMap::new(group_id.clone(), tag.id.clone(), Some(app_tag_map.id.clone())).save(conn).await?;
            }
            added.push(tag.id.clone());
        }

        // Detach: the app edge goes, and with it every propagated group edge
        let removed_map_ids: Vec<_> = existing_maps
            .iter()
            .filter(|m| self.tags_to_remove.contains(&m.tag_id))
            .map(|m| m.id.clone())
            .collect();
        GroupTagMap::end_all_by_app_tag_maps(&removed_map_ids, conn).await?;
        AppTagMap::end_by_ids(&removed_map_ids, conn).await?;

        ModifyGroupsTimeLimit::new(app_group_ids, added.clone()).execute(conn).await?;

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;
        hooks::audit::log_event(
            AuditEvent::new(EventType::TagModify, "app", app.id.to_string(), "tags_modified")
                .actor(actor.as_ref(), None)
                .target_name(app.name.clone())
                .payload(json!({ "tagsAdded": added, "tagsRemoved": self.tags_to_remove })),
        );

        Ok(app)
    }
}

/// Applies freshly attached time-limit tags to the access that already
/// exists: active grants, role associations, and the fan-out grants of any
/// role in the set are all pulled down to the new limit.
pub struct ModifyGroupsTimeLimit {
    group_ids: Vec<GroupId>,
    tag_ids: Vec<TagId>,
}

impl ModifyGroupsTimeLimit {
    pub fn new(group_ids: Vec<GroupId>, tag_ids: Vec<TagId>) -> Self {
        Self {
            group_ids,
            tag_ids,
        }
    }

    pub async fn execute(self, conn: &DbConn) -> EmptyResult {
        // Unmanaged groups keep their limits advisory
        let groups: Vec<_> =
            Group::find_by_ids(&self.group_ids, conn).await.into_iter().filter(|g| g.is_managed).collect();
        if groups.is_empty() {
            return Ok(());
        }
        let group_ids: Vec<_> = groups.iter().map(|g| g.id.clone()).collect();
        let role_group_ids: Vec<_> =
            groups.iter().filter(|g| g.kind() == GroupKind::Role).map(|g| g.id.clone()).collect();

        let tags = Tag::find_by_ids(&self.tag_ids, conn).await;
        let member_limit = coalesce_seconds_constraint(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, &tags);
        let owner_limit = coalesce_seconds_constraint(Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY, &tags);

        if let Some(seconds) = member_limit {
            let cap = Utc::now().naive_utc() + TimeDelta::seconds(seconds);

            Membership::cap_ended_at_for_groups(&group_ids, false, cap, conn).await?;
            RoleGroupMap::cap_ended_at_for_groups(&group_ids, false, cap, conn).await?;

            // Members of a limited role keep their fan-out only that long too
            let role_map_ids: Vec<_> = RoleGroupMap::find_active_by_roles(&role_group_ids, conn)
                .await
                .into_iter()
                .filter(|m| !m.is_owner)
                .map(|m| m.id)
                .collect();
            Membership::cap_ended_at_for_role_maps(&role_map_ids, cap, conn).await?;
        }

        if let Some(seconds) = owner_limit {
            let cap = Utc::now().naive_utc() + TimeDelta::seconds(seconds);

            Membership::cap_ended_at_for_groups(&group_ids, true, cap, conn).await?;
            RoleGroupMap::cap_ended_at_for_groups(&group_ids, true, cap, conn).await?;

            let role_map_ids: Vec<_> = RoleGroupMap::find_active_by_roles(&role_group_ids, conn)
                .await
                .into_iter()
                .filter(|m| m.is_owner)
                .map(|m| m.id)
                .collect();
            Membership::cap_ended_at_for_role_maps(&role_map_ids, cap, conn).await?;
        }

        Ok(())
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::ops::{testutil::*, CreateApp, ModifyRoleGroups};

    fn constraint_map(value: Value) -> serde_json::Map<String, Value> {
        let Value::Object(map) = value else { panic!("constraints must be an object") };
        map
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_tag_validates_names_and_constraint_shapes() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        CreateTag::new(String::from("Limits"), String::new(), None)
            .constraints(constraint_map(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 })))
            .execute(&conn)
            .await
            .unwrap();

        let err = CreateTag::new(String::from("limits"), String::new(), None).execute(&conn).await.unwrap_err();
        assert!(err.is_conflict(), "tag names are case-insensitively unique");

        let err = CreateTag::new(String::from("Bogus"), String::new(), None)
            .constraints(constraint_map(json!({ "bogus_key": true })))
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(!err.is_conflict());

        let err = CreateTag::new(String::from("Wrong"), String::new(), None)
            .constraints(constraint_map(json!({ Tag::REQUIRE_REASON_CONSTRAINT_KEY: "yes" })))
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(!err.message().is_empty());

        let err = CreateTag::new(String::from("Negative"), String::new(), None)
            .constraints(constraint_map(json!({ Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY: -1 })))
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(!err.message().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attaching_a_time_limit_tag_caps_existing_access() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let u2 = seed_user(&conn, "u2").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        seed_grant(&conn, &u1, &g1, false).await;

        // A second, derived grant on the same group through a role
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u2, &role, false).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let tag = CreateTag::new(String::from("Bounded"), String::new(), None)
            .constraints(constraint_map(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 })))
            .execute(&conn)
            .await
            .unwrap();

        ModifyGroupTags::new(g1.id.clone(), None).attach(vec![tag.id.clone()]).execute(&conn).await.unwrap();

        // Every unbounded member edge on the group is reined in: the direct
        // grant, the derived grant and the role association itself
        let cap = Utc::now().naive_utc() + TimeDelta::seconds(3600);
        for grant in Membership::find_active_by_group(&g1.id, &conn).await {
            let ended_at = grant.ended_at.expect("capped by the new limit");
            assert!((cap - ended_at).num_seconds().abs() < 60);
        }
        let maps = RoleGroupMap::find_active_by_role(&role.id, &conn).await;
        let map_ended_at = maps[0].ended_at.expect("capped by the new limit");
        assert!((cap - map_ended_at).num_seconds().abs() < 60);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_time_limit_on_a_role_caps_its_fanout_grants() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        let tag = CreateTag::new(String::from("Bounded"), String::new(), None)
            .constraints(constraint_map(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 })))
            .execute(&conn)
            .await
            .unwrap();

        ModifyGroupTags::new(role.id.clone(), None).attach(vec![tag.id.clone()]).execute(&conn).await.unwrap();

        let cap = Utc::now().naive_utc() + TimeDelta::seconds(3600);

        // The role membership and the fan-out grant it feeds are capped
        let role_members = Membership::find_active_role_members(&role.id, &conn).await;
        let membership_end = role_members[0].ended_at.expect("capped by the new limit");
        assert!((cap - membership_end).num_seconds().abs() < 60);

        let derived = Membership::find_active_by_group(&g1.id, &conn).await;
        assert_eq!(derived.len(), 1);
        let derived_end = derived[0].ended_at.expect("capped by the new limit");
        assert!((cap - derived_end).num_seconds().abs() < 60);

        // The association itself points at an untagged group and stays open
        let maps = RoleGroupMap::find_active_by_role(&role.id, &conn).await;
        assert_eq!(maps[0].ended_at, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn app_tags_propagate_to_every_app_group_and_detach_cleanly() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let app = CreateApp::new(String::from("Chat"), String::new(), None)
            .additional_groups(vec![(String::from("Tools"), String::new())])
            .execute(&conn)
            .await
            .unwrap();
        let app_groups = AppGroup::find_active_by_app(&app.id, &conn).await;
        assert_eq!(app_groups.len(), 2);

        let tag = CreateTag::new(String::from("Scoped"), String::new(), None).execute(&conn).await.unwrap();

        ModifyAppTags::new(app.id.clone(), None).attach(vec![tag.id.clone()]).execute(&conn).await.unwrap();

        assert_eq!(AppTagMap::find_active_by_app(&app.id, &conn).await.len(), 1);
        for app_group in &app_groups {
            let tags = Group::active_tags(&app_group.id, &conn).await;
            assert_eq!(tags.len(), 1);
            assert_eq!(tags[0].id, tag.id);
        }

        ModifyAppTags::new(app.id.clone(), None).detach(vec![tag.id.clone()]).execute(&conn).await.unwrap();

        assert!(AppTagMap::find_active_by_app(&app.id, &conn).await.is_empty());
        for app_group in &app_groups {
            assert!(Group::active_tags(&app_group.id, &conn).await.is_empty());
        }
    }
}
