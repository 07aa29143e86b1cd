use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::{
    db::{
        models::{
            coalesce_ended_at, AccessRequest, Group, GroupId, Membership, RequestStatus, RoleGroupMap, RoleGroupMapId,
            RoleRequest, Tag, User, UserId,
        },
        DbConn,
    },
    error::ApiResult,
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    idp,
    ops::constraints,
    util::earliest_ended_at,
};

/// The association primitive: attaches and detaches groups to a role as
/// member links or owner links, materializing one derived grant per active
/// role member on attach and unwinding them on detach. Only managed,
/// non-role groups can be attached; roles never nest.
pub struct ModifyRoleGroups {
    role_group_id: GroupId,
    groups_added_ended_at: Option<NaiveDateTime>,
    groups_to_add: Vec<GroupId>,
    owner_groups_to_add: Vec<GroupId>,
    groups_should_expire: Vec<RoleGroupMapId>,
    owner_groups_should_expire: Vec<RoleGroupMapId>,
    groups_to_remove: Vec<GroupId>,
    owner_groups_to_remove: Vec<GroupId>,
    sync_to_idp: bool,
    current_actor_id: Option<UserId>,
    created_reason: String,
    notify: bool,
}

impl ModifyRoleGroups {
    pub fn new(role_group_id: GroupId, current_actor_id: Option<UserId>) -> Self {
        Self {
            role_group_id,
            groups_added_ended_at: None,
            groups_to_add: Vec::new(),
            owner_groups_to_add: Vec::new(),
            groups_should_expire: Vec::new(),
            owner_groups_should_expire: Vec::new(),
            groups_to_remove: Vec::new(),
            owner_groups_to_remove: Vec::new(),
            sync_to_idp: true,
            current_actor_id,
            created_reason: String::new(),
            notify: true,
        }
    }

    #[must_use]
    pub fn attach_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups_to_add = groups;
        self
    }

    #[must_use]
    pub fn attach_owner_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.owner_groups_to_add = groups;
        self
    }

    #[must_use]
    pub fn detach_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.groups_to_remove = groups;
        self
    }

    #[must_use]
    pub fn detach_owner_groups(mut self, groups: Vec<GroupId>) -> Self {
        self.owner_groups_to_remove = groups;
        self
    }

    #[must_use]
    pub fn expire_groups(mut self, maps: Vec<RoleGroupMapId>) -> Self {
        self.groups_should_expire = maps;
        self
    }

    #[must_use]
    pub fn expire_owner_groups(mut self, maps: Vec<RoleGroupMapId>) -> Self {
        self.owner_groups_should_expire = maps;
        self
    }

    #[must_use]
    pub fn ended_at(mut self, ended_at: Option<NaiveDateTime>) -> Self {
        self.groups_added_ended_at = ended_at;
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.created_reason = reason.into();
        self
    }

    #[must_use]
    pub fn skip_idp_sync(mut self) -> Self {
        self.sync_to_idp = false;
        self
    }

    #[must_use]
    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }

    pub async fn execute(mut self, conn: &DbConn) -> ApiResult<Group> {
        let Some(role) = Group::find_by_id(&self.role_group_id, conn).await else {
            err_not_found!(format!("Role group {} not found", self.role_group_id));
        };
        if !role.is_role() {
            err!(format!("Group {} is not a role group", role.name));
        }

        // Targets must be managed non-role groups; anything else is dropped
        let groups_to_add = Group::find_attachable_by_ids(&self.groups_to_add, conn).await;
        let owner_groups_to_add = Group::find_attachable_by_ids(&self.owner_groups_to_add, conn).await;
        let groups_to_remove = Group::find_by_ids(&self.groups_to_remove, conn).await;
        let owner_groups_to_remove = Group::find_by_ids(&self.owner_groups_to_remove, conn).await;
        self.groups_to_add = groups_to_add.iter().map(|g| g.id.clone()).collect();
        self.owner_groups_to_add = owner_groups_to_add.iter().map(|g| g.id.clone()).collect();

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        // Fast return if no changes are being made
        if self.groups_to_add.is_empty()
            && self.owner_groups_to_add.is_empty()
            && groups_to_remove.is_empty()
            && owner_groups_to_remove.is_empty()
            && self.groups_should_expire.is_empty()
            && self.owner_groups_should_expire.is_empty()
        {
            return Ok(role);
        }

        // Policy gates over the groups being attached
        let (valid, _) = constraints::check_self_add_for_role(
            &role,
            actor.as_ref(),
            &self.groups_to_add,
            &self.owner_groups_to_add,
            conn,
        )
        .await;
        if !valid {
            return Ok(role);
        }

        let (valid, _) = constraints::check_reason_for_role(
            &role,
            actor.as_ref(),
            &self.created_reason,
            &self.groups_to_add,
            &self.owner_groups_to_add,
            conn,
        )
        .await;
        if !valid {
            return Ok(role);
        }

        let mut idp_tasks = idp::IdpTasks::new();

        // Detach phase; groups being re-attached are detached first so a
        // bounded association extends through a fresh row
        let mut detach_member_ids: Vec<_> = groups_to_remove.iter().map(|g| g.id.clone()).collect();
        detach_member_ids.extend(self.groups_to_add.iter().cloned());
        self.detach(&role.id, &detach_member_ids, false, actor.as_ref(), conn).await?;

        let mut detach_owner_ids: Vec<_> = owner_groups_to_remove.iter().map(|g| g.id.clone()).collect();
        detach_owner_ids.extend(self.owner_groups_to_add.iter().cloned());
        self.detach(&role.id, &detach_owner_ids, true, actor.as_ref(), conn).await?;

        // Identity provider removals for the detached targets, skipping
        // every user still covered through another origin
        if !groups_to_remove.is_empty() || !owner_groups_to_remove.is_empty() {
            let role_member_ids: Vec<_> =
                Membership::find_active_role_members(&role.id, conn).await.into_iter().map(|m| m.user_id).collect();

            let mut removed_target_ids: Vec<_> = groups_to_remove.iter().map(|g| g.id.clone()).collect();
            removed_target_ids.extend(owner_groups_to_remove.iter().map(|g| g.id.clone()));
            let still_covered =
                Membership::active_buckets_for_users_in_groups(&removed_target_ids, &role_member_ids, conn).await;

            if self.sync_to_idp {
                for group in groups_to_remove.iter().filter(|g| g.is_managed) {
                    let covered: HashSet<_> = still_covered
                        .iter()
                        .filter(|(_, g, owner)| *g == group.id && !*owner)
                        .map(|(u, _, _)| u.clone())
                        .collect();
                    for member_id in role_member_ids.iter().filter(|u| !covered.contains(*u)) {
                        idp::queue_remove_member(&mut idp_tasks, &group.id, member_id);
                    }
                }

                for group in owner_groups_to_remove.iter().filter(|g| g.is_managed) {
                    let covered: HashSet<_> = still_covered
                        .iter()
                        .filter(|(_, g, owner)| *g == group.id && *owner)
                        .map(|(u, _, _)| u.clone())
                        .collect();
                    for member_id in role_member_ids.iter().filter(|u| !covered.contains(*u)) {
                        idp::queue_remove_owner(&mut idp_tasks, &group.id, member_id);
                    }
                }
            }
        }

        // Flag associations for the expiring roles page
        RoleGroupMap::mark_should_expire(&self.groups_should_expire, false, conn).await?;
        RoleGroupMap::mark_should_expire(&self.owner_groups_should_expire, true, conn).await?;

        // Attach phase. The association end bound is clamped by the target
        // group's tags: member limit for member links, owner limit for
        // owner links.
        let mut member_maps_added: HashMap<GroupId, RoleGroupMap> = HashMap::new();
        let mut owner_maps_added: HashMap<GroupId, RoleGroupMap> = HashMap::new();

        for group in &groups_to_add {
            let group_tags = Group::active_tags(&group.id, conn).await;
            let map_ended_at = coalesce_ended_at(
                Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY,
                &group_tags,
                self.groups_added_ended_at,
                group.is_managed,
            );
            let map = self.build_map(&role.id, &group.id, false, map_ended_at, actor.as_ref());
            map.save(conn).await?;
            member_maps_added.insert(group.id.clone(), map);
        }

        for group in &owner_groups_to_add {
            let group_tags = Group::active_tags(&group.id, conn).await;
            let map_ended_at = coalesce_ended_at(
                Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY,
                &group_tags,
                self.groups_added_ended_at,
                group.is_managed,
            );
            let map = self.build_map(&role.id, &group.id, true, map_ended_at, actor.as_ref());
            map.save(conn).await?;
            owner_maps_added.insert(group.id.clone(), map);
        }

        // Role fan-out: every active role member gains a derived grant per
        // new association, bounded by both the association and their own
        // role membership
        let active_role_memberships = Membership::find_active_role_members(&role.id, conn).await;
        let role_member_ids: Vec<_> = active_role_memberships.iter().map(|m| m.user_id.clone()).collect();

        let mut memberships_added: HashMap<GroupId, HashMap<UserId, Membership>> = HashMap::new();
        let mut ownerships_added: HashMap<GroupId, HashMap<UserId, Membership>> = HashMap::new();

        for map in member_maps_added.values().chain(owner_maps_added.values()) {
            let bucket = if map.is_owner {
                ownerships_added.entry(map.group_id.clone()).or_default()
            } else {
                memberships_added.entry(map.group_id.clone()).or_default()
            };

            for member in &active_role_memberships {
                if self.sync_to_idp {
                    if map.is_owner {
                        idp::queue_add_owner(&mut idp_tasks, &map.group_id, &member.user_id);
                    } else {
                        idp::queue_add_member(&mut idp_tasks, &map.group_id, &member.user_id);
                    }
                }

                let derived_ended_at = earliest_ended_at(map.ended_at, member.ended_at);
                let mut derived = Membership::new(member.user_id.clone(), map.group_id.clone(), map.is_owner);
                derived.role_group_map_id = Some(map.id.clone());
                derived.ended_at = derived_ended_at;
                derived.created_reason = self.created_reason.clone();
                derived.created_actor_id = actor.clone();
                derived.ended_actor_id = if self.groups_added_ended_at.is_some() { actor.clone() } else { None };
                derived.save(conn).await?;
                bucket.insert(member.user_id.clone(), derived);
            }
        }

        // Resolve pending access requests the fan-out satisfies
        let mut resolved_access = Vec::new();

        let member_group_ids: Vec<_> = memberships_added.keys().cloned().collect();
        for mut request in AccessRequest::find_pending_for_grants(&member_group_ids, &role_member_ids, false, conn).await {
            if let Some(grant) =
                memberships_added.get(&request.requested_group_id).and_then(|g| g.get(&request.requester_user_id))
            {
                self.approve_access_request(&mut request, grant, actor.as_ref(), conn).await?;
                resolved_access.push(request);
            }
        }

        let owner_group_ids: Vec<_> = ownerships_added.keys().cloned().collect();
        for mut request in AccessRequest::find_pending_for_grants(&owner_group_ids, &role_member_ids, true, conn).await {
            if let Some(grant) =
                ownerships_added.get(&request.requested_group_id).and_then(|g| g.get(&request.requester_user_id))
            {
                self.approve_access_request(&mut request, grant, actor.as_ref(), conn).await?;
                resolved_access.push(request);
            }
        }

        // Resolve pending role requests for the attachments themselves
        let mut resolved_role = Vec::new();

        for mut request in RoleRequest::find_pending_for_attach(&role.id, &self.groups_to_add, false, conn).await {
            if let Some(map) = member_maps_added.get(&request.requested_group_id) {
                self.approve_role_request(&mut request, map, actor.as_ref(), conn).await?;
                resolved_role.push(request);
            }
        }

        for mut request in RoleRequest::find_pending_for_attach(&role.id, &self.owner_groups_to_add, true, conn).await {
            if let Some(map) = owner_maps_added.get(&request.requested_group_id) {
                self.approve_role_request(&mut request, map, actor.as_ref(), conn).await?;
                resolved_role.push(request);
            }
        }

        idp::join_all(idp_tasks).await;

        for request in &resolved_access {
            let requester = User::find_by_id(&request.requester_user_id, conn).await;
            let approvers = super::request_approvers(&request.requested_group_id, &request.requester_user_id, conn).await;
            if let Some(requested_group) = Group::find_by_id(&request.requested_group_id, conn).await {
                hooks::notifications::access_request_completed(request, &requested_group, requester.as_ref(), &approvers, true);
            }
        }

        if self.notify {
            for request in &resolved_role {
                let requester = User::find_by_id(&request.requester_user_id, conn).await;
                let approvers = super::request_approvers(&request.requested_group_id, &request.requester_user_id, conn).await;
                if let Some(requested_group) = Group::find_by_id(&request.requested_group_id, conn).await {
                    hooks::notifications::access_role_request_completed(
                        request,
                        &role,
                        &requested_group,
                        requester.as_ref(),
                        &approvers,
                        true,
                    );
                }
            }
        }

        // Role assignment audit trail, one event per touched association
        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        for group in groups_to_add.iter().chain(owner_groups_to_add.iter()) {
            hooks::audit::log_event(
                AuditEvent::new(EventType::RoleGroupModify, "role_assignment", role.id.to_string(), "role_assigned")
                    .actor(actor.as_ref(), actor_email.clone())
                    .target_name(role.name.clone())
                    .reason(self.created_reason.clone())
                    .payload(json!({
                        "roleGroupId": role.id,
                        "roleGroupName": role.name,
                        "assignedGroupId": group.id,
                        "assignedGroupName": group.name,
                        "isOwner": self.owner_groups_to_add.contains(&group.id),
                        "endedAt": self.groups_added_ended_at.as_ref().map(crate::util::format_date),
                    })),
            );
        }
        for group in groups_to_remove.iter().chain(owner_groups_to_remove.iter()) {
            hooks::audit::log_event(
                AuditEvent::new(EventType::RoleGroupModify, "role_assignment", role.id.to_string(), "role_unassigned")
                    .actor(actor.as_ref(), actor_email.clone())
                    .target_name(role.name.clone())
                    .reason(self.created_reason.clone())
                    .payload(json!({
                        "roleGroupId": role.id,
                        "roleGroupName": role.name,
                        "unassignedGroupId": group.id,
                        "unassignedGroupName": group.name,
                    })),
            );
        }
        hooks::metrics::increment("role.groups_modified", &[]);

        Ok(role)
    }

    /// Ends the associations of one link kind towards the given targets,
    /// derived grants first
    async fn detach(
        &self,
        role_id: &GroupId,
        group_ids: &[GroupId],
        owner_links: bool,
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> crate::error::EmptyResult {
        if group_ids.is_empty() {
            return Ok(());
        }

        let old_maps = RoleGroupMap::find_active_by_role_and_groups(role_id, group_ids, owner_links, conn).await;
        let old_map_ids: Vec<_> = old_maps.into_iter().map(|m| m.id).collect();

        Membership::end_all_for_role_maps(&old_map_ids, actor, conn).await?;
        RoleGroupMap::end_by_ids(&old_map_ids, actor, conn).await
    }

    fn build_map(
        &self,
        role_id: &GroupId,
        group_id: &GroupId,
        is_owner: bool,
        ended_at: Option<NaiveDateTime>,
        actor: Option<&UserId>,
    ) -> RoleGroupMap {
        let mut map = RoleGroupMap::new(role_id.clone(), group_id.clone(), is_owner);
        map.ended_at = ended_at;
        map.created_reason = self.created_reason.clone();
        map.created_actor_id = actor.cloned();
        map.ended_actor_id = if self.groups_added_ended_at.is_some() { actor.cloned() } else { None };
        map
    }

    async fn approve_access_request(
        &self,
        request: &mut AccessRequest,
        grant: &Membership,
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> crate::error::EmptyResult {
        request.status = RequestStatus::Approved as i32;
        request.resolved_at = Some(chrono::Utc::now().naive_utc());
        request.resolver_user_id = actor.cloned();
        request.resolution_reason = self.created_reason.clone();
        request.approval_ending_at = grant.ended_at;
        request.approved_membership_id = Some(grant.id.clone());
        request.save(conn).await
    }

    async fn approve_role_request(
        &self,
        request: &mut RoleRequest,
        map: &RoleGroupMap,
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> crate::error::EmptyResult {
        request.status = RequestStatus::Approved as i32;
        request.resolved_at = Some(chrono::Utc::now().naive_utc());
        request.resolver_user_id = actor.cloned();
        request.resolution_reason = self.created_reason.clone();
        request.approval_ending_at = map.ended_at;
        request.approved_membership_id = Some(map.id.clone());
        request.save(conn).await
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::GroupKind;
    use crate::ops::{testutil::*, ModifyGroupUsers};
    use chrono::{TimeDelta, Utc};

    #[tokio::test(flavor = "multi_thread")]
    async fn attaching_two_groups_fans_out_to_every_role_member() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let u2 = seed_user(&conn, "u2").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;
        seed_grant(&conn, &u2, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;
        let g2 = seed_group(&conn, "Dashboards", GroupKind::Plain, true).await;

        ModifyRoleGroups::new(role.id.clone(), None)
            .attach_groups(vec![g1.id.clone(), g2.id.clone()])
            .execute(&conn)
            .await
            .unwrap();

        for group in [&g1, &g2] {
            let grants = Membership::find_active_by_group(&group.id, &conn).await;
            assert_eq!(grants.len(), 2, "two derived grants per attached group");
            assert!(grants.iter().all(|g| g.role_group_map_id.is_some() && !g.is_owner));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detach_keeps_the_identity_provider_entry_while_another_role_covers() {
        let (_guard, pool, idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let r1 = seed_group(&conn, "Role-Primary", GroupKind::Role, true).await;
        let r2 = seed_group(&conn, "Role-Secondary", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &r1, false).await;
        seed_grant(&conn, &u1, &r2, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;

        ModifyRoleGroups::new(r1.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();
        ModifyRoleGroups::new(r2.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();
        idp.clear();

        ModifyRoleGroups::new(r1.id.clone(), None).detach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        // The grant through the second role still covers the bucket
        assert!(Membership::has_active(&u1.id, &g1.id, false, &conn).await);
        assert_eq!(idp.count_with_prefix("remove_member"), 0, "got {:?}", idp.calls());

        let remaining = Membership::find_active_by_group(&g1.id, &conn).await;
        assert_eq!(remaining.len(), 1);
        let r2_maps = RoleGroupMap::find_active_by_role(&r2.id, &conn).await;
        assert_eq!(remaining[0].role_group_map_id.as_ref(), Some(&r2_maps[0].id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn attach_then_detach_returns_to_the_pre_attach_grant_set() {
        let (_guard, pool, idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;

        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();
        assert!(Membership::has_active(&u1.id, &g1.id, false, &conn).await);

        ModifyRoleGroups::new(role.id.clone(), None).detach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();

        assert!(!Membership::has_active(&u1.id, &g1.id, false, &conn).await);
        assert!(RoleGroupMap::find_active_by_role(&role.id, &conn).await.is_empty());
        // No other origin covered the bucket, so the mirror entry goes too
        assert_eq!(idp.count_with_prefix("remove_member"), 1, "got {:?}", idp.calls());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owner_link_fanout_uses_member_clamp() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        let tag = seed_tag(&conn, "member-bound", json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 })).await;
        attach_tag(&conn, &role, &tag).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;

        ModifyRoleGroups::new(role.id.clone(), None)
            .attach_owner_groups(vec![g1.id.clone()])
            .execute(&conn)
            .await
            .unwrap();

        // Adding a role member fans an ownership grant out to the owner-link
        // group; its bound comes from the role's member time limit
        ModifyGroupUsers::new(role.id.clone(), None).add_members(vec![u1.id.clone()]).execute(&conn).await.unwrap();

        let derived: Vec<_> = Membership::find_active_by_group(&g1.id, &conn)
            .await
            .into_iter()
            .filter(|m| m.role_group_map_id.is_some())
            .collect();
        assert_eq!(derived.len(), 1);
        assert!(derived[0].is_owner);
        let ended_at = derived[0].ended_at.expect("bounded by the member limit");
        let limit = Utc::now().naive_utc() + TimeDelta::seconds(3600);
        assert!((limit - ended_at).num_seconds().abs() < 60);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn role_groups_are_never_attachable_targets() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        let other_role = seed_group(&conn, "Role-Other", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;

        ModifyRoleGroups::new(role.id.clone(), None)
            .attach_groups(vec![other_role.id.clone()])
            .execute(&conn)
            .await
            .unwrap();

        assert!(RoleGroupMap::find_active_by_role(&role.id, &conn).await.is_empty());
        assert!(Membership::find_active_by_group(&other_role.id, &conn).await.is_empty());
    }
}
