use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::{
    db::{
        models::{
            coalesce_ended_at, AccessRequest, Group, GroupId, Membership, MembershipId, RequestStatus, RoleGroupMap,
            Tag, User, UserId,
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

/// The grant primitive: ends, extends and creates memberships and
/// ownerships on one group, fans role changes out to associated groups,
/// mirrors the result to the identity provider and resolves the pending
/// requests the mutation satisfies.
///
/// Observable ordering: end, commit, add, commit, resolve, commit, then the
/// identity provider batch, then notifications.
pub struct ModifyGroupUsers {
    group_id: GroupId,
    users_added_ended_at: Option<NaiveDateTime>,
    members_to_add: Vec<UserId>,
    owners_to_add: Vec<UserId>,
    members_should_expire: Vec<MembershipId>,
    owners_should_expire: Vec<MembershipId>,
    members_to_remove: Vec<UserId>,
    owners_to_remove: Vec<UserId>,
    sync_to_idp: bool,
    current_actor_id: Option<UserId>,
    created_reason: String,
    notify: bool,
}

impl ModifyGroupUsers {
    pub fn new(group_id: GroupId, current_actor_id: Option<UserId>) -> Self {
        Self {
            group_id,
            users_added_ended_at: None,
            members_to_add: Vec::new(),
            owners_to_add: Vec::new(),
            members_should_expire: Vec::new(),
            owners_should_expire: Vec::new(),
            members_to_remove: Vec::new(),
            owners_to_remove: Vec::new(),
            sync_to_idp: true,
            current_actor_id,
            created_reason: String::new(),
            notify: true,
        }
    }

    #[must_use]
    pub fn add_members(mut self, members: Vec<UserId>) -> Self {
        self.members_to_add = members;
        self
    }

    #[must_use]
    pub fn add_owners(mut self, owners: Vec<UserId>) -> Self {
        self.owners_to_add = owners;
        self
    }

    #[must_use]
    pub fn remove_members(mut self, members: Vec<UserId>) -> Self {
        self.members_to_remove = members;
        self
    }

    #[must_use]
    pub fn remove_owners(mut self, owners: Vec<UserId>) -> Self {
        self.owners_to_remove = owners;
        self
    }

    #[must_use]
    pub fn expire_members(mut self, memberships: Vec<MembershipId>) -> Self {
        self.members_should_expire = memberships;
        self
    }

    #[must_use]
    pub fn expire_owners(mut self, ownerships: Vec<MembershipId>) -> Self {
        self.owners_should_expire = ownerships;
        self
    }

    #[must_use]
    pub fn ended_at(mut self, ended_at: Option<NaiveDateTime>) -> Self {
        self.users_added_ended_at = ended_at;
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
        let Some(group) = Group::find_by_id(&self.group_id, conn).await else {
            err_not_found!(format!("Group {} not found", self.group_id));
        };

        // Only users that still exist and are not deleted take part
        self.members_to_add = existing_user_ids(std::mem::take(&mut self.members_to_add), conn).await;
        self.owners_to_add = existing_user_ids(std::mem::take(&mut self.owners_to_add), conn).await;
        self.members_to_remove = existing_user_ids(std::mem::take(&mut self.members_to_remove), conn).await;
        self.owners_to_remove = existing_user_ids(std::mem::take(&mut self.owners_to_remove), conn).await;

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        // Fast return if no changes are being made
        if self.members_to_add.is_empty()
            && self.owners_to_add.is_empty()
            && self.members_to_remove.is_empty()
            && self.owners_to_remove.is_empty()
            && self.members_should_expire.is_empty()
            && self.owners_should_expire.is_empty()
        {
            return Ok(group);
        }

        // Policy gates; a refusal leaves the group untouched
        let (valid, _) = constraints::check_self_add_for_group(
            &group,
            actor.as_ref(),
            &self.members_to_add,
            &self.owners_to_add,
            conn,
        )
        .await;
        if !valid {
            return Ok(group);
        }

        let (valid, _) = constraints::check_reason_for_group(&group, actor.as_ref(), &self.created_reason, conn).await;
        if !valid {
            return Ok(group);
        }

        // The group's current tags decide the effective end bound, one
        // clamp per bucket
        let tags = Group::active_tags(&group.id, conn).await;
        let members_added_ended_at = coalesce_ended_at(
            Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY,
            &tags,
            self.users_added_ended_at,
            group.is_managed,
        );
        let owners_added_ended_at = coalesce_ended_at(
            Tag::OWNER_TIME_LIMIT_CONSTRAINT_KEY,
            &tags,
            self.users_added_ended_at,
            group.is_managed,
        );

        let mut idp_tasks = idp::IdpTasks::new();

        // End phase. Users being re-added are ended first as well, so a
        // bounded grant is extended through a fresh row and the extension
        // shows up in the audit trail.
        let remove_changed_members = union_ids(&self.members_to_remove, &self.members_to_add);
        let remove_changed_owners = union_ids(&self.owners_to_remove, &self.owners_to_add);

        Membership::end_direct_for_users(&group.id, &remove_changed_members, false, actor.as_ref(), conn).await?;
        Membership::end_direct_for_users(&group.id, &remove_changed_owners, true, actor.as_ref(), conn).await?;

        if group.is_role() {
            // Removing a member from a role removes their derived access on
            // every associated group
            let all_map_ids: Vec<_> =
                RoleGroupMap::find_active_by_role(&group.id, conn).await.into_iter().map(|m| m.id).collect();
            Membership::end_derived_for_users(&all_map_ids, &remove_changed_members, actor.as_ref(), conn).await?;
        }

        // Identity provider removals, only where no other active grant
        // still covers the bucket
        if !self.members_to_remove.is_empty() || !self.owners_to_remove.is_empty() {
            let removed_ids = union_ids(&self.members_to_remove, &self.owners_to_remove);
            let still_covered = Membership::active_buckets_for_users(&group.id, &removed_ids, conn).await;

            if self.sync_to_idp && group.is_managed {
                let members_covered: HashSet<_> =
                    still_covered.iter().filter(|(_, owner)| !*owner).map(|(u, _)| u.clone()).collect();
                for member_id in self.members_to_remove.iter().filter(|u| !members_covered.contains(*u)) {
                    idp::queue_remove_member(&mut idp_tasks, &group.id, member_id);
                }

                let owners_covered: HashSet<_> =
                    still_covered.iter().filter(|(_, owner)| *owner).map(|(u, _)| u.clone()).collect();
                for owner_id in self.owners_to_remove.iter().filter(|u| !owners_covered.contains(*u)) {
                    idp::queue_remove_owner(&mut idp_tasks, &group.id, owner_id);
                }
            }

            if group.is_role() && self.sync_to_idp {
                let managed_maps = RoleGroupMap::find_active_managed_by_role(&group.id, conn).await;
                let associated_group_ids: Vec<_> = managed_maps.iter().map(|m| m.group_id.clone()).collect();
                let still_covered =
                    Membership::active_buckets_for_users_in_groups(&associated_group_ids, &removed_ids, conn).await;

                for map in &managed_maps {
                    if !map.is_owner {
                        let covered: HashSet<_> = still_covered
                            .iter()
                            .filter(|(_, g, owner)| *g == map.group_id && !*owner)
                            .map(|(u, _, _)| u.clone())
                            .collect();
                        for member_id in self.members_to_remove.iter().filter(|u| !covered.contains(*u)) {
                            idp::queue_remove_member(&mut idp_tasks, &map.group_id, member_id);
                        }
                    } else {
                        let covered: HashSet<_> = still_covered
                            .iter()
                            .filter(|(_, g, owner)| *g == map.group_id && *owner)
                            .map(|(u, _, _)| u.clone())
                            .collect();
                        for owner_id in self.owners_to_remove.iter().filter(|u| !covered.contains(*u)) {
                            idp::queue_remove_owner(&mut idp_tasks, &map.group_id, owner_id);
                        }
                    }
                }
            }
        }

        // Flag rows for the expirations page
        Membership::mark_should_expire(&self.members_should_expire, false, conn).await?;
        Membership::mark_should_expire(&self.owners_should_expire, true, conn).await?;

        // Add phase
        let mut memberships_added: HashMap<GroupId, HashMap<UserId, Membership>> = HashMap::new();
        let mut ownerships_added: HashMap<GroupId, HashMap<UserId, Membership>> = HashMap::new();
        memberships_added.insert(group.id.clone(), HashMap::new());
        ownerships_added.insert(group.id.clone(), HashMap::new());

        if !self.members_to_add.is_empty() || !self.owners_to_add.is_empty() {
            for member_id in &self.members_to_add {
                if self.sync_to_idp && group.is_managed {
                    idp::queue_add_member(&mut idp_tasks, &group.id, member_id);
                }
                let membership = self
                    .build_grant(member_id.clone(), group.id.clone(), false, members_added_ended_at, None, actor.as_ref());
                membership.save(conn).await?;
                memberships_added.get_mut(&group.id).expect("seeded above").insert(member_id.clone(), membership);
            }

            for owner_id in &self.owners_to_add {
                if self.sync_to_idp && group.is_managed {
                    idp::queue_add_owner(&mut idp_tasks, &group.id, owner_id);
                }
                let ownership = self
                    .build_grant(owner_id.clone(), group.id.clone(), true, owners_added_ended_at, None, actor.as_ref());
                ownership.save(conn).await?;
                ownerships_added.get_mut(&group.id).expect("seeded above").insert(owner_id.clone(), ownership);
            }

            // Role fan-out: new role members gain derived grants on every
            // managed group associated with the role. The end bound of a
            // derived grant is the earlier of the association's and the
            // member clamp computed above, for owner links as well.
            if group.is_role() {
                for map in RoleGroupMap::find_active_managed_by_role(&group.id, conn).await {
                    let bucket = if map.is_owner {
                        ownerships_added.entry(map.group_id.clone()).or_default()
                    } else {
                        memberships_added.entry(map.group_id.clone()).or_default()
                    };

                    for member_id in &self.members_to_add {
                        if self.sync_to_idp {
                            if map.is_owner {
                                idp::queue_add_owner(&mut idp_tasks, &map.group_id, member_id);
                            } else {
                                idp::queue_add_member(&mut idp_tasks, &map.group_id, member_id);
                            }
                        }

                        let derived_ended_at = earliest_ended_at(map.ended_at, members_added_ended_at);
                        let derived = self.build_grant(
                            member_id.clone(),
                            map.group_id.clone(),
                            map.is_owner,
                            derived_ended_at,
                            Some(map.id.clone()),
                            actor.as_ref(),
                        );
                        derived.save(conn).await?;
                        bucket.insert(member_id.clone(), derived);
                    }
                }
            }
        }

        // Resolve the pending requests this mutation satisfies
        let mut resolved = Vec::new();

        let member_group_ids: Vec<_> = memberships_added.keys().cloned().collect();
        for mut request in
            AccessRequest::find_pending_for_grants(&member_group_ids, &self.members_to_add, false, conn).await
        {
            if let Some(grant) = memberships_added.get(&request.requested_group_id).and_then(|g| g.get(&request.requester_user_id)) {
                self.approve_request(&mut request, grant, actor.as_ref(), conn).await?;
                resolved.push(request);
            }
        }

        for mut request in
            AccessRequest::find_pending_for_grants(&[group.id.clone()], &self.owners_to_add, true, conn).await
        {
            if let Some(grant) = ownerships_added.get(&request.requested_group_id).and_then(|g| g.get(&request.requester_user_id)) {
                self.approve_request(&mut request, grant, actor.as_ref(), conn).await?;
                resolved.push(request);
            }
        }

        // Ownership requests satisfied through an owner-link of this role
        let owner_fanout_ids: Vec<_> = ownerships_added.keys().filter(|g| **g != group.id).cloned().collect();
        for mut request in
            AccessRequest::find_pending_for_grants(&owner_fanout_ids, &self.members_to_add, true, conn).await
        {
            if let Some(grant) = ownerships_added.get(&request.requested_group_id).and_then(|g| g.get(&request.requester_user_id)) {
                self.approve_request(&mut request, grant, actor.as_ref(), conn).await?;
                resolved.push(request);
            }
        }

        // Everything is committed; mirror to the identity provider and only
        // then tell people about it
        idp::join_all(idp_tasks).await;

        if self.notify {
            for request in &resolved {
                let requester = User::find_by_id(&request.requester_user_id, conn).await;
                let approvers = super::request_approvers(&request.requested_group_id, &request.requester_user_id, conn).await;
                if let Some(requested_group) = Group::find_by_id(&request.requested_group_id, conn).await {
                    hooks::notifications::access_request_completed(
                        request,
                        &requested_group,
                        requester.as_ref(),
                        &approvers,
                        true,
                    );
                }
            }
        }

        let actor_email = match actor.as_ref() {
            Some(id) => User::find_by_id(id, conn).await.map(|u| u.email),
            None => None,
        };
        hooks::audit::log_event(
            AuditEvent::new(EventType::GroupModifyUsers, "group", group.id.to_string(), "modified")
                .actor(actor.as_ref(), actor_email)
                .target_name(group.name.clone())
                .reason(self.created_reason.clone())
                .payload(json!({
                    "membersAdded": self.members_to_add,
                    "ownersAdded": self.owners_to_add,
                    "membersRemoved": self.members_to_remove,
                    "ownersRemoved": self.owners_to_remove,
                    "endingAt": members_added_ended_at.as_ref().map(crate::util::format_date),
                })),
        );
        hooks::metrics::increment("group.users_modified", &[("kind", group.kind.as_str())]);

        Ok(group)
    }

    fn build_grant(
        &self,
        user_id: UserId,
        group_id: GroupId,
        is_owner: bool,
        ended_at: Option<NaiveDateTime>,
        role_group_map_id: Option<crate::db::models::RoleGroupMapId>,
        actor: Option<&UserId>,
    ) -> Membership {
        let mut grant = Membership::new(user_id, group_id, is_owner);
        grant.role_group_map_id = role_group_map_id;
        grant.ended_at = ended_at;
        grant.created_reason = self.created_reason.clone();
        grant.created_actor_id = actor.cloned();
        grant.ended_actor_id = if ended_at.is_some() { actor.cloned() } else { None };
        grant
    }

    async fn approve_request(
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
}

async fn existing_user_ids(ids: Vec<UserId>, conn: &DbConn) -> Vec<UserId> {
    if ids.is_empty() {
        return ids;
    }
    let found: HashSet<_> = User::find_by_ids(&ids, conn).await.into_iter().map(|u| u.id).collect();
    ids.into_iter().filter(|id| found.contains(id)).collect()
}

fn union_ids(a: &[UserId], b: &[UserId]) -> Vec<UserId> {
    let mut seen = HashSet::new();
    a.iter().chain(b).filter(|id| seen.insert((*id).clone())).cloned().collect()
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::GroupKind;
    use crate::ops::{testutil::*, ModifyRoleGroups};
    use chrono::{TimeDelta, Utc};

    #[tokio::test(flavor = "multi_thread")]
    async fn member_add_auto_approves_the_pending_request() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let mut request = AccessRequest::new(u1.id.clone(), g1.id.clone(), false, String::from("need it"), None);
        request.save(&conn).await.unwrap();

        ModifyGroupUsers::new(g1.id.clone(), None).add_members(vec![u1.id.clone()]).execute(&conn).await.unwrap();

        let request = AccessRequest::find_by_id(&request.id, &conn).await.unwrap();
        assert_eq!(request.status(), RequestStatus::Approved);
        assert!(request.resolved_at.is_some());

        let grants = Membership::find_active_direct(&g1.id, false, &conn).await;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].user_id, u1.id);
        assert_eq!(request.approved_membership_id.as_ref(), Some(&grants[0].id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requested_end_is_clamped_by_the_member_time_limit() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let tag = seed_tag(&conn, "limited", json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 })).await;
        attach_tag(&conn, &g1, &tag).await;

        let requested = Utc::now().naive_utc() + TimeDelta::seconds(7200);
        ModifyGroupUsers::new(g1.id.clone(), None)
            .add_members(vec![u1.id.clone()])
            .ended_at(Some(requested))
            .execute(&conn)
            .await
            .unwrap();

        let grants = Membership::find_active_direct(&g1.id, false, &conn).await;
        assert_eq!(grants.len(), 1);
        let ended_at = grants[0].ended_at.expect("grant must be bounded");
        assert!(ended_at < requested);
        let limit = Utc::now().naive_utc() + TimeDelta::seconds(3600);
        assert!((limit - ended_at).num_seconds().abs() < 60);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn self_add_is_refused_when_a_tag_disallows_it() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        seed_grant(&conn, &u1, &g1, true).await;
        let tag = seed_tag(&conn, "no-self-add", json!({ Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY: true })).await;
        attach_tag(&conn, &g1, &tag).await;

        ModifyGroupUsers::new(g1.id.clone(), Some(u1.id.clone()))
            .add_members(vec![u1.id.clone()])
            .execute(&conn)
            .await
            .unwrap();

        // The gate made the call a no-op
        assert!(Membership::find_active_direct(&g1.id, false, &conn).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unmanaged_groups_never_reach_the_identity_provider() {
        let (_guard, pool, idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Legacy", GroupKind::Plain, false).await;

        ModifyGroupUsers::new(g1.id.clone(), None).add_members(vec![u1.id.clone()]).execute(&conn).await.unwrap();

        assert_eq!(Membership::find_active_direct(&g1.id, false, &conn).await.len(), 1);
        assert!(idp.calls().is_empty(), "got {:?}", idp.calls());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn re_adding_a_bounded_member_extends_through_a_fresh_row() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let old_end = Utc::now().naive_utc() + TimeDelta::hours(1);
        let old = seed_bounded_grant(&conn, &u1, &g1, false, Some(old_end)).await;

        let new_end = Utc::now().naive_utc() + TimeDelta::hours(8);
        ModifyGroupUsers::new(g1.id.clone(), None)
            .add_members(vec![u1.id.clone()])
            .ended_at(Some(new_end))
            .execute(&conn)
            .await
            .unwrap();

        let old = Membership::find_by_id(&old.id, &conn).await.unwrap();
        assert!(!old.is_active_at(Utc::now().naive_utc()), "the old bounded grant must be ended");

        let active = Membership::find_active_direct(&g1.id, false, &conn).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].ended_at, Some(new_end));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removal_skips_the_identity_provider_while_another_origin_remains() {
        let (_guard, pool, idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let role = seed_group(&conn, "Role-Payments", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;

        // Direct grant plus a derived one through the role
        seed_grant(&conn, &u1, &g1, false).await;
        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();
        idp.clear();

        ModifyGroupUsers::new(g1.id.clone(), None).remove_members(vec![u1.id.clone()]).execute(&conn).await.unwrap();

        // The derived grant still covers the bucket, so no removal call
        assert_eq!(idp.count_with_prefix("remove_member"), 0, "got {:?}", idp.calls());
        assert!(Membership::has_active(&u1.id, &g1.id, false, &conn).await);
    }
}
