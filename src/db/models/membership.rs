use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

use super::{GroupId, UserId};
use crate::{
    db::{
        schema::{groups, role_group_maps, user_group_memberships},
        DbConn,
    },
    error::{ApiResult, EmptyResult, MapResult},
    util::get_uuid,
};

/// The grant edge: user U is a member (or owner) of group G from
/// `created_at` until `ended_at`. A null `role_group_map_id` makes the grant
/// direct; otherwise it is derived from a role association and may never
/// outlive it.
#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = user_group_memberships)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct Membership {
    pub id: MembershipId,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub is_owner: bool,
    pub role_group_map_id: Option<RoleGroupMapId>,
    pub access_request_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub created_reason: String,
    pub created_actor_id: Option<UserId>,
    pub ended_actor_id: Option<UserId>,
    pub should_expire: bool,
}

/// Association edge between a role group and a target group. While active,
/// every member of the role holds a derived grant on the target.
#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = role_group_maps)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct RoleGroupMap {
    pub id: RoleGroupMapId,
    pub role_group_id: GroupId,
    pub group_id: GroupId,
    pub is_owner: bool,
    pub created_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub created_reason: String,
    pub created_actor_id: Option<UserId>,
    pub ended_actor_id: Option<UserId>,
    pub should_expire: bool,
}

/// Local methods
impl Membership {
    pub fn new(user_id: UserId, group_id: GroupId, is_owner: bool) -> Self {
        Self {
            id: MembershipId(get_uuid()),
            user_id,
            group_id,
            is_owner,
            role_group_map_id: None,
            access_request_id: None,
            created_at: Utc::now().naive_utc(),
            ended_at: None,
            created_reason: String::new(),
            created_actor_id: None,
            ended_actor_id: None,
            should_expire: false,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.role_group_map_id.is_none()
    }

    pub fn is_active_at(&self, at: NaiveDateTime) -> bool {
        self.ended_at.is_none_or(|e| e > at)
    }
}

/// Database methods
impl Membership {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(user_group_memberships::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving membership")
            }
            postgresql {
                diesel::insert_into(user_group_memberships::table)
                    .values(self)
                    .on_conflict(user_group_memberships::id)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving membership")
            }
        }
        .map(|_| ())
    }

    pub async fn find_by_id(id: &MembershipId, conn: &DbConn) -> Option<Self> {
        let id = id.clone();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::id.eq(id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_active_by_group(group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq(group_id))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading memberships")
        }}
    }

    /// Active direct grants of one bucket of a group
    pub async fn find_active_direct(group_id: &GroupId, is_owner: bool, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq(group_id))
                .filter(user_group_memberships::is_owner.eq(is_owner))
                .filter(user_group_memberships::role_group_map_id.is_null())
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading memberships")
        }}
    }

    /// Active user members of a role group (never owners): the fan-out set
    pub async fn find_active_role_members(role_group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let role_group_id = role_group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq(role_group_id))
                .filter(user_group_memberships::is_owner.eq(false))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role members")
        }}
    }

    /// Active derived grants carried by one role association
    pub async fn find_active_by_role_map(role_group_map_id: &RoleGroupMapId, conn: &DbConn) -> Vec<Self> {
        let map_id = Some(role_group_map_id.clone());
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::role_group_map_id.eq(map_id))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading derived memberships")
        }}
    }

    /// Distinct users of one bucket of a group holding an active grant of
    /// any origin. This is the desired state the identity provider mirror
    /// converges to.
    pub async fn active_user_ids(group_id: &GroupId, is_owner: bool, conn: &DbConn) -> Vec<UserId> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq(group_id))
                .filter(user_group_memberships::is_owner.eq(is_owner))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .select(user_group_memberships::user_id)
                .distinct()
                .load::<UserId>(conn)
                .expect("Error loading membership users")
        }}
    }

    /// Distinct (user, is_owner) buckets with remaining active access to a
    /// group, restricted to the given users. Consulted after the end phase
    /// to decide which identity provider removals are actually due.
    pub async fn active_buckets_for_users(group_id: &GroupId, user_ids: &[UserId], conn: &DbConn) -> Vec<(UserId, bool)> {
        if user_ids.is_empty() {
            return Vec::new();
        }
        let group_id = group_id.clone();
        let user_ids = user_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq(group_id))
                .filter(user_group_memberships::user_id.eq_any(user_ids))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .select((user_group_memberships::user_id, user_group_memberships::is_owner))
                .distinct()
                .load::<(UserId, bool)>(conn)
                .expect("Error loading membership buckets")
        }}
    }

    /// Same probe across several groups, returning (user, group, is_owner)
    pub async fn active_buckets_for_users_in_groups(
        group_ids: &[GroupId],
        user_ids: &[UserId],
        conn: &DbConn,
    ) -> Vec<(UserId, GroupId, bool)> {
        if user_ids.is_empty() || group_ids.is_empty() {
            return Vec::new();
        }
        let group_ids = group_ids.to_vec();
        let user_ids = user_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::group_id.eq_any(group_ids))
                .filter(user_group_memberships::user_id.eq_any(user_ids))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .select((
                    user_group_memberships::user_id,
                    user_group_memberships::group_id,
                    user_group_memberships::is_owner,
                ))
                .distinct()
                .load::<(UserId, GroupId, bool)>(conn)
                .expect("Error loading membership buckets")
        }}
    }

    pub async fn has_active(user_id: &UserId, group_id: &GroupId, is_owner: bool, conn: &DbConn) -> bool {
        let user_id = user_id.clone();
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::user_id.eq(user_id))
                .filter(user_group_memberships::group_id.eq(group_id))
                .filter(user_group_memberships::is_owner.eq(is_owner))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .count()
                .first::<i64>(conn)
                .unwrap_or(0)
                > 0
        }}
    }

    /// Active owners of a group, the first approver tier
    pub async fn active_owner_ids(group_id: &GroupId, conn: &DbConn) -> Vec<UserId> {
        Self::active_user_ids(group_id, true, conn).await
    }

    /// Ends the active direct grants of one bucket for the given users.
    /// Re-added users are ended here too so extensions leave an audit trail.
    pub async fn end_direct_for_users(
        group_id: &GroupId,
        user_ids: &[UserId],
        is_owner: bool,
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> EmptyResult {
        if user_ids.is_empty() {
            return Ok(());
        }
        let group_id = group_id.clone();
        let user_ids = user_ids.to_vec();
        let actor = actor.cloned();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::group_id.eq(group_id))
                    .filter(user_group_memberships::user_id.eq_any(user_ids))
                    .filter(user_group_memberships::is_owner.eq(is_owner))
                    .filter(user_group_memberships::role_group_map_id.is_null())
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now))),
            )
            .set((user_group_memberships::ended_at.eq(Some(now)), user_group_memberships::ended_actor_id.eq(actor)))
            .execute(conn)
            .map_res("Error ending memberships")
        }}
        .map(|_| ())
    }

    /// Ends the derived grants carried by the given role maps for the given
    /// users, propagating a role-member removal to the associated groups.
    pub async fn end_derived_for_users(
        role_group_map_ids: &[RoleGroupMapId],
        user_ids: &[UserId],
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> EmptyResult {
        if role_group_map_ids.is_empty() || user_ids.is_empty() {
            return Ok(());
        }
        let map_ids = role_group_map_ids.iter().cloned().map(Some).collect::<Vec<_>>();
        let user_ids = user_ids.to_vec();
        let actor = actor.cloned();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::role_group_map_id.eq_any(map_ids))
                    .filter(user_group_memberships::user_id.eq_any(user_ids))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now))),
            )
            .set((user_group_memberships::ended_at.eq(Some(now)), user_group_memberships::ended_actor_id.eq(actor)))
            .execute(conn)
            .map_res("Error ending derived memberships")
        }}
        .map(|_| ())
    }

    /// Ends every derived grant of the given role maps, for role detach and
    /// role deletion.
    pub async fn end_all_for_role_maps(
        role_group_map_ids: &[RoleGroupMapId],
        actor: Option<&UserId>,
        conn: &DbConn,
    ) -> EmptyResult {
        if role_group_map_ids.is_empty() {
            return Ok(());
        }
        let map_ids = role_group_map_ids.iter().cloned().map(Some).collect::<Vec<_>>();
        let actor = actor.cloned();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::role_group_map_id.eq_any(map_ids))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now))),
            )
            .set((user_group_memberships::ended_at.eq(Some(now)), user_group_memberships::ended_actor_id.eq(actor)))
            .execute(conn)
            .map_res("Error ending derived memberships")
        }}
        .map(|_| ())
    }

    /// Ends every active grant pointing at a group, within the deleting
    /// transaction.
    pub async fn end_all_for_group(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::group_id.eq(group_id))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now))),
            )
            .set(user_group_memberships::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group memberships")
        }}
        .map(|_| ())
    }

    pub async fn end_all_for_user(user_id: &UserId, actor: Option<&UserId>, conn: &DbConn) -> EmptyResult {
        let user_id = user_id.clone();
        let actor = actor.cloned();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::user_id.eq(user_id))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now))),
            )
            .set((user_group_memberships::ended_at.eq(Some(now)), user_group_memberships::ended_actor_id.eq(actor)))
            .execute(conn)
            .map_res("Error ending user memberships")
        }}
        .map(|_| ())
    }

    /// Flags time-bounded rows for the expirations page. A hint only, the
    /// expiry itself is carried by `ended_at`.
    pub async fn mark_should_expire(ids: &[MembershipId], is_owner: bool, conn: &DbConn) -> EmptyResult {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::id.eq_any(ids))
                    .filter(user_group_memberships::is_owner.eq(is_owner))
                    .filter(user_group_memberships::ended_at.gt(now)),
            )
            .set(user_group_memberships::should_expire.eq(true))
            .execute(conn)
            .map_res("Error flagging memberships")
        }}
        .map(|_| ())
    }

    /// Time-bounded grants on non-deleted groups ending inside the window
    pub async fn find_ending_between(start: NaiveDateTime, end: NaiveDateTime, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            user_group_memberships::table
                .inner_join(groups::table)
                .filter(user_group_memberships::ended_at.gt(start))
                .filter(user_group_memberships::ended_at.le(end))
                .filter(groups::deleted_at.is_null())
                .select(user_group_memberships::all_columns)
                .load::<Self>(conn)
                .expect("Error loading expiring memberships")
        }}
    }

    /// Pulls every grant of one bucket running past `cap` down to it; how a
    /// freshly attached time-limit tag binds existing access
    pub async fn cap_ended_at_for_groups(
        group_ids: &[GroupId],
        is_owner: bool,
        cap: NaiveDateTime,
        conn: &DbConn,
    ) -> EmptyResult {
        if group_ids.is_empty() {
            return Ok(());
        }
        let group_ids = group_ids.to_vec();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::group_id.eq_any(group_ids))
                    .filter(user_group_memberships::is_owner.eq(is_owner))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(cap))),
            )
            .set(user_group_memberships::ended_at.eq(Some(cap)))
            .execute(conn)
            .map_res("Error capping memberships")
        }}
        .map(|_| ())
    }

    /// Same cap over the derived grants of the given role maps
    pub async fn cap_ended_at_for_role_maps(
        role_group_map_ids: &[RoleGroupMapId],
        cap: NaiveDateTime,
        conn: &DbConn,
    ) -> EmptyResult {
        if role_group_map_ids.is_empty() {
            return Ok(());
        }
        let map_ids = role_group_map_ids.iter().cloned().map(Some).collect::<Vec<_>>();
        db_run! { conn: {
            diesel::update(
                user_group_memberships::table
                    .filter(user_group_memberships::role_group_map_id.eq_any(map_ids))
                    .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(cap))),
            )
            .set(user_group_memberships::ended_at.eq(Some(cap)))
            .execute(conn)
            .map_res("Error capping derived memberships")
        }}
        .map(|_| ())
    }

    pub async fn count_active(conn: &DbConn) -> ApiResult<i64> {
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .count()
                .first::<i64>(conn)
                .map_res("Error counting memberships")
        }}
    }
}

/// Local methods
impl RoleGroupMap {
    pub fn new(role_group_id: GroupId, group_id: GroupId, is_owner: bool) -> Self {
        Self {
            id: RoleGroupMapId(get_uuid()),
            role_group_id,
            group_id,
            is_owner,
            created_at: Utc::now().naive_utc(),
            ended_at: None,
            created_reason: String::new(),
            created_actor_id: None,
            ended_actor_id: None,
            should_expire: false,
        }
    }

    pub fn is_active_at(&self, at: NaiveDateTime) -> bool {
        self.ended_at.is_none_or(|e| e > at)
    }
}

/// Database methods
impl RoleGroupMap {
    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(role_group_maps::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving role group map")
            }
            postgresql {
                diesel::insert_into(role_group_maps::table)
                    .values(self)
                    .on_conflict(role_group_maps::id)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving role group map")
            }
        }
        .map(|_| ())
    }

    pub async fn find_by_id(id: &RoleGroupMapId, conn: &DbConn) -> Option<Self> {
        let id = id.clone();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::id.eq(id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Active associations of a role, owner links and member links alike
    pub async fn find_active_by_role(role_group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let role_group_id = role_group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::role_group_id.eq(role_group_id))
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    /// Active associations of a role whose target group is managed and not
    /// deleted; the only ones the identity provider is written for.
    pub async fn find_active_managed_by_role(role_group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let role_group_id = role_group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .inner_join(groups::table)
                .filter(role_group_maps::role_group_id.eq(role_group_id))
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .filter(groups::deleted_at.is_null())
                .filter(groups::is_managed.eq(true))
                .select(role_group_maps::all_columns)
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    pub async fn find_active_by_role_and_groups(
        role_group_id: &GroupId,
        group_ids: &[GroupId],
        is_owner: bool,
        conn: &DbConn,
    ) -> Vec<Self> {
        if group_ids.is_empty() {
            return Vec::new();
        }
        let role_group_id = role_group_id.clone();
        let group_ids = group_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::role_group_id.eq(role_group_id))
                .filter(role_group_maps::group_id.eq_any(group_ids))
                .filter(role_group_maps::is_owner.eq(is_owner))
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    /// Active associations pointing at a target group
    pub async fn find_active_by_group(group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::group_id.eq(group_id))
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    pub async fn find_all_active(conn: &DbConn) -> Vec<Self> {
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    pub async fn end_by_ids(ids: &[RoleGroupMapId], actor: Option<&UserId>, conn: &DbConn) -> EmptyResult {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let actor = actor.cloned();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                role_group_maps::table
                    .filter(role_group_maps::id.eq_any(ids))
                    .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now))),
            )
            .set((role_group_maps::ended_at.eq(Some(now)), role_group_maps::ended_actor_id.eq(actor)))
            .execute(conn)
            .map_res("Error ending role group maps")
        }}
        .map(|_| ())
    }

    /// Ends every association touching a group, both as role and as target
    pub async fn end_all_for_group(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                role_group_maps::table
                    .filter(
                        role_group_maps::group_id.eq(group_id.clone()).or(role_group_maps::role_group_id.eq(group_id)),
                    )
                    .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now))),
            )
            .set(role_group_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending role group maps")
        }}
        .map(|_| ())
    }

    /// Active associations of any of the given roles
    pub async fn find_active_by_roles(role_group_ids: &[GroupId], conn: &DbConn) -> Vec<Self> {
        if role_group_ids.is_empty() {
            return Vec::new();
        }
        let role_group_ids = role_group_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            role_group_maps::table
                .filter(role_group_maps::role_group_id.eq_any(role_group_ids))
                .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading role group maps")
        }}
    }

    /// Association counterpart of the grant cap above
    pub async fn cap_ended_at_for_groups(
        group_ids: &[GroupId],
        is_owner: bool,
        cap: NaiveDateTime,
        conn: &DbConn,
    ) -> EmptyResult {
        if group_ids.is_empty() {
            return Ok(());
        }
        let group_ids = group_ids.to_vec();
        db_run! { conn: {
            diesel::update(
                role_group_maps::table
                    .filter(role_group_maps::group_id.eq_any(group_ids))
                    .filter(role_group_maps::is_owner.eq(is_owner))
                    .filter(role_group_maps::ended_at.is_null().or(role_group_maps::ended_at.gt(cap))),
            )
            .set(role_group_maps::ended_at.eq(Some(cap)))
            .execute(conn)
            .map_res("Error capping role group maps")
        }}
        .map(|_| ())
    }

    pub async fn mark_should_expire(ids: &[RoleGroupMapId], is_owner: bool, conn: &DbConn) -> EmptyResult {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                role_group_maps::table
                    .filter(role_group_maps::id.eq_any(ids))
                    .filter(role_group_maps::is_owner.eq(is_owner))
                    .filter(role_group_maps::ended_at.gt(now)),
            )
            .set(role_group_maps::should_expire.eq(true))
            .execute(conn)
            .map_res("Error flagging role group maps")
        }}
        .map(|_| ())
    }

    /// Time-bounded associations on non-deleted groups ending in the window
    pub async fn find_ending_between(start: NaiveDateTime, end: NaiveDateTime, conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            role_group_maps::table
                .inner_join(groups::table)
                .filter(role_group_maps::ended_at.gt(start))
                .filter(role_group_maps::ended_at.le(end))
                .filter(groups::deleted_at.is_null())
                .select(role_group_maps::all_columns)
                .load::<Self>(conn)
                .expect("Error loading expiring role group maps")
        }}
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipId(String);

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGroupMapId(String);
