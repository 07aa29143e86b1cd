use chrono::{NaiveDateTime, TimeDelta, Utc};
use derive_more::{AsRef, Deref, Display, From};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

use super::{lower, AppId, GroupId, MembershipId, RoleGroupMapId, UserId};
use crate::{
    db::{
        schema::{access_requests, group_requests, role_requests},
        DbConn,
    },
    error::{EmptyResult, MapResult},
    util::{format_date, get_entity_id},
};

/// States of every request variant. Pending resolves exactly once; the
/// terminal states are immutable.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
pub enum RequestStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
}

impl RequestStatus {
    pub fn from_i32(status: i32) -> Self {
        Self::from_i32_opt(status).unwrap_or(Self::Pending)
    }

    fn from_i32_opt(status: i32) -> Option<Self> {
        FromPrimitive::from_i32(status)
    }
}

#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = access_requests)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct AccessRequest {
    pub id: AccessRequestId,
    pub requester_user_id: UserId,
    pub requested_group_id: GroupId,
    pub request_ownership: bool,
    pub request_reason: String,
    pub request_ending_at: Option<NaiveDateTime>,
    pub status: i32,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolver_user_id: Option<UserId>,
    pub resolution_reason: String,
    pub approval_ending_at: Option<NaiveDateTime>,
    pub approved_membership_id: Option<MembershipId>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Same shape as [`AccessRequest`], but asking to attach the requester's
/// role to the group; approval materializes a role association instead of a
/// direct grant.
#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = role_requests)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct RoleRequest {
    pub id: RoleRequestId,
    pub requester_user_id: UserId,
    pub requester_role_id: GroupId,
    pub requested_group_id: GroupId,
    pub request_ownership: bool,
    pub request_reason: String,
    pub request_ending_at: Option<NaiveDateTime>,
    pub status: i32,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolver_user_id: Option<UserId>,
    pub resolution_reason: String,
    pub approval_ending_at: Option<NaiveDateTime>,
    pub approved_membership_id: Option<RoleGroupMapId>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// A request to create a group. Carries the requested projection so the
/// approver can edit before the group is built.
#[derive(Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = group_requests)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct GroupRequest {
    pub id: GroupRequestId,
    pub requester_user_id: UserId,
    pub requested_group_name: String,
    pub requested_group_description: String,
    pub requested_group_kind: String,
    pub requested_app_id: Option<AppId>,
    pub requested_group_tags: String,
    pub requested_ownership_ending_at: Option<NaiveDateTime>,
    pub request_reason: String,
    pub status: i32,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolver_user_id: Option<UserId>,
    pub resolution_reason: String,
    pub approved_group_id: Option<GroupId>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Local methods
impl AccessRequest {
    pub fn new(
        requester_user_id: UserId,
        requested_group_id: GroupId,
        request_ownership: bool,
        request_reason: String,
        request_ending_at: Option<NaiveDateTime>,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            id: AccessRequestId(get_entity_id()),
            requester_user_id,
            requested_group_id,
            request_ownership,
            request_reason,
            request_ending_at,
            status: RequestStatus::Pending as i32,
            resolved_at: None,
            resolver_user_id: None,
            resolution_reason: String::new(),
            approval_ending_at: None,
            approved_membership_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_i32(self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending && self.resolved_at.is_none()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "requesterUserId": self.requester_user_id,
            "requestedGroupId": self.requested_group_id,
            "requestOwnership": self.request_ownership,
            "requestReason": self.request_reason,
            "requestEndingAt": self.request_ending_at.as_ref().map(format_date),
            "status": self.status,
            "resolvedAt": self.resolved_at.as_ref().map(format_date),
            "approvalEndingAt": self.approval_ending_at.as_ref().map(format_date),
            "createdAt": format_date(&self.created_at),
        })
    }
}

/// Database methods
impl AccessRequest {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(access_requests::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving access request")
            }
            postgresql {
                diesel::insert_into(access_requests::table)
                    .values(&*self)
                    .on_conflict(access_requests::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving access request")
            }
        }
    }

    pub async fn find_by_id(id: &AccessRequestId, conn: &DbConn) -> Option<Self> {
        let id = id.clone();
        db_run! { conn: {
            access_requests::table
                .filter(access_requests::id.eq(id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_pending_by_group(group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            access_requests::table
                .filter(access_requests::requested_group_id.eq(group_id))
                .filter(access_requests::status.eq(pending))
                .filter(access_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading access requests")
        }}
    }

    pub async fn find_pending_by_user(user_id: &UserId, conn: &DbConn) -> Vec<Self> {
        let user_id = user_id.clone();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            access_requests::table
                .filter(access_requests::requester_user_id.eq(user_id))
                .filter(access_requests::status.eq(pending))
                .filter(access_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading access requests")
        }}
    }

    /// The auto-resolution probe: pending requests satisfied by grants just
    /// inserted for (groups × requesters × bucket).
    pub async fn find_pending_for_grants(
        group_ids: &[GroupId],
        requester_ids: &[UserId],
        request_ownership: bool,
        conn: &DbConn,
    ) -> Vec<Self> {
        if group_ids.is_empty() || requester_ids.is_empty() {
            return Vec::new();
        }
        let group_ids = group_ids.to_vec();
        let requester_ids = requester_ids.to_vec();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            access_requests::table
                .filter(access_requests::requested_group_id.eq_any(group_ids))
                .filter(access_requests::requester_user_id.eq_any(requester_ids))
                .filter(access_requests::request_ownership.eq(request_ownership))
                .filter(access_requests::status.eq(pending))
                .filter(access_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading access requests")
        }}
    }

    /// Pending requests past their own requested end or older than the TTL
    pub async fn find_stale(ttl_days: i64, conn: &DbConn) -> Vec<Self> {
        let now = Utc::now().naive_utc();
        let cutoff = now - TimeDelta::days(ttl_days);
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            access_requests::table
                .filter(access_requests::status.eq(pending))
                .filter(access_requests::resolved_at.is_null())
                .filter(access_requests::request_ending_at.lt(now).or(access_requests::created_at.lt(cutoff)))
                .load::<Self>(conn)
                .expect("Error loading access requests")
        }}
    }
}

/// Local methods
impl RoleRequest {
    pub fn new(
        requester_user_id: UserId,
        requester_role_id: GroupId,
        requested_group_id: GroupId,
        request_ownership: bool,
        request_reason: String,
        request_ending_at: Option<NaiveDateTime>,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            id: RoleRequestId(get_entity_id()),
            requester_user_id,
            requester_role_id,
            requested_group_id,
            request_ownership,
            request_reason,
            request_ending_at,
            status: RequestStatus::Pending as i32,
            resolved_at: None,
            resolver_user_id: None,
            resolution_reason: String::new(),
            approval_ending_at: None,
            approved_membership_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_i32(self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending && self.resolved_at.is_none()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "requesterUserId": self.requester_user_id,
            "requesterRoleId": self.requester_role_id,
            "requestedGroupId": self.requested_group_id,
            "requestOwnership": self.request_ownership,
            "requestReason": self.request_reason,
            "status": self.status,
            "resolvedAt": self.resolved_at.as_ref().map(format_date),
            "createdAt": format_date(&self.created_at),
        })
    }
}

/// Database methods
impl RoleRequest {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(role_requests::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving role request")
            }
            postgresql {
                diesel::insert_into(role_requests::table)
                    .values(&*self)
                    .on_conflict(role_requests::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving role request")
            }
        }
    }

    pub async fn find_by_id(id: &RoleRequestId, conn: &DbConn) -> Option<Self> {
        let id = id.clone();
        db_run! { conn: {
            role_requests::table
                .filter(role_requests::id.eq(id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_pending_by_group(group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            role_requests::table
                .filter(role_requests::requested_group_id.eq(group_id))
                .filter(role_requests::status.eq(pending))
                .filter(role_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading role requests")
        }}
    }

    pub async fn find_pending_by_user(user_id: &UserId, conn: &DbConn) -> Vec<Self> {
        let user_id = user_id.clone();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            role_requests::table
                .filter(role_requests::requester_user_id.eq(user_id))
                .filter(role_requests::status.eq(pending))
                .filter(role_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading role requests")
        }}
    }

    /// Pending role requests satisfied by an attach of this role to the
    /// given targets.
    pub async fn find_pending_for_attach(
        role_group_id: &GroupId,
        group_ids: &[GroupId],
        request_ownership: bool,
        conn: &DbConn,
    ) -> Vec<Self> {
        if group_ids.is_empty() {
            return Vec::new();
        }
        let role_group_id = role_group_id.clone();
        let group_ids = group_ids.to_vec();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            role_requests::table
                .filter(role_requests::requester_role_id.eq(role_group_id))
                .filter(role_requests::requested_group_id.eq_any(group_ids))
                .filter(role_requests::request_ownership.eq(request_ownership))
                .filter(role_requests::status.eq(pending))
                .filter(role_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading role requests")
        }}
    }

    pub async fn find_stale(ttl_days: i64, conn: &DbConn) -> Vec<Self> {
        let now = Utc::now().naive_utc();
        let cutoff = now - TimeDelta::days(ttl_days);
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            role_requests::table
                .filter(role_requests::status.eq(pending))
                .filter(role_requests::resolved_at.is_null())
                .filter(role_requests::request_ending_at.lt(now).or(role_requests::created_at.lt(cutoff)))
                .load::<Self>(conn)
                .expect("Error loading role requests")
        }}
    }
}

/// Local methods
impl GroupRequest {
    pub fn new(
        requester_user_id: UserId,
        requested_group_name: String,
        requested_group_description: String,
        requested_group_kind: String,
        requested_app_id: Option<AppId>,
        requested_group_tags: Vec<String>,
        requested_ownership_ending_at: Option<NaiveDateTime>,
        request_reason: String,
    ) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            id: GroupRequestId(get_entity_id()),
            requester_user_id,
            requested_group_name,
            requested_group_description,
            requested_group_kind,
            requested_app_id,
            requested_group_tags: serde_json::to_string(&requested_group_tags).unwrap_or_else(|_| String::from("[]")),
            requested_ownership_ending_at,
            request_reason,
            status: RequestStatus::Pending as i32,
            resolved_at: None,
            resolver_user_id: None,
            resolution_reason: String::new(),
            approved_group_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_i32(self.status)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending && self.resolved_at.is_none()
    }

    pub fn tag_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.requested_group_tags).unwrap_or_default()
    }
}

/// Database methods
impl GroupRequest {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(group_requests::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving group request")
            }
            postgresql {
                diesel::insert_into(group_requests::table)
                    .values(&*self)
                    .on_conflict(group_requests::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving group request")
            }
        }
    }

    pub async fn find_by_id(id: &GroupRequestId, conn: &DbConn) -> Option<Self> {
        let id = id.clone();
        db_run! { conn: {
            group_requests::table
                .filter(group_requests::id.eq(id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Duplicate probe: a pending request for the same name (ci) and app
    pub async fn find_pending_by_name_and_app(name: &str, app_id: Option<&AppId>, conn: &DbConn) -> Option<Self> {
        let name = name.to_lowercase();
        let app_id = app_id.cloned();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            let mut query = group_requests::table
                .filter(lower(group_requests::requested_group_name).eq(name))
                .filter(group_requests::status.eq(pending))
                .filter(group_requests::resolved_at.is_null())
                .into_boxed();
            query = match app_id {
                Some(app_id) => query.filter(group_requests::requested_app_id.eq(app_id)),
                None => query.filter(group_requests::requested_app_id.is_null()),
            };
            query.first::<Self>(conn).ok()
        }}
    }

    pub async fn find_pending_by_user(user_id: &UserId, conn: &DbConn) -> Vec<Self> {
        let user_id = user_id.clone();
        let pending = RequestStatus::Pending as i32;
        db_run! { conn: {
            group_requests::table
                .filter(group_requests::requester_user_id.eq(user_id))
                .filter(group_requests::status.eq(pending))
                .filter(group_requests::resolved_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading group requests")
        }}
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequestId(String);

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequestId(String);

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRequestId(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_tolerates_garbage() {
        assert_eq!(RequestStatus::from_i32(0), RequestStatus::Pending);
        assert_eq!(RequestStatus::from_i32(1), RequestStatus::Approved);
        assert_eq!(RequestStatus::from_i32(2), RequestStatus::Rejected);
        assert_eq!(RequestStatus::from_i32(99), RequestStatus::Pending);
    }

    #[test]
    fn new_requests_start_pending() {
        let r = AccessRequest::new(
            UserId::from(String::from("u1")),
            GroupId::from(String::from("g1")),
            false,
            String::from("need it"),
            None,
        );
        assert!(r.is_pending());
        assert_eq!(r.id.as_ref().len(), 20);
    }
}
