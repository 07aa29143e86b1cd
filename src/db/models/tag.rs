use chrono::{NaiveDateTime, TimeDelta, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

use super::{lower, AppId, GroupId};
use crate::{
    db::{
        schema::{app_tag_maps, group_tag_maps, tags},
        DbConn,
    },
    error::{EmptyResult, MapResult},
    util::{format_date, get_uuid},
};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = tags)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub constraints: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Edge attaching a tag to a group. When the tag arrived through an app-level
/// tag, `app_tag_map_id` points at the app edge that produced it.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = group_tag_maps)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct GroupTagMap {
    pub id: GroupTagMapId,
    pub group_id: GroupId,
    pub tag_id: TagId,
    pub app_tag_map_id: Option<AppTagMapId>,
    pub created_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

/// Edge attaching a tag to an app. App tags fan out to every group of the
/// app as linked `GroupTagMap` rows.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = app_tag_maps)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct AppTagMap {
    pub id: AppTagMapId,
    pub app_id: AppId,
    pub tag_id: TagId,
    pub created_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
}

/// Local methods
impl Tag {
    // Recognized constraint keys. Durations are seconds, the rest booleans.
    pub const MEMBER_TIME_LIMIT_CONSTRAINT_KEY: &'static str = "member_time_limit";
    pub const OWNER_TIME_LIMIT_CONSTRAINT_KEY: &'static str = "owner_time_limit";
    pub const DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY: &'static str = "disallow_self_add_membership";
    pub const DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY: &'static str = "disallow_self_add_ownership";
    pub const REQUIRE_REASON_CONSTRAINT_KEY: &'static str = "require_reason";
    pub const OWNER_CANNOT_ADD_SELF_CONSTRAINT_KEY: &'static str = "owner_cannot_add_self";

    pub const CONSTRAINT_KEYS: &'static [&'static str] = &[
        Self::MEMBER_TIME_LIMIT_CONSTRAINT_KEY,
        Self::OWNER_TIME_LIMIT_CONSTRAINT_KEY,
        Self::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY,
        Self::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY,
        Self::REQUIRE_REASON_CONSTRAINT_KEY,
        Self::OWNER_CANNOT_ADD_SELF_CONSTRAINT_KEY,
    ];

    pub fn new(name: String, description: String, constraints: serde_json::Map<String, Value>) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            id: TagId(crate::util::get_entity_id()),
            name,
            description,
            enabled: true,
            constraints: Value::Object(constraints).to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn constraint_map(&self) -> serde_json::Map<String, Value> {
        match serde_json::from_str(&self.constraints) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    pub fn constraint(&self, key: &str) -> Option<Value> {
        self.constraint_map().get(key).cloned()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "enabled": self.enabled,
            "constraints": serde_json::from_str::<Value>(&self.constraints).unwrap_or_default(),
            "createdAt": format_date(&self.created_at),
        })
    }
}

//
// Constraint coalescing. Pure functions over the tag set currently attached
// to a group (or, for roles, the union over the role's associated groups).
//

/// Boolean constraints coalesce with OR: one tag is enough to switch the
/// behavior on.
pub fn coalesce_bool_constraint(key: &str, tags: &[Tag]) -> bool {
    tags.iter().any(|t| matches!(t.constraint(key), Some(Value::Bool(true))))
}

/// Duration constraints coalesce to the smallest positive limit present.
pub fn coalesce_seconds_constraint(key: &str, tags: &[Tag]) -> Option<i64> {
    tags.iter()
        .filter_map(|t| t.constraint(key).and_then(|v| v.as_i64()))
        .filter(|secs| *secs > 0)
        .min()
}

/// Clamps a requested end timestamp to `now + limit` for the coalesced time
/// limit under `key`. Managed groups are clamped; for unmanaged groups the
/// limit is advisory and the requested end passes through unchanged.
pub fn coalesce_ended_at(
    key: &str,
    tags: &[Tag],
    initial_ended_at: Option<NaiveDateTime>,
    group_is_managed: bool,
) -> Option<NaiveDateTime> {
    if !group_is_managed {
        return initial_ended_at;
    }

    match coalesce_seconds_constraint(key, tags) {
        Some(seconds) => {
            let limit = Utc::now().naive_utc() + TimeDelta::seconds(seconds);
            match initial_ended_at {
                Some(requested) if requested < limit => Some(requested),
                _ => Some(limit),
            }
        }
        None => initial_ended_at,
    }
}

/// Database methods
impl Tag {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(tags::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving tag")
            }
            postgresql {
                diesel::insert_into(tags::table)
                    .values(&*self)
                    .on_conflict(tags::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving tag")
            }
        }
    }

    pub async fn find_by_id(tag_id: &TagId, conn: &DbConn) -> Option<Self> {
        let tag_id = tag_id.clone();
        db_run! { conn: {
            tags::table
                .filter(tags::id.eq(tag_id))
                .filter(tags::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_ids(tag_ids: &[TagId], conn: &DbConn) -> Vec<Self> {
        let tag_ids = tag_ids.to_vec();
        db_run! { conn: {
            tags::table
                .filter(tags::id.eq_any(tag_ids))
                .filter(tags::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading tags")
        }}
    }

    /// Case-insensitive name lookup among non-deleted tags
    pub async fn find_by_name(name: &str, conn: &DbConn) -> Option<Self> {
        let name = name.to_lowercase();
        db_run! { conn: {
            tags::table
                .filter(lower(tags::name).eq(name))
                .filter(tags::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn soft_delete(&mut self, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        self.deleted_at = Some(now);
        self.updated_at = now;

        let tag_id = self.id.clone();
        db_run! { conn: {
            diesel::update(tags::table.filter(tags::id.eq(tag_id)))
                .set((tags::deleted_at.eq(Some(now)), tags::updated_at.eq(now)))
                .execute(conn)
                .map_res("Error deleting tag")
        }}
    }
}

impl GroupTagMap {
    pub fn new(group_id: GroupId, tag_id: TagId, app_tag_map_id: Option<AppTagMapId>) -> Self {
        Self {
            id: GroupTagMapId(get_uuid()),
            group_id,
            tag_id,
            app_tag_map_id,
            created_at: Utc::now().naive_utc(),
            ended_at: None,
        }
    }

    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(group_tag_maps::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving group tag map")
            }
            postgresql {
                diesel::insert_into(group_tag_maps::table)
                    .values(self)
                    .on_conflict(group_tag_maps::id)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving group tag map")
            }
        }
    }

    pub async fn find_active_by_group(group_id: &GroupId, conn: &DbConn) -> Vec<Self> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            group_tag_maps::table
                .filter(group_tag_maps::group_id.eq(group_id))
                .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading group tag maps")
        }}
    }

    pub async fn find_active_by_tag(tag_id: &TagId, conn: &DbConn) -> Vec<Self> {
        let tag_id = tag_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            group_tag_maps::table
                .filter(group_tag_maps::tag_id.eq(tag_id))
                .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading group tag maps")
        }}
    }

    pub async fn end_all_for_group(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::group_id.eq(group_id))
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group tag maps")
        }}
    }

    pub async fn end_by_ids(ids: &[GroupTagMapId], conn: &DbConn) -> EmptyResult {
        let ids = ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::id.eq_any(ids))
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group tag maps")
        }}
    }

    pub async fn end_all_by_app_tag_maps(app_tag_map_ids: &[AppTagMapId], conn: &DbConn) -> EmptyResult {
        let app_tag_map_ids = app_tag_map_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::app_tag_map_id.eq_any(app_tag_map_ids.into_iter().map(Some).collect::<Vec<_>>()))
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group tag maps")
        }}
    }

    pub async fn end_all_for_tag(tag_id: &TagId, conn: &DbConn) -> EmptyResult {
        let tag_id = tag_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::tag_id.eq(tag_id))
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group tag maps")
        }}
    }

    /// Ends a group's active directly-attached maps for the given tags.
    /// App-propagated maps stay; they are governed at the app level.
    pub async fn end_direct_for_group_and_tags(group_id: &GroupId, tag_ids: &[TagId], conn: &DbConn) -> EmptyResult {
        if tag_ids.is_empty() {
            return Ok(());
        }
        let group_id = group_id.clone();
        let tag_ids = tag_ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::group_id.eq(group_id))
                    .filter(group_tag_maps::tag_id.eq_any(tag_ids))
                    .filter(group_tag_maps::app_tag_map_id.is_null())
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending group tag maps")
        }}
    }

    /// Clears the app linkage on a group's active app-propagated tags, used
    /// when the group stops being an app group but keeps the tags.
    pub async fn detach_from_app_maps(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                group_tag_maps::table
                    .filter(group_tag_maps::group_id.eq(group_id))
                    .filter(group_tag_maps::app_tag_map_id.is_not_null())
                    .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now))),
            )
            .set(group_tag_maps::app_tag_map_id.eq(None::<AppTagMapId>))
            .execute(conn)
            .map_res("Error detaching group tag maps")
        }}
    }
}

impl AppTagMap {
    pub fn new(app_id: AppId, tag_id: TagId) -> Self {
        Self {
            id: AppTagMapId(get_uuid()),
            app_id,
            tag_id,
            created_at: Utc::now().naive_utc(),
            ended_at: None,
        }
    }

    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(app_tag_maps::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving app tag map")
            }
            postgresql {
                diesel::insert_into(app_tag_maps::table)
                    .values(self)
                    .on_conflict(app_tag_maps::id)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving app tag map")
            }
        }
    }

    pub async fn find_active_by_app(app_id: &AppId, conn: &DbConn) -> Vec<Self> {
        let app_id = app_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            app_tag_maps::table
                .filter(app_tag_maps::app_id.eq(app_id))
                .filter(app_tag_maps::ended_at.is_null().or(app_tag_maps::ended_at.gt(now)))
                .load::<Self>(conn)
                .expect("Error loading app tag maps")
        }}
    }

    pub async fn end_all_for_app(app_id: &AppId, conn: &DbConn) -> EmptyResult {
        let app_id = app_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                app_tag_maps::table
                    .filter(app_tag_maps::app_id.eq(app_id))
                    .filter(app_tag_maps::ended_at.is_null().or(app_tag_maps::ended_at.gt(now))),
            )
            .set(app_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending app tag maps")
        }}
    }

    pub async fn end_all_for_tag(tag_id: &TagId, conn: &DbConn) -> EmptyResult {
        let tag_id = tag_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                app_tag_maps::table
                    .filter(app_tag_maps::tag_id.eq(tag_id))
                    .filter(app_tag_maps::ended_at.is_null().or(app_tag_maps::ended_at.gt(now))),
            )
            .set(app_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending app tag maps")
        }}
    }

    pub async fn end_by_ids(ids: &[AppTagMapId], conn: &DbConn) -> EmptyResult {
        let ids = ids.to_vec();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(
                app_tag_maps::table
                    .filter(app_tag_maps::id.eq_any(ids))
                    .filter(app_tag_maps::ended_at.is_null().or(app_tag_maps::ended_at.gt(now))),
            )
            .set(app_tag_maps::ended_at.eq(Some(now)))
            .execute(conn)
            .map_res("Error ending app tag maps")
        }}
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagId(String);

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTagMapId(String);

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTagMapId(String);

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_with(constraints: Value) -> Tag {
        let Value::Object(map) = constraints else { panic!("constraints must be an object") };
        Tag::new(String::from("test"), String::new(), map)
    }

    #[test]
    fn bool_constraints_coalesce_with_or() {
        let a = tag_with(json!({ Tag::REQUIRE_REASON_CONSTRAINT_KEY: false }));
        let b = tag_with(json!({ Tag::REQUIRE_REASON_CONSTRAINT_KEY: true }));
        let c = tag_with(json!({}));

        assert!(coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &[a, b]));

        let a = tag_with(json!({ Tag::REQUIRE_REASON_CONSTRAINT_KEY: false }));
        assert!(!coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &[a, c]));
        assert!(!coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &[]));
    }

    #[test]
    fn seconds_constraints_coalesce_to_the_minimum_positive() {
        let a = tag_with(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 7200 }));
        let b = tag_with(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 }));
        let c = tag_with(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: -1 }));

        assert_eq!(coalesce_seconds_constraint(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, &[a, b, c]), Some(3600));
        assert_eq!(coalesce_seconds_constraint(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, &[]), None);
    }

    #[test]
    fn ended_at_is_clamped_for_managed_groups_only() {
        let limit_tag = tag_with(json!({ Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY: 3600 }));
        let far = Utc::now().naive_utc() + TimeDelta::seconds(7200);

        // Managed: clamped down to roughly now + 1h
        let clamped = coalesce_ended_at(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, std::slice::from_ref(&limit_tag), Some(far), true)
            .expect("limit should apply");
        assert!(clamped < far);

        // A requested end below the limit passes through
        let near = Utc::now().naive_utc() + TimeDelta::seconds(60);
        let kept = coalesce_ended_at(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, std::slice::from_ref(&limit_tag), Some(near), true);
        assert_eq!(kept, Some(near));

        // No requested end still picks up the limit
        assert!(coalesce_ended_at(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, std::slice::from_ref(&limit_tag), None, true).is_some());

        // Unmanaged: advisory only
        assert_eq!(
            coalesce_ended_at(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, &[limit_tag], Some(far), false),
            Some(far)
        );

        // No tags, no clamp
        assert_eq!(coalesce_ended_at(Tag::MEMBER_TIME_LIMIT_CONSTRAINT_KEY, &[], None, true), None);
    }
}
