use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

use super::{lower, User, UserId};
use crate::{
    db::{
        schema::{app_groups, apps, groups, user_group_memberships},
        DbConn,
    },
    error::{EmptyResult, MapResult},
    util::format_date,
};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = apps)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub description: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Local methods
impl App {
    /// The app governing this service itself. Members of its owner group are
    /// the access admins; the app and its owner group cannot be deleted.
    pub const ACCESS_APP_RESERVED_NAME: &'static str = "Access";

    pub fn new(name: String, description: String) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            id: AppId(crate::util::get_entity_id()),
            name,
            description,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.name == Self::ACCESS_APP_RESERVED_NAME
    }

    pub fn owners_group_description(app_name: &str) -> String {
        format!("Owners of the {app_name} app")
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "createdAt": format_date(&self.created_at),
            "deletedAt": self.deleted_at.as_ref().map(format_date),
        })
    }
}

/// Database methods
impl App {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(apps::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving app")
            }
            postgresql {
                diesel::insert_into(apps::table)
                    .values(&*self)
                    .on_conflict(apps::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving app")
            }
        }
        .map(|_| ())
    }

    pub async fn find_by_id(app_id: &AppId, conn: &DbConn) -> Option<Self> {
        let app_id = app_id.clone();
        db_run! { conn: {
            apps::table
                .filter(apps::id.eq(app_id))
                .filter(apps::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Case-insensitive name lookup among non-deleted apps
    pub async fn find_by_name(name: &str, conn: &DbConn) -> Option<Self> {
        let name = name.to_lowercase();
        db_run! { conn: {
            apps::table
                .filter(lower(apps::name).eq(name))
                .filter(apps::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn soft_delete(&mut self, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        self.deleted_at = Some(now);
        self.updated_at = now;

        let app_id = self.id.clone();
        db_run! { conn: {
            diesel::update(apps::table.filter(apps::id.eq(app_id)))
                .set((apps::deleted_at.eq(Some(now)), apps::updated_at.eq(now)))
                .execute(conn)
                .map_res("Error deleting app")
        }}
        .map(|_| ())
    }

    /// Active owners of the app's owner groups, the second approver tier
    pub async fn manager_ids(app_id: &AppId, conn: &DbConn) -> Vec<UserId> {
        let app_id = app_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .inner_join(app_groups::table.on(app_groups::id.eq(user_group_memberships::group_id)))
                .inner_join(groups::table.on(groups::id.eq(user_group_memberships::group_id)))
                .filter(app_groups::app_id.eq(app_id))
                .filter(app_groups::is_owner.eq(true))
                .filter(groups::deleted_at.is_null())
                .filter(user_group_memberships::is_owner.eq(true))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .select(user_group_memberships::user_id)
                .distinct()
                .load::<UserId>(conn)
                .expect("Error loading app managers")
        }}
    }

    pub async fn managers(app_id: &AppId, conn: &DbConn) -> Vec<User> {
        let ids = Self::manager_ids(app_id, conn).await;
        User::find_by_ids(&ids, conn).await
    }

    /// Members of the reserved app's owner group, the access admins.
    /// They bypass the policy gates and are the final approver tier.
    pub async fn access_admin_ids(conn: &DbConn) -> Vec<UserId> {
        let reserved = Self::ACCESS_APP_RESERVED_NAME.to_lowercase();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            user_group_memberships::table
                .inner_join(app_groups::table.on(app_groups::id.eq(user_group_memberships::group_id)))
                .inner_join(apps::table.on(apps::id.eq(app_groups::app_id)))
                .inner_join(groups::table.on(groups::id.eq(user_group_memberships::group_id)))
                .filter(lower(apps::name).eq(reserved))
                .filter(apps::deleted_at.is_null())
                .filter(app_groups::is_owner.eq(true))
                .filter(groups::deleted_at.is_null())
                .filter(user_group_memberships::is_owner.eq(false))
                .filter(user_group_memberships::ended_at.is_null().or(user_group_memberships::ended_at.gt(now)))
                .select(user_group_memberships::user_id)
                .distinct()
                .load::<UserId>(conn)
                .expect("Error loading access admins")
        }}
    }

    pub async fn access_admins(conn: &DbConn) -> Vec<User> {
        let ids = Self::access_admin_ids(conn).await;
        User::find_by_ids(&ids, conn).await
    }

    pub async fn is_access_admin(user_id: &UserId, conn: &DbConn) -> bool {
        Self::access_admin_ids(conn).await.contains(user_id)
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
