use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde_json::Value;

use crate::{
    db::{schema::users, DbConn},
    error::{ApiResult, EmptyResult, MapResult},
};

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub employee_number: Option<String>,
    pub manager_id: Option<UserId>,
    pub profile: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Local methods
impl User {
    pub fn new(id: UserId, email: String) -> Self {
        let now = Utc::now().naive_utc();
        let email = email.to_lowercase();

        Self {
            id,
            email,
            first_name: String::new(),
            last_name: String::new(),
            display_name: String::new(),
            employee_number: None,
            manager_id: None,
            profile: String::from("{}"),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn profile_json(&self) -> Value {
        serde_json::from_str(&self.profile).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

/// Database methods
impl User {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(users::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving user")
            }
            postgresql {
                diesel::insert_into(users::table)
                    .values(&*self)
                    .on_conflict(users::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving user")
            }
        }
    }

    pub async fn find_by_id(user_id: &UserId, conn: &DbConn) -> Option<Self> {
        let user_id = user_id.clone();
        db_run! { conn: {
            users::table
                .filter(users::id.eq(user_id))
                .filter(users::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Lookup ignoring the deletion marker, for audit trails
    pub async fn find_by_id_including_deleted(user_id: &UserId, conn: &DbConn) -> Option<Self> {
        let user_id = user_id.clone();
        db_run! { conn: {
            users::table
                .filter(users::id.eq(user_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_ids(user_ids: &[UserId], conn: &DbConn) -> Vec<Self> {
        let user_ids = user_ids.to_vec();
        db_run! { conn: {
            users::table
                .filter(users::id.eq_any(user_ids))
                .filter(users::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading users")
        }}
    }

    pub async fn find_by_email(email: &str, conn: &DbConn) -> Option<Self> {
        let email = email.to_lowercase();
        db_run! { conn: {
            users::table
                .filter(users::email.eq(email))
                .filter(users::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_all_active(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            users::table
                .filter(users::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading users")
        }}
    }

    /// Resolves an actor id to its id only when the user is still active,
    /// the rule every operation applies before recording an actor.
    pub async fn resolve_actor(user_id: Option<&UserId>, conn: &DbConn) -> Option<UserId> {
        match user_id {
            Some(id) => Self::find_by_id(id, conn).await.map(|u| u.id),
            None => None,
        }
    }

    pub async fn soft_delete(&mut self, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        self.deleted_at = Some(now);
        self.updated_at = now;

        let user_id = self.id.clone();
        db_run! { conn: {
            diesel::update(users::table.filter(users::id.eq(user_id)))
                .set((users::deleted_at.eq(Some(now)), users::updated_at.eq(now)))
                .execute(conn)
                .map_res("Error deleting user")
        }}
    }

    pub async fn count_active(conn: &DbConn) -> ApiResult<i64> {
        db_run! { conn: {
            users::table
                .filter(users::deleted_at.is_null())
                .count()
                .first::<i64>(conn)
                .map_res("Error counting users")
        }}
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

use serde::{Deserialize, Serialize};
