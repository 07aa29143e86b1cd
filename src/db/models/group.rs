use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use diesel::prelude::*;
use diesel_derive_newtype::DieselNewType;

use super::{lower, AppId, Tag};
use crate::{
    db::{
        schema::{app_groups, group_tag_maps, groups, role_groups, tags},
        DbConn,
    },
    error::{EmptyResult, MapResult},
    util::format_date,
};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = groups)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(id))]
pub struct Group {
    pub id: GroupId,
    pub kind: String,
    pub name: String,
    pub description: String,
    pub is_managed: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

/// Extension row tying an app group to its [`super::App`]. Exactly one row
/// per app carries `is_owner = true` while the app is active.
#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = app_groups)]
#[diesel(primary_key(id))]
pub struct AppGroup {
    pub id: GroupId,
    pub app_id: AppId,
    pub is_owner: bool,
}

/// Extension row marking a group as a role. Carries no attributes of its
/// own; roles are distinguished by the discriminator plus this row.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = role_groups)]
#[diesel(primary_key(id))]
pub struct RoleGroup {
    pub id: GroupId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    Plain,
    Role,
    App,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "group",
            Self::Role => "role_group",
            Self::App => "app_group",
        }
    }

    pub fn from_str(kind: &str) -> Self {
        match kind {
            "role_group" => Self::Role,
            "app_group" => Self::App,
            _ => Self::Plain,
        }
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local methods
impl Group {
    // Reserved name prefix of role groups
    pub const ROLE_GROUP_NAME_PREFIX: &'static str = "Role-";
    // Name prefix and separator of app groups: App-<app name>-<group>
    pub const APP_GROUP_NAME_PREFIX: &'static str = "App-";
    pub const APP_NAME_GROUP_NAME_SEPARATOR: &'static str = "-";
    // Name suffix of the owner group every app has
    pub const APP_OWNERS_GROUP_NAME_SUFFIX: &'static str = "Owners";

    pub fn new(kind: GroupKind, name: String, description: String) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            // The definitive id is the identity provider's group id,
            // assigned when the group is created or adopted there.
            id: GroupId(String::new()),
            kind: kind.as_str().to_string(),
            name,
            description,
            is_managed: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn kind(&self) -> GroupKind {
        GroupKind::from_str(&self.kind)
    }

    pub fn is_role(&self) -> bool {
        self.kind() == GroupKind::Role
    }

    pub fn is_app_group(&self) -> bool {
        self.kind() == GroupKind::App
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn app_group_name_prefix(app_name: &str) -> String {
        format!("{}{}{}", Self::APP_GROUP_NAME_PREFIX, app_name, Self::APP_NAME_GROUP_NAME_SEPARATOR)
    }

    pub fn app_owners_group_name(app_name: &str) -> String {
        format!("{}{}", Self::app_group_name_prefix(app_name), Self::APP_OWNERS_GROUP_NAME_SUFFIX)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "kind": self.kind,
            "name": self.name,
            "description": self.description,
            "isManaged": self.is_managed,
            "createdAt": format_date(&self.created_at),
            "deletedAt": self.deleted_at.as_ref().map(format_date),
        })
    }
}

/// Database methods
impl Group {
    pub async fn save(&mut self, conn: &DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(groups::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving group")
            }
            postgresql {
                diesel::insert_into(groups::table)
                    .values(&*self)
                    .on_conflict(groups::id)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving group")
            }
        }
        .map(|_| ())
    }

    pub async fn find_by_id(group_id: &GroupId, conn: &DbConn) -> Option<Self> {
        let group_id = group_id.clone();
        db_run! { conn: {
            groups::table
                .filter(groups::id.eq(group_id))
                .filter(groups::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Lookup ignoring the deletion marker, for audit trails and cascades
    pub async fn find_by_id_including_deleted(group_id: &GroupId, conn: &DbConn) -> Option<Self> {
        let group_id = group_id.clone();
        db_run! { conn: {
            groups::table
                .filter(groups::id.eq(group_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_ids(group_ids: &[GroupId], conn: &DbConn) -> Vec<Self> {
        let group_ids = group_ids.to_vec();
        db_run! { conn: {
            groups::table
                .filter(groups::id.eq_any(group_ids))
                .filter(groups::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading groups")
        }}
    }

    /// Managed, non-role groups out of the given set. The only groups a role
    /// may be attached to.
    pub async fn find_attachable_by_ids(group_ids: &[GroupId], conn: &DbConn) -> Vec<Self> {
        let group_ids = group_ids.to_vec();
        let role_kind = GroupKind::Role.as_str();
        db_run! { conn: {
            groups::table
                .filter(groups::id.eq_any(group_ids))
                .filter(groups::deleted_at.is_null())
                .filter(groups::is_managed.eq(true))
                .filter(groups::kind.ne(role_kind))
                .load::<Self>(conn)
                .expect("Error loading groups")
        }}
    }

    /// Case-insensitive name lookup among non-deleted groups
    pub async fn find_by_name(name: &str, conn: &DbConn) -> Option<Self> {
        let name = name.to_lowercase();
        db_run! { conn: {
            groups::table
                .filter(lower(groups::name).eq(name))
                .filter(groups::deleted_at.is_null())
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Case-insensitive prefix scan, used to adopt groups carrying an app's
    /// name prefix when the app is created.
    pub async fn find_by_name_prefix(prefix: &str, conn: &DbConn) -> Vec<Self> {
        // Group names never contain SQL wildcards, the validation pattern
        // rejects them before anything is stored
        let pattern = format!("{}%", prefix.to_lowercase());
        db_run! { conn: {
            groups::table
                .filter(lower(groups::name).like(pattern))
                .filter(groups::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading groups")
        }}
    }

    pub async fn find_all_active(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            groups::table
                .filter(groups::deleted_at.is_null())
                .load::<Self>(conn)
                .expect("Error loading groups")
        }}
    }

    pub async fn find_all_active_unmanaged(conn: &DbConn) -> Vec<Self> {
        db_run! { conn: {
            groups::table
                .filter(groups::deleted_at.is_null())
                .filter(groups::is_managed.eq(false))
                .load::<Self>(conn)
                .expect("Error loading groups")
        }}
    }

    pub async fn set_kind(&mut self, kind: GroupKind, conn: &DbConn) -> EmptyResult {
        self.kind = kind.as_str().to_string();
        self.save(conn).await
    }

    pub async fn set_managed(group_id: &GroupId, is_managed: bool, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::update(groups::table.filter(groups::id.eq(group_id)))
                .set((groups::is_managed.eq(is_managed), groups::updated_at.eq(now)))
                .execute(conn)
                .map_res("Error updating group")
        }}
        .map(|_| ())
    }

    pub async fn soft_delete(&mut self, conn: &DbConn) -> EmptyResult {
        let now = Utc::now().naive_utc();
        self.deleted_at = Some(now);
        self.updated_at = now;

        let group_id = self.id.clone();
        db_run! { conn: {
            diesel::update(groups::table.filter(groups::id.eq(group_id)))
                .set((groups::deleted_at.eq(Some(now)), groups::updated_at.eq(now)))
                .execute(conn)
                .map_res("Error deleting group")
        }}
        .map(|_| ())
    }

    /// The enabled tags currently attached to this group through an active
    /// tag map. This is the input set of every constraint coalescing.
    pub async fn active_tags(group_id: &GroupId, conn: &DbConn) -> Vec<Tag> {
        let group_id = group_id.clone();
        let now = Utc::now().naive_utc();
        db_run! { conn: {
            group_tag_maps::table
                .inner_join(tags::table)
                .filter(group_tag_maps::group_id.eq(group_id))
                .filter(group_tag_maps::ended_at.is_null().or(group_tag_maps::ended_at.gt(now)))
                .filter(tags::deleted_at.is_null())
                .filter(tags::enabled.eq(true))
                .select(tags::all_columns)
                .load::<Tag>(conn)
                .expect("Error loading group tags")
        }}
    }
}

impl AppGroup {
    pub fn new(id: GroupId, app_id: AppId, is_owner: bool) -> Self {
        Self {
            id,
            app_id,
            is_owner,
        }
    }

    pub async fn save(&self, conn: &DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(app_groups::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving app group")
            }
            postgresql {
                diesel::insert_into(app_groups::table)
                    .values(self)
                    .on_conflict(app_groups::id)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving app group")
            }
        }
        .map(|_| ())
    }

    pub async fn find_by_group(group_id: &GroupId, conn: &DbConn) -> Option<Self> {
        let group_id = group_id.clone();
        db_run! { conn: {
            app_groups::table
                .filter(app_groups::id.eq(group_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// All non-deleted groups of an app, extension rows only
    pub async fn find_active_by_app(app_id: &AppId, conn: &DbConn) -> Vec<Self> {
        let app_id = app_id.clone();
        db_run! { conn: {
            app_groups::table
                .inner_join(groups::table)
                .filter(app_groups::app_id.eq(app_id))
                .filter(groups::deleted_at.is_null())
                .select(app_groups::all_columns)
                .load::<Self>(conn)
                .expect("Error loading app groups")
        }}
    }

    /// The owner group rows of an app (one while the invariant holds)
    pub async fn find_owner_groups_by_app(app_id: &AppId, conn: &DbConn) -> Vec<Self> {
        let app_id = app_id.clone();
        db_run! { conn: {
            app_groups::table
                .inner_join(groups::table)
                .filter(app_groups::app_id.eq(app_id))
                .filter(app_groups::is_owner.eq(true))
                .filter(groups::deleted_at.is_null())
                .select(app_groups::all_columns)
                .load::<Self>(conn)
                .expect("Error loading app owner groups")
        }}
    }

    /// Drops the extension row, used when a group changes kind.
    /// The group row itself is never deleted.
    pub async fn delete_row(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        db_run! { conn: {
            diesel::delete(app_groups::table.filter(app_groups::id.eq(group_id)))
                .execute(conn)
                .map_res("Error deleting app group row")
        }}
        .map(|_| ())
    }
}

impl RoleGroup {
    pub async fn insert(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let row = RoleGroup {
            id: group_id.clone(),
        };
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(role_groups::table)
                    .values(&row)
                    .execute(conn)
                    .map_res("Error saving role group row")
            }
            postgresql {
                diesel::insert_into(role_groups::table)
                    .values(&row)
                    .on_conflict(role_groups::id)
                    .do_nothing()
                    .execute(conn)
                    .map_res("Error saving role group row")
            }
        }
        .map(|_| ())
    }

    pub async fn delete_row(group_id: &GroupId, conn: &DbConn) -> EmptyResult {
        let group_id = group_id.clone();
        db_run! { conn: {
            diesel::delete(role_groups::table.filter(role_groups::id.eq(group_id)))
                .execute(conn)
                .map_res("Error deleting role group row")
        }}
        .map(|_| ())
    }
}

#[derive(AsRef, Clone, Debug, Deref, DieselNewType, Display, From, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_the_discriminator() {
        for kind in [GroupKind::Plain, GroupKind::Role, GroupKind::App] {
            assert_eq!(GroupKind::from_str(kind.as_str()), kind);
        }
        assert_eq!(GroupKind::from_str("anything-else"), GroupKind::Plain);
    }

    #[test]
    fn app_group_names_carry_the_app_prefix() {
        assert_eq!(Group::app_group_name_prefix("Chat"), "App-Chat-");
        assert_eq!(Group::app_owners_group_name("Chat"), "App-Chat-Owners");
    }
}
