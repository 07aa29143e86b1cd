//
// Shared plumbing for the engine tests: a throwaway sqlite database per
// test, seed helpers that write rows directly, and a recording identity
// provider client installed through the same registry the runtime uses.
//
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;

use crate::{
    db::{
        models::{Group, GroupId, GroupKind, GroupTagMap, Membership, RoleGroup, Tag, User, UserId},
        DbConn, DbPool,
    },
    error::ApiResult,
    idp::{self, IdpClient, IdpGroup, IdpUser},
    util::get_entity_id,
};

/// The installed identity provider client is process-global, so tests that
/// exercise it take this lock for their whole body.
static IDP_TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn pool() -> DbPool {
    let db_file = std::env::temp_dir().join(format!("accessward-test-{}.sqlite3", crate::util::get_uuid()));
    DbPool::from_url(db_file.to_str().expect("temp path is valid utf-8")).expect("test database")
}

/// A fresh database plus a fresh recording client, serialized across tests
pub fn setup() -> (MutexGuard<'static, ()>, DbPool, Arc<RecordingIdp>) {
    let guard = IDP_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let recorder = Arc::new(RecordingIdp::default());
    idp::install(Arc::clone(&recorder) as Arc<dyn IdpClient>);
    (guard, pool(), recorder)
}

pub async fn seed_user(conn: &DbConn, id: &str) -> User {
    let mut user = User::new(UserId::from(id.to_string()), format!("{id}@example.com"));
    user.display_name = id.to_string();
    user.save(conn).await.expect("seed user");
    user
}

pub async fn seed_group(conn: &DbConn, name: &str, kind: GroupKind, is_managed: bool) -> Group {
    let mut group = Group::new(kind, name.to_string(), format!("{name} (test)"));
    group.id = GroupId::from(get_entity_id());
    group.is_managed = is_managed;
    group.save(conn).await.expect("seed group");
    if kind == GroupKind::Role {
        RoleGroup::insert(&group.id, conn).await.expect("seed role row");
    }
    group
}

pub async fn seed_tag(conn: &DbConn, name: &str, constraints: Value) -> Tag {
    let Value::Object(map) = constraints else { panic!("constraints must be an object") };
    let mut tag = Tag::new(name.to_string(), String::new(), map);
    tag.save(conn).await.expect("seed tag");
    tag
}

pub async fn attach_tag(conn: &DbConn, group: &Group, tag: &Tag) {
    GroupTagMap::new(group.id.clone(), tag.id.clone(), None).save(conn).await.expect("seed tag map");
}

/// A direct grant written straight into the store, for fixtures that need a
/// starting state without running the primitive under test
pub async fn seed_grant(conn: &DbConn, user: &User, group: &Group, is_owner: bool) -> Membership {
    seed_bounded_grant(conn, user, group, is_owner, None).await
}

pub async fn seed_bounded_grant(
    conn: &DbConn,
    user: &User,
    group: &Group,
    is_owner: bool,
    ended_at: Option<NaiveDateTime>,
) -> Membership {
    let mut grant = Membership::new(user.id.clone(), group.id.clone(), is_owner);
    grant.ended_at = ended_at;
    grant.save(conn).await.expect("seed grant");
    grant
}

/// Identity provider stub that records every write it receives
#[derive(Default)]
pub struct RecordingIdp {
    calls: Mutex<Vec<String>>,
}

impl RecordingIdp {
    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl IdpClient for RecordingIdp {
    async fn list_users(&self) -> ApiResult<Vec<IdpUser>> {
        Ok(Vec::new())
    }

    async fn get_user_schema(&self, _user_type: &str) -> ApiResult<Value> {
        Ok(Value::Null)
    }

    async fn list_groups(&self) -> ApiResult<Vec<IdpGroup>> {
        Ok(Vec::new())
    }

    async fn list_users_for_group(&self, _group_id: &GroupId) -> ApiResult<Vec<UserId>> {
        Ok(Vec::new())
    }

    async fn list_owners_for_group(&self, _group_id: &GroupId) -> ApiResult<Vec<UserId>> {
        Ok(Vec::new())
    }

    async fn list_groups_with_active_rules(&self) -> ApiResult<Vec<GroupId>> {
        Ok(Vec::new())
    }

    async fn create_group(&self, name: &str, description: &str) -> ApiResult<Option<IdpGroup>> {
        self.record(format!("create_group:{name}"));
        Ok(Some(IdpGroup {
            id: GroupId::from(get_entity_id()),
            name: name.to_string(),
            description: description.to_string(),
        }))
    }

    async fn find_group_by_name(&self, _name: &str) -> ApiResult<Option<IdpGroup>> {
        Ok(None)
    }

    async fn update_group(&self, group_id: &GroupId, _name: &str, _description: &str) -> ApiResult<()> {
        self.record(format!("update_group:{group_id}"));
        Ok(())
    }

    async fn delete_group(&self, group_id: &GroupId) -> ApiResult<()> {
        self.record(format!("delete_group:{group_id}"));
        Ok(())
    }

    async fn add_user_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        self.record(format!("add_member:{group_id}:{user_id}"));
        Ok(())
    }

    async fn remove_user_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        self.record(format!("remove_member:{group_id}:{user_id}"));
        Ok(())
    }

    async fn add_owner_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        self.record(format!("add_owner:{group_id}:{user_id}"));
        Ok(())
    }

    async fn remove_owner_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        self.record(format!("remove_owner:{group_id}:{user_id}"));
        Ok(())
    }
}
