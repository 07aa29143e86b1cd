//
// Identity provider adapter. The engine talks to a trait object installed at
// startup; every write is queued during the store transaction and awaited
// after commit, so a failing call can never roll the store back.
//
mod okta;

pub use okta::OktaClient;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    db::models::{GroupId, UserId},
    error::ApiResult,
    CONFIG,
};

/// A user as the identity provider reports it
#[derive(Clone, Debug)]
pub struct IdpUser {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub display_name: String,
    pub employee_number: Option<String>,
    pub manager_id: Option<UserId>,
    pub active: bool,
    pub profile: Value,
}

/// A group as the identity provider reports it
#[derive(Clone, Debug)]
pub struct IdpGroup {
    pub id: GroupId,
    pub name: String,
    pub description: String,
}

/// The operations the engine needs from the identity provider. All calls are
/// idempotent: adding an existing member or removing an absent one reports
/// success.
#[async_trait]
pub trait IdpClient: Send + Sync {
    async fn list_users(&self) -> ApiResult<Vec<IdpUser>>;
    async fn get_user_schema(&self, user_type: &str) -> ApiResult<Value>;
    async fn list_groups(&self) -> ApiResult<Vec<IdpGroup>>;
    async fn list_users_for_group(&self, group_id: &GroupId) -> ApiResult<Vec<UserId>>;
    async fn list_owners_for_group(&self, group_id: &GroupId) -> ApiResult<Vec<UserId>>;
    /// Groups governed by provider-side assignment rules; those stay unmanaged
    async fn list_groups_with_active_rules(&self) -> ApiResult<Vec<GroupId>>;
    async fn create_group(&self, name: &str, description: &str) -> ApiResult<Option<IdpGroup>>;
    async fn find_group_by_name(&self, name: &str) -> ApiResult<Option<IdpGroup>>;
    async fn update_group(&self, group_id: &GroupId, name: &str, description: &str) -> ApiResult<()>;
    async fn delete_group(&self, group_id: &GroupId) -> ApiResult<()>;
    async fn add_user_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()>;
    async fn remove_user_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()>;
    async fn add_owner_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()>;
    async fn remove_owner_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()>;
}

static CLIENT: RwLock<Option<Arc<dyn IdpClient>>> = RwLock::new(None);

/// Installs the client used by every subsequent call. Tests install a
/// recording mock through the same slot.
pub fn install(client: Arc<dyn IdpClient>) {
    *CLIENT.write().expect("Identity provider registry poisoned") = Some(client);
}

pub fn init_from_config() {
    if let (Some(base_url), Some(token)) = (CONFIG.idp_base_url(), CONFIG.idp_api_token()) {
        install(Arc::new(OktaClient::new(base_url, token)));
        info!("Identity provider client initialized");
    } else {
        warn!("No identity provider configured, mutations will only touch the local store");
    }
}

pub fn client() -> Option<Arc<dyn IdpClient>> {
    CLIENT.read().expect("Identity provider registry poisoned").clone()
}

/// Writes queued during a primitive, awaited together after its last commit
pub type IdpTasks = Vec<tokio::task::JoinHandle<()>>;

fn spawn<F>(tasks: &mut IdpTasks, what: String, fut: F)
where
    F: std::future::Future<Output = ApiResult<()>> + Send + 'static,
{
    tasks.push(tokio::spawn(async move {
        if let Err(e) = fut.await {
            // Logged and swallowed; the reconciler converges later
            warn!("Identity provider call failed ({what}): {e:#?}");
        }
    }));
}

pub fn queue_add_member(tasks: &mut IdpTasks, group_id: &GroupId, user_id: &UserId) {
    if let Some(client) = client() {
        let (g, u) = (group_id.clone(), user_id.clone());
        spawn(tasks, format!("add member {u} to {g}"), async move { client.add_user_to_group(&g, &u).await });
    }
}

pub fn queue_remove_member(tasks: &mut IdpTasks, group_id: &GroupId, user_id: &UserId) {
    if let Some(client) = client() {
        let (g, u) = (group_id.clone(), user_id.clone());
        spawn(tasks, format!("remove member {u} from {g}"), async move { client.remove_user_from_group(&g, &u).await });
    }
}

pub fn queue_add_owner(tasks: &mut IdpTasks, group_id: &GroupId, user_id: &UserId) {
    if let Some(client) = client() {
        let (g, u) = (group_id.clone(), user_id.clone());
        spawn(tasks, format!("add owner {u} to {g}"), async move { client.add_owner_to_group(&g, &u).await });
    }
}

pub fn queue_remove_owner(tasks: &mut IdpTasks, group_id: &GroupId, user_id: &UserId) {
    if let Some(client) = client() {
        let (g, u) = (group_id.clone(), user_id.clone());
        spawn(tasks, format!("remove owner {u} from {g}"), async move { client.remove_owner_from_group(&g, &u).await });
    }
}

pub fn queue_delete_group(tasks: &mut IdpTasks, group_id: &GroupId) {
    if let Some(client) = client() {
        let g = group_id.clone();
        spawn(tasks, format!("delete group {g}"), async move { client.delete_group(&g).await });
    }
}

/// The structured-concurrency boundary at the end of every primitive
pub async fn join_all(tasks: IdpTasks) {
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            warn!("Identity provider task panicked: {e:?}");
        }
    }
}
