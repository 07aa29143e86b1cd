//
// Background convergence. Each job runs on its own scheduler tick with its
// own connection, is idempotent, and repairs whatever drifted since the
// last pass: the store stays authoritative, the identity provider mirror
// follows.
//
pub mod expire;
pub mod groups;
pub mod integrity;
pub mod memberships;
pub mod users;

use crate::{db::DbPool, error::EmptyResult};

/// One full pass over every job, the `sync` subcommand
pub async fn run_all(pool: DbPool) -> EmptyResult {
    users::sync_users(pool.clone()).await?;
    groups::sync_groups(pool.clone()).await?;
    memberships::sync_memberships(pool.clone()).await?;
    expire::expire_requests(pool.clone()).await?;
    integrity::repair_integrity(pool.clone()).await?;
    expire::notify_expiring_access(pool).await?;
    Ok(())
}
