use std::collections::HashSet;

use crate::{
    db::{
        models::{Group, Membership, User},
        DbPool,
    },
    error::EmptyResult,
    hooks, idp,
    CONFIG,
};

/// Converges memberships and ownerships per managed group. Authoritative
/// mode pushes the store's desired state ("an active grant of any origin
/// exists") into the provider; mirror mode imports the provider's lists as
/// direct grants instead, for first adoption.
pub async fn sync_memberships(pool: DbPool) -> EmptyResult {
    let Some(client) = idp::client() else {
        warn!("Membership sync skipped, no identity provider configured");
        return Ok(());
    };

    let conn = pool.get().await?;
    let authoritative = CONFIG.sync_authoritative();

    let mut drift = 0u64;

    for group in Group::find_all_active(&conn).await {
        if !group.is_managed {
            continue;
        }

        let idp_members: HashSet<_> = match client.list_users_for_group(&group.id).await {
            Ok(users) => users.into_iter().collect(),
            Err(e) => {
                warn!("Skipping membership sync for {}: {e:#?}", group.name);
                continue;
            }
        };
        let idp_owners: HashSet<_> = match client.list_owners_for_group(&group.id).await {
            Ok(users) => users.into_iter().collect(),
            Err(e) => {
                warn!("Skipping ownership sync for {}: {e:#?}", group.name);
                continue;
            }
        };

        for is_owner in [false, true] {
            let desired: HashSet<_> = Membership::active_user_ids(&group.id, is_owner, &conn).await.into_iter().collect();
            let actual = if is_owner {
                &idp_owners
            } else {
                &idp_members
            };

            if authoritative {
                for user_id in desired.difference(actual) {
                    drift += 1;
                    let result = if is_owner {
                        client.add_owner_to_group(&group.id, user_id).await
                    } else {
                        client.add_user_to_group(&group.id, user_id).await
                    };
                    if let Err(e) = result {
                        warn!("Failed to add {user_id} to {}: {e:#?}", group.name);
                    }
                }
                for user_id in actual.difference(&desired) {
                    drift += 1;
                    let result = if is_owner {
                        client.remove_owner_from_group(&group.id, user_id).await
                    } else {
                        client.remove_user_from_group(&group.id, user_id).await
                    };
                    if let Err(e) = result {
                        warn!("Failed to remove {user_id} from {}: {e:#?}", group.name);
                    }
                }
            } else {
                // Mirror mode: the provider's lists become direct grants
                for user_id in actual.difference(&desired) {
                    if User::find_by_id(user_id, &conn).await.is_none() {
                        continue;
                    }
                    drift += 1;
                    let mut grant = Membership::new(user_id.clone(), group.id.clone(), is_owner);
                    grant.created_reason = String::from("Imported from the identity provider");
                    grant.save(&conn).await?;
                }
                let direct = Membership::find_active_direct(&group.id, is_owner, &conn).await;
                for grant in direct.iter().filter(|m| !actual.contains(&m.user_id)) {
                    drift += 1;
                    Membership::end_direct_for_users(&group.id, &[grant.user_id.clone()], is_owner, None, &conn).await?;
                }
            }
        }
    }

    info!("Membership sync done, {drift} drifted entries handled (authoritative: {authoritative})");
    hooks::metrics::record_counter("sync.membership_drift", drift as f64, &[]);

    Ok(())
}
