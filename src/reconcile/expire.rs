use std::collections::HashMap;

use chrono::{TimeDelta, Utc};

use crate::{
    db::{
        models::{AccessRequest, Group, GroupId, Membership, RoleGroupMap, RoleRequest, User, UserId},
        DbPool,
    },
    error::EmptyResult,
    hooks,
    ops::{RejectAccessRequest, RejectRoleRequest},
    CONFIG,
};

/// Rejects pending requests that ran past their own requested end or the
/// configured time-to-live.
pub async fn expire_requests(pool: DbPool) -> EmptyResult {
    let conn = pool.get().await?;
    let ttl_days = CONFIG.access_request_ttl_days();

    let mut expired = 0u64;

    for request in AccessRequest::find_stale(ttl_days, &conn).await {
        RejectAccessRequest::new(request.id.clone(), None)
            .reason("Closed because the request expired without a resolution")
            .execute(&conn)
            .await?;
        expired += 1;
    }

    for request in RoleRequest::find_stale(ttl_days, &conn).await {
        RejectRoleRequest::new(request.id.clone(), None)
            .reason("Closed because the request expired without a resolution")
            .execute(&conn)
            .await?;
        expired += 1;
    }

    if expired > 0 {
        info!("Request expiry done, {expired} pending request(s) closed");
    }
    hooks::metrics::record_counter("requests.expired", expired as f64, &[]);

    Ok(())
}

/// Tells users, group owners and role owners about access ending inside
/// the configured notification window.
pub async fn notify_expiring_access(pool: DbPool) -> EmptyResult {
    let conn = pool.get().await?;

    let now = Utc::now().naive_utc();
    let window_end = now + TimeDelta::days(CONFIG.expiry_notification_days());

    let expiring_grants = Membership::find_ending_between(now, window_end, &conn).await;
    let expiring_maps = RoleGroupMap::find_ending_between(now, window_end, &conn).await;

    // Per user: their own grants running out
    let mut grants_per_user: HashMap<UserId, Vec<Membership>> = HashMap::new();
    for grant in &expiring_grants {
        grants_per_user.entry(grant.user_id.clone()).or_default().push(grant.clone());
    }

    for (user_id, grants) in &grants_per_user {
        let Some(user) = User::find_by_id(user_id, &conn).await else { continue };

        let mut groups = Vec::new();
        for group_id in grants.iter().map(|g| &g.group_id).collect::<std::collections::HashSet<_>>() {
            if let Some(group) = Group::find_by_id(group_id, &conn).await {
                groups.push(group);
            }
        }

        hooks::notifications::access_expiring_user(&user, &groups, window_end, grants);
    }

    // Per group owner: member access and role associations on their groups
    let mut grants_per_group: HashMap<GroupId, Vec<Membership>> = HashMap::new();
    for grant in &expiring_grants {
        grants_per_group.entry(grant.group_id.clone()).or_default().push(grant.clone());
    }
    let mut maps_per_group: HashMap<GroupId, Vec<RoleGroupMap>> = HashMap::new();
    for map in &expiring_maps {
        maps_per_group.entry(map.group_id.clone()).or_default().push(map.clone());
    }

    let mut grants_per_owner: HashMap<UserId, Vec<Membership>> = HashMap::new();
    let mut maps_per_owner: HashMap<UserId, Vec<RoleGroupMap>> = HashMap::new();
    for group_id in grants_per_group.keys().chain(maps_per_group.keys()).collect::<std::collections::HashSet<_>>() {
        for owner_id in Membership::active_owner_ids(group_id, &conn).await {
            if let Some(grants) = grants_per_group.get(group_id) {
                // Owners are not nagged about their own expiring access here
                let foreign: Vec<_> = grants.iter().filter(|g| g.user_id != owner_id).cloned().collect();
                grants_per_owner.entry(owner_id.clone()).or_default().extend(foreign);
            }
            if let Some(maps) = maps_per_group.get(group_id) {
                maps_per_owner.entry(owner_id.clone()).or_default().extend(maps.iter().cloned());
            }
        }
    }

    for owner_id in grants_per_owner.keys().chain(maps_per_owner.keys()).collect::<std::collections::HashSet<_>>() {
        let Some(owner) = User::find_by_id(owner_id, &conn).await else { continue };
        let empty_grants = Vec::new();
        let empty_maps = Vec::new();
        let grants = grants_per_owner.get(owner_id).unwrap_or(&empty_grants);
        let maps = maps_per_owner.get(owner_id).unwrap_or(&empty_maps);
        if grants.is_empty() && maps.is_empty() {
            continue;
        }
        hooks::notifications::access_expiring_owner(&owner, grants, maps, window_end);
    }

    // Per role owner: associations their role is about to lose
    let mut maps_per_role: HashMap<GroupId, Vec<RoleGroupMap>> = HashMap::new();
    for map in &expiring_maps {
        maps_per_role.entry(map.role_group_id.clone()).or_default().push(map.clone());
    }

    for (role_id, maps) in &maps_per_role {
        for owner_id in Membership::active_owner_ids(role_id, &conn).await {
            let Some(owner) = User::find_by_id(&owner_id, &conn).await else { continue };
            hooks::notifications::access_expiring_role_owner(&owner, maps, window_end);
        }
    }

    info!(
        "Expiring-access notifications done: {} grant(s), {} association(s) in window",
        expiring_grants.len(),
        expiring_maps.len()
    );

    Ok(())
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::{GroupKind, RequestStatus};
    use crate::ops::testutil::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn the_sweep_rejects_requests_past_their_own_end() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let past = Utc::now().naive_utc() - TimeDelta::hours(1);
        let mut stale = AccessRequest::new(u1.id.clone(), g1.id.clone(), false, String::new(), Some(past));
        stale.save(&conn).await.unwrap();

        let future = Utc::now().naive_utc() + TimeDelta::days(2);
        let mut fresh = AccessRequest::new(u1.id.clone(), g1.id.clone(), true, String::new(), Some(future));
        fresh.save(&conn).await.unwrap();

        expire_requests(pool.clone()).await.unwrap();

        let stale = AccessRequest::find_by_id(&stale.id, &conn).await.unwrap();
        assert_eq!(stale.status(), RequestStatus::Rejected);
        assert!(stale.resolved_at.is_some());

        let fresh = AccessRequest::find_by_id(&fresh.id, &conn).await.unwrap();
        assert_eq!(fresh.status(), RequestStatus::Pending);
    }
}
