use std::collections::HashSet;

use crate::{
    db::{
        models::{Group, Membership, RoleGroupMap},
        DbPool,
    },
    error::EmptyResult,
    hooks, idp,
    ops::UnmanageGroup,
    util::earliest_ended_at,
};

/// Restores the structural invariants after drift: unmanaged groups carry
/// no role plumbing, and every active role association fans out to exactly
/// the role's active members.
pub async fn repair_integrity(pool: DbPool) -> EmptyResult {
    let conn = pool.get().await?;

    // Unmanaged groups cannot be populated by roles; clearing them also
    // rejects their pending requests
    for group in Group::find_all_active_unmanaged(&conn).await {
        UnmanageGroup::new(group.id, None).execute(&conn).await?;
    }

    let mut repaired = 0u64;

    for map in RoleGroupMap::find_all_active(&conn).await {
        let role_memberships = Membership::find_active_role_members(&map.role_group_id, &conn).await;
        let member_ids: HashSet<_> = role_memberships.iter().map(|m| m.user_id.clone()).collect();

        let derived = Membership::find_active_by_role_map(&map.id, &conn).await;
        let derived_ids: HashSet<_> = derived.iter().map(|m| m.user_id.clone()).collect();

        let group_is_managed = Group::find_by_id(&map.group_id, &conn).await.map(|g| g.is_managed).unwrap_or(false);

        // Missing fan-out rows are rebuilt, bounded by both the association
        // and the source role membership
        let missing: Vec<_> = member_ids.difference(&derived_ids).cloned().collect();
        if !missing.is_empty() {
            info!(
                "Role {} is missing {} in group {} for {} user(s)",
                map.role_group_id,
                if map.is_owner { "ownerships" } else { "memberships" },
                map.group_id,
                missing.len()
            );
        }
        for user_id in &missing {
            let source = role_memberships.iter().find(|m| m.user_id == *user_id).expect("picked from this set");

            if group_is_managed {
                if let Some(client) = idp::client() {
                    let result = if map.is_owner {
                        client.add_owner_to_group(&map.group_id, user_id).await
                    } else {
                        client.add_user_to_group(&map.group_id, user_id).await
                    };
                    if let Err(e) = result {
                        warn!("Failed to re-add {user_id} to {}: {e:#?}", map.group_id);
                    }
                }
            }

            let mut grant = Membership::new(user_id.clone(), map.group_id.clone(), map.is_owner);
            grant.role_group_map_id = Some(map.id.clone());
            grant.ended_at = earliest_ended_at(map.ended_at, source.ended_at);
            grant.save(&conn).await?;
            repaired += 1;
        }

        // Extra fan-out rows end, with the usual other-origin probe before
        // anything is removed from the identity provider
        let extra: Vec<_> = derived_ids.difference(&member_ids).cloned().collect();
        if !extra.is_empty() {
            info!(
                "Role {} has {} extra {} in group {} ",
                map.role_group_id,
                extra.len(),
                if map.is_owner { "ownerships" } else { "memberships" },
                map.group_id
            );

            Membership::end_derived_for_users(&[map.id.clone()], &extra, None, &conn).await?;
            repaired += extra.len() as u64;

            let still_covered = Membership::active_buckets_for_users(&map.group_id, &extra, &conn).await;
            let covered: HashSet<_> = still_covered
                .iter()
                .filter(|(_, owner)| *owner == map.is_owner)
                .map(|(u, _)| u.clone())
                .collect();

            if group_is_managed {
                if let Some(client) = idp::client() {
                    for user_id in extra.iter().filter(|u| !covered.contains(*u)) {
                        let result = if map.is_owner {
                            client.remove_owner_from_group(&map.group_id, user_id).await
                        } else {
                            client.remove_user_from_group(&map.group_id, user_id).await
                        };
                        if let Err(e) = result {
                            warn!("Failed to remove {user_id} from {}: {e:#?}", map.group_id);
                        }
                    }
                }
            }
        }
    }

    if repaired > 0 {
        info!("Integrity repair done, {repaired} derived grant(s) fixed");
    }
    hooks::metrics::record_counter("integrity.repaired", repaired as f64, &[]);

    Ok(())
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::GroupKind;
    use crate::ops::{testutil::*, ModifyRoleGroups};
    use crate::util::earliest_ended_at;
    use chrono::{TimeDelta, Utc};

    #[tokio::test(flavor = "multi_thread")]
    async fn drift_repair_rebuilds_missing_and_ends_extra_fanout_rows() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let u2 = seed_user(&conn, "u2").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        let member_end = Utc::now().naive_utc() + TimeDelta::hours(4);
        seed_bounded_grant(&conn, &u1, &role, false, Some(member_end)).await;
        let g1 = seed_group(&conn, "Pager", GroupKind::Plain, true).await;

        ModifyRoleGroups::new(role.id.clone(), None).attach_groups(vec![g1.id.clone()]).execute(&conn).await.unwrap();
        let map = RoleGroupMap::find_active_by_role(&role.id, &conn).await.remove(0);

        // Manufacture drift: the fan-out row for u1 is gone, and u2 holds
        // one without being a role member
        Membership::end_derived_for_users(&[map.id.clone()], &[u1.id.clone()], None, &conn).await.unwrap();
        let mut stray = Membership::new(u2.id.clone(), g1.id.clone(), false);
        stray.role_group_map_id = Some(map.id.clone());
        stray.save(&conn).await.unwrap();

        repair_integrity(pool.clone()).await.unwrap();

        let derived = Membership::find_active_by_role_map(&map.id, &conn).await;
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].user_id, u1.id);
        // The rebuilt row is bounded by both the association and the source
        // role membership
        assert_eq!(derived[0].ended_at, earliest_ended_at(map.ended_at, Some(member_end)));
    }
}
