use std::collections::{HashMap, HashSet};

use crate::{
    db::{
        models::{App, AppGroup, Group, GroupId, GroupKind, RoleGroup},
        DbConn, DbPool,
    },
    error::EmptyResult,
    hooks, idp,
    ops::{DeleteGroup, UnmanageGroup},
};

/// Pulls the group catalog: creates rows for provider groups this store has
/// never seen, refreshes names and descriptions, soft-deletes groups gone
/// from the provider, and unmanages groups governed by provider-side
/// assignment rules.
pub async fn sync_groups(pool: DbPool) -> EmptyResult {
    let Some(client) = idp::client() else {
        warn!("Group sync skipped, no identity provider configured");
        return Ok(());
    };

    let idp_groups = client.list_groups().await?;
    let ruled: HashSet<GroupId> = client.list_groups_with_active_rules().await?.into_iter().collect();
    let conn = pool.get().await?;

    let mut local: HashMap<GroupId, Group> =
        Group::find_all_active(&conn).await.into_iter().map(|g| (g.id.clone(), g)).collect();

    let mut created = 0u64;
    let mut deleted = 0u64;

    for idp_group in &idp_groups {
        match local.remove(&idp_group.id) {
            None => {
                let kind = kind_for_name(&idp_group.name, &conn).await;
                let mut group = Group::new(kind, idp_group.name.clone(), idp_group.description.clone());
                group.id = idp_group.id.clone();
                group.save(&conn).await?;

                match kind {
                    GroupKind::Role => RoleGroup::insert(&group.id, &conn).await?,
                    GroupKind::App => {
                        if let Some(app) = app_for_name(&idp_group.name, &conn).await {
                            let is_owner = idp_group.name.eq_ignore_ascii_case(&Group::app_owners_group_name(&app.name));
                            AppGroup::new(group.id.clone(), app.id, is_owner).save(&conn).await?;
                        }
                    }
                    GroupKind::Plain => {}
                }
                created += 1;
            }
            Some(mut group) => {
                if group.name != idp_group.name || group.description != idp_group.description {
                    group.name = idp_group.name.clone();
                    group.description = idp_group.description.clone();
                    group.save(&conn).await?;
                }
            }
        }

        // Provider rules populate these groups; this service must not
        if ruled.contains(&idp_group.id) {
            if let Some(group) = Group::find_by_id(&idp_group.id, &conn).await {
                if group.is_managed {
                    UnmanageGroup::new(group.id, None).execute(&conn).await?;
                }
            }
        }
    }

    // Groups only this store knows are gone from the provider
    for group_id in local.into_keys() {
        DeleteGroup::new(group_id, None).skip_idp_sync().execute(&conn).await?;
        deleted += 1;
    }

    info!("Group sync done: {created} created, {deleted} deleted, {} rule-governed", ruled.len());
    hooks::metrics::record_gauge("sync.groups_total", idp_groups.len() as f64, &[]);

    Ok(())
}

/// A discovered group's kind follows its name: the role prefix wins, an app
/// prefix matching a live app makes it an app group, anything else is plain
async fn kind_for_name(name: &str, conn: &DbConn) -> GroupKind {
    if name.starts_with(Group::ROLE_GROUP_NAME_PREFIX) {
        return GroupKind::Role;
    }
    if name.starts_with(Group::APP_GROUP_NAME_PREFIX) && app_for_name(name, conn).await.is_some() {
        return GroupKind::App;
    }
    GroupKind::Plain
}

async fn app_for_name(name: &str, conn: &DbConn) -> Option<App> {
    let rest = name.strip_prefix(Group::APP_GROUP_NAME_PREFIX)?;
    let app_name = rest.split(Group::APP_NAME_GROUP_NAME_SEPARATOR).next()?;
    App::find_by_name(app_name, conn).await
}
