use std::collections::HashMap;

use crate::{
    db::{
        models::{User, UserId},
        DbPool,
    },
    error::EmptyResult,
    hooks, idp,
    ops::DeleteUser,
};

/// Pulls the authoritative user catalog from the identity provider:
/// creates newcomers, refreshes profile fields, and soft-deletes users the
/// provider no longer reports as active, which also ends their grants and
/// rejects their pending requests.
pub async fn sync_users(pool: DbPool) -> EmptyResult {
    let Some(client) = idp::client() else {
        warn!("User sync skipped, no identity provider configured");
        return Ok(());
    };

    // The schema tells operators which profile attributes the provider
    // carries for this user type; sync itself only needs the core fields
    match client.get_user_schema(&crate::CONFIG.idp_user_type()).await {
        Ok(schema) => {
            let attributes = schema.pointer("/definitions/custom/properties").and_then(|p| p.as_object()).map(|p| p.len());
            debug!("User schema loaded, {} custom attribute(s)", attributes.unwrap_or(0));
        }
        Err(e) => warn!("Failed to load the user schema: {e:#?}"),
    }

    let idp_users = client.list_users().await?;
    let conn = pool.get().await?;

    let mut local: HashMap<UserId, User> =
        User::find_all_active(&conn).await.into_iter().map(|u| (u.id.clone(), u)).collect();

    let mut created = 0u64;
    let mut updated = 0u64;
    let mut deleted = 0u64;

    for idp_user in &idp_users {
        if !idp_user.active {
            if local.remove(&idp_user.id).is_some() {
                DeleteUser::new(idp_user.id.clone(), None).execute(&conn).await?;
                deleted += 1;
            }
            continue;
        }

        match local.remove(&idp_user.id) {
            None => {
                let mut user = User::new(idp_user.id.clone(), idp_user.email.clone());
                apply_profile(&mut user, idp_user);
                user.save(&conn).await?;
                created += 1;
            }
            Some(mut user) => {
                if profile_changed(&user, idp_user) {
                    apply_profile(&mut user, idp_user);
                    user.save(&conn).await?;
                    updated += 1;
                }
            }
        }
    }

    // Whoever is left exists only here; the provider is the authority
    for user_id in local.into_keys() {
        DeleteUser::new(user_id, None).execute(&conn).await?;
        deleted += 1;
    }

    info!("User sync done: {created} created, {updated} updated, {deleted} deleted");
    hooks::metrics::record_gauge("sync.users_total", idp_users.len() as f64, &[]);

    Ok(())
}

fn apply_profile(user: &mut User, idp_user: &idp::IdpUser) {
    user.email = idp_user.email.clone();
    user.first_name = idp_user.first_name.clone();
    user.last_name = idp_user.last_name.clone();
    user.display_name = idp_user.display_name.clone();
    user.employee_number = idp_user.employee_number.clone();
    user.manager_id = idp_user.manager_id.clone();
    user.profile = idp_user.profile.to_string();
}

fn profile_changed(user: &User, idp_user: &idp::IdpUser) -> bool {
    user.email != idp_user.email
        || user.first_name != idp_user.first_name
        || user.last_name != idp_user.last_name
        || user.display_name != idp_user.display_name
        || user.employee_number != idp_user.employee_number
        || user.manager_id != idp_user.manager_id
        || user.profile != idp_user.profile.to_string()
}
