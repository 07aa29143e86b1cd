//
// Policy gates. Both gates answer with `(valid, message)`; a failing gate
// turns the calling primitive into a no-op, never an error.
//
use crate::{
    db::{
        models::{self, App, Group, GroupId, Membership, RoleGroupMap, Tag, UserId},
        DbConn,
    },
    CONFIG,
};

pub type GateResult = (bool, String);

const PASS: GateResult = (true, String::new());

fn fail(message: String) -> GateResult {
    info!("Policy gate refused a mutation: {message}");
    (false, message)
}

/// Tags of the groups a role is associated with, split by link kind
async fn associated_group_tags(role_group_id: &GroupId, conn: &DbConn) -> (Vec<(Group, Vec<Tag>)>, Vec<(Group, Vec<Tag>)>) {
    let maps = RoleGroupMap::find_active_by_role(role_group_id, conn).await;

    let mut member_links = Vec::new();
    let mut owner_links = Vec::new();
    for map in maps {
        if let Some(group) = Group::find_by_id(&map.group_id, conn).await {
            let tags = Group::active_tags(&group.id, conn).await;
            if map.is_owner {
                owner_links.push((group, tags));
            } else {
                member_links.push((group, tags));
            }
        }
    }
    (member_links, owner_links)
}

/// Self-add gate over `ModifyGroupUsers` input. Denies an actor granting
/// themselves access where a tag forbids it, including transitively through
/// a role's associated groups. Access admins and actorless (system) calls
/// pass.
pub async fn check_self_add_for_group(
    group: &Group,
    current_actor: Option<&UserId>,
    members_to_add: &[UserId],
    owners_to_add: &[UserId],
    conn: &DbConn,
) -> GateResult {
    let Some(actor) = current_actor else { return PASS };
    if App::is_access_admin(actor, conn).await {
        return PASS;
    }

    let tags = Group::active_tags(&group.id, conn).await;

    if owners_to_add.contains(actor)
        && group.is_managed
        && models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY, &tags)
    {
        return fail(format!(
            "Current user is restricted from adding themself as owner to {} due to group tags",
            group.name
        ));
    }

    if members_to_add.contains(actor) {
        if group.is_managed && models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY, &tags) {
            return fail(format!(
                "Current user is restricted from adding themself as member to {} due to group tags",
                group.name
            ));
        }

        // Membership of a role carries access to everything the role is
        // attached to, so the associated groups' tags bind as well
        if group.is_role() && group.is_managed {
            let (member_links, owner_links) = associated_group_tags(&group.id, conn).await;
            for (member_group, link_tags) in &member_links {
                if member_group.is_managed
                    && models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY, link_tags)
                {
                    return fail(format!(
                        "Current user is restricted from adding themself as member to {} because the associated group {} restricts self-added membership",
                        group.name, member_group.name
                    ));
                }
            }
            for (owner_group, link_tags) in &owner_links {
                if owner_group.is_managed
                    && models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY, link_tags)
                {
                    return fail(format!(
                        "Current user is restricted from adding themself as member to {} because the associated group {} restricts self-added ownership",
                        group.name, owner_group.name
                    ));
                }
            }
        }
    }

    PASS
}

/// Self-add gate over `ModifyRoleGroups` input. An actor who is a member of
/// the role would gain access to every group being attached, so the target
/// groups' self-add tags bind the attach itself.
pub async fn check_self_add_for_role(
    role: &Group,
    current_actor: Option<&UserId>,
    member_groups_to_add: &[GroupId],
    owner_groups_to_add: &[GroupId],
    conn: &DbConn,
) -> GateResult {
    let Some(actor) = current_actor else { return PASS };
    if App::is_access_admin(actor, conn).await {
        return PASS;
    }
    if !role.is_role() {
        return PASS;
    }

    if !Membership::has_active(actor, &role.id, false, conn).await {
        return PASS;
    }

    for group in Group::find_by_ids(member_groups_to_add, conn).await {
        if !group.is_managed {
            continue;
        }
        let tags = Group::active_tags(&group.id, conn).await;
        if models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY, &tags) {
            return fail(format!(
                "Current user is a member of {} and is restricted from attaching it to {} which restricts self-added membership",
                role.name, group.name
            ));
        }
    }

    for group in Group::find_by_ids(owner_groups_to_add, conn).await {
        if !group.is_managed {
            continue;
        }
        let tags = Group::active_tags(&group.id, conn).await;
        if models::coalesce_bool_constraint(Tag::DISALLOW_SELF_ADD_OWNERSHIP_CONSTRAINT_KEY, &tags) {
            return fail(format!(
                "Current user is a member of {} and is restricted from attaching it to {} which restricts self-added ownership",
                role.name, group.name
            ));
        }
    }

    PASS
}

/// Shared reason validation once a tag demands one
fn validate_reason(reason: &str, group_name: &str) -> GateResult {
    if reason.trim().is_empty() {
        return fail(format!("A reason is required for changes to {group_name} due to group tags"));
    }

    let template = CONFIG.reason_template();
    if !template.is_empty() && reason.trim() == template.trim() {
        return fail(format!("The reason for changes to {group_name} must be filled in, not the template text"));
    }

    for fragment in CONFIG.reason_required_substrings_list() {
        if !reason.contains(&fragment) {
            return fail(format!("The reason for changes to {group_name} must reference {fragment}"));
        }
    }

    PASS
}

/// Reason gate over `ModifyGroupUsers` input. For a role group the tag set
/// is the union of the role's own tags and those of its associated groups.
pub async fn check_reason_for_group(
    group: &Group,
    current_actor: Option<&UserId>,
    reason: &str,
    conn: &DbConn,
) -> GateResult {
    if let Some(actor) = current_actor {
        if App::is_access_admin(actor, conn).await {
            return PASS;
        }
    }

    let mut tags = Group::active_tags(&group.id, conn).await;
    if group.is_role() {
        let (member_links, owner_links) = associated_group_tags(&group.id, conn).await;
        for (_, link_tags) in member_links.into_iter().chain(owner_links) {
            tags.extend(link_tags);
        }
    }

    if models::coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &tags) {
        return validate_reason(reason, &group.name);
    }

    PASS
}

/// Reason gate over `ModifyRoleGroups` input: the attached groups' tags
/// decide whether a reason is due.
pub async fn check_reason_for_role(
    role: &Group,
    current_actor: Option<&UserId>,
    reason: &str,
    member_groups_to_add: &[GroupId],
    owner_groups_to_add: &[GroupId],
    conn: &DbConn,
) -> GateResult {
    if let Some(actor) = current_actor {
        if App::is_access_admin(actor, conn).await {
            return PASS;
        }
    }

    let role_tags = Group::active_tags(&role.id, conn).await;
    if models::coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &role_tags) {
        let (valid, message) = validate_reason(reason, &role.name);
        if !valid {
            return (valid, message);
        }
    }

    let mut group_ids = member_groups_to_add.to_vec();
    group_ids.extend_from_slice(owner_groups_to_add);

    for group in Group::find_by_ids(&group_ids, conn).await {
        let tags = Group::active_tags(&group.id, conn).await;
        if models::coalesce_bool_constraint(Tag::REQUIRE_REASON_CONSTRAINT_KEY, &tags) {
            let (valid, message) = validate_reason(reason, &group.name);
            if !valid {
                return (valid, message);
            }
        }
    }

    PASS
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::GroupKind;
    use crate::ops::{testutil::*, CreateApp, ModifyGroupUsers};

    #[tokio::test(flavor = "multi_thread")]
    async fn a_tagged_group_requires_a_non_empty_reason() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let tag = seed_tag(&conn, "why", json!({ Tag::REQUIRE_REASON_CONSTRAINT_KEY: true })).await;
        attach_tag(&conn, &g1, &tag).await;

        let (valid, message) = check_reason_for_group(&g1, Some(&u1.id), "  ", &conn).await;
        assert!(!valid);
        assert!(message.contains(&g1.name));

        let (valid, _) = check_reason_for_group(&g1, Some(&u1.id), "ticket ACC-7", &conn).await;
        assert!(valid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn untagged_groups_do_not_require_a_reason() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;

        let (valid, _) = check_reason_for_group(&g1, Some(&u1.id), "", &conn).await;
        assert!(valid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn access_admins_bypass_the_self_add_gate() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let admin = seed_user(&conn, "admin").await;
        CreateApp::new(App::ACCESS_APP_RESERVED_NAME.to_string(), String::new(), None)
            .owner(admin.id.clone())
            .execute(&conn)
            .await
            .unwrap();

        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let tag = seed_tag(&conn, "no-self-add", json!({ Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY: true })).await;
        attach_tag(&conn, &g1, &tag).await;

        let (valid, _) = check_self_add_for_group(&g1, Some(&admin.id), &[admin.id.clone()], &[], &conn).await;
        assert!(valid, "access admins pass the gate");

        ModifyGroupUsers::new(g1.id.clone(), Some(admin.id.clone()))
            .add_members(vec![admin.id.clone()])
            .execute(&conn)
            .await
            .unwrap();
        assert!(Membership::has_active(&admin.id, &g1.id, false, &conn).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn role_members_cannot_attach_restricted_groups_to_their_role() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &role, false).await;

        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let tag = seed_tag(&conn, "no-self-add", json!({ Tag::DISALLOW_SELF_ADD_MEMBERSHIP_CONSTRAINT_KEY: true })).await;
        attach_tag(&conn, &g1, &tag).await;

        let (valid, message) =
            check_self_add_for_role(&role, Some(&u1.id), &[g1.id.clone()], &[], &conn).await;
        assert!(!valid);
        assert!(message.contains(&g1.name));

        // A non-member of the role attaches just fine
        let u2 = seed_user(&conn, "u2").await;
        let (valid, _) = check_self_add_for_role(&role, Some(&u2.id), &[g1.id.clone()], &[], &conn).await;
        assert!(valid);
    }
}
