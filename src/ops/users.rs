use crate::{
    db::{
        models::{AccessRequest, GroupRequest, RoleRequest, User, UserId},
        DbConn,
    },
    error::EmptyResult,
    hooks::{
        self,
        audit::{AuditEvent, EventType},
    },
    ops::{access_requests::RejectAccessRequest, group_requests::RejectGroupRequest, role_requests::RejectRoleRequest},
};

/// Soft-deletes a user: every active grant ends and every request they have
/// pending is rejected. The identity provider is left alone; the deletion
/// arrived from there in the first place, or its sync will pick it up.
pub struct DeleteUser {
    user_id: UserId,
    current_actor_id: Option<UserId>,
}

impl DeleteUser {
    pub fn new(user_id: UserId, current_actor_id: Option<UserId>) -> Self {
        Self {
            user_id,
            current_actor_id,
        }
    }

    pub async fn execute(self, conn: &DbConn) -> EmptyResult {
        let Some(mut user) = User::find_by_id(&self.user_id, conn).await else {
            err_not_found!(format!("User {} not found", self.user_id));
        };

        let actor = User::resolve_actor(self.current_actor_id.as_ref(), conn).await;

        user.soft_delete(conn).await?;

        crate::db::models::Membership::end_all_for_user(&user.id, actor.as_ref(), conn).await?;

        for request in AccessRequest::find_pending_by_user(&user.id, conn).await {
            RejectAccessRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requester was deleted")
                .skip_requester_notification()
                .execute(conn)
                .await?;
        }
        for request in RoleRequest::find_pending_by_user(&user.id, conn).await {
            RejectRoleRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requester was deleted")
                .skip_requester_notification()
                .execute(conn)
                .await?;
        }
        for request in GroupRequest::find_pending_by_user(&user.id, conn).await {
            RejectGroupRequest::new(request.id.clone(), actor.clone())
                .reason("Closed because the requester was deleted")
                .execute(conn)
                .await?;
        }

        hooks::audit::log_event(
            AuditEvent::new(EventType::UserDelete, "user", user.id.to_string(), "deleted")
                .actor(actor.as_ref(), None)
                .target_name(user.email.clone()),
        );
        hooks::metrics::increment("user.deleted", &[]);

        Ok(())
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::models::{GroupKind, Membership, RequestStatus};
    use crate::ops::testutil::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_a_user_ends_grants_and_rejects_their_requests() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let u1 = seed_user(&conn, "u1").await;
        let g1 = seed_group(&conn, "Payments", GroupKind::Plain, true).await;
        let g2 = seed_group(&conn, "Dashboards", GroupKind::Plain, true).await;
        let role = seed_group(&conn, "Role-Oncall", GroupKind::Role, true).await;
        seed_grant(&conn, &u1, &g1, false).await;
        seed_grant(&conn, &u1, &g2, true).await;

        let mut access = AccessRequest::new(u1.id.clone(), g1.id.clone(), false, String::new(), None);
        access.save(&conn).await.unwrap();
        let mut role_request =
            RoleRequest::new(u1.id.clone(), role.id.clone(), g2.id.clone(), false, String::new(), None);
        role_request.save(&conn).await.unwrap();
        let mut group_request = GroupRequest::new(
            u1.id.clone(),
            String::from("Reporting"),
            String::new(),
            GroupKind::Plain.as_str().to_string(),
            None,
            Vec::new(),
            None,
            String::new(),
        );
        group_request.save(&conn).await.unwrap();

        DeleteUser::new(u1.id.clone(), None).execute(&conn).await.unwrap();

        assert!(User::find_by_id(&u1.id, &conn).await.is_none());
        assert!(!Membership::has_active(&u1.id, &g1.id, false, &conn).await);
        assert!(!Membership::has_active(&u1.id, &g2.id, true, &conn).await);

        let access = AccessRequest::find_by_id(&access.id, &conn).await.unwrap();
        assert_eq!(access.status(), RequestStatus::Rejected);
        let role_request = RoleRequest::find_by_id(&role_request.id, &conn).await.unwrap();
        assert_eq!(role_request.status(), RequestStatus::Rejected);
        let group_request = GroupRequest::find_by_id(&group_request.id, &conn).await.unwrap();
        assert_eq!(group_request.status(), RequestStatus::Rejected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleting_an_unknown_user_reports_not_found() {
        let (_guard, pool, _idp) = setup();
        let conn = pool.get().await.unwrap();

        let err = DeleteUser::new(UserId::from(String::from("missing")), None)
            .execute(&conn)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
