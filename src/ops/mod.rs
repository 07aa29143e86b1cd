//
// The mutation primitives. Every operation here follows the same contract:
// validate, gate, mutate the store in commit-ordered phases, then dispatch
// the queued identity provider writes and notifications after the final
// commit.
//
#[cfg(all(test, sqlite))]
pub(crate) mod testutil;

pub mod access_requests;
pub mod apps;
pub mod constraints;
pub mod group_requests;
pub mod groups;
pub mod modify_group_users;
pub mod modify_role_groups;
pub mod role_requests;
pub mod tags;
pub mod users;

pub use access_requests::{ApproveAccessRequest, CreateAccessRequest, RejectAccessRequest};
pub use apps::{CreateApp, DeleteApp};
pub use group_requests::{ApproveGroupRequest, CreateGroupRequest, RejectGroupRequest};
pub use groups::{CreateGroup, DeleteGroup, ModifyGroupType, UnmanageGroup};
pub use modify_group_users::ModifyGroupUsers;
pub use modify_role_groups::ModifyRoleGroups;
pub use role_requests::{ApproveRoleRequest, CreateRoleRequest, RejectRoleRequest};
pub use tags::{CreateTag, DeleteTag, ModifyAppTags, ModifyGroupTags, ModifyGroupsTimeLimit};
pub use users::DeleteUser;

use crate::db::{
    models::{App, AppGroup, GroupId, Membership, User, UserId},
    DbConn,
};

/// Approver selection shared by the request lifecycle: group owners first,
/// app managers for app groups, access admins as the floor. A tier whose
/// only candidate is the requester falls through to the next.
pub(crate) async fn request_approvers(group_id: &GroupId, requester_id: &UserId, conn: &DbConn) -> Vec<User> {
    let mut approver_ids = Membership::active_owner_ids(group_id, conn).await;

    if let Some(app_group) = AppGroup::find_by_group(group_id, conn).await {
        if approver_ids.is_empty() || (approver_ids.len() == 1 && approver_ids[0] == *requester_id) {
            approver_ids = App::manager_ids(&app_group.app_id, conn).await;
        }
    }

    if approver_ids.is_empty() || (approver_ids.len() == 1 && approver_ids[0] == *requester_id) {
        approver_ids = App::access_admin_ids(conn).await;
    }

    User::find_by_ids(&approver_ids, conn).await
}
