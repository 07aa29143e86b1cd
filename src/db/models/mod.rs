mod app;
mod group;
mod membership;
mod request;
mod tag;
mod user;

pub use self::app::{App, AppId};
pub use self::group::{AppGroup, Group, GroupId, GroupKind, RoleGroup};
pub use self::membership::{Membership, MembershipId, RoleGroupMap, RoleGroupMapId};
pub use self::request::{
    AccessRequest, AccessRequestId, GroupRequest, GroupRequestId, RequestStatus, RoleRequest, RoleRequestId,
};
pub use self::tag::{
    coalesce_bool_constraint, coalesce_ended_at, coalesce_seconds_constraint, AppTagMap, AppTagMapId, GroupTagMap,
    GroupTagMapId, Tag, TagId,
};
pub use self::user::{User, UserId};

diesel::define_sql_function! {
    /// Case folding for the case-insensitive uniqueness probes on names
    fn lower(x: diesel::sql_types::Text) -> diesel::sql_types::Text;
}
