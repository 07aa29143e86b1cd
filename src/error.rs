//
// Error generator macro
//
use std::error::Error as StdError;

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $src_fn:expr, $usr_msg_fun:expr ),+ $(,)? ) => {
        pub enum ErrorKind { $($name( $ty )),+ }

        pub struct Error { message: String, error: ErrorKind }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self { Error::from((stringify!($name), err)) }
        })+
        $(impl<S: Into<String>> From<(S, $ty)> for Error {
            fn from(val: (S, $ty)) -> Self {
                Error { message: val.0.into(), error: ErrorKind::$name(val.1) }
            }
        })+
        impl StdError for Error {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                match &self.error {$( ErrorKind::$name(e) => $src_fn(e), )+}
            }
        }
        impl std::fmt::Display for Error {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match &self.error {$(
                   ErrorKind::$name(e) => $usr_msg_fun(e, f, &self.message),
                )+}
            }
        }
    };
}

use diesel::r2d2::PoolError as R2d2Err;
use diesel::result::Error as DieselErr;
use reqwest::Error as ReqErr;
use serde_json::Error as SerdeErr;
use std::io::Error as IoErr;

#[derive(Serialize)]
pub struct Empty {}

// Error struct
// Contains a user-facing message plus an enum variant carrying the cause.
// The marker variants keep the dispositions of the error table apart so
// callers can branch on them without string matching.
//
// After the variant itself there are two expressions: the first extracts the
// error source (if any), the second formats the error for display.
make_error! {
    // Just an empty error
    Empty(Empty):         _no_source, _serialize,
    // Used to represent err! calls: invalid input, no state change
    Simple(String):       _no_source, _api_error,
    // Duplicate name or duplicate pending request
    Conflict(Conflict):   _no_source, _api_error,
    // Self-add or reason gate refused the mutation
    PolicyDenied(Denied): _no_source, _api_error,
    // Lookup by id or name missed
    NotFound(Missing):    _no_source, _api_error,
    // The actor lacks permission for the target
    Forbidden(Refused):   _no_source, _api_error,

    // Used for structured payloads, like conditional-access decisions
    Json(Value):          _no_source, _serialize,
    Db(DieselErr):        _has_source, _api_error,
    R2d2(R2d2Err):        _has_source, _api_error,
    Serde(SerdeErr):      _has_source, _api_error,
    Io(IoErr):            _has_source, _api_error,
    // An identity provider call failed; logged and swallowed after commit
    Idp(ReqErr):          _has_source, _api_error,
}

#[derive(Debug, Default)]
pub struct Conflict;
#[derive(Debug, Default)]
pub struct Denied;
#[derive(Debug, Default)]
pub struct Missing;
#[derive(Debug, Default)]
pub struct Refused;

pub type ApiResult<T> = Result<T, Error>;
pub type EmptyResult = ApiResult<()>;

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.source() {
            Some(e) => write!(f, "{}.\n[CAUSE] {:#?}", self.message, e),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        (usr_msg, log_msg.into()).into()
    }

    pub fn empty() -> Self {
        Empty {}.into()
    }

    #[must_use]
    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.error, ErrorKind::Conflict(_))
    }

    pub fn is_policy_denied(&self) -> bool {
        matches!(self.error, ErrorKind::PolicyDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.error, ErrorKind::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self.error, ErrorKind::Forbidden(_))
    }
}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> ApiResult<S>;
}

impl<S, E: Into<Error>> MapResult<S> for Result<S, E> {
    fn map_res(self, msg: &str) -> ApiResult<S> {
        self.map_err(|e| e.into().with_msg(msg))
    }
}

const fn _has_source<T>(e: T) -> Option<T> {
    Some(e)
}
fn _no_source<T, S>(_: T) -> Option<S> {
    None
}

fn _serialize(e: &impl Serialize, f: &mut std::fmt::Formatter<'_>, _msg: &str) -> std::fmt::Result {
    write!(f, "{}", serde_json::to_string(e).unwrap_or_default())
}

fn _api_error<T: std::fmt::Debug>(_: &T, f: &mut std::fmt::Formatter<'_>, msg: &str) -> std::fmt::Result {
    write!(f, "{msg}")
}

use serde::Serialize;
use serde_json::Value;

//
// Error return macros
//
// `err!` produces a plain validation failure; the sibling macros mark the
// disposition the caller is expected to branch on.
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        error!("{}", $msg);
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        error!("{}. {}", $usr_msg, $log_value);
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_silent {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[macro_export]
macro_rules! err_conflict {
    ($msg:expr) => {{
        warn!("{}", $msg);
        return Err($crate::error::Error::from($crate::error::Conflict).with_msg($msg));
    }};
}

#[macro_export]
macro_rules! err_policy {
    ($msg:expr) => {{
        info!("{}", $msg);
        return Err($crate::error::Error::from($crate::error::Denied).with_msg($msg));
    }};
}

#[macro_export]
macro_rules! err_not_found {
    () => {{
        return Err($crate::error::Error::from($crate::error::Missing).with_msg("Not found"));
    }};
    ($msg:expr) => {{
        return Err($crate::error::Error::from($crate::error::Missing).with_msg($msg));
    }};
}

#[macro_export]
macro_rules! err_forbidden {
    ($msg:expr) => {{
        warn!("{}", $msg);
        return Err($crate::error::Error::from($crate::error::Refused).with_msg($msg));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_predicates_follow_the_marker_variant() {
        let e = Error::from(Conflict).with_msg("Duplicate name");
        assert!(e.is_conflict());
        assert!(!e.is_policy_denied());
        assert_eq!(e.message(), "Duplicate name");

        let e = Error::from(Denied).with_msg("Self-add is not allowed");
        assert!(e.is_policy_denied());

        let e = Error::new("user facing", "log detail");
        assert!(!e.is_conflict() && !e.is_not_found() && !e.is_forbidden());
    }

    #[test]
    fn display_uses_the_user_message() {
        let e = Error::from(Missing).with_msg("No such group");
        assert_eq!(format!("{e}"), "No such group");
    }
}
