//! The taxonomy of errors every bus-facing operation can fail with.
//!
//! Mirrors `ConsoleKitManager`'s `GError` domain (see `ck-manager.h` in the
//! reference sources): each kind maps 1:1 onto a `org.freedesktop.ConsoleKit.*`
//! D-Bus error name so a client sees the same distinguishable failures the
//! original daemon produced.

use dbus::MethodErr;

/// Catch-all error kind taxonomy (spec §7).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    #[error("unexpected failure")]
    Failed,
    #[error("contract violated by caller state")]
    General,
    #[error("insufficient permission")]
    InsufficientPermission,
    #[error("authorization requires an interactive challenge")]
    AuthorizationRequired,
    #[error("a system action is already in flight")]
    Busy,
    #[error("not supported on this platform")]
    NotSupported,
    #[error("inhibited by a block-mode lock")]
    Inhibited,
    #[error("invalid input")]
    InvalidInput,
    #[error("out of memory")]
    Oom,
    #[error("no seats")]
    NoSeats,
    #[error("no sessions")]
    NoSessions,
    #[error("nothing inhibited")]
    NothingInhibited,
    #[error("session already active")]
    AlreadyActive,
}

impl Kind {
    /// The last path segment of the D-Bus error name this kind reports as.
    pub fn dbus_suffix(self) -> &'static str {
        match self {
            Kind::Failed => "Failed",
            Kind::General => "GeneralError",
            Kind::InsufficientPermission => "InsufficientPermission",
            Kind::AuthorizationRequired => "AuthorizationRequired",
            Kind::Busy => "Busy",
            Kind::NotSupported => "NotSupported",
            Kind::Inhibited => "Inhibited",
            Kind::InvalidInput => "InvalidInput",
            Kind::Oom => "OOM",
            Kind::NoSeats => "NoSeats",
            Kind::NoSessions => "NoSessions",
            Kind::NothingInhibited => "NothingInhibited",
            Kind::AlreadyActive => "AlreadyActive",
        }
    }
}

/// A taxonomy error with a human-readable message, surfaced to a bus caller.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: Kind,
    pub message: String,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(Kind::Failed, message)
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(Kind::General, message)
    }

    pub fn perm(message: impl Into<String>) -> Self {
        Self::new(Kind::InsufficientPermission, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Builds the D-Bus error name for the object the call actually landed
    /// on (`object` is `"Manager"`, `"Seat"`, or `"Session"` — spec §A.2).
    pub fn to_method_err(&self, object: &str) -> MethodErr {
        MethodErr::new(
            format!("org.freedesktop.ConsoleKit.{object}.{}", self.kind.dbus_suffix()),
            self.message.clone(),
        )
    }
}

impl From<Error> for MethodErr {
    fn from(err: Error) -> MethodErr {
        err.to_method_err("Manager")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn each_kind_maps_to_a_distinct_dbus_suffix() {
        let kinds = [
            Kind::Failed,
            Kind::General,
            Kind::InsufficientPermission,
            Kind::AuthorizationRequired,
            Kind::Busy,
            Kind::NotSupported,
            Kind::Inhibited,
            Kind::InvalidInput,
            Kind::Oom,
            Kind::NoSeats,
            Kind::NoSessions,
            Kind::NothingInhibited,
            Kind::AlreadyActive,
        ];
        let mut suffixes: Vec<&str> = kinds.iter().map(|k| k.dbus_suffix()).collect();
        suffixes.sort_unstable();
        suffixes.dedup();
        assert_eq!(suffixes.len(), kinds.len(), "two Kind variants must not share a D-Bus error suffix");
    }

    #[test]
    fn to_method_err_is_scoped_to_the_object_the_call_landed_on() {
        // Only checks that building the error for each object name doesn't
        // panic; `MethodErr`'s fields aren't publicly inspectable.
        let err = Error::new(Kind::Inhibited, "blocked by a lock");
        let _ = err.to_method_err("Session");
        let _ = err.to_method_err("Manager");
    }
}
