use thiserror::Error;

/// Error type for every operation the client performs.
///
/// Variants are structured so that [`classify_connect`] and [`classify_exec`]
/// can map them to a retry decision without inspecting raw transport text.
/// Adapters convert transport errors into these variants once, at the point
/// where the error is raised; no other component looks at message strings.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    // Connect-phase errors
    #[error("authentication failure for {user}@{host}")]
    Auth { user: String, host: String },

    #[error("invalid private key: {path}")]
    KeyInvalid { path: String },

    #[error("key file not found: {path}")]
    KeyNotFound { path: String },

    #[error("unsupported algorithm during negotiation: {detail}")]
    UnsupportedAlgorithm { detail: String },

    #[error("illegal port: {port}")]
    IllegalPort { port: u32 },

    #[error("DNS lookup failed for {host}")]
    Dns { host: String },

    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("timeout occurred during connection process ({seconds}s)")]
    ConnectTimeout { seconds: u64 },

    // Session-loss errors (force a reconnect before the next attempt)
    #[error("not connected")]
    NotConnected,

    #[error("no response from server")]
    NoResponse,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("timeout after {seconds}s")]
    Timeout { seconds: u64 },

    // Transient channel congestion (requeue the order, back off, retry)
    #[error("channel open failure: {reason}")]
    ChannelOpen { reason: String },

    #[error("must wait before further traffic: {reason}")]
    Busy { reason: String },

    // Filesystem errors, remote or local (fatal for the order)
    #[error("no such path: {path}")]
    NoSuchPath { path: String },

    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("no space left while writing {path}")]
    DiskFull { path: String },

    #[error("too many open files or links: {path}")]
    TooManyFiles { path: String },

    #[error("{path} must be a regular file")]
    MustBeFile { path: String },

    #[error("{path} must be a directory")]
    MustBeDirectory { path: String },

    // Execution errors
    #[error("command execution failed: {reason}")]
    Exec { reason: String },

    #[error("command output too large (limit: {limit_bytes} bytes)")]
    OutputTooLarge { limit_bytes: usize },

    // Data channel errors that fit no narrower category
    #[error("data channel error: {reason}")]
    Data { reason: String },

    // Scheduler lifecycle
    #[error("scheduler shut down before the operation completed")]
    SchedulerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Retry category assigned to an error.
///
/// `ConnectFatal`/`ConnectTransient` are produced by [`classify_connect`];
/// the remaining categories by [`classify_exec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Configuration or permanent-state problem during connect; surface, no retry.
    ConnectFatal,
    /// Anything else raised while connecting; retried by the pool.
    ConnectTransient,
    /// Permanent failure of the order itself; surface, no retry.
    ExecFatal,
    /// Channel congestion; requeue the order at the queue front after a backoff.
    ExecTransientBusy,
    /// The session is unusable; force-close it so the next acquisition reconnects.
    NeedsReconnect,
}

/// Classify an error raised while establishing a connection.
#[must_use]
pub fn classify_connect(error: &Error) -> ErrorClass {
    match error {
        Error::Auth { .. }
        | Error::KeyInvalid { .. }
        | Error::KeyNotFound { .. }
        | Error::UnsupportedAlgorithm { .. }
        | Error::IllegalPort { .. }
        | Error::Dns { .. }
        | Error::ConfigNotFound { .. }
        | Error::ConfigInvalid { .. } => ErrorClass::ConnectFatal,
        _ => ErrorClass::ConnectTransient,
    }
}

/// Classify an error raised while executing a dispatched order.
#[must_use]
pub fn classify_exec(error: &Error) -> ErrorClass {
    match error {
        Error::ChannelOpen { .. } | Error::Busy { .. } => ErrorClass::ExecTransientBusy,
        Error::NotConnected
        | Error::NoResponse
        | Error::ConnectionReset
        | Error::Timeout { .. } => ErrorClass::NeedsReconnect,
        _ => ErrorClass::ExecFatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============== Display ==============

    #[test]
    fn test_auth_display() {
        let err = Error::Auth {
            user: "admin".to_string(),
            host: "server1".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("admin"));
        assert!(msg.contains("server1"));
        assert!(msg.contains("authentication failure"));
    }

    #[test]
    fn test_key_invalid_display() {
        let err = Error::KeyInvalid {
            path: "/home/user/.ssh/id_rsa".to_string(),
        };
        assert!(format!("{err}").contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_connect_timeout_display() {
        let err = Error::ConnectTimeout { seconds: 10 };
        let msg = format!("{err}");
        assert!(msg.contains("timeout occurred during connection process"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_no_such_path_display() {
        let err = Error::NoSuchPath {
            path: "/tmp/missing".to_string(),
        };
        assert!(format!("{err}").contains("/tmp/missing"));
    }

    #[test]
    fn test_must_be_file_display() {
        let err = Error::MustBeFile {
            path: "/etc".to_string(),
        };
        assert_eq!(format!("{err}"), "/etc must be a regular file");
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(format!("{err}").contains("file not found"));
    }

    // ============== Connect classification ==============

    #[test]
    fn test_classify_connect_fatal_categories() {
        let fatals = vec![
            Error::Auth {
                user: "u".to_string(),
                host: "h".to_string(),
            },
            Error::KeyInvalid {
                path: "k".to_string(),
            },
            Error::KeyNotFound {
                path: "k".to_string(),
            },
            Error::UnsupportedAlgorithm {
                detail: "no common kex".to_string(),
            },
            Error::IllegalPort { port: 0 },
            Error::Dns {
                host: "nowhere.invalid".to_string(),
            },
            Error::ConfigInvalid {
                field: "port".to_string(),
                reason: "zero".to_string(),
            },
        ];
        for err in fatals {
            assert_eq!(classify_connect(&err), ErrorClass::ConnectFatal, "{err}");
        }
    }

    #[test]
    fn test_classify_connect_transient_catch_all() {
        let transients = vec![
            Error::Connect {
                host: "h".to_string(),
                reason: "connection refused".to_string(),
            },
            Error::ConnectTimeout { seconds: 10 },
            Error::ConnectionReset,
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )),
        ];
        for err in transients {
            assert_eq!(classify_connect(&err), ErrorClass::ConnectTransient, "{err}");
        }
    }

    // ============== Exec classification ==============

    #[test]
    fn test_classify_exec_transient_busy() {
        assert_eq!(
            classify_exec(&Error::ChannelOpen {
                reason: "open failure".to_string()
            }),
            ErrorClass::ExecTransientBusy
        );
        assert_eq!(
            classify_exec(&Error::Busy {
                reason: "must wait for continue".to_string()
            }),
            ErrorClass::ExecTransientBusy
        );
    }

    #[test]
    fn test_classify_exec_needs_reconnect() {
        let reconnects = vec![
            Error::NotConnected,
            Error::NoResponse,
            Error::ConnectionReset,
            Error::Timeout { seconds: 30 },
        ];
        for err in reconnects {
            assert_eq!(classify_exec(&err), ErrorClass::NeedsReconnect, "{err}");
        }
    }

    #[test]
    fn test_classify_exec_fatal_filesystem_errors() {
        let fatals = vec![
            Error::NoSuchPath {
                path: "p".to_string(),
            },
            Error::PermissionDenied {
                path: "p".to_string(),
            },
            Error::AlreadyExists {
                path: "p".to_string(),
            },
            Error::DiskFull {
                path: "p".to_string(),
            },
            Error::TooManyFiles {
                path: "p".to_string(),
            },
            Error::MustBeFile {
                path: "p".to_string(),
            },
            Error::OutputTooLarge { limit_bytes: 1024 },
            Error::Exec {
                reason: "exit 127".to_string(),
            },
        ];
        for err in fatals {
            assert_eq!(classify_exec(&err), ErrorClass::ExecFatal, "{err}");
        }
    }

    #[test]
    fn test_all_variants_display_and_debug() {
        let variants: Vec<Error> = vec![
            Error::ConfigNotFound {
                path: "a".to_string(),
            },
            Error::ConfigInvalid {
                field: "b".to_string(),
                reason: "c".to_string(),
            },
            Error::Auth {
                user: "d".to_string(),
                host: "e".to_string(),
            },
            Error::KeyInvalid {
                path: "f".to_string(),
            },
            Error::KeyNotFound {
                path: "g".to_string(),
            },
            Error::UnsupportedAlgorithm {
                detail: "h".to_string(),
            },
            Error::IllegalPort { port: 70000 },
            Error::Dns {
                host: "i".to_string(),
            },
            Error::Connect {
                host: "j".to_string(),
                reason: "k".to_string(),
            },
            Error::ConnectTimeout { seconds: 1 },
            Error::NotConnected,
            Error::NoResponse,
            Error::ConnectionReset,
            Error::Timeout { seconds: 2 },
            Error::ChannelOpen {
                reason: "l".to_string(),
            },
            Error::Busy {
                reason: "m".to_string(),
            },
            Error::NoSuchPath {
                path: "n".to_string(),
            },
            Error::PermissionDenied {
                path: "o".to_string(),
            },
            Error::AlreadyExists {
                path: "p".to_string(),
            },
            Error::DiskFull {
                path: "q".to_string(),
            },
            Error::TooManyFiles {
                path: "r".to_string(),
            },
            Error::MustBeFile {
                path: "s".to_string(),
            },
            Error::MustBeDirectory {
                path: "t".to_string(),
            },
            Error::Exec {
                reason: "u".to_string(),
            },
            Error::OutputTooLarge { limit_bytes: 1 },
            Error::Data {
                reason: "v".to_string(),
            },
            Error::SchedulerClosed,
        ];

        for err in variants {
            let _ = format!("{err}");
            let _ = format!("{err:?}");
        }
    }

    #[test]
    fn test_result_type_alias() {
        let ok: Result<i32> = Ok(42);
        let err: Result<i32> = Err(Error::NotConnected);
        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
