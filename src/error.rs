//! Error types surfaced by the client.
//!
//! Each failure mode is its own variant so callers can match on the kind
//! (`NotFound` vs `NotStored` vs a dead server) instead of parsing messages.
//! Variants that relate to a key carry it, and variants caused by a specific
//! server carry its `host:port` address.

use std::fmt;
use std::io;

/// Errors returned by [`Client`](crate::Client) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key is empty, too long, or contains characters the protocol cannot carry.
    #[error("a bad key was provided or characters out of range ({reason}). Key {key:?}")]
    BadKey { key: String, reason: KeyProblem },

    /// The server holds no entry for the key.
    #[error("not found. Key {key}")]
    NotFound { key: String },

    /// A conditional store (`add`, `replace`, `append`, `prepend`) was refused.
    #[error("not stored. Key {key}")]
    NotStored { key: String },

    /// A CAS write lost the race against another writer.
    #[error("connection data exists. Key {key}")]
    ConnectionDataExists { key: String },

    /// Connect, poll, or receive timeout expired.
    #[error("a timeout occurred ({phase}) on {server}. Key {key}")]
    TimeoutOccurred {
        key: String,
        server: String,
        phase: Phase,
    },

    /// The key routes to a server that is currently ejected.
    #[error("server is marked dead: {server}. Key {key}")]
    ServerIsMarkedDead { key: String, server: String },

    /// Every server in the pool is ejected.
    #[error("all servers are down. Key {key}")]
    AllServersDown { key: String },

    /// Socket-level failure talking to a server.
    #[error("system error on {server}: {source}. Key {key}")]
    SystemError {
        key: String,
        server: String,
        #[source]
        source: io::Error,
    },

    /// The server rejected the request.
    #[error("{message:?} from {server}. Key {key}")]
    ServerError {
        key: String,
        server: String,
        message: String,
    },

    /// The server sent something the client could not interpret.
    #[error("unknown read failure from {server}: {detail}. Key {key}")]
    Protocol {
        key: String,
        server: String,
        detail: String,
    },

    /// Misuse of the API, e.g. reading a raw value as marshalled.
    #[error("argument error: {0}")]
    Argument(String),

    /// Invalid configuration or server list.
    #[error("configuration error: {0}")]
    Config(String),

    /// Value serialization or deserialization failed.
    #[error("codec error: {message}. Key {key}")]
    Codec { key: String, message: String },

    /// A broadcast operation failed on one or more servers.
    #[error("{op} failed on {} server(s): {}", .failures.len(), summarize(.failures))]
    Broadcast {
        op: &'static str,
        failures: Vec<ServerFailure>,
    },
}

impl Error {
    /// Returns true for failures that count against a server's health.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Error::TimeoutOccurred { .. } | Error::SystemError { .. } | Error::Protocol { .. }
        )
    }

    /// The key this error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Error::BadKey { key, .. }
            | Error::NotFound { key }
            | Error::NotStored { key }
            | Error::ConnectionDataExists { key }
            | Error::TimeoutOccurred { key, .. }
            | Error::ServerIsMarkedDead { key, .. }
            | Error::AllServersDown { key }
            | Error::SystemError { key, .. }
            | Error::ServerError { key, .. }
            | Error::Protocol { key, .. }
            | Error::Codec { key, .. } => Some(key),
            Error::Argument(_) | Error::Config(_) | Error::Broadcast { .. } => None,
        }
    }

    /// The server address this error refers to, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Error::TimeoutOccurred { server, .. }
            | Error::ServerIsMarkedDead { server, .. }
            | Error::SystemError { server, .. }
            | Error::ServerError { server, .. }
            | Error::Protocol { server, .. } => Some(server),
            _ => None,
        }
    }
}

/// One server's failure within a broadcast.
#[derive(Debug)]
pub struct ServerFailure {
    pub server: String,
    pub error: Error,
}

fn summarize(failures: &[ServerFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.server, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a key failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyProblem {
    Empty,
    TooLong { len: usize, max: usize },
    InvalidByte { byte: u8, offset: usize },
}

impl fmt::Display for KeyProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyProblem::Empty => write!(f, "empty key"),
            KeyProblem::TooLong { len, max } => write!(f, "{len} bytes exceeds {max}"),
            KeyProblem::InvalidByte { byte, offset } => {
                write!(f, "byte 0x{byte:02x} at offset {offset}")
            }
        }
    }
}

/// Which stage of a request timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Poll,
    Receive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Poll => write!(f, "poll"),
            Phase::Receive => write!(f, "receive"),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
