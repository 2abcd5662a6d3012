//! The boundary between the client and the wire.
//!
//! A [`Transport`] executes one [`Request`] against one server and returns the
//! server's [`Reply`], or a [`TransportError`] when the server could not be
//! reached or did not answer in time. Interpreting replies (hit or miss,
//! stored or not) is the client's job; the transport only moves bytes.
//!
//! Keys in requests and replies are wire keys, i.e. already prefixed.

pub mod memory;
pub mod socket;

use bytes::Bytes;
use std::io;
use std::time::Duration;

use crate::error::Phase;
use crate::server::ServerSpec;

/// How a store command treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    /// Store only if the entry still carries the version token `unique`.
    Cas { unique: u64 },
}

impl StoreMode {
    pub fn command(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
            StoreMode::Cas { .. } => "cas",
        }
    }
}

/// One protocol operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        keys: Vec<String>,
    },
    /// Like `Get`, but the reply carries version tokens.
    Gets {
        keys: Vec<String>,
    },
    Store {
        mode: StoreMode,
        key: String,
        value: Bytes,
        flags: u32,
        exptime: u32,
    },
    Delete {
        key: String,
    },
    Incr {
        key: String,
        delta: u64,
    },
    Decr {
        key: String,
        delta: u64,
    },
    Flush {
        delay: u32,
    },
    Stats,
}

impl Request {
    /// Whether the request may be sent without waiting for the reply.
    ///
    /// A `cas` store is never bufferable: its `EXISTS` reply is the result.
    pub fn is_bufferable(&self) -> bool {
        match self {
            Request::Store {
                mode: StoreMode::Cas { .. },
                ..
            } => false,
            Request::Store { .. } | Request::Delete { .. } => true,
            _ => false,
        }
    }

    /// First key of the request, for log lines.
    pub fn key(&self) -> &str {
        match self {
            Request::Get { keys } | Request::Gets { keys } => {
                keys.first().map(String::as_str).unwrap_or_default()
            }
            Request::Store { key, .. }
            | Request::Delete { key }
            | Request::Incr { key, .. }
            | Request::Decr { key, .. } => key,
            Request::Flush { .. } | Request::Stats => "",
        }
    }
}

/// One entry returned by a retrieval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Bytes,
    pub flags: u32,
    /// Version token. Zero when the server did not send one.
    pub cas: u64,
}

/// What the server answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Retrieval result. Misses are simply absent.
    Values(Vec<Item>),
    Stored,
    NotStored,
    /// CAS token mismatch.
    Exists,
    NotFound,
    Deleted,
    /// New value after incr/decr.
    Numeric(u64),
    Ok,
    Stats(Vec<(String, String)>),
    ServerError(String),
    ClientError(String),
    /// The request was queued and no reply will be read.
    Buffered,
}

/// Failures that mean the server did not answer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("{0} timeout")]
    Timeout(Phase),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-phase timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Establishing a connection.
    pub connect: Duration,
    /// Waiting for the socket to accept the request.
    pub poll: Duration,
    /// Waiting for reply bytes.
    pub receive: Duration,
}

/// Whether writes wait for the server's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Confirmed,
    /// Return once the request is queued.
    Buffered,
}

/// Options for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub timeouts: Timeouts,
    pub delivery: Delivery,
    /// With non-blocking sockets the reply wait is bounded by the poll timeout.
    pub non_blocking: bool,
}

impl CallOptions {
    /// How long to wait for reply bytes.
    pub fn reply_timeout(&self) -> Duration {
        if self.non_blocking {
            self.timeouts.poll
        } else {
            self.timeouts.receive
        }
    }

    /// Whether `request` should be sent without reading a reply.
    pub fn buffers(&self, request: &Request) -> bool {
        self.delivery == Delivery::Buffered && request.is_bufferable()
    }
}

/// Executes protocol operations against individual servers.
///
/// A transport owns its connections. Connections are opened lazily on first
/// use and are never shared between transports; [`Transport::fork`] yields a
/// transport with the same setup and no open connections.
pub trait Transport: Send {
    /// Execute `request` on `server`.
    fn execute(
        &mut self,
        server: &ServerSpec,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Reply, TransportError>;

    /// Drop the connection to `server`, if any.
    fn disconnect(&mut self, server: &ServerSpec);

    /// Drop every connection.
    fn disconnect_all(&mut self);

    /// A fresh transport with the same setup and no connections.
    fn fork(&self) -> Self
    where
        Self: Sized;

    /// Execute `request` on each server in turn. A failure on one server does
    /// not stop the others; results are in `servers` order.
    fn broadcast(
        &mut self,
        servers: &[&ServerSpec],
        request: &Request,
        options: &CallOptions,
    ) -> Vec<Result<Reply, TransportError>> {
        servers
            .iter()
            .map(|server| self.execute(server, request, options))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(delivery: Delivery, non_blocking: bool) -> CallOptions {
        CallOptions {
            timeouts: Timeouts {
                connect: Duration::from_secs(4),
                poll: Duration::from_millis(5),
                receive: Duration::from_millis(250),
            },
            delivery,
            non_blocking,
        }
    }

    #[test]
    fn reply_timeout_follows_blocking_mode() {
        assert_eq!(
            options(Delivery::Confirmed, false).reply_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(
            options(Delivery::Confirmed, true).reply_timeout(),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn only_writes_are_buffered() {
        let buffered = options(Delivery::Buffered, true);
        let set = Request::Store {
            mode: StoreMode::Set,
            key: "k".into(),
            value: Bytes::from_static(b"v"),
            flags: 0,
            exptime: 0,
        };
        assert!(buffered.buffers(&set));
        assert!(buffered.buffers(&Request::Delete { key: "k".into() }));
        assert!(!buffered.buffers(&Request::Get {
            keys: vec!["k".into()]
        }));
        assert!(!buffered.buffers(&Request::Incr {
            key: "k".into(),
            delta: 1
        }));
        assert!(!options(Delivery::Confirmed, false).buffers(&set));

        let cas = Request::Store {
            mode: StoreMode::Cas { unique: 7 },
            key: "k".into(),
            value: Bytes::from_static(b"v"),
            flags: 0,
            exptime: 0,
        };
        assert!(!cas.is_bufferable());
        assert!(!buffered.buffers(&cas));
    }

    #[test]
    fn request_key() {
        assert_eq!(
            Request::Gets {
                keys: vec!["a".into(), "b".into()]
            }
            .key(),
            "a"
        );
        assert_eq!(Request::Stats.key(), "");
    }
}
