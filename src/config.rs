//! Client configuration.
//!
//! [`Config`] mirrors the option names other memcached clients use so that
//! existing configuration carries over. It is validated and resolved once, at
//! construction, into [`Settings`]; nothing re-reads the option bag per call.
//!
//! Timeout precedence: `connect_timeout`, `poll_timeout` and `rcv_timeout`
//! each win over the combined `timeout`, which wins over the built-in default.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::distribution::{DeadServers, Distribution};
use crate::error::{Error, Result};
use crate::failure::EjectPolicy;
use crate::hash::HashKind;
use crate::key;
use crate::transport::{Delivery, Timeouts};

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 4.0;

/// Default poll timeout in seconds.
pub const DEFAULT_POLL_TIMEOUT: f64 = 0.25;

/// Default receive timeout in seconds.
pub const DEFAULT_RCV_TIMEOUT: f64 = 0.25;

/// Default `retry_timeout` in seconds.
pub const DEFAULT_RETRY_TIMEOUT: f64 = 30.0;

/// Default expiry in seconds (one week).
pub const DEFAULT_TTL: u32 = 604_800;

/// Client options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Namespace prepended to every key on the wire.
    pub prefix_key: Option<String>,
    pub hash: HashKind,
    pub distribution: Distribution,
    /// Give servers ring points in proportion to their weight.
    pub ketama_weighted: bool,
    /// Include `prefix_key` in the routing hash.
    pub hash_with_prefix_key: bool,
    pub dead_servers: DeadServers,
    pub auto_eject_hosts: bool,
    /// Consecutive failures that eject a server. Must be at least 1 when set.
    pub server_failure_limit: Option<u32>,
    /// Seconds an ejected server waits before it is probed.
    pub retry_timeout: f64,
    /// Sort servers by address before assigning indices.
    pub sort_hosts: bool,
    /// Return from writes once the request is queued on the socket.
    pub no_block: bool,
    /// Same as `no_block` for writes.
    pub buffer_requests: bool,
    pub support_cas: bool,
    /// Expiry applied when an operation does not specify one. 0 never expires.
    pub default_ttl: u32,
    /// Seconds; applies to connect, poll and receive unless overridden.
    pub timeout: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub poll_timeout: Option<f64>,
    pub rcv_timeout: Option<f64>,
    /// Use datagrams instead of a stream connection.
    pub udp: bool,
    /// Log a backtrace whenever an error is returned.
    pub show_backtraces: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix_key: None,
            hash: HashKind::default(),
            distribution: Distribution::default(),
            ketama_weighted: true,
            hash_with_prefix_key: false,
            dead_servers: DeadServers::default(),
            auto_eject_hosts: false,
            server_failure_limit: None,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            sort_hosts: false,
            no_block: false,
            buffer_requests: false,
            support_cas: false,
            default_ttl: DEFAULT_TTL,
            timeout: None,
            connect_timeout: None,
            poll_timeout: None,
            rcv_timeout: None,
            udp: false,
            show_backtraces: false,
        }
    }
}

impl Config {
    /// Validate the options and resolve them into [`Settings`].
    pub fn resolve(&self) -> Result<Settings> {
        let prefix = self.prefix_key.clone().unwrap_or_default();
        key::validate_prefix(&prefix)?;

        if self.sort_hosts && self.distribution == Distribution::Consistent {
            return Err(Error::Config(
                "sort_hosts cannot be combined with consistent distribution".into(),
            ));
        }

        let failure_limit = match self.server_failure_limit {
            Some(0) => {
                return Err(Error::Config("server_failure_limit must be at least 1".into()));
            }
            Some(limit) => limit,
            None if self.auto_eject_hosts => {
                return Err(Error::Config(
                    "auto_eject_hosts requires server_failure_limit".into(),
                ));
            }
            None => 0,
        };

        if !self.retry_timeout.is_finite() || self.retry_timeout < 0.0 {
            return Err(Error::Config(format!(
                "retry_timeout must be a non-negative number of seconds, got {}",
                self.retry_timeout
            )));
        }
        let retry_timeout = seconds("retry_timeout", self.retry_timeout)?;

        let timeouts = Timeouts {
            connect: self.timeout_for(
                "connect_timeout",
                self.connect_timeout,
                DEFAULT_CONNECT_TIMEOUT,
            )?,
            poll: self.timeout_for("poll_timeout", self.poll_timeout, DEFAULT_POLL_TIMEOUT)?,
            receive: self.timeout_for("rcv_timeout", self.rcv_timeout, DEFAULT_RCV_TIMEOUT)?,
        };

        let delivery = if self.no_block || self.buffer_requests {
            Delivery::Buffered
        } else {
            Delivery::Confirmed
        };

        Ok(Settings {
            prefix,
            hash: self.hash,
            distribution: self.distribution,
            ketama_weighted: self.ketama_weighted,
            hash_with_prefix_key: self.hash_with_prefix_key,
            dead_servers: self.dead_servers,
            eject: EjectPolicy {
                auto_eject: self.auto_eject_hosts,
                failure_limit,
                retry_timeout,
            },
            sort_hosts: self.sort_hosts,
            delivery,
            non_blocking: self.no_block,
            support_cas: self.support_cas,
            default_ttl: self.default_ttl,
            timeouts,
            udp: self.udp,
            show_backtraces: self.show_backtraces,
        })
    }

    fn timeout_for(&self, name: &str, specific: Option<f64>, default: f64) -> Result<Duration> {
        let (name, secs) = match (specific, self.timeout) {
            (Some(secs), _) => (name, secs),
            (None, Some(secs)) => ("timeout", secs),
            (None, None) => (name, default),
        };
        if !secs.is_finite() || secs <= 0.0 {
            return Err(Error::Config(format!(
                "{name} must be a positive number of seconds, got {secs}"
            )));
        }
        seconds(name, secs)
    }
}

fn seconds(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("{name} of {secs} seconds is out of range: {e}")))
}

/// Options resolved at construction. Shared, read-only, by a client and its clones.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Empty when no prefix is configured.
    pub prefix: String,
    pub hash: HashKind,
    pub distribution: Distribution,
    pub ketama_weighted: bool,
    pub hash_with_prefix_key: bool,
    pub dead_servers: DeadServers,
    pub eject: EjectPolicy,
    pub sort_hosts: bool,
    /// Delivery for writes.
    pub delivery: Delivery,
    pub non_blocking: bool,
    pub support_cas: bool,
    pub default_ttl: u32,
    pub timeouts: Timeouts,
    pub udp: bool,
    pub show_backtraces: bool,
}

/// A client definition loaded from a TOML file.
///
/// ```toml
/// servers = ["cache-1:11211", "cache-2:11211:2"]
///
/// [client]
/// distribution = "consistent"
/// auto_eject_hosts = true
/// server_failure_limit = 2
///
/// [logging]
/// level = "debug"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFile {
    pub servers: Vec<String>,

    #[serde(default)]
    pub client: Config,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientFile {
    /// Load a client definition from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}
