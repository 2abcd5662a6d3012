//! Server addresses and weights.
//!
//! A server is written as `host[:port[:weight]]`. The port defaults to 11211
//! and the weight to 1.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Default memcached port.
pub const DEFAULT_PORT: u16 = 11211;

/// Default server weight.
pub const DEFAULT_WEIGHT: u32 = 1;

/// One configured cache server. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerSpec {
    hostname: String,
    port: u16,
    weight: u32,
}

impl ServerSpec {
    /// Create a spec, validating the hostname and weight.
    pub fn new(hostname: impl Into<String>, port: u16, weight: u32) -> Result<Self, Error> {
        let hostname = hostname.into();
        if hostname.is_empty() {
            return Err(Error::Config("server hostname is empty".into()));
        }
        if hostname.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::Config(format!(
                "server hostname {hostname:?} contains whitespace"
            )));
        }
        if port == 0 {
            return Err(Error::Config(format!("server {hostname} has port 0")));
        }
        if weight == 0 {
            return Err(Error::Config(format!("server {hostname} has weight 0")));
        }
        Ok(Self {
            hostname,
            port,
            weight,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The `host:port` address used in messages and as the connection key.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Seed for the `index`th continuum point of this server.
    ///
    /// The port is omitted for servers on the default port.
    pub(crate) fn point_seed(&self, index: u32) -> String {
        if self.port == DEFAULT_PORT {
            format!("{}-{}", self.hostname, index)
        } else {
            format!("{}:{}-{}", self.hostname, self.port, index)
        }
    }
}

impl FromStr for ServerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        // split always yields at least one item
        let hostname = parts.next().unwrap_or_default();

        let port = match parts.next() {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in server {s:?}")))?,
            None => DEFAULT_PORT,
        };

        let weight = match parts.next() {
            Some(w) => w
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid weight in server {s:?}")))?,
            None => DEFAULT_WEIGHT,
        };

        if parts.next().is_some() {
            return Err(Error::Config(format!("too many fields in server {s:?}")));
        }

        Self::new(hostname, port, weight)
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> (String, u16, u32) {
        let spec: ServerSpec = s.parse().unwrap();
        (spec.hostname().to_string(), spec.port(), spec.weight())
    }

    #[test]
    fn parses_host_port_weight() {
        assert_eq!(parse("localhost:43042:2"), ("localhost".into(), 43042, 2));
        assert_eq!(parse("localhost:43043:10"), ("localhost".into(), 43043, 10));
    }

    #[test]
    fn defaults() {
        assert_eq!(parse("localhost"), ("localhost".into(), 11211, 1));
        assert_eq!(parse("127.0.0.1:43042"), ("127.0.0.1".into(), 43042, 1));
    }

    #[test]
    fn hostname_only_list() {
        for i in 1..=8 {
            let host = format!("app-cache-{i:02}");
            assert_eq!(parse(&host), (host.clone(), 11211, 1));
        }
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            ":43042",
            "localhost:memcached",
            "local host:43043:1",
            "localhost:43042:heavy",
            "localhost:43042:0",
            "localhost:99999",
            "localhost:1:2:3",
            "",
        ] {
            assert!(
                matches!(bad.parse::<ServerSpec>(), Err(Error::Config(_))),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn display_is_address() {
        let spec: ServerSpec = "cache-1:11311:4".parse().unwrap();
        assert_eq!(spec.to_string(), "cache-1:11311");
        assert_eq!(spec.address(), "cache-1:11311");
    }

    #[test]
    fn point_seed_omits_default_port() {
        let a: ServerSpec = "cache-1".parse().unwrap();
        let b: ServerSpec = "cache-1:11311".parse().unwrap();
        assert_eq!(a.point_seed(3), "cache-1-3");
        assert_eq!(b.point_seed(3), "cache-1:11311-3");
    }
}
