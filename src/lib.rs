//! Client for a cluster of memcached servers.
//!
//! Keys are spread over a pool of independent servers with either modula or
//! consistent (ketama) hashing. Servers that keep failing can be ejected from
//! routing and are retried after a timeout, so a dead server degrades the
//! cluster instead of taking the application down with it.
//!
//! # Example
//!
//! ```no_run
//! use crucible_memcache::{Client, Config, Distribution};
//!
//! # fn example() -> Result<(), crucible_memcache::Error> {
//! let mut client = Client::connect(
//!     &["cache-1:11211", "cache-2:11211:2"],
//!     &Config {
//!         distribution: Distribution::Consistent,
//!         auto_eject_hosts: true,
//!         server_failure_limit: Some(2),
//!         ..Default::default()
//!     },
//! )?;
//!
//! client.set("greeting", "hello", None)?;
//! let value: String = client.get("greeting")?;
//! assert_eq!(value, "hello");
//!
//! client.delete("greeting")?;
//! # Ok(())
//! # }
//! ```

mod cas;
mod client;
pub mod codec;
pub mod config;
pub mod continuum;
pub mod distribution;
mod error;
pub mod failure;
pub mod hash;
pub mod key;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod server;
mod stats;
pub mod transport;

pub use client::{Ack, Client};
pub use codec::{Codec, JsonCodec};
pub use config::{ClientFile, Config, LoggingConfig, Settings};
pub use distribution::{DeadServers, Distribution};
pub use error::{Error, KeyProblem, Phase, Result, ServerFailure};
pub use failure::Health;
pub use hash::HashKind;
pub use server::ServerSpec;
pub use stats::{StatValue, Stats};
pub use transport::memory::{Fault, MemoryCluster, MemoryTransport};
pub use transport::socket::SocketTransport;
pub use transport::Transport;
