//! Client metrics.

use metriken::{Counter, metric};

/// Requests sent to servers.
#[metric(name = "memcache_client_requests")]
pub static REQUESTS: Counter = Counter::new();

/// Keys found by get operations.
#[metric(name = "memcache_client_get_hits")]
pub static GET_HITS: Counter = Counter::new();

/// Keys missing from get operations.
#[metric(name = "memcache_client_get_misses")]
pub static GET_MISSES: Counter = Counter::new();

/// Requests that failed to get an answer from a server.
#[metric(name = "memcache_client_transport_failures")]
pub static TRANSPORT_FAILURES: Counter = Counter::new();

/// Servers ejected from routing.
#[metric(name = "memcache_client_ejections")]
pub static EJECTIONS: Counter = Counter::new();

/// Ejected servers restored by a successful probe.
#[metric(name = "memcache_client_restorations")]
pub static RESTORATIONS: Counter = Counter::new();

/// Continuum rebuilds after a membership change.
#[metric(name = "memcache_client_continuum_rebuilds")]
pub static CONTINUUM_REBUILDS: Counter = Counter::new();
