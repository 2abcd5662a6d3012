//! Server pool.
//!
//! The pool owns the server list, the per-server health records and, for
//! consistent distribution, the continuum. Server indices are assigned once
//! at construction and never change.
//!
//! With dead-server-aware consistent distribution the continuum always
//! reflects the routable servers: whenever a server is ejected, or becomes
//! due for a probe, a new continuum is built and swapped in. Clones keep
//! whichever continuum was current when they were made.

use ahash::AHashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::config::Settings;
use crate::continuum::Continuum;
use crate::distribution::{self, DeadServers, Distribution, PoolView, RouteError};
use crate::error::{Error, Result};
use crate::failure::{FailureTracker, Health, Transition};
use crate::metrics;
use crate::server::ServerSpec;

#[derive(Debug, Clone)]
pub struct ServerPool {
    servers: Arc<[ServerSpec]>,
    tracker: FailureTracker,
    continuum: Option<Arc<Continuum>>,
    settings: Arc<Settings>,
}

impl ServerPool {
    pub fn new(mut servers: Vec<ServerSpec>, settings: Arc<Settings>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::Config("no servers configured".into()));
        }

        let mut seen = AHashSet::with_capacity(servers.len());
        for server in &servers {
            if !seen.insert(server.address()) {
                return Err(Error::Config(format!("duplicate server {server}")));
            }
        }

        if settings.sort_hosts {
            servers.sort_by_key(|s| s.to_string());
        }

        let continuum = (settings.distribution == Distribution::Consistent).then(|| {
            Arc::new(Continuum::build(
                &servers,
                &vec![true; servers.len()],
                settings.ketama_weighted,
                settings.hash,
            ))
        });

        Ok(Self {
            tracker: FailureTracker::new(servers.len(), settings.eject),
            servers: servers.into(),
            continuum,
            settings,
        })
    }

    pub fn servers(&self) -> &[ServerSpec] {
        &self.servers
    }

    /// Shared handle to the server list.
    pub fn specs(&self) -> Arc<[ServerSpec]> {
        self.servers.clone()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn continuum(&self) -> Option<&Continuum> {
        self.continuum.as_deref()
    }

    /// The hash a key is routed by.
    pub fn key_hash(&self, key: &str) -> u32 {
        match self.settings.distribution {
            Distribution::Random => rand::random(),
            _ if self.settings.hash_with_prefix_key && !self.settings.prefix.is_empty() => {
                let mut input = Vec::with_capacity(self.settings.prefix.len() + key.len());
                input.extend_from_slice(self.settings.prefix.as_bytes());
                input.extend_from_slice(key.as_bytes());
                self.settings.hash.hash(&input)
            }
            _ => self.settings.hash.hash(key.as_bytes()),
        }
    }

    /// Index of the server `key` should be sent to.
    pub fn route(&mut self, key: &str, now: Instant) -> std::result::Result<usize, RouteError> {
        let hash = self.key_hash(key);
        let live = self.routable(now);
        distribution::route(
            self.settings.distribution,
            self.settings.dead_servers,
            hash,
            PoolView {
                live: &live,
                continuum: self.continuum.as_deref(),
            },
        )
    }

    /// Routable servers in the order they would be tried for `key`.
    pub fn candidates(&mut self, key: &str, now: Instant) -> Vec<usize> {
        let hash = self.key_hash(key);
        let live = self.routable(now);
        distribution::candidates(
            self.settings.distribution,
            self.settings.dead_servers,
            hash,
            PoolView {
                live: &live,
                continuum: self.continuum.as_deref(),
            },
        )
    }

    /// Routability of every server, rebuilding the continuum first if the
    /// routable set no longer matches it.
    pub fn routable(&mut self, now: Instant) -> Vec<bool> {
        let live = self.tracker.routable(now);
        if self.settings.dead_servers == DeadServers::Aware {
            self.refresh_continuum(&live);
        }
        live
    }

    fn refresh_continuum(&mut self, live: &[bool]) {
        let Some(current) = &self.continuum else {
            return;
        };
        if current.members() == live {
            return;
        }
        let rebuilt = Continuum::build(
            &self.servers,
            live,
            self.settings.ketama_weighted,
            self.settings.hash,
        );
        debug!(
            points = rebuilt.len(),
            servers = live.iter().filter(|l| **l).count(),
            "rebuilt continuum"
        );
        metrics::CONTINUUM_REBUILDS.increment();
        self.continuum = Some(Arc::new(rebuilt));
    }

    pub fn health(&self, index: usize, now: Instant) -> Health {
        self.tracker.health(index, now)
    }

    pub fn failures(&self, index: usize) -> u32 {
        self.tracker.state(index).consecutive_failures
    }

    pub fn record_success(&mut self, index: usize) -> Transition {
        self.tracker.record_success(index)
    }

    pub fn record_failure(&mut self, index: usize, now: Instant) -> Transition {
        self.tracker.record_failure(index, now)
    }

    pub fn reset_health(&mut self) {
        self.tracker.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn specs(list: &[&str]) -> Vec<ServerSpec> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn pool(list: &[&str], config: Config) -> ServerPool {
        ServerPool::new(specs(list), Arc::new(config.resolve().unwrap())).unwrap()
    }

    fn ejecting(distribution: Distribution) -> Config {
        Config {
            distribution,
            auto_eject_hosts: true,
            server_failure_limit: Some(1),
            retry_timeout: 60.0,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_empty_and_duplicates() {
        let settings = Arc::new(Config::default().resolve().unwrap());
        assert!(matches!(
            ServerPool::new(vec![], settings.clone()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerPool::new(specs(&["a:1", "b:1", "a:1:5"]), settings),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn preserves_order_unless_sorted() {
        let list = ["c:1", "a:1", "b:1"];
        let unsorted = pool(&list, Config::default());
        let order: Vec<String> = unsorted.servers().iter().map(|s| s.to_string()).collect();
        assert_eq!(order, ["c:1", "a:1", "b:1"]);

        let sorted = pool(
            &list,
            Config {
                sort_hosts: true,
                distribution: Distribution::Modula,
                ..Default::default()
            },
        );
        let order: Vec<String> = sorted.servers().iter().map(|s| s.to_string()).collect();
        assert_eq!(order, ["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn hash_ignores_prefix_by_default() {
        let plain = pool(&["a", "b"], Config::default());
        let prefixed = pool(
            &["a", "b"],
            Config {
                prefix_key: Some("ns:".into()),
                ..Default::default()
            },
        );
        let hashed = pool(
            &["a", "b"],
            Config {
                prefix_key: Some("ns:".into()),
                hash_with_prefix_key: true,
                ..Default::default()
            },
        );
        assert_eq!(plain.key_hash("k"), prefixed.key_hash("k"));
        assert_eq!(hashed.key_hash("k"), plain.key_hash("ns:k"));
    }

    #[test]
    fn aware_mode_rebuilds_on_ejection() {
        let now = Instant::now();
        let mut p = pool(&["a", "b", "c"], ejecting(Distribution::Consistent));
        assert_eq!(p.continuum().unwrap().len(), 480);

        p.record_failure(1, now);
        assert_eq!(p.routable(now), vec![true, false, true]);
        assert_eq!(p.continuum().unwrap().len(), 320);
        assert_eq!(p.continuum().unwrap().members(), &[true, false, true]);

        p.record_success(1);
        p.routable(now);
        assert_eq!(p.continuum().unwrap().len(), 480);
    }

    #[test]
    fn transparent_mode_keeps_continuum() {
        let now = Instant::now();
        let mut p = pool(
            &["a", "b", "c"],
            Config {
                dead_servers: DeadServers::Transparent,
                ..ejecting(Distribution::Consistent)
            },
        );
        p.record_failure(1, now);
        assert_eq!(p.routable(now), vec![true, false, true]);
        assert_eq!(p.continuum().unwrap().len(), 480);
        for i in 0..50 {
            assert_ne!(p.route(&format!("key{i}"), now), Ok(1));
        }
    }

    #[test]
    fn probe_due_server_rejoins_routing() {
        let start = Instant::now();
        let mut p = pool(
            &["a", "b"],
            Config {
                retry_timeout: 1.0,
                ..ejecting(Distribution::Modula)
            },
        );
        p.record_failure(0, start);
        for i in 0..20 {
            assert_eq!(p.route(&format!("k{i}"), start), Ok(1));
        }
        let later = start + Duration::from_secs(1);
        assert_eq!(p.health(0, later), Health::ProbeDue);
        assert_eq!(p.routable(later), vec![true, true]);
    }

    #[test]
    fn candidates_are_distinct() {
        let now = Instant::now();
        let mut p = pool(&["a", "b", "c", "d"], Config::default());
        let list = p.candidates("some-key", now);
        assert_eq!(list.len(), 4);
        assert_eq!(Ok(list[0]), p.route("some-key", now));
    }
}
