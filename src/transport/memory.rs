//! In-process cluster.
//!
//! [`MemoryCluster`] simulates a set of memcached servers addressed by
//! `host:port`, with the storage semantics of the real server: conditional
//! stores, CAS tokens, numeric incr/decr, expiry and the item size limit.
//! Servers can be stopped, started and made to misbehave, which is what the
//! failover tests are built on.
//!
//! A [`MemoryTransport`] is one client's view of the cluster. It tracks which
//! servers it holds a connection to, so forked transports start disconnected.

use ahash::{AHashMap, AHashSet};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::{CallOptions, Item, Reply, Request, StoreMode, Transport, TransportError};
use crate::error::Phase;
use crate::server::ServerSpec;

/// Largest value a server accepts.
pub const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Expiry values above this are absolute unix times.
const RELATIVE_EXPIRY_LIMIT: u32 = 60 * 60 * 24 * 30;

/// Injected misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connections are refused.
    Refuse,
    /// Requests are accepted but never answered.
    Hang,
}

/// A stored entry as seen by tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Bytes,
    pub flags: u32,
    pub exptime: u32,
    pub cas: u64,
}

#[derive(Debug)]
struct Entry {
    stored: StoredEntry,
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct MemoryServer {
    entries: AHashMap<String, Entry>,
    fault: Option<Fault>,
    requests: u64,
    connects: u64,
    next_cas: u64,
    total_items: u64,
    cmd_get: u64,
    get_hits: u64,
    get_misses: u64,
    started: Option<Instant>,
}

impl MemoryServer {
    fn started() -> Self {
        Self {
            started: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(now))
    }

    fn exists(&self, key: &str, now: Instant) -> bool {
        self.live(key, now).is_some()
    }

    fn put(&mut self, key: &str, value: Bytes, flags: u32, exptime: u32, now: Instant) {
        self.next_cas += 1;
        self.total_items += 1;
        self.entries.insert(
            key.to_string(),
            Entry {
                stored: StoredEntry {
                    value,
                    flags,
                    exptime,
                    cas: self.next_cas,
                },
                expires: expiry(exptime, now),
            },
        );
    }

    fn execute(&mut self, request: &Request) -> Reply {
        let now = Instant::now();
        match request {
            Request::Get { keys } | Request::Gets { keys } => {
                let mut items = Vec::new();
                for key in keys {
                    self.cmd_get += 1;
                    match self.live(key, now) {
                        Some(entry) => {
                            items.push(Item {
                                key: key.clone(),
                                value: entry.stored.value.clone(),
                                flags: entry.stored.flags,
                                cas: entry.stored.cas,
                            });
                            self.get_hits += 1;
                        }
                        None => self.get_misses += 1,
                    }
                }
                Reply::Values(items)
            }
            Request::Store {
                mode,
                key,
                value,
                flags,
                exptime,
            } => self.store(*mode, key, value, *flags, *exptime, now),
            Request::Delete { key } => {
                if self.exists(key, now) {
                    self.entries.remove(key);
                    Reply::Deleted
                } else {
                    Reply::NotFound
                }
            }
            Request::Incr { key, delta } => self.arithmetic(key, now, |v| v.wrapping_add(*delta)),
            Request::Decr { key, delta } => self.arithmetic(key, now, |v| v.saturating_sub(*delta)),
            Request::Flush { delay } => {
                if *delay == 0 {
                    self.entries.clear();
                } else {
                    let at = now + Duration::from_secs(u64::from(*delay));
                    for entry in self.entries.values_mut() {
                        entry.expires = Some(entry.expires.map_or(at, |e| e.min(at)));
                    }
                }
                Reply::Ok
            }
            Request::Stats => self.stats(now),
        }
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &Bytes,
        flags: u32,
        exptime: u32,
        now: Instant,
    ) -> Reply {
        let existing = self.live(key, now);
        let combined_len = match (mode, existing) {
            (StoreMode::Append | StoreMode::Prepend, Some(e)) => e.stored.value.len() + value.len(),
            _ => value.len(),
        };
        if combined_len > MAX_ITEM_SIZE {
            return Reply::ServerError("object too large for cache".into());
        }

        match (mode, existing) {
            (StoreMode::Set, _) | (StoreMode::Add, None) | (StoreMode::Replace, Some(_)) => {
                self.put(key, value.clone(), flags, exptime, now);
                Reply::Stored
            }
            (StoreMode::Add, Some(_))
            | (StoreMode::Replace, None)
            | (StoreMode::Append | StoreMode::Prepend, None) => Reply::NotStored,
            (StoreMode::Append | StoreMode::Prepend, Some(entry)) => {
                let mut joined = BytesMut::with_capacity(combined_len);
                if mode == StoreMode::Append {
                    joined.extend_from_slice(&entry.stored.value);
                    joined.extend_from_slice(value);
                } else {
                    joined.extend_from_slice(value);
                    joined.extend_from_slice(&entry.stored.value);
                }
                let (flags, exptime) = (entry.stored.flags, entry.stored.exptime);
                self.put(key, joined.freeze(), flags, exptime, now);
                Reply::Stored
            }
            (StoreMode::Cas { .. }, None) => Reply::NotFound,
            (StoreMode::Cas { unique }, Some(entry)) => {
                if entry.stored.cas != unique {
                    Reply::Exists
                } else {
                    self.put(key, value.clone(), flags, exptime, now);
                    Reply::Stored
                }
            }
        }
    }

    fn arithmetic(&mut self, key: &str, now: Instant, op: impl Fn(u64) -> u64) -> Reply {
        let Some(entry) = self.live(key, now) else {
            return Reply::NotFound;
        };
        let current = std::str::from_utf8(&entry.stored.value)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        let Some(current) = current else {
            return Reply::ClientError("cannot increment or decrement non-numeric value".into());
        };
        let next = op(current);
        let (flags, exptime) = (entry.stored.flags, entry.stored.exptime);
        self.put(key, Bytes::from(next.to_string()), flags, exptime, now);
        Reply::Numeric(next)
    }

    fn stats(&self, now: Instant) -> Reply {
        let uptime = self
            .started
            .map(|s| now.saturating_duration_since(s).as_secs())
            .unwrap_or_default();
        let curr_items = self.entries.values().filter(|e| e.is_live(now)).count();
        Reply::Stats(vec![
            ("pid".into(), std::process::id().to_string()),
            ("uptime".into(), uptime.to_string()),
            ("version".into(), "memory".into()),
            ("curr_items".into(), curr_items.to_string()),
            ("total_items".into(), self.total_items.to_string()),
            ("cmd_get".into(), self.cmd_get.to_string()),
            ("get_hits".into(), self.get_hits.to_string()),
            ("get_misses".into(), self.get_misses.to_string()),
        ])
    }
}

fn expiry(exptime: u32, now: Instant) -> Option<Instant> {
    match exptime {
        0 => None,
        secs if secs <= RELATIVE_EXPIRY_LIMIT => Some(now + Duration::from_secs(u64::from(secs))),
        at => {
            let unix_now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Some(now + Duration::from_secs(u64::from(at).saturating_sub(unix_now)))
        }
    }
}

/// A simulated cluster shared by any number of transports.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    servers: Arc<Mutex<AHashMap<String, MemoryServer>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster with a running server for each address.
    pub fn with_servers<S: AsRef<str>>(addresses: &[S]) -> Self {
        let cluster = Self::new();
        for address in addresses {
            cluster.start(address.as_ref());
        }
        cluster
    }

    /// Start a server. A server that is already running is left alone.
    pub fn start(&self, address: &str) {
        self.servers
            .lock()
            .entry(address.to_string())
            .or_insert_with(MemoryServer::started);
    }

    /// Stop a server, discarding its data. Connections to it are refused.
    pub fn stop(&self, address: &str) {
        self.servers.lock().remove(address);
    }

    pub fn fail(&self, address: &str, fault: Fault) {
        if let Some(server) = self.servers.lock().get_mut(address) {
            server.fault = Some(fault);
        }
    }

    pub fn heal(&self, address: &str) {
        if let Some(server) = self.servers.lock().get_mut(address) {
            server.fault = None;
        }
    }

    /// Requests that reached `address`, failed ones included.
    pub fn requests(&self, address: &str) -> u64 {
        self.servers
            .lock()
            .get(address)
            .map(|s| s.requests)
            .unwrap_or_default()
    }

    /// Requests that reached any server.
    pub fn total_requests(&self) -> u64 {
        self.servers.lock().values().map(|s| s.requests).sum()
    }

    /// Connections opened to `address`.
    pub fn connects(&self, address: &str) -> u64 {
        self.servers
            .lock()
            .get(address)
            .map(|s| s.connects)
            .unwrap_or_default()
    }

    /// The live entry stored under the wire key `key` on `address`.
    pub fn entry(&self, address: &str, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        self.servers
            .lock()
            .get(address)
            .and_then(|s| s.live(key, now))
            .map(|e| e.stored.clone())
    }

    /// Number of live entries on `address`.
    pub fn len(&self, address: &str) -> usize {
        let now = Instant::now();
        self.servers
            .lock()
            .get(address)
            .map(|s| s.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or_default()
    }

    /// Where the wire key `key` is stored, if anywhere.
    pub fn locate(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.servers
            .lock()
            .iter()
            .find(|(_, s)| s.exists(key, now))
            .map(|(address, _)| address.clone())
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            cluster: self.clone(),
            connected: AHashSet::new(),
        }
    }
}

/// One client's connections into a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemoryTransport {
    cluster: MemoryCluster,
    connected: AHashSet<String>,
}

impl MemoryTransport {
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connected.contains(address)
    }

    pub fn connections(&self) -> usize {
        self.connected.len()
    }
}

impl Transport for MemoryTransport {
    fn execute(
        &mut self,
        server: &ServerSpec,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Reply, TransportError> {
        let address = server.address();
        let mut servers = self.cluster.servers.lock();

        let Some(state) = servers.get_mut(&address) else {
            self.connected.remove(&address);
            return Err(TransportError::Connect(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            )));
        };

        state.requests += 1;
        match state.fault {
            Some(Fault::Refuse) => {
                self.connected.remove(&address);
                return Err(TransportError::Connect(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                )));
            }
            Some(Fault::Hang) => {
                if !self.connected.contains(&address) {
                    state.connects += 1;
                    self.connected.insert(address);
                }
                return Err(TransportError::Timeout(Phase::Receive));
            }
            None => {}
        }

        if self.connected.insert(address) {
            state.connects += 1;
        }

        let reply = state.execute(request);
        if options.buffers(request) {
            Ok(Reply::Buffered)
        } else {
            Ok(reply)
        }
    }

    fn disconnect(&mut self, server: &ServerSpec) {
        self.connected.remove(&server.address());
    }

    fn disconnect_all(&mut self) {
        self.connected.clear();
    }

    fn fork(&self) -> Self {
        self.cluster.transport()
    }
}
