//! The cluster client.
//!
//! Every keyed operation follows the same path: validate the key, route it to
//! a server, execute the request over the transport, then turn the reply into
//! a value or one of the [`Error`] kinds. A transport failure is recorded
//! against the server before it is returned, which is what drives ejection;
//! nothing is retried within a call.

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, Codec, JsonCodec, MARSHALLED_FLAG};
use crate::config::{ClientFile, Config, Settings};
use crate::distribution::RouteError;
use crate::error::{Error, Phase, Result, ServerFailure};
use crate::failure::{Health, Transition};
use crate::key;
use crate::metrics;
use crate::pool::ServerPool;
use crate::server::ServerSpec;
use crate::stats::Stats;
use crate::transport::socket::SocketTransport;
use crate::transport::{CallOptions, Item, Reply, Request, StoreMode, Transport, TransportError};

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The server acknowledged the write.
    Confirmed,
    /// The write was queued without waiting for the server. Conditional
    /// failures such as `NotStored` are not reported in this mode.
    Buffered,
}

impl Ack {
    pub fn is_confirmed(&self) -> bool {
        *self == Ack::Confirmed
    }
}

/// A client for a pool of memcached servers.
///
/// A client is not meant to be shared between threads; clone it instead.
/// Clones share the configuration and start with their own connections.
pub struct Client<T: Transport = SocketTransport, C: Codec = JsonCodec> {
    settings: Arc<Settings>,
    pool: ServerPool,
    transport: T,
    codec: C,
}

impl Client<SocketTransport> {
    /// Build a client that talks to the servers over sockets.
    ///
    /// Connections are opened on first use, so this does no I/O.
    pub fn connect<S: AsRef<str>>(servers: &[S], config: &Config) -> Result<Self> {
        Self::new(servers, config, SocketTransport::new(config.udp))
    }

    /// Build a socket client from a loaded client file.
    pub fn from_file(file: &ClientFile) -> Result<Self> {
        Self::connect(&file.servers, &file.client)
    }
}

impl<T: Transport> Client<T, JsonCodec> {
    /// Build a client over `transport`.
    ///
    /// Servers are written `host[:port[:weight]]`. Fails with
    /// [`Error::Config`] if a server or an option is invalid.
    pub fn new<S: AsRef<str>>(servers: &[S], config: &Config, transport: T) -> Result<Self> {
        let settings = Arc::new(config.resolve()?);
        let specs = servers
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<ServerSpec>>>()?;
        let pool = ServerPool::new(specs, settings.clone())?;

        debug!(
            servers = pool.len(),
            distribution = ?settings.distribution,
            hash = ?settings.hash,
            "client created"
        );

        Ok(Self {
            settings,
            pool,
            transport,
            codec: JsonCodec,
        })
    }
}

impl<T: Transport, C: Codec> Client<T, C> {
    /// Replace the codec used by marshalled operations.
    pub fn with_codec<D: Codec>(self, codec: D) -> Client<T, D> {
        Client {
            settings: self.settings,
            pool: self.pool,
            transport: self.transport,
            codec,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Configured servers as `host:port`, in pool order.
    pub fn servers(&self) -> Vec<String> {
        self.pool.servers().iter().map(ServerSpec::address).collect()
    }

    /// Health of each server, in pool order.
    pub fn health(&self) -> Vec<Health> {
        let now = Instant::now();
        (0..self.pool.len())
            .map(|i| self.pool.health(i, now))
            .collect()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The server `key` would currently be sent to.
    pub fn server_for(&mut self, key: &str) -> Result<String> {
        self.check_key(key)?;
        let index = self.route(key)?;
        Ok(self.pool.servers()[index].address())
    }

    /// Drop all connections and forget all failures.
    pub fn reset(&mut self) {
        self.transport.disconnect_all();
        self.pool.reset_health();
        debug!("client reset");
    }

    /// Fetch and decode the value stored under `key`.
    pub fn get<V: DeserializeOwned>(&mut self, key: &str) -> Result<V> {
        let result = self.fetch(key).and_then(|item| self.decode(key, item));
        self.finish(result)
    }

    /// Fetch the raw bytes stored under `key`.
    pub fn get_raw(&mut self, key: &str) -> Result<Bytes> {
        let result = self.fetch(key).and_then(|item| raw(key, item));
        self.finish(result)
    }

    /// Fetch several keys at once. Missing keys are left out of the result.
    ///
    /// Every key is validated before anything is sent. Keys are grouped by
    /// server and each server receives one request.
    pub fn get_multi<K: AsRef<str>, V: DeserializeOwned>(
        &mut self,
        keys: &[K],
    ) -> Result<HashMap<String, V>> {
        let result = self.fetch_multi(keys).and_then(|items| {
            items
                .into_iter()
                .map(|(key, item)| {
                    let value = self.decode(&key, item)?;
                    Ok((key, value))
                })
                .collect()
        });
        self.finish(result)
    }

    pub fn get_multi_raw<K: AsRef<str>>(&mut self, keys: &[K]) -> Result<HashMap<String, Bytes>> {
        let result = self.fetch_multi(keys).and_then(|items| {
            items
                .into_iter()
                .map(|(key, item)| {
                    let value = raw(&key, item)?;
                    Ok((key, value))
                })
                .collect()
        });
        self.finish(result)
    }

    /// Store `value` under `key`. `ttl` of `None` uses the configured default.
    pub fn set<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        let result = self.store_value(StoreMode::Set, key, value, ttl);
        self.finish(result)
    }

    pub fn set_raw(&mut self, key: &str, value: &[u8], ttl: Option<u32>) -> Result<Ack> {
        let result = self.store(StoreMode::Set, key, Bytes::copy_from_slice(value), 0, ttl);
        self.finish(result)
    }

    /// Store only if `key` does not exist yet.
    pub fn add<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        let result = self.store_value(StoreMode::Add, key, value, ttl);
        self.finish(result)
    }

    pub fn add_raw(&mut self, key: &str, value: &[u8], ttl: Option<u32>) -> Result<Ack> {
        let result = self.store(StoreMode::Add, key, Bytes::copy_from_slice(value), 0, ttl);
        self.finish(result)
    }

    /// Store only if `key` already exists.
    pub fn replace<V: Serialize + ?Sized>(
        &mut self,
        key: &str,
        value: &V,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        let result = self.store_value(StoreMode::Replace, key, value, ttl);
        self.finish(result)
    }

    pub fn replace_raw(&mut self, key: &str, value: &[u8], ttl: Option<u32>) -> Result<Ack> {
        let result = self.store(StoreMode::Replace, key, Bytes::copy_from_slice(value), 0, ttl);
        self.finish(result)
    }

    /// Append raw bytes to an existing value.
    pub fn append(&mut self, key: &str, value: &[u8]) -> Result<Ack> {
        let result = self.store(StoreMode::Append, key, Bytes::copy_from_slice(value), 0, None);
        self.finish(result)
    }

    /// Prepend raw bytes to an existing value.
    pub fn prepend(&mut self, key: &str, value: &[u8]) -> Result<Ack> {
        let result = self.store(StoreMode::Prepend, key, Bytes::copy_from_slice(value), 0, None);
        self.finish(result)
    }

    pub fn delete(&mut self, key: &str) -> Result<Ack> {
        let result = self.delete_key(key);
        self.finish(result)
    }

    /// Add 1 to a numeric value, returning the new value.
    pub fn increment(&mut self, key: &str) -> Result<u64> {
        self.increment_by(key, 1)
    }

    pub fn increment_by(&mut self, key: &str, offset: u64) -> Result<u64> {
        let result = self.arithmetic(key, offset, true);
        self.finish(result)
    }

    /// Subtract 1 from a numeric value. The value never drops below zero.
    pub fn decrement(&mut self, key: &str) -> Result<u64> {
        self.decrement_by(key, 1)
    }

    pub fn decrement_by(&mut self, key: &str, offset: u64) -> Result<u64> {
        let result = self.arithmetic(key, offset, false);
        self.finish(result)
    }

    /// Invalidate every entry on every routable server.
    pub fn flush(&mut self) -> Result<()> {
        let result = self.broadcast("flush", &Request::Flush { delay: 0 }).map(|_| ());
        self.finish(result)
    }

    /// Collect statistics from every routable server.
    ///
    /// Ejected servers keep their place in the result with absent values.
    pub fn stats(&mut self) -> Result<Stats> {
        let result = self.broadcast("stats", &Request::Stats).map(|replies| {
            let mut stats = Stats::new(self.servers());
            for (index, reply) in replies {
                if let Reply::Stats(reported) = reply {
                    stats.record(index, &reported);
                }
            }
            stats
        });
        self.finish(result)
    }

    fn fetch(&mut self, key: &str) -> Result<Item> {
        self.check_key(key)?;
        let index = self.route(key)?;
        let wire = self.wire_key(key);
        let request = Request::Get {
            keys: vec![wire.clone()],
        };
        match self.dispatch(index, key, &request)? {
            Reply::Values(items) => match items.into_iter().find(|item| item.key == wire) {
                Some(item) => {
                    metrics::GET_HITS.increment();
                    Ok(item)
                }
                None => {
                    metrics::GET_MISSES.increment();
                    Err(Error::NotFound {
                        key: key.to_string(),
                    })
                }
            },
            other => Err(self.unexpected(key, index, other)),
        }
    }

    fn fetch_multi<K: AsRef<str>>(&mut self, keys: &[K]) -> Result<Vec<(String, Item)>> {
        key::validate_all(keys, self.settings.prefix.len())?;

        let mut seen = AHashSet::with_capacity(keys.len());
        let mut order = Vec::new();
        let mut groups: AHashMap<usize, Vec<String>> = AHashMap::new();
        for key in keys {
            let key = key.as_ref();
            if !seen.insert(key) {
                continue;
            }
            let index = self.route(key)?;
            let group = groups.entry(index).or_default();
            if group.is_empty() {
                order.push(index);
            }
            group.push(self.wire_key(key));
        }

        let mut found = Vec::with_capacity(seen.len());
        for index in order {
            let Some(wire_keys) = groups.remove(&index) else {
                continue;
            };
            let first = self.logical_key(&wire_keys[0]).to_string();
            let requested = wire_keys.len();
            let request = Request::Get { keys: wire_keys };
            match self.dispatch(index, &first, &request)? {
                Reply::Values(items) => {
                    let hits = items.len();
                    for item in items {
                        let key = self.logical_key(&item.key).to_string();
                        found.push((key, item));
                    }
                    for _ in 0..hits {
                        metrics::GET_HITS.increment();
                    }
                    for _ in hits..requested {
                        metrics::GET_MISSES.increment();
                    }
                }
                other => return Err(self.unexpected(&first, index, other)),
            }
        }
        Ok(found)
    }

    fn store_value<V: Serialize + ?Sized>(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: &V,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        self.check_key(key)?;
        let bytes = self.encode(key, value)?;
        self.store(mode, key, bytes, MARSHALLED_FLAG, ttl)
    }

    fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: Bytes,
        flags: u32,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        self.check_key(key)?;
        let index = self.route(key)?;
        self.store_at(index, mode, key, value, flags, ttl)
    }

    /// Store on a server that was already chosen.
    pub(crate) fn store_at(
        &mut self,
        index: usize,
        mode: StoreMode,
        key: &str,
        value: Bytes,
        flags: u32,
        ttl: Option<u32>,
    ) -> Result<Ack> {
        let request = Request::Store {
            mode,
            key: self.wire_key(key),
            value,
            flags,
            exptime: ttl.unwrap_or(self.settings.default_ttl),
        };
        let key_owned = || key.to_string();
        match self.dispatch(index, key, &request)? {
            Reply::Stored => Ok(Ack::Confirmed),
            Reply::Buffered => Ok(Ack::Buffered),
            Reply::NotStored => Err(Error::NotStored { key: key_owned() }),
            Reply::Exists => Err(Error::ConnectionDataExists { key: key_owned() }),
            Reply::NotFound => Err(Error::NotFound { key: key_owned() }),
            other => Err(self.unexpected(key, index, other)),
        }
    }

    fn delete_key(&mut self, key: &str) -> Result<Ack> {
        self.check_key(key)?;
        let index = self.route(key)?;
        let request = Request::Delete {
            key: self.wire_key(key),
        };
        match self.dispatch(index, key, &request)? {
            Reply::Deleted => Ok(Ack::Confirmed),
            Reply::Buffered => Ok(Ack::Buffered),
            Reply::NotFound => Err(Error::NotFound {
                key: key.to_string(),
            }),
            other => Err(self.unexpected(key, index, other)),
        }
    }

    fn arithmetic(&mut self, key: &str, delta: u64, increment: bool) -> Result<u64> {
        self.check_key(key)?;
        let index = self.route(key)?;
        let key_wire = self.wire_key(key);
        let request = if increment {
            Request::Incr {
                key: key_wire,
                delta,
            }
        } else {
            Request::Decr {
                key: key_wire,
                delta,
            }
        };
        match self.dispatch(index, key, &request)? {
            Reply::Numeric(value) => Ok(value),
            Reply::NotFound => Err(Error::NotFound {
                key: key.to_string(),
            }),
            other => Err(self.unexpected(key, index, other)),
        }
    }

    /// Send `request` to every routable server. Per-server failures are
    /// collected; the remaining servers are still contacted.
    fn broadcast(&mut self, op: &'static str, request: &Request) -> Result<Vec<(usize, Reply)>> {
        let now = Instant::now();
        let targets: Vec<usize> = self
            .pool
            .routable(now)
            .iter()
            .enumerate()
            .filter_map(|(i, live)| live.then_some(i))
            .collect();
        if targets.is_empty() {
            return Err(Error::AllServersDown { key: String::new() });
        }

        let servers = self.pool.specs();
        let specs: Vec<&ServerSpec> = targets.iter().map(|i| &servers[*i]).collect();
        let options = self.options();
        for _ in &specs {
            metrics::REQUESTS.increment();
        }
        let results = self.transport.broadcast(&specs, request, &options);

        let mut replies = Vec::with_capacity(targets.len());
        let mut failures = Vec::new();
        for ((&index, &server), result) in targets.iter().zip(&specs).zip(results) {
            match result {
                Ok(Reply::ServerError(message) | Reply::ClientError(message)) => {
                    self.on_success(index, server);
                    failures.push(ServerFailure {
                        server: server.address(),
                        error: Error::ServerError {
                            key: String::new(),
                            server: server.address(),
                            message,
                        },
                    });
                }
                Ok(reply) => {
                    self.on_success(index, server);
                    replies.push((index, reply));
                }
                Err(e) => {
                    self.transport.disconnect(server);
                    self.on_failure(index, server, &e);
                    failures.push(ServerFailure {
                        server: server.address(),
                        error: transport_error("", server, e),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(replies)
        } else {
            warn!(op, failed = failures.len(), "broadcast failed on some servers");
            Err(Error::Broadcast { op, failures })
        }
    }

    pub(crate) fn check_key(&self, key: &str) -> Result<()> {
        key::validate(key, self.settings.prefix.len())
    }

    pub(crate) fn wire_key(&self, key: &str) -> String {
        let mut wire = String::with_capacity(self.settings.prefix.len() + key.len());
        wire.push_str(&self.settings.prefix);
        wire.push_str(key);
        wire
    }

    fn logical_key<'a>(&self, wire: &'a str) -> &'a str {
        wire.strip_prefix(self.settings.prefix.as_str()).unwrap_or(wire)
    }

    pub(crate) fn route(&mut self, key: &str) -> Result<usize> {
        self.pool
            .route(key, Instant::now())
            .map_err(|e| match e {
                RouteError::AllServersDown => Error::AllServersDown {
                    key: key.to_string(),
                },
                RouteError::MarkedDead(index) => Error::ServerIsMarkedDead {
                    key: key.to_string(),
                    server: self.pool.servers()[index].address(),
                },
            })
    }

    fn options(&self) -> CallOptions {
        CallOptions {
            timeouts: self.settings.timeouts,
            delivery: self.settings.delivery,
            non_blocking: self.settings.non_blocking,
        }
    }

    /// Execute `request` on the server at `index`, recording the outcome.
    pub(crate) fn dispatch(&mut self, index: usize, key: &str, request: &Request) -> Result<Reply> {
        let servers = self.pool.specs();
        let server = &servers[index];
        let options = self.options();

        metrics::REQUESTS.increment();
        match self.transport.execute(server, request, &options) {
            Ok(reply) => {
                self.on_success(index, server);
                Ok(reply)
            }
            Err(e) => {
                self.transport.disconnect(server);
                self.on_failure(index, server, &e);
                Err(transport_error(key, server, e))
            }
        }
    }

    fn on_success(&mut self, index: usize, server: &ServerSpec) {
        match self.pool.record_success(index) {
            Transition::Restored => {
                metrics::RESTORATIONS.increment();
                info!(server = %server, "server restored after successful retry");
            }
            Transition::Recovered => debug!(server = %server, "server recovered"),
            _ => {}
        }
    }

    fn on_failure(&mut self, index: usize, server: &ServerSpec, error: &TransportError) {
        metrics::TRANSPORT_FAILURES.increment();
        match self.pool.record_failure(index, Instant::now()) {
            Transition::Ejected => {
                metrics::EJECTIONS.increment();
                warn!(
                    server = %server,
                    failures = self.pool.failures(index),
                    retry_after = ?self.settings.eject.retry_timeout,
                    %error,
                    "ejecting server"
                );
            }
            Transition::ProbeFailed => {
                warn!(server = %server, %error, "retry failed, server stays ejected");
            }
            _ => debug!(
                server = %server,
                failures = self.pool.failures(index),
                %error,
                "request failed"
            ),
        }
    }

    pub(crate) fn unexpected(&self, key: &str, index: usize, reply: Reply) -> Error {
        let server = self.pool.servers()[index].address();
        match reply {
            Reply::ServerError(message) | Reply::ClientError(message) => Error::ServerError {
                key: key.to_string(),
                server,
                message,
            },
            other => Error::Protocol {
                key: key.to_string(),
                server,
                detail: format!("unexpected reply {other:?}"),
            },
        }
    }

    pub(crate) fn encode<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<Bytes> {
        self.codec
            .encode(value)
            .map(Bytes::from)
            .map_err(|e| Error::Codec {
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    pub(crate) fn decode<V: DeserializeOwned>(&self, key: &str, item: Item) -> Result<V> {
        if !codec::is_marshalled(item.flags) {
            return Err(Error::Argument(format!(
                "value for key {key} was stored raw; read it with a raw operation"
            )));
        }
        self.codec.decode(&item.value).map_err(|e| Error::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Log a backtrace for a failed operation when configured to.
    pub(crate) fn finish<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(error) = &result {
            if self.settings.show_backtraces {
                let backtrace = Backtrace::force_capture();
                debug!(%error, %backtrace, "operation failed");
            }
        }
        result
    }
}

/// Raw bytes of an item, refusing marshalled values.
fn raw(key: &str, item: Item) -> Result<Bytes> {
    if codec::is_marshalled(item.flags) {
        return Err(Error::Argument(format!(
            "value for key {key} is marshalled; read it with a marshalled operation"
        )));
    }
    Ok(item.value)
}

fn transport_error(key: &str, server: &ServerSpec, error: TransportError) -> Error {
    let key = key.to_string();
    let server = server.address();
    match error {
        TransportError::Connect(source) if source.kind() == io::ErrorKind::TimedOut => {
            Error::TimeoutOccurred {
                key,
                server,
                phase: Phase::Connect,
            }
        }
        TransportError::Connect(source) | TransportError::Io(source) => Error::SystemError {
            key,
            server,
            source,
        },
        TransportError::Timeout(phase) => Error::TimeoutOccurred { key, server, phase },
        TransportError::Closed => Error::SystemError {
            key,
            server,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"),
        },
        TransportError::Protocol(detail) => Error::Protocol {
            key,
            server,
            detail,
        },
    }
}

impl<T: Transport, C: Codec> Clone for Client<T, C> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            pool: self.pool.clone(),
            transport: self.transport.fork(),
            codec: self.codec.clone(),
        }
    }
}

impl<T: Transport, C: Codec> fmt::Debug for Client<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("servers", &self.servers())
            .field("distribution", &self.settings.distribution)
            .finish()
    }
}
