//! Compare-and-swap.
//!
//! `cas` reads a value together with its version token, hands the value to a
//! closure, and writes the closure's result back only if the token is still
//! current. The read and the write go to the same server. A lost race is
//! reported as [`Error::ConnectionDataExists`] and is never retried here; the
//! caller decides whether to run the whole `cas` again.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::{Ack, Client};
use crate::codec::{Codec, MARSHALLED_FLAG, is_marshalled};
use crate::error::{Error, Result};
use crate::transport::{Item, Reply, Request, StoreMode, Transport};

impl<T: Transport, C: Codec> Client<T, C> {
    /// Replace the value under `key` with `update(current)`.
    ///
    /// Fails with [`Error::NotFound`] without calling `update` if the key is
    /// missing, and with [`Error::Config`] unless `support_cas` is enabled.
    pub fn cas<V, F>(&mut self, key: &str, ttl: Option<u32>, update: F) -> Result<Ack>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(V) -> V,
    {
        let result = self.cas_value(key, ttl, update);
        self.finish(result)
    }

    /// [`Client::cas`] over raw bytes.
    pub fn cas_raw<F>(&mut self, key: &str, ttl: Option<u32>, update: F) -> Result<Ack>
    where
        F: FnOnce(Bytes) -> Vec<u8>,
    {
        let result = self.cas_bytes(key, ttl, update);
        self.finish(result)
    }

    fn cas_value<V, F>(&mut self, key: &str, ttl: Option<u32>, update: F) -> Result<Ack>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(V) -> V,
    {
        let (index, item) = self.read_versioned(key)?;
        let token = item.cas;
        let current: V = self.decode(key, item)?;
        let next = self.encode(key, &update(current))?;
        self.store_at(index, StoreMode::Cas { unique: token }, key, next, MARSHALLED_FLAG, ttl)
    }

    fn cas_bytes<F>(&mut self, key: &str, ttl: Option<u32>, update: F) -> Result<Ack>
    where
        F: FnOnce(Bytes) -> Vec<u8>,
    {
        let (index, item) = self.read_versioned(key)?;
        if is_marshalled(item.flags) {
            return Err(Error::Argument(format!(
                "value for key {key} is marshalled; use cas instead of cas_raw"
            )));
        }
        let token = item.cas;
        let next = Bytes::from(update(item.value));
        self.store_at(index, StoreMode::Cas { unique: token }, key, next, item.flags, ttl)
    }

    /// Read `key` with its version token. Returns the server index it came from.
    fn read_versioned(&mut self, key: &str) -> Result<(usize, Item)> {
        if !self.settings().support_cas {
            return Err(Error::Config("cas requires support_cas to be enabled".into()));
        }
        self.check_key(key)?;
        let index = self.route(key)?;
        let wire = self.wire_key(key);
        let request = Request::Gets {
            keys: vec![wire.clone()],
        };
        match self.dispatch(index, key, &request)? {
            Reply::Values(items) => items
                .into_iter()
                .find(|item| item.key == wire)
                .map(|item| (index, item))
                .ok_or_else(|| Error::NotFound {
                    key: key.to_string(),
                }),
            other => Err(self.unexpected(key, index, other)),
        }
    }
}
