//! Value marshalling.
//!
//! Marshalled values are stored with [`MARSHALLED_FLAG`] set so that reads can
//! tell them apart from raw bytes written by `*_raw` operations.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Flag bit set on values written through a [`Codec`].
pub const MARSHALLED_FLAG: u32 = 1;

/// Converts values to and from their stored bytes.
pub trait Codec: Clone + Send {
    type Error: fmt::Display;

    fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>, Self::Error>;

    fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V, Self::Error>;
}

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn encode<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn decode<V: DeserializeOwned>(&self, bytes: &[u8]) -> Result<V, Self::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Whether `flags` mark a marshalled value.
pub fn is_marshalled(flags: u32) -> bool {
    flags & MARSHALLED_FLAG != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        visits: u32,
    }

    #[test]
    fn structs_survive_encoding() {
        let session = Session {
            user: "evan".into(),
            visits: 3,
        };
        let bytes = JsonCodec.encode(&session).unwrap();
        let back: Session = JsonCodec.decode(&bytes).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn decode_failure_is_reported() {
        let err = JsonCodec.decode::<Session>(b"not json").unwrap_err();
        assert!(!err.to_string().is_empty());
    }

    #[test]
    fn flag_check() {
        assert!(is_marshalled(MARSHALLED_FLAG));
        assert!(is_marshalled(MARSHALLED_FLAG | 0x10));
        assert!(!is_marshalled(0));
        assert!(!is_marshalled(0x10));
    }
}
