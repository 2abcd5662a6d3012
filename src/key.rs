//! Key validation.
//!
//! Keys travel inside a whitespace-delimited text protocol, so anything that
//! would break framing is rejected before a request is built: empty keys,
//! whitespace and control bytes, bytes outside printable ASCII, and keys that
//! exceed the server limit once the namespace prefix is prepended.

use crate::error::{Error, KeyProblem, Result};

/// Maximum key length accepted by the server, prefix included.
pub const MAX_KEY_LEN: usize = 250;

/// Maximum length of a configured `prefix_key`.
pub const MAX_PREFIX_LEN: usize = 127;

/// Check a single key. `prefix_len` is the length of the configured prefix.
pub fn validate(key: &str, prefix_len: usize) -> Result<()> {
    check(key.as_bytes(), prefix_len).map_err(|reason| Error::BadKey {
        key: key.to_string(),
        reason,
    })
}

/// Check every key of a batch, failing on the first invalid one.
pub fn validate_all<K: AsRef<str>>(keys: &[K], prefix_len: usize) -> Result<()> {
    for key in keys {
        validate(key.as_ref(), prefix_len)?;
    }
    Ok(())
}

/// Check a namespace prefix. An empty prefix is treated as no prefix.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(Error::Config(format!(
            "prefix_key is {} bytes, maximum is {MAX_PREFIX_LEN}",
            prefix.len()
        )));
    }
    if let Some((offset, &byte)) = prefix
        .as_bytes()
        .iter()
        .enumerate()
        .find(|(_, b)| !is_key_byte(**b))
    {
        return Err(Error::Config(format!(
            "prefix_key contains byte 0x{byte:02x} at offset {offset}"
        )));
    }
    Ok(())
}

fn check(key: &[u8], prefix_len: usize) -> std::result::Result<(), KeyProblem> {
    if key.is_empty() {
        return Err(KeyProblem::Empty);
    }

    let len = key.len() + prefix_len;
    if len > MAX_KEY_LEN {
        return Err(KeyProblem::TooLong {
            len,
            max: MAX_KEY_LEN,
        });
    }

    match key.iter().position(|b| !is_key_byte(*b)) {
        Some(offset) => Err(KeyProblem::InvalidByte {
            byte: key[offset],
            offset,
        }),
        None => Ok(()),
    }
}

/// Printable, non-space ASCII.
#[inline]
fn is_key_byte(b: u8) -> bool {
    (0x21..0x7f).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(key: &str, prefix_len: usize) -> KeyProblem {
        match validate(key, prefix_len) {
            Err(Error::BadKey { reason, .. }) => reason,
            other => panic!("expected BadKey, got {other:?}"),
        }
    }

    #[test]
    fn accepts_printable_keys() {
        assert!(validate("user:42", 0).is_ok());
        assert!(validate("a~!@#$%^&*()_+-={}[]|\\:;\"'<>,.?/", 0).is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(problem("", 0), KeyProblem::Empty);
    }

    #[test]
    fn rejects_whitespace() {
        assert!(matches!(
            problem("i have a space", 0),
            KeyProblem::InvalidByte { byte: b' ', offset: 1 }
        ));
        assert!(matches!(
            problem("tab\there", 0),
            KeyProblem::InvalidByte { byte: b'\t', .. }
        ));
        assert!(matches!(
            problem("line\r\n", 0),
            KeyProblem::InvalidByte { byte: b'\r', .. }
        ));
    }

    #[test]
    fn rejects_nul_and_control() {
        assert!(matches!(
            problem("with\0null", 0),
            KeyProblem::InvalidByte { byte: 0, offset: 4 }
        ));
        assert!(matches!(
            problem("del\x7f", 0),
            KeyProblem::InvalidByte { byte: 0x7f, .. }
        ));
    }

    #[test]
    fn rejects_non_ascii() {
        assert!(matches!(
            problem("ch\u{e2}teau", 0),
            KeyProblem::InvalidByte { byte: 0xc3, offset: 2 }
        ));
    }

    #[test]
    fn length_includes_prefix() {
        let key = "x".repeat(250);
        assert!(validate(&key, 0).is_ok());
        assert_eq!(
            problem(&"x".repeat(251), 0),
            KeyProblem::TooLong { len: 251, max: 250 }
        );
        assert_eq!(
            problem(&"x".repeat(240), 11),
            KeyProblem::TooLong { len: 251, max: 250 }
        );
    }

    #[test]
    fn batch_fails_on_any_bad_key() {
        assert!(validate_all(&["a", "b", "c"], 0).is_ok());
        let err = validate_all(&["a", "b b", "c"], 0).unwrap_err();
        assert_eq!(err.key(), Some("b b"));
    }

    #[test]
    fn prefix_rules() {
        assert!(validate_prefix("prefix_key_").is_ok());
        assert!(validate_prefix(&"x".repeat(127)).is_ok());
        assert!(matches!(
            validate_prefix(&"x".repeat(128)),
            Err(Error::Config(_))
        ));
        assert!(matches!(validate_prefix("has space"), Err(Error::Config(_))));
    }
}
