//! Mapping between entity IDs and namespaced keys.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyspaceError {
    #[error("invalid keyspace prefix '{prefix}': must start and end with '/' and be ASCII")]
    InvalidPrefix { prefix: String },
    #[error("invalid id '{id}': must be non-empty and must not contain '/'")]
    InvalidId { id: String },
}

/// A namespace of entities stored one per key, as `<prefix><id>`.
///
/// The prefix must start and end with `/`, so that prefixes never overlap
/// unless one is nested within the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyspacePrefix {
    prefix: Cow<'static, str>,
}

impl KeyspacePrefix {
    /// Build a prefix from a literal, checked at compile time when used in a `const`.
    pub const fn from_static(prefix: &'static str) -> Self {
        let bytes = prefix.as_bytes();
        assert!(
            bytes.len() >= 2 && bytes[0] == b'/' && bytes[bytes.len() - 1] == b'/',
            "keyspace prefix must start and end with '/'"
        );
        Self {
            prefix: Cow::Borrowed(prefix),
        }
    }

    pub fn new(prefix: impl Into<String>) -> Result<Self, KeyspaceError> {
        let prefix = prefix.into();
        let valid = prefix.len() >= 2 && prefix.is_ascii() && prefix.starts_with('/') && prefix.ends_with('/');
        if !valid {
            return Err(KeyspaceError::InvalidPrefix { prefix });
        }
        Ok(Self {
            prefix: Cow::Owned(prefix),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// A nested prefix, `<prefix><name>/`.
    pub fn child(&self, name: &str) -> Result<Self, KeyspaceError> {
        check_id(name)?;
        Self::new(format!("{}{}/", self.prefix, name))
    }

    /// The key under which the entity `id` is stored.
    pub fn key(&self, id: &str) -> Result<String, KeyspaceError> {
        check_id(id)?;
        Ok(format!("{}{}", self.prefix, id))
    }

    /// `[start, end)` bounds covering every key in this namespace.
    pub fn range(&self) -> (String, String) {
        (self.prefix.to_string(), prefix_end(&self.prefix))
    }

    /// The entity ID encoded in `key`, if `key` belongs directly to this namespace.
    pub fn extract_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(self.prefix.as_ref())?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id)
    }
}

impl fmt::Display for KeyspacePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

fn check_id(id: &str) -> Result<(), KeyspaceError> {
    if id.is_empty() || id.contains('/') {
        return Err(KeyspaceError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Only meaningful for ASCII prefixes; an empty or all-0x7f prefix yields `"\u{7f}"`.
pub fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    "\u{7f}".to_string()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const NODES: KeyspacePrefix = KeyspacePrefix::from_static("/nodes/");

    #[test]
    fn key_and_extract() {
        let key = NODES.key("node-abcd").unwrap();
        assert_eq!(key, "/nodes/node-abcd");
        assert_eq!(NODES.extract_id(&key), Some("node-abcd"));
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(NODES.key("").is_err());
        assert!(NODES.key("a/b").is_err());
    }

    #[test]
    fn rejects_bad_prefixes() {
        assert!(KeyspacePrefix::new("nodes/").is_err());
        assert!(KeyspacePrefix::new("/nodes").is_err());
        assert!(KeyspacePrefix::new("/").is_err());
        assert!(KeyspacePrefix::new("/nodes/").is_ok());
    }

    #[test]
    fn extract_ignores_foreign_and_nested_keys() {
        assert_eq!(NODES.extract_id("/cluster/configuration"), None);
        assert_eq!(NODES.extract_id("/nodes/a/b"), None);
        assert_eq!(NODES.extract_id("/nodes/"), None);
    }

    #[test]
    fn range_bounds() {
        let (start, end) = NODES.range();
        assert_eq!(start, "/nodes/");
        assert_eq!(end, "/nodes0");
    }

    #[test]
    fn child_prefix() {
        let pki = KeyspacePrefix::from_static("/cluster-pki/");
        let issued = pki.child("issued").unwrap();
        assert_eq!(issued.as_str(), "/cluster-pki/issued/");
    }

    proptest! {
        #[test]
        fn keys_fall_inside_range(id in "[a-zA-Z0-9_.-]{1,40}") {
            let key = NODES.key(&id).unwrap();
            let (start, end) = NODES.range();
            prop_assert!(key.as_str() >= start.as_str());
            prop_assert!(key.as_str() < end.as_str());
            prop_assert_eq!(NODES.extract_id(&key), Some(id.as_str()));
        }
    }
}
