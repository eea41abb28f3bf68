//! Core key-value types: queries, pairs, snapshots and change events.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};

/// What a watch observes: one key, or every key under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum KvQuery {
    /// A single key.
    Key(String),
    /// All keys starting with this prefix.
    Prefix(String),
}

impl KvQuery {
    /// Creates a single-key query.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a valid key path.
    pub fn key(path: impl Into<String>) -> KvResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        if path.ends_with('/') {
            return Err(KvError::invalid_path(path, "key must not end with '/'"));
        }
        Ok(Self::Key(path))
    }

    /// Creates a prefix query.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a valid key path.
    pub fn prefix(path: impl Into<String>) -> KvResult<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self::Prefix(path))
    }

    /// Parses the configuration form, where a trailing `/` marks a prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a valid key path.
    pub fn parse(spec: &str) -> KvResult<Self> {
        if spec.ends_with('/') {
            Self::prefix(spec)
        } else {
            Self::key(spec)
        }
    }

    /// The key or prefix path.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Key(p) | Self::Prefix(p) => p,
        }
    }

    /// Returns true for prefix queries.
    #[must_use]
    pub const fn is_prefix(&self) -> bool {
        matches!(self, Self::Prefix(_))
    }

    /// Returns true if `key` falls under this query.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(p) => p == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

impl fmt::Display for KvQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(p) => write!(f, "{p}"),
            Self::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

fn validate_path(path: &str) -> KvResult<()> {
    if path.is_empty() {
        return Err(KvError::invalid_path(path, "path cannot be empty"));
    }
    if path.starts_with('/') {
        return Err(KvError::invalid_path(path, "path must not start with '/'"));
    }
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(KvError::invalid_path(
            path,
            "path must not contain whitespace or control characters",
        ));
    }
    if path.split('/').any(|segment| segment == "." || segment == "..") {
        return Err(KvError::invalid_path(path, "path must not contain '.' or '..' segments"));
    }
    Ok(())
}

/// A single stored key with its value and modification index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// Full key path.
    pub key: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Index of the last write to this key.
    pub modify_index: u64,
}

impl KvPair {
    /// Creates a new pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, modify_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            modify_index,
        }
    }

    /// The value as text; invalid UTF-8 sequences are replaced.
    #[must_use]
    pub fn value_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// The result of one read of a query: its matching pairs and its index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSnapshot {
    /// The query this snapshot answers.
    pub query: KvQuery,
    /// The query's modification index at read time.
    pub index: u64,
    /// Matching pairs keyed by full key path.
    pub pairs: BTreeMap<String, KvPair>,
}

impl KvSnapshot {
    /// Creates an empty snapshot at the given index.
    #[must_use]
    pub fn empty(query: KvQuery, index: u64) -> Self {
        Self {
            query,
            index,
            pairs: BTreeMap::new(),
        }
    }

    /// Creates a snapshot from a list of pairs.
    #[must_use]
    pub fn from_pairs(query: KvQuery, index: u64, pairs: impl IntoIterator<Item = KvPair>) -> Self {
        Self {
            query,
            index,
            pairs: pairs.into_iter().map(|p| (p.key.clone(), p)).collect(),
        }
    }

    /// Looks up a key in this snapshot.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KvPair> {
        self.pairs.get(key)
    }

    /// Returns true if no pairs matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Notification that a watched query moved to a new index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The query that changed.
    pub query: KvQuery,
    /// The new modification index.
    pub index: u64,
    /// When the watch observed the change.
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event observed now.
    #[must_use]
    pub fn new(query: KvQuery, index: u64) -> Self {
        Self {
            query,
            index,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_distinguishes_keys_and_prefixes() {
        let q = KvQuery::parse("config/services/consul/datacenter").expect("valid key");
        assert_eq!(
            q,
            KvQuery::Key("config/services/consul/datacenter".to_string())
        );
        assert!(!q.is_prefix());

        let q = KvQuery::parse("config/services/").expect("valid prefix");
        assert!(q.is_prefix());
        assert_eq!(q.path(), "config/services/");
    }

    #[test_case("" ; "empty")]
    #[test_case("/config/region" ; "leading slash")]
    #[test_case("config/my region" ; "contains space")]
    #[test_case("config/../secret" ; "parent segment")]
    #[test_case("config/./region" ; "current segment")]
    #[test_case("config/\tregion" ; "contains tab")]
    fn invalid_paths_are_rejected(path: &str) {
        assert!(KvQuery::parse(path).is_err(), "expected '{path}' to be rejected");
    }

    #[test]
    fn key_constructor_rejects_trailing_slash() {
        assert!(KvQuery::key("config/").is_err());
        assert!(KvQuery::prefix("config/").is_ok());
    }

    #[test]
    fn matches_respects_query_kind() {
        let key = KvQuery::key("config/region").expect("valid");
        assert!(key.matches("config/region"));
        assert!(!key.matches("config/region/extra"));

        let prefix = KvQuery::prefix("config/").expect("valid");
        assert!(prefix.matches("config/region"));
        assert!(prefix.matches("config/a/b"));
        assert!(!prefix.matches("other/region"));
    }

    #[test]
    fn display_marks_prefixes() {
        assert_eq!(KvQuery::key("a/b").expect("valid").to_string(), "a/b");
        assert_eq!(KvQuery::prefix("a/").expect("valid").to_string(), "a/*");
    }

    #[test]
    fn value_str_is_lossy() {
        let pair = KvPair::new("k", vec![0x66, 0x6f, 0xff], 3);
        assert_eq!(pair.value_str(), "fo\u{fffd}");
    }

    #[test]
    fn snapshot_from_pairs_indexes_by_key() {
        let query = KvQuery::prefix("svc/").expect("valid");
        let snap = KvSnapshot::from_pairs(
            query,
            7,
            vec![KvPair::new("svc/a", "1", 5), KvPair::new("svc/b", "2", 7)],
        );
        assert_eq!(snap.get("svc/b").map(|p| p.modify_index), Some(7));
        assert!(snap.get("svc/c").is_none());
        assert!(!snap.is_empty());
    }
}
