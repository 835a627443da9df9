//! Query Key Module
//!
//! Hierarchical, structurally-compared identifiers for cacheable data.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// == Key Segment ==
/// One segment of a query key.
///
/// Floats are deliberately absent so that segments stay `Eq + Hash`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Filter objects; sorted so that insertion order never affects equality.
    Map(BTreeMap<String, KeySegment>),
}

impl KeySegment {
    /// Builds a `Map` segment from key/value pairs.
    pub fn params<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<KeySegment>,
        I: IntoIterator<Item = (K, V)>,
    {
        KeySegment::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        KeySegment::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        KeySegment::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        KeySegment::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        KeySegment::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        KeySegment::Int(value.into())
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        KeySegment::Int(value.into())
    }
}

impl From<bool> for KeySegment {
    fn from(value: bool) -> Self {
        KeySegment::Bool(value)
    }
}

impl<T: Into<KeySegment>> From<Option<T>> for KeySegment {
    fn from(value: Option<T>) -> Self {
        value.map_or(KeySegment::Null, Into::into)
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Null => write!(f, "null"),
            KeySegment::Bool(b) => write!(f, "{}", b),
            KeySegment::Int(i) => write!(f, "{}", i),
            KeySegment::Str(s) => write!(f, "{:?}", s),
            KeySegment::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// == Query Key ==
/// Ordered sequence of segments, e.g. `["thoughts", "detail", "42"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Creates a key from raw segments.
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// Key naming a whole entity family: `[entity]`.
    pub fn entity(entity: &str) -> Self {
        Self(vec![KeySegment::from(entity)])
    }

    /// Returns a new key with `segment` appended.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment when it is a string, which by convention names the entity.
    pub fn entity_name(&self) -> Option<&str> {
        match self.0.first() {
            Some(KeySegment::Str(name)) => Some(name),
            _ => None,
        }
    }

    // == Prefix Matching ==
    /// Returns true when every segment of `self` equals the leading segments
    /// of `other`. A key is a prefix of itself; the empty key matches everything.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", segment)?;
        }
        write!(f, "]")
    }
}

// == Constructors ==
/// Builds the canonical key `[entity, qualifier, params?]`.
///
/// Keys built from equal inputs are structurally equal wherever they are built.
pub fn make_key(entity: &str, qualifier: &str, params: Option<KeySegment>) -> QueryKey {
    let mut segments = vec![KeySegment::from(entity), KeySegment::from(qualifier)];
    if let Some(params) = params {
        segments.push(params);
    }
    QueryKey(segments)
}

/// Free-function form of [`QueryKey::is_prefix_of`].
pub fn is_prefix_of(prefix: &QueryKey, key: &QueryKey) -> bool {
    prefix.is_prefix_of(key)
}

/// Builds a [`QueryKey`] from heterogeneous segments.
///
/// ```ignore
/// let key = query_key!["thoughts", "detail", 42];
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::keys::QueryKey::new(vec![$($crate::keys::KeySegment::from($segment)),*])
    };
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_is_structural() {
        let a = make_key("thoughts", "list", Some(KeySegment::params([("tag", "rust")])));
        let b = make_key("thoughts", "list", Some(KeySegment::params([("tag", "rust")])));
        assert_eq!(a, b);
    }

    #[test]
    fn test_params_order_does_not_matter() {
        let a = KeySegment::params([("a", 1), ("b", 2)]);
        let b = KeySegment::params([("b", 2), ("a", 1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_matches_family() {
        let list = make_key("thoughts", "list", None);
        let filtered = make_key("thoughts", "list", Some(KeySegment::params([("tag", "x")])));
        let detail = make_key("thoughts", "detail", Some("1".into()));
        let other = make_key("voice_captures", "list", None);

        assert!(list.is_prefix_of(&filtered));
        assert!(list.is_prefix_of(&list));
        assert!(!list.is_prefix_of(&detail));
        assert!(!list.is_prefix_of(&other));
        assert!(QueryKey::entity("thoughts").is_prefix_of(&detail));
    }

    #[test]
    fn test_longer_key_is_not_prefix_of_shorter() {
        let list = make_key("thoughts", "list", None);
        let filtered = list.child("page-2");
        assert!(!filtered.is_prefix_of(&list));
    }

    #[test]
    fn test_empty_key_matches_everything() {
        let detail = make_key("thoughts", "detail", Some("1".into()));
        assert!(QueryKey::default().is_prefix_of(&detail));
    }

    #[test]
    fn test_query_key_macro() {
        let key = query_key!["thoughts", "detail", 7];
        assert_eq!(key, make_key("thoughts", "detail", Some(KeySegment::Int(7))));
        assert_eq!(key.entity_name(), Some("thoughts"));
    }

    #[test]
    fn test_key_serializes_as_array() {
        let key = query_key!["thoughts", "list", KeySegment::params([("limit", 10)])];
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, serde_json::json!(["thoughts", "list", {"limit": 10}]));

        let back: QueryKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_display() {
        let key = query_key!["thoughts", "detail", 3];
        assert_eq!(key.to_string(), r#"["thoughts","detail",3]"#);
    }
}
