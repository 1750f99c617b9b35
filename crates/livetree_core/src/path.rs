//! Locations in the tree.
//!
//! A [`Path`] is the ordered sequence of keys from the root to a node. Its
//! textual form is slash-delimited (`/users/ada`); the root is `/`.

use crate::error::{CoreError, CoreResult};
use std::cmp::Ordering;
use std::fmt;

/// Maximum key length in UTF-8 bytes.
pub const MAX_KEY_BYTES: usize = 768;

/// Characters that may never appear in a key.
const FORBIDDEN_KEY_CHARS: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Validates a single key.
pub fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_key(key, "key is empty"));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(CoreError::invalid_key(
            key,
            format!("key exceeds {MAX_KEY_BYTES} bytes"),
        ));
    }
    if let Some(c) = key
        .chars()
        .find(|c| FORBIDDEN_KEY_CHARS.contains(c) || c.is_ascii_control())
    {
        return Err(CoreError::invalid_key(
            key,
            format!("key contains forbidden character {c:?}"),
        ));
    }
    Ok(())
}

fn as_int_key(key: &str) -> Option<i32> {
    if key.starts_with('+') {
        return None;
    }
    key.parse().ok()
}

/// Compares two keys in child order.
///
/// Keys that parse as 32-bit integers come first, in numeric order; all
/// other keys follow in lexicographic order.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (as_int_key(a), as_int_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// An absolute location in the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root location.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses a slash-delimited path. Empty segments are ignored.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let mut segments = Vec::new();
        for segment in text.split('/').filter(|s| !s.is_empty()) {
            validate_key(segment)
                .map_err(|e| CoreError::invalid_path(text, e.to_string()))?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    /// Builds a path from already separated keys.
    pub fn from_keys<I, S>(keys: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = keys.into_iter().map(Into::into).collect::<Vec<String>>();
        for key in &segments {
            validate_key(key)?;
        }
        Ok(Self { segments })
    }

    /// Returns the location at a relative path below this one.
    ///
    /// `relative` may contain several slash-separated keys.
    pub fn child(&self, relative: &str) -> CoreResult<Self> {
        Ok(self.join(&Self::parse(relative)?))
    }

    /// Appends a single key that is already known to be valid, such as a
    /// key taken from an existing path or a generated push key.
    pub fn push_key(&self, key: &str) -> Self {
        debug_assert!(validate_key(key).is_ok(), "invalid key {key:?}");
        let mut segments = self.segments.clone();
        segments.push(key.to_string());
        Self { segments }
    }

    /// Appends a relative path.
    pub fn join(&self, relative: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    /// Parent location, `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// Last key, `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// First key, `None` at the root.
    pub fn front(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Path without its first key.
    pub fn pop_front(&self) -> Self {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Whether this is the root location.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether this path has no keys.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Keys from the root.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns true if `self` is an ancestor of `other` or equal to it.
    pub fn contains(&self, other: &Path) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// The part of `self` below `ancestor`, if `ancestor` contains `self`.
    pub fn relative_to(&self, ancestor: &Path) -> Option<Self> {
        self.segments
            .strip_prefix(ancestor.segments.as_slice())
            .map(|rest| Self {
                segments: rest.to_vec(),
            })
    }

    /// Percent-encoded form suitable for appending to a URL.
    pub fn to_url_path(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            out.push_str(&urlencoding::encode(segment));
        }
        out
    }

    /// Parses the path part of a URL, decoding percent escapes.
    pub fn from_url_path(text: &str) -> CoreResult<Self> {
        let mut segments = Vec::new();
        for raw in text.split('/').filter(|s| !s.is_empty()) {
            let key = urlencoding::decode(raw)
                .map_err(|_| CoreError::invalid_path(text, "escape is not valid UTF-8"))?;
            validate_key(&key).map_err(|e| CoreError::invalid_path(text, e.to_string()))?;
            segments.push(key.into_owned());
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Path {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse(s)
    }
}

impl serde::Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Path {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_drops_empty_segments() {
        let path = Path::parse("//users/ada/").unwrap();
        assert_eq!(path.segments(), &["users", "ada"]);
        assert_eq!(path.to_string(), "/users/ada");
        assert_eq!(Path::parse("").unwrap(), Path::root());
        assert_eq!(Path::root().to_string(), "/");
    }

    #[test]
    fn key_rules() {
        assert!(validate_key("ada").is_ok());
        assert!(validate_key("").is_err());
        for bad in ["a.b", "a#", "$x", "[0]", "x]", "tab\there"] {
            assert!(validate_key(bad).is_err(), "{bad} accepted");
        }
        assert!(validate_key(&"k".repeat(MAX_KEY_BYTES)).is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_BYTES + 1)).is_err());
        assert!(Path::parse("/users/a.b").is_err());
    }

    #[test]
    fn navigation() {
        let path = Path::parse("/a/b/c").unwrap();
        assert_eq!(path.key(), Some("c"));
        assert_eq!(path.front(), Some("a"));
        assert_eq!(path.parent().unwrap().to_string(), "/a/b");
        assert_eq!(path.pop_front().to_string(), "/b/c");
        assert_eq!(Path::root().parent(), None);
        assert_eq!(path.child("d/e").unwrap().to_string(), "/a/b/c/d/e");
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn containment() {
        let a = Path::parse("/a").unwrap();
        let abc = Path::parse("/a/b/c").unwrap();
        assert!(a.contains(&abc));
        assert!(abc.contains(&abc));
        assert!(!abc.contains(&a));
        assert!(Path::root().contains(&a));
        assert_eq!(abc.relative_to(&a).unwrap().to_string(), "/b/c");
        assert_eq!(a.relative_to(&abc), None);
    }

    #[test]
    fn integer_keys_sort_first() {
        let mut keys = vec!["b", "10", "a", "2", "-1", "007"];
        keys.sort_by(|a, b| compare_keys(a, b));
        assert_eq!(keys, vec!["-1", "2", "007", "10", "a", "b"]);
        assert_eq!(compare_keys("+1", "1"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn url_encoding_round_trips() {
        let path = Path::from_keys(["hello world", "caf\u{e9}", "a&b"]).unwrap();
        let encoded = path.to_url_path();
        assert_eq!(encoded, "/hello%20world/caf%C3%A9/a%26b");
        assert_eq!(Path::from_url_path(&encoded).unwrap(), path);
        assert!(Path::from_url_path("/bad%FF").is_err());
    }

    #[test]
    fn stray_percent_signs_stay_literal() {
        let path = Path::from_url_path("/bad%2/x%+1").unwrap();
        assert_eq!(path.segments(), &["bad%2", "x%+1"]);
        assert_eq!(Path::from_url_path("/%61da").unwrap().key(), Some("ada"));
    }
}
