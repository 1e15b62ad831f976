//! Memory fragment data types
//!
//! Fragments are the raw input layer. Every piece of content handed to the
//! engine arrives as a `MemoryFragment` with a caller-supplied identifier and
//! a typed payload. Fragments are immutable once constructed; the encoder
//! turns them into episodes and never hands the original back out.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed fragment payload.
///
/// Text and binary payloads are kept apart so similarity scoring can work in
/// the right unit space (characters vs bytes). Structured payloads
/// canonicalize to sorted-key JSON text before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    /// UTF-8 text
    Text(String),
    /// Raw binary payload
    #[serde(with = "b64")]
    Bytes(Vec<u8>),
    /// Structured key-value payload
    Structured(serde_json::Map<String, serde_json::Value>),
}

/// Discriminant of a `Content` value, recorded on episodes so replay can
/// restore the original shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// UTF-8 text
    Text,
    /// Raw binary payload
    Bytes,
    /// Structured key-value payload
    Structured,
}

impl Content {
    /// The kind tag for this payload
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Text(_) => ContentKind::Text,
            Content::Bytes(_) => ContentKind::Bytes,
            Content::Structured(_) => ContentKind::Structured,
        }
    }

    /// Length in content units: characters for text, bytes for binary.
    /// Structured payloads measure their canonical JSON text.
    pub fn unit_len(&self) -> usize {
        match self {
            Content::Text(s) => s.chars().count(),
            Content::Bytes(b) => b.len(),
            Content::Structured(_) => self.canonical_text().chars().count(),
        }
    }

    /// Length in bytes of the canonical payload (compression-ratio denominator)
    pub fn byte_len(&self) -> usize {
        match self {
            Content::Text(s) => s.len(),
            Content::Bytes(b) => b.len(),
            Content::Structured(_) => self.canonical_text().len(),
        }
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Bytes(b) => b.is_empty(),
            Content::Structured(m) => m.is_empty(),
        }
    }

    /// Canonical JSON rendering of a structured payload. `serde_json::Map`
    /// is key-ordered, so this is stable for equal maps.
    fn canonical_text(&self) -> String {
        match self {
            Content::Structured(m) => {
                serde_json::to_string(m).unwrap_or_default()
            }
            Content::Text(s) => s.clone(),
            Content::Bytes(_) => String::new(),
        }
    }

    /// Canonical byte encoding used for content hashing. The kind tag is
    /// mixed in so `Text("ab")` and `Bytes(b"ab")` hash apart.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Content::Text(s) => {
                out.push(0u8);
                out.extend_from_slice(s.as_bytes());
            }
            Content::Bytes(b) => {
                out.push(1u8);
                out.extend_from_slice(b);
            }
            Content::Structured(_) => {
                out.push(2u8);
                out.extend_from_slice(self.canonical_text().as_bytes());
            }
        }
        out
    }

    /// Expand into a unit buffer for slicing and splicing
    pub fn to_units(&self) -> ContentUnits {
        match self {
            Content::Text(s) => ContentUnits::Chars(s.chars().collect()),
            Content::Bytes(b) => ContentUnits::Bytes(b.clone()),
            Content::Structured(_) => {
                ContentUnits::Chars(self.canonical_text().chars().collect())
            }
        }
    }
}

/// A fragment payload expanded into indexable units (chars or bytes).
///
/// The encoder slices candidates out of this buffer and replay splices
/// resolved spans back into one, so multi-byte characters never split.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentUnits {
    /// Character units of a text payload
    Chars(Vec<char>),
    /// Byte units of a binary payload
    Bytes(Vec<u8>),
}

impl ContentUnits {
    /// An empty buffer of the given kind (structured assembles as text)
    pub fn empty(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Text | ContentKind::Structured => ContentUnits::Chars(Vec::new()),
            ContentKind::Bytes => ContentUnits::Bytes(Vec::new()),
        }
    }

    /// Number of units in the buffer
    pub fn len(&self) -> usize {
        match self {
            ContentUnits::Chars(c) => c.len(),
            ContentUnits::Bytes(b) => b.len(),
        }
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice `[start, end)` out as a `Content` of the same kind
    pub fn slice(&self, start: usize, end: usize) -> Content {
        match self {
            ContentUnits::Chars(c) => Content::Text(c[start..end].iter().collect()),
            ContentUnits::Bytes(b) => Content::Bytes(b[start..end].to_vec()),
        }
    }

    /// Append another content value's units. Kind mismatches append nothing
    /// and report false; callers treat that as corrupt input.
    pub fn push_content(&mut self, content: &Content) -> bool {
        match (self, content) {
            (ContentUnits::Chars(c), Content::Text(s)) => {
                c.extend(s.chars());
                true
            }
            (ContentUnits::Bytes(b), Content::Bytes(v)) => {
                b.extend_from_slice(v);
                true
            }
            _ => false,
        }
    }

    /// Append `count` placeholder units (U+FFFD for text, 0x00 for binary)
    pub fn push_placeholder(&mut self, count: usize) {
        match self {
            ContentUnits::Chars(c) => c.extend(std::iter::repeat('\u{FFFD}').take(count)),
            ContentUnits::Bytes(b) => b.extend(std::iter::repeat(0u8).take(count)),
        }
    }

    /// Collapse the buffer back into a `Content` value
    pub fn into_content(self) -> Content {
        match self {
            ContentUnits::Chars(c) => Content::Text(c.into_iter().collect()),
            ContentUnits::Bytes(b) => Content::Bytes(b),
        }
    }
}

/// A discrete memory fragment submitted for encoding.
///
/// The identifier comes from the caller (conversation turn ID, tool call ID)
/// and lands in the observation set of every pattern the fragment touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    /// Caller-supplied identifier, must be non-empty
    pub id: String,
    /// Fragment payload
    pub content: Content,
    /// Ingestion timestamp
    pub timestamp: DateTime<Utc>,
}

impl MemoryFragment {
    /// Create a fragment with the current time as its timestamp
    pub fn new(id: impl Into<String>, content: Content) -> Self {
        Self {
            id: id.into(),
            content,
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for text payloads
    pub fn text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, Content::Text(text.into()))
    }

    /// Convenience constructor for binary payloads
    pub fn bytes(id: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(id, Content::Bytes(bytes))
    }

    /// Convenience constructor for structured payloads
    pub fn structured(
        id: impl Into<String>,
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self::new(id, Content::Structured(map))
    }

    /// Replace the timestamp (replayed ingestion, deterministic pipelines)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Reject fragments the engine must not ingest
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidFragment(
                "fragment id must be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Payload with structured content canonicalized to its JSON text.
    /// Encoding and similarity always operate on this form.
    pub fn canonical_content(&self) -> Content {
        match &self.content {
            Content::Structured(_) => Content::Text(self.content.canonical_text()),
            other => other.clone(),
        }
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_len_counts_chars_not_bytes() {
        let content = Content::Text("héllo".to_string());
        assert_eq!(content.unit_len(), 5);
        assert_eq!(content.byte_len(), 6);
    }

    #[test]
    fn test_units_slice_is_char_safe() {
        let units = Content::Text("héllo".to_string()).to_units();
        assert_eq!(units.slice(0, 2), Content::Text("hé".to_string()));
        assert_eq!(units.slice(2, 5), Content::Text("llo".to_string()));
    }

    #[test]
    fn test_canonical_bytes_distinguish_kinds() {
        let text = Content::Text("ab".to_string());
        let bytes = Content::Bytes(b"ab".to_vec());
        assert_ne!(text.canonical_bytes(), bytes.canonical_bytes());
    }

    #[test]
    fn test_structured_canonicalizes_sorted() {
        let mut map = serde_json::Map::new();
        map.insert("zeta".to_string(), serde_json::json!(1));
        map.insert("alpha".to_string(), serde_json::json!("x"));
        let fragment = MemoryFragment::structured("frag-1", map);

        let canonical = fragment.canonical_content();
        match canonical {
            Content::Text(s) => {
                assert_eq!(s, r#"{"alpha":"x","zeta":1}"#);
            }
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_bytes_serde_round_trip() {
        let content = Content::Bytes(vec![0, 1, 2, 250, 255]);
        let json = serde_json::to_string(&content).unwrap();
        assert!(json.contains("bytes"));
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let fragment = MemoryFragment::text("", "hello");
        assert!(matches!(
            fragment.validate(),
            Err(Error::InvalidFragment(_))
        ));

        let fragment = MemoryFragment::text("   ", "hello");
        assert!(fragment.validate().is_err());

        let fragment = MemoryFragment::text("frag-1", "hello");
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn test_splice_round_trip() {
        let content = Content::Text("abcdef".to_string());
        let units = content.to_units();
        let mut out = ContentUnits::empty(ContentKind::Text);
        assert!(out.push_content(&units.slice(0, 3)));
        assert!(out.push_content(&units.slice(3, 6)));
        assert_eq!(out.into_content(), content);
    }

    #[test]
    fn test_placeholder_fill() {
        let mut out = ContentUnits::empty(ContentKind::Bytes);
        out.push_placeholder(4);
        assert_eq!(out.into_content(), Content::Bytes(vec![0, 0, 0, 0]));
    }
}
