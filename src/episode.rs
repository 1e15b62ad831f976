//! Episode data types and the compact element codec
//!
//! An episode is the compressed form of one fragment: an ordered run of
//! pattern references and literal spans, each anchored at its unit position
//! in the original content. Episodes are immutable once the encoder emits
//! them and are owned by the caller; the engine keeps none in memory beyond
//! the replay cache.
//!
//! The wire form (`to_bytes`) packs each element behind a single LEB128
//! varint header carrying the tag in its low bit, so a pattern reference
//! costs a few bytes regardless of the span it replaces. That blob is what
//! gets persisted and what the compression ratio is measured against.

use crate::error::{Error, Result};
use crate::fragment::{Content, ContentKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One element of an episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeElement {
    /// Reference to a stored pattern covering `span` units at `position`
    PatternRef {
        /// Referenced pattern ID
        pattern_id: u64,
        /// Unit offset into the original fragment
        position: usize,
        /// Units the resolved pattern covers
        span: usize,
    },
    /// Literal span that matched no stored pattern
    Literal {
        /// The literal content
        content: Content,
        /// Unit offset into the original fragment
        position: usize,
    },
}

impl EpisodeElement {
    /// Unit offset of this element in the original fragment
    pub fn position(&self) -> usize {
        match self {
            EpisodeElement::PatternRef { position, .. } => *position,
            EpisodeElement::Literal { position, .. } => *position,
        }
    }

    /// Units this element covers
    pub fn span(&self) -> usize {
        match self {
            EpisodeElement::PatternRef { span, .. } => *span,
            EpisodeElement::Literal { content, .. } => content.unit_len(),
        }
    }
}

/// The compressed representation of one encoded fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// Deterministic episode identifier (`epi-` + 16 hex chars)
    pub id: String,
    /// Identifier of the fragment this episode encodes
    pub fragment_id: String,
    /// Ordered elements, positions strictly increasing
    pub elements: Vec<EpisodeElement>,
    /// Original fragment length in content units
    pub original_length: usize,
    /// Kind of the original payload, so replay restores the right shape
    pub content_kind: ContentKind,
    /// Encoded size over original size; above 1.0 means the fragment did
    /// not compress, which is reported rather than hidden
    pub compression_ratio: f64,
    /// Taken from the fragment, so identical input yields identical episodes
    pub created_at: DateTime<Utc>,
}

impl Episode {
    /// Derive the episode ID from the fragment identity. Same fragment ID,
    /// content, and timestamp always map to the same episode ID.
    pub fn derive_id(
        fragment_id: &str,
        content: &Content,
        timestamp: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fragment_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(content.canonical_bytes());
        hasher.update(timestamp.timestamp_millis().to_le_bytes());
        let digest = hasher.finalize();
        let mut id = String::with_capacity(20);
        id.push_str("epi-");
        for byte in &digest[..8] {
            id.push_str(&format!("{byte:02x}"));
        }
        id
    }

    /// Whether the episode carries no elements (empty fragment)
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Encode the element run into its compact wire form.
    ///
    /// Layout per element: varint header `(value << 1) | tag`.
    /// Tag 0 (literal): value is the payload byte length, raw bytes follow.
    /// Tag 1 (reference): value is the pattern ID, a span varint follows.
    /// Positions are cumulative and therefore not stored.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for element in &self.elements {
            match element {
                EpisodeElement::Literal { content, .. } => {
                    let payload = match content {
                        Content::Text(s) => s.as_bytes().to_vec(),
                        Content::Bytes(b) => b.clone(),
                        Content::Structured(_) => {
                            // Structured fragments canonicalize to text before
                            // encoding, so a structured literal cannot occur.
                            Vec::new()
                        }
                    };
                    write_varint(&mut out, (payload.len() as u64) << 1);
                    out.extend_from_slice(&payload);
                }
                EpisodeElement::PatternRef {
                    pattern_id, span, ..
                } => {
                    write_varint(&mut out, (*pattern_id << 1) | 1);
                    write_varint(&mut out, *span as u64);
                }
            }
        }
        out
    }

    /// Decode a wire blob back into elements, reconstructing positions
    pub fn elements_from_bytes(bytes: &[u8], kind: ContentKind) -> Result<Vec<EpisodeElement>> {
        let mut elements = Vec::new();
        let mut idx = 0usize;
        let mut position = 0usize;
        while idx < bytes.len() {
            let header = read_varint(bytes, &mut idx)?;
            if header & 1 == 0 {
                let len = (header >> 1) as usize;
                if idx + len > bytes.len() {
                    return Err(Error::Persistence(
                        "episode blob truncated inside a literal".to_string(),
                    ));
                }
                let payload = &bytes[idx..idx + len];
                idx += len;
                let content = match kind {
                    ContentKind::Bytes => Content::Bytes(payload.to_vec()),
                    ContentKind::Text | ContentKind::Structured => {
                        let text = std::str::from_utf8(payload).map_err(|_| {
                            Error::Persistence(
                                "episode literal is not valid UTF-8".to_string(),
                            )
                        })?;
                        Content::Text(text.to_string())
                    }
                };
                let span = content.unit_len();
                elements.push(EpisodeElement::Literal { content, position });
                position += span;
            } else {
                let pattern_id = header >> 1;
                let span = read_varint(bytes, &mut idx)? as usize;
                elements.push(EpisodeElement::PatternRef {
                    pattern_id,
                    position,
                    span,
                });
                position += span;
            }
        }
        Ok(elements)
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], idx: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*idx).ok_or_else(|| {
            Error::Persistence("episode blob truncated inside a varint".to_string())
        })?;
        *idx += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::Persistence(
                "episode blob varint overflows u64".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn episode_with(elements: Vec<EpisodeElement>, kind: ContentKind, len: usize) -> Episode {
        Episode {
            id: "epi-0000000000000000".to_string(),
            fragment_id: "frag-1".to_string(),
            elements,
            original_length: len,
            content_kind: kind,
            compression_ratio: 1.0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_codec_round_trip_text() {
        let episode = episode_with(
            vec![
                EpisodeElement::Literal {
                    content: Content::Text("abc".to_string()),
                    position: 0,
                },
                EpisodeElement::PatternRef {
                    pattern_id: 1,
                    position: 3,
                    span: 3,
                },
                EpisodeElement::PatternRef {
                    pattern_id: 1,
                    position: 6,
                    span: 3,
                },
            ],
            ContentKind::Text,
            9,
        );

        let blob = episode.to_bytes();
        let decoded = Episode::elements_from_bytes(&blob, ContentKind::Text).unwrap();
        assert_eq!(decoded, episode.elements);
    }

    #[test]
    fn test_codec_round_trip_bytes() {
        let episode = episode_with(
            vec![
                EpisodeElement::PatternRef {
                    pattern_id: 300,
                    position: 0,
                    span: 200,
                },
                EpisodeElement::Literal {
                    content: Content::Bytes(vec![7u8; 40]),
                    position: 200,
                },
            ],
            ContentKind::Bytes,
            240,
        );

        let blob = episode.to_bytes();
        let decoded = Episode::elements_from_bytes(&blob, ContentKind::Bytes).unwrap();
        assert_eq!(decoded, episode.elements);
    }

    #[test]
    fn test_reference_is_smaller_than_its_span() {
        let episode = episode_with(
            vec![EpisodeElement::PatternRef {
                pattern_id: 12,
                position: 0,
                span: 120,
            }],
            ContentKind::Text,
            120,
        );
        assert!(episode.to_bytes().len() <= 3);
    }

    #[test]
    fn test_multibyte_literal_positions() {
        // "héé" is 3 units but 5 UTF-8 bytes
        let episode = episode_with(
            vec![
                EpisodeElement::Literal {
                    content: Content::Text("héé".to_string()),
                    position: 0,
                },
                EpisodeElement::PatternRef {
                    pattern_id: 2,
                    position: 3,
                    span: 4,
                },
            ],
            ContentKind::Text,
            7,
        );

        let decoded = Episode::elements_from_bytes(&episode.to_bytes(), ContentKind::Text).unwrap();
        assert_eq!(decoded[1].position(), 3);
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let episode = episode_with(
            vec![EpisodeElement::Literal {
                content: Content::Text("hello world".to_string()),
                position: 0,
            }],
            ContentKind::Text,
            11,
        );
        let mut blob = episode.to_bytes();
        blob.truncate(blob.len() - 3);
        assert!(Episode::elements_from_bytes(&blob, ContentKind::Text).is_err());
    }

    #[test]
    fn test_derive_id_is_deterministic() {
        let content = Content::Text("same input".to_string());
        let at = Utc::now();
        let a = Episode::derive_id("frag-1", &content, at);
        let b = Episode::derive_id("frag-1", &content, at);
        assert_eq!(a, b);
        assert!(a.starts_with("epi-"));
        assert_eq!(a.len(), 20);

        let later = at + chrono::Duration::milliseconds(5);
        assert_ne!(a, Episode::derive_id("frag-1", &content, later));
        assert_ne!(a, Episode::derive_id("frag-2", &content, at));
    }

    #[test]
    fn test_varint_round_trip_large_values() {
        let mut buf = Vec::new();
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64] {
            buf.clear();
            write_varint(&mut buf, value);
            let mut idx = 0;
            assert_eq!(read_varint(&buf, &mut idx).unwrap(), value);
            assert_eq!(idx, buf.len());
        }
    }
}
