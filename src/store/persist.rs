//! JSON file persistence for patterns, episodes, and clusters
//!
//! Three directories mirror the three logical tables:
//!
//! ```text
//! <data_dir>/
//! ├── patterns/pat-<id>.json
//! ├── episodes/<episode-id>.json
//! └── clusters/clusters.json
//! ```
//!
//! Loading skips individual corrupt files with a warning instead of failing
//! the whole restore; a half-written file from a crashed flush costs one
//! record, not the store. Composite validation happens in
//! `PatternStore::install_patterns`, not here.

use crate::episode::Episode;
use crate::error::{Error, Result};
use crate::fragment::ContentKind;
use crate::hierarchy::cluster::Cluster;
use crate::pattern::{Pattern, PatternBody};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Storage seam for engine state
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Persist one pattern record
    async fn save_pattern(&self, pattern: &Pattern) -> Result<()>;

    /// Persist one episode record
    async fn save_episode(&self, episode: &Episode) -> Result<()>;

    /// Persist the whole installed cluster set
    async fn save_clusters(&self, clusters: &[Cluster]) -> Result<()>;

    /// Load every persisted pattern record
    async fn load_patterns(&self) -> Result<Vec<Pattern>>;

    /// Load one persisted episode by ID
    async fn load_episode(&self, episode_id: &str) -> Result<Episode>;

    /// Load the persisted cluster set (empty when none was ever saved)
    async fn load_clusters(&self) -> Result<Vec<Cluster>>;
}

/// Persisted form of a pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternRecord {
    id: u64,
    body: PatternBody,
    frequency: u64,
    depth: u32,
    observed_in: Vec<String>,
    created_at: DateTime<Utc>,
}

impl PatternRecord {
    fn from_pattern(pattern: &Pattern) -> Self {
        let mut observed_in: Vec<String> = pattern.observed_in.iter().cloned().collect();
        observed_in.sort_unstable();
        Self {
            id: pattern.id,
            body: pattern.body.clone(),
            frequency: pattern.frequency,
            depth: pattern.depth,
            observed_in,
            created_at: pattern.created_at,
        }
    }

    fn into_pattern(self) -> Pattern {
        Pattern {
            id: self.id,
            body: self.body,
            frequency: self.frequency,
            depth: self.depth,
            // Recomputed during install
            resolved_len: 0,
            observed_in: self.observed_in.into_iter().collect(),
            created_at: self.created_at,
        }
    }
}

/// Persisted form of an episode; elements travel as the compact blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpisodeRecord {
    id: String,
    fragment_id: String,
    elements_blob: String,
    original_length: usize,
    content_kind: ContentKind,
    compression_ratio: f64,
    created_at: DateTime<Utc>,
}

impl EpisodeRecord {
    fn from_episode(episode: &Episode) -> Self {
        Self {
            id: episode.id.clone(),
            fragment_id: episode.fragment_id.clone(),
            elements_blob: STANDARD.encode(episode.to_bytes()),
            original_length: episode.original_length,
            content_kind: episode.content_kind,
            compression_ratio: episode.compression_ratio,
            created_at: episode.created_at,
        }
    }

    fn into_episode(self) -> Result<Episode> {
        let blob = STANDARD
            .decode(self.elements_blob.as_bytes())
            .map_err(|e| Error::Persistence(format!("episode {} blob: {e}", self.id)))?;
        let elements = Episode::elements_from_bytes(&blob, self.content_kind)?;
        Ok(Episode {
            id: self.id,
            fragment_id: self.fragment_id,
            elements,
            original_length: self.original_length,
            content_kind: self.content_kind,
            compression_ratio: self.compression_ratio,
            created_at: self.created_at,
        })
    }
}

/// JSON-file backend rooted at one data directory
pub struct JsonFileBackend {
    patterns_dir: PathBuf,
    episodes_dir: PathBuf,
    clusters_file: PathBuf,
}

impl JsonFileBackend {
    /// Open (creating directories as needed) a backend under `base_dir`
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base = base_dir.as_ref();
        let patterns_dir = base.join("patterns");
        let episodes_dir = base.join("episodes");
        let clusters_dir = base.join("clusters");
        tokio::fs::create_dir_all(&patterns_dir).await?;
        tokio::fs::create_dir_all(&episodes_dir).await?;
        tokio::fs::create_dir_all(&clusters_dir).await?;
        Ok(Self {
            patterns_dir,
            episodes_dir,
            clusters_file: clusters_dir.join("clusters.json"),
        })
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Read every `.json` file in `dir`, skipping unparseable entries
    async fn load_json_files<T: DeserializeOwned>(&self, dir: &Path) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                    continue;
                }
            };
            match serde_json::from_str::<T>(&raw) {
                Ok(value) => out.push(value),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt file");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl PersistenceBackend for JsonFileBackend {
    async fn save_pattern(&self, pattern: &Pattern) -> Result<()> {
        let path = self.patterns_dir.join(format!("pat-{}.json", pattern.id));
        self.write_json(&path, &PatternRecord::from_pattern(pattern))
            .await
    }

    async fn save_episode(&self, episode: &Episode) -> Result<()> {
        let path = self.episodes_dir.join(format!("{}.json", episode.id));
        self.write_json(&path, &EpisodeRecord::from_episode(episode))
            .await
    }

    async fn save_clusters(&self, clusters: &[Cluster]) -> Result<()> {
        self.write_json(&self.clusters_file, &clusters).await
    }

    async fn load_patterns(&self) -> Result<Vec<Pattern>> {
        let records: Vec<PatternRecord> = self.load_json_files(&self.patterns_dir).await?;
        Ok(records.into_iter().map(PatternRecord::into_pattern).collect())
    }

    async fn load_episode(&self, episode_id: &str) -> Result<Episode> {
        let path = self.episodes_dir.join(format!("{episode_id}.json"));
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| Error::Persistence(format!("episode {episode_id} is not persisted")))?;
        let record: EpisodeRecord = serde_json::from_str(&raw)?;
        record.into_episode()
    }

    async fn load_clusters(&self) -> Result<Vec<Cluster>> {
        match tokio::fs::read_to_string(&self.clusters_file).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
