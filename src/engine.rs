//! Engine facade wiring the store, encoder, replay engine, and hierarchy
//! builder behind one handle
//!
//! `FractalMemoryEngine` is the surface the host application talks to:
//! `encode`, `reconstruct`, `rebuild_hierarchies`, `get_statistics`. It owns
//! the pattern store and hands `Arc` references to the subsystems, so there
//! is no process-wide registry; engine lifetime bounds everything. With a
//! data directory configured it also restores state on startup and flushes
//! changes back out, asynchronously on the hot paths and synchronously via
//! [`FractalMemoryEngine::flush`].

use crate::config::EngineConfig;
use crate::encoder::FractalEncoder;
use crate::episode::Episode;
use crate::error::{Error, Result};
use crate::fragment::MemoryFragment;
use crate::hierarchy::cluster::Cluster;
use crate::hierarchy::{CancelToken, HierarchyBuilder, RebuildOutcome};
use crate::replay::{ReconstructionResult, ReplayEngine};
use crate::similarity::metric_for;
use crate::store::persist::{JsonFileBackend, PersistenceBackend};
use crate::store::PatternStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    /// Patterns currently held by the store
    pub pattern_count: usize,
    /// Clusters in the installed hierarchy snapshot
    pub cluster_count: usize,
    /// Episodes encoded by this engine instance
    pub episode_count: u64,
    /// Mean compression ratio across those episodes (0.0 when none)
    pub avg_compression_ratio: f64,
    /// Fraction of reconstructions served from the replay cache
    pub cache_hit_rate: f64,
    /// Highest level present in the installed hierarchy (0 = none)
    pub hierarchy_levels: u32,
}

/// Running compression-ratio accumulator
#[derive(Debug, Default)]
struct RatioStats {
    episodes: u64,
    ratio_sum: f64,
}

/// The public face of the compression engine.
///
/// All shared state lives behind the owned [`PatternStore`]; the engine
/// itself can be wrapped in an `Arc` and called concurrently from any
/// number of tasks.
pub struct FractalMemoryEngine {
    store: Arc<PatternStore>,
    encoder: FractalEncoder,
    replay: ReplayEngine,
    hierarchy: HierarchyBuilder,
    persistence: Option<Arc<dyn PersistenceBackend>>,
    /// Episodes handed to a background flush that has not confirmed the
    /// write yet; `flush` drains whatever is still here so durability
    /// never depends on a spawned task getting scheduled
    pending_episodes: Arc<Mutex<HashMap<String, Episode>>>,
    ratios: RwLock<RatioStats>,
}

impl FractalMemoryEngine {
    /// Build an in-memory engine from a validated configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let metric = metric_for(config.metric);
        let store = Arc::new(PatternStore::new(
            metric.clone(),
            config.storage.max_patterns,
        ));
        Ok(Self {
            encoder: FractalEncoder::new(store.clone(), config.encoder.clone()),
            replay: ReplayEngine::new(store.clone(), &config.replay),
            hierarchy: HierarchyBuilder::new(store.clone(), metric, config.hierarchy.clone()),
            store,
            persistence: None,
            pending_episodes: Arc::new(Mutex::new(HashMap::new())),
            ratios: RwLock::new(RatioStats::default()),
        })
    }

    /// Build an engine backed by the JSON persistence layer at
    /// `config.storage.data_dir`, restoring patterns and clusters saved by
    /// previous runs.
    pub async fn with_persistence(config: EngineConfig) -> Result<Self> {
        let data_dir = config.storage.data_dir.clone().ok_or_else(|| {
            Error::Config("storage.data_dir is required for persistence".to_string())
        })?;
        let mut engine = Self::new(config)?;
        let backend = JsonFileBackend::open(&data_dir).await?;

        let patterns = backend.load_patterns().await?;
        let restored = engine.store.install_patterns(patterns).await?;
        let clusters = backend.load_clusters().await?;
        let cluster_count = clusters.len();
        engine.store.replace_clusters(clusters).await;
        // Restored patterns are already on disk; don't rewrite them on the
        // first flush.
        engine.store.take_dirty().await;
        info!(
            data_dir = %data_dir.display(),
            patterns = restored,
            clusters = cluster_count,
            "Restored engine state"
        );

        engine.persistence = Some(Arc::new(backend));
        Ok(engine)
    }

    /// Compress one fragment into an episode.
    ///
    /// The episode is caller-owned; the engine keeps no copy beyond the
    /// replay cache. New and touched patterns plus the episode record are
    /// flushed in the background when persistence is enabled, without
    /// gating the call.
    pub async fn encode(&self, fragment: &MemoryFragment) -> Result<Episode> {
        let episode = self.encoder.encode(fragment).await?;

        {
            let mut ratios = self.ratios.write().await;
            ratios.episodes += 1;
            ratios.ratio_sum += episode.compression_ratio;
        }

        if let Some(backend) = &self.persistence {
            let backend = backend.clone();
            let store = self.store.clone();
            let pending = self.pending_episodes.clone();
            let snapshot = episode.clone();
            pending
                .lock()
                .await
                .insert(snapshot.id.clone(), snapshot.clone());
            tokio::spawn(async move {
                match backend.save_episode(&snapshot).await {
                    Ok(()) => {
                        pending.lock().await.remove(&snapshot.id);
                    }
                    Err(e) => {
                        // Stays pending; the next flush retries it
                        warn!(episode_id = %snapshot.id, error = %e, "Background episode flush failed");
                    }
                }
                for pattern in store.take_dirty().await {
                    if let Err(e) = backend.save_pattern(&pattern).await {
                        warn!(pattern_id = pattern.id, error = %e, "Background pattern flush failed");
                    }
                }
            });
        }

        Ok(episode)
    }

    /// Reconstruct an episode at the requested fidelity (1.0 = exact).
    pub async fn reconstruct(
        &self,
        episode: &Episode,
        fidelity: f64,
    ) -> Result<ReconstructionResult> {
        self.replay.reconstruct(episode, fidelity).await
    }

    /// Rebuild the pattern hierarchy and atomically install the result.
    ///
    /// Returns the newly installed cluster set. Idempotent for an
    /// unchanged store.
    pub async fn rebuild_hierarchies(&self) -> Result<Vec<Cluster>> {
        match self.rebuild_with_cancel(&CancelToken::new()).await? {
            Some(clusters) => Ok(clusters),
            // A fresh token is never cancelled; a cancelled rebuild is a
            // no-op, so the installed set is the right answer either way
            None => Ok(self.store.clusters().await.as_ref().clone()),
        }
    }

    /// Cancellable rebuild used by the maintenance loop. `None` means the
    /// rebuild observed a cancellation; the previously installed cluster
    /// set stays untouched.
    async fn rebuild_with_cancel(&self, cancel: &CancelToken) -> Result<Option<Vec<Cluster>>> {
        let clusters = match self.hierarchy.rebuild_with_cancel(cancel).await {
            RebuildOutcome::Completed(clusters) => clusters,
            RebuildOutcome::Cancelled => {
                debug!("Hierarchy rebuild cancelled; previous cluster set retained");
                return Ok(None);
            }
        };

        self.store.replace_clusters(clusters.clone()).await;
        info!(clusters = clusters.len(), "Hierarchy installed");

        if let Some(backend) = &self.persistence {
            let backend = backend.clone();
            let snapshot = clusters.clone();
            tokio::spawn(async move {
                if let Err(e) = backend.save_clusters(&snapshot).await {
                    warn!(error = %e, "Background cluster flush failed");
                }
            });
        }

        Ok(Some(clusters))
    }

    /// Reload a previously persisted episode by ID.
    pub async fn recall_episode(&self, episode_id: &str) -> Result<Episode> {
        let backend = self
            .persistence
            .as_ref()
            .ok_or_else(|| Error::Persistence("persistence is not enabled".to_string()))?;
        backend.load_episode(episode_id).await
    }

    /// Current engine counters.
    pub async fn get_statistics(&self) -> EngineStatistics {
        let ratios = self.ratios.read().await;
        let avg = if ratios.episodes == 0 {
            0.0
        } else {
            ratios.ratio_sum / ratios.episodes as f64
        };
        let clusters = self.store.clusters().await;
        EngineStatistics {
            pattern_count: self.store.pattern_count().await,
            cluster_count: clusters.len(),
            episode_count: ratios.episodes,
            avg_compression_ratio: avg,
            cache_hit_rate: self.replay.cache_hit_rate(),
            hierarchy_levels: clusters.iter().map(|c| c.level).max().unwrap_or(0),
        }
    }

    /// Synchronously flush all unsaved episodes, patterns, and the
    /// installed cluster set, surfacing any persistence error. No-op
    /// without persistence.
    pub async fn flush(&self) -> Result<()> {
        let Some(backend) = &self.persistence else {
            return Ok(());
        };
        let episodes: Vec<Episode> = {
            let pending = self.pending_episodes.lock().await;
            pending.values().cloned().collect()
        };
        for episode in episodes {
            backend.save_episode(&episode).await?;
            self.pending_episodes.lock().await.remove(&episode.id);
        }
        for pattern in self.store.take_dirty().await {
            backend.save_pattern(&pattern).await?;
        }
        let clusters = self.store.clusters().await;
        backend.save_clusters(&clusters).await?;
        Ok(())
    }

    /// Spawn the periodic hierarchy maintenance task.
    ///
    /// Every `interval` the task rebuilds the hierarchy; the returned
    /// handle stops the loop and cancels an in-flight rebuild cooperatively.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> MaintenanceHandle {
        let engine = self.clone();
        let cancel = CancelToken::new();
        let stop = Arc::new(Notify::new());

        let loop_cancel = cancel.clone();
        let loop_stop = stop.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a freshly
            // started engine isn't rebuilt before it holds any patterns.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Maintenance tick: rebuilding hierarchy");
                        match engine.rebuild_with_cancel(&loop_cancel).await {
                            Ok(Some(_)) => {}
                            Ok(None) => break,
                            Err(e) => warn!(error = %e, "Maintenance rebuild failed"),
                        }
                    }
                    _ = loop_stop.notified() => break,
                }
            }
            info!("Maintenance loop stopped");
        });

        MaintenanceHandle { cancel, stop, task }
    }
}

/// Controls a running maintenance loop.
pub struct MaintenanceHandle {
    cancel: CancelToken,
    stop: Arc<Notify>,
    task: tokio::task::JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the loop, cancelling any in-flight rebuild, and wait for it to
    /// finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.stop.notify_one();
        let _ = self.task.await;
    }
}
