//! QFAC - Fractal Memory Compression Engine
//!
//! QFAC compresses memory fragments by detecting self-similar structure
//! across everything it has stored before. Fragments become *episodes*:
//! sequences of references into a shared pattern store interleaved with
//! literal spans. Episodes replay back into their original content at a
//! caller-chosen fidelity, and a background builder clusters the stored
//! patterns into coherence-scored hierarchies for drill-down navigation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     FractalMemoryEngine                         │
//! │                                                                 │
//! │  encode(fragment)        reconstruct(episode, fidelity)         │
//! │        │                          │                             │
//! │  ┌─────▼────────┐        ┌────────▼─────────┐                   │
//! │  │   Fractal    │        │      Replay      │──► LRU cache      │
//! │  │   Encoder    │        │      Engine      │                   │
//! │  └─────┬────────┘        └────────┬─────────┘                   │
//! │        │ stage + commit           │ read-only                   │
//! │  ┌─────▼───────────────────────── ▼────────┐                    │
//! │  │              Pattern Store              │◄── rebuild()       │
//! │  │  patterns ─ content-hash index          │    ┌────────────┐  │
//! │  │  clusters ─ atomic Arc snapshot         │◄───│ Hierarchy  │  │
//! │  └─────┬───────────────────────────────────┘    │  Builder   │  │
//! │        │ async flush / restore                  └────────────┘  │
//! │  ┌─────▼────────────┐                                           │
//! │  │ JSON persistence │   patterns/ episodes/ clusters/           │
//! │  └──────────────────┘                                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine performs no network I/O, no natural-language parsing, and
//! holds no UI state; the surrounding application calls in through
//! [`FractalMemoryEngine`] and owns the episodes it gets back.
//!
//! ## Modules
//!
//! - [`engine`]: the facade, statistics, and the maintenance loop
//! - [`encoder`]: recursive-split fractal compression
//! - [`replay`]: fidelity-budgeted reconstruction with an LRU cache
//! - [`hierarchy`]: agglomerative pattern clustering
//! - [`store`]: thread-safe pattern/cluster storage and JSON persistence
//! - [`similarity`]: pluggable similarity metrics
//! - [`config`]: engine configuration

pub mod config;
pub mod encoder;
pub mod engine;
pub mod episode;
pub mod error;
pub mod fragment;
pub mod hierarchy;
pub mod pattern;
pub mod replay;
pub mod similarity;
pub mod store;

pub use config::{EngineConfig, MetricKind};
pub use engine::{EngineStatistics, FractalMemoryEngine, MaintenanceHandle};
pub use episode::{Episode, EpisodeElement};
pub use error::{Error, Result};
pub use fragment::{Content, ContentKind, MemoryFragment};
pub use hierarchy::cluster::Cluster;
pub use pattern::{Pattern, PatternBody};
pub use replay::ReconstructionResult;
