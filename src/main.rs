//! QFAC - Fractal Memory Compression Engine
//!
//! Command-line front end over the engine library: encode fragments into
//! episodes, reconstruct them at a chosen fidelity, rebuild the pattern
//! hierarchy, and inspect engine statistics. State lives in a JSON data
//! directory so episodes survive across invocations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qfac::{Cluster, Content, EngineConfig, FractalMemoryEngine, MemoryFragment};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "qfac")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Fractal memory compression engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QFAC_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (default: ~/.qfac)
    #[arg(long, env = "QFAC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a fragment into an episode
    Encode {
        /// Fragment identifier
        #[arg(long)]
        id: Option<String>,

        /// Read fragment content from a file
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Fragment content given inline
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Reconstruct a persisted episode
    Reconstruct {
        /// Episode identifier (epi-…)
        episode_id: String,

        /// Requested fidelity in [0.0, 1.0]
        #[arg(long, default_value_t = 1.0)]
        fidelity: f64,

        /// Write reconstructed content to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Rebuild the pattern hierarchy once
    Rebuild,

    /// Show engine statistics
    Stats,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("qfac={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if let Some(config_path) = &cli.config {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("reading config {}", config_path.display()))?;
        toml::from_str::<EngineConfig>(&content)?
    } else {
        EngineConfig::default()
    };

    if let Commands::Config { default } = &cli.command {
        let rendered = if *default {
            toml::to_string_pretty(&EngineConfig::default())?
        } else {
            toml::to_string_pretty(&config)?
        };
        print!("{rendered}");
        return Ok(());
    }

    // CLI flag > config file > ~/.qfac
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    if config.storage.data_dir.is_none() {
        config.storage.data_dir = dirs_next::home_dir().map(|home| home.join(".qfac"));
    }

    let engine = FractalMemoryEngine::with_persistence(config).await?;

    match cli.command {
        Commands::Encode { id, file, text } => {
            run_encode(&engine, id, file, text).await?;
        }
        Commands::Reconstruct {
            episode_id,
            fidelity,
            out,
        } => {
            run_reconstruct(&engine, &episode_id, fidelity, out).await?;
        }
        Commands::Rebuild => {
            let clusters = engine.rebuild_hierarchies().await?;
            print_cluster_tree(&clusters);
        }
        Commands::Stats => {
            let stats = engine.get_statistics().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Config { .. } => unreachable!("handled before engine startup"),
    }

    engine.flush().await?;
    Ok(())
}

async fn run_encode(
    engine: &FractalMemoryEngine,
    id: Option<String>,
    file: Option<PathBuf>,
    text: Option<String>,
) -> Result<()> {
    let fragment_id = id.unwrap_or_else(|| format!("frag-{}", uuid::Uuid::new_v4()));
    let fragment = match (file, text) {
        (Some(path), None) => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading fragment {}", path.display()))?;
            match String::from_utf8(bytes) {
                Ok(text) => MemoryFragment::text(fragment_id, text),
                Err(e) => MemoryFragment::bytes(fragment_id, e.into_bytes()),
            }
        }
        (None, Some(text)) => MemoryFragment::text(fragment_id, text),
        _ => anyhow::bail!("exactly one of --file or --text is required"),
    };

    let episode = engine.encode(&fragment).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "episode_id": episode.id,
            "fragment_id": episode.fragment_id,
            "elements": episode.elements.len(),
            "original_length": episode.original_length,
            "compression_ratio": episode.compression_ratio,
        }))?
    );
    Ok(())
}

async fn run_reconstruct(
    engine: &FractalMemoryEngine,
    episode_id: &str,
    fidelity: f64,
    out: Option<PathBuf>,
) -> Result<()> {
    let episode = engine.recall_episode(episode_id).await?;
    let result = engine.reconstruct(&episode, fidelity).await?;

    eprintln!(
        "achieved_fidelity={:.3} unresolved_refs={} latency={:?}",
        result.achieved_fidelity, result.unresolved_refs, result.latency
    );
    let bytes = match result.content {
        Content::Text(text) => text.into_bytes(),
        Content::Bytes(bytes) => bytes,
        Content::Structured(map) => serde_json::to_vec_pretty(&map)?,
    };
    match out {
        Some(path) => std::fs::write(&path, bytes)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            use std::io::Write as _;
            std::io::stdout().write_all(&bytes)?;
            println!();
        }
    }
    Ok(())
}

fn print_cluster_tree(clusters: &[Cluster]) {
    if clusters.is_empty() {
        println!("no clusters (fewer than min_cluster_size groupable patterns)");
        return;
    }
    let mut levels: Vec<u32> = clusters.iter().map(|c| c.level).collect();
    levels.sort_unstable();
    levels.dedup();
    for level in levels.into_iter().rev() {
        println!("level {level}:");
        for cluster in clusters.iter().filter(|c| c.level == level) {
            println!(
                "  {:#018x} coherence={:.3} members={:?} children={}",
                cluster.id,
                cluster.coherence,
                cluster.member_pattern_ids,
                cluster.child_cluster_ids.len()
            );
        }
    }
}
