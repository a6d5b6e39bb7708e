//! trove-meta - metadata engine admin tool
//!
//! **Usage:**
//! ```bash
//! trove-meta [--config <file>] config
//! trove-meta verify <artifact> <sha256>
//! trove-meta manifest <url-or-path>
//! trove-meta state
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use trove_common::config::{init_tracing, ConfigResolver};
use trove_meta::artifact::{normalize_checksum, sha256_file};
use trove_meta::manifest::load_manifest;

/// Trove metadata engine admin tool
#[derive(Parser, Debug)]
#[clap(name = "trove-meta", version)]
#[clap(about = "Inspect configuration, plugin artifacts and persisted engine state")]
struct Args {
    /// Config file (overrides TROVE_CONFIG and the user config directory)
    #[clap(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as TOML
    Config,

    /// Check a plugin artifact against its expected SHA-256
    Verify {
        artifact: PathBuf,
        sha256: String,
    },

    /// Fetch an update manifest and list its channels
    Manifest { locator: String },

    /// Show persisted provider state and version records
    State,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigResolver::new(args.config.clone()).load()?;
    init_tracing(&config.logging)?;
    info!("trove-meta v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Config => {
            let text = toml::to_string_pretty(&config).context("serialise configuration")?;
            println!("{}", text);
        }

        Command::Verify { artifact, sha256 } => {
            let actual = sha256_file(&artifact)
                .await
                .with_context(|| format!("hash {}", artifact.display()))?;
            if actual != normalize_checksum(&sha256) {
                bail!("checksum mismatch: expected {}, got {}", sha256, actual);
            }
            println!("OK {}  {}", actual, artifact.display());
        }

        Command::Manifest { locator } => {
            let manifest = load_manifest(&locator).await?;
            println!("{}", manifest.name);
            for (channel, release) in &manifest.versions {
                let min_engine = release
                    .min_engine_version
                    .map(|v| format!(" (engine >= {})", v))
                    .unwrap_or_default();
                println!("  {:<10} {}{}", channel, release.version, min_engine);
                if let Some(changelog) = &release.changelog {
                    println!("             {}", changelog);
                }
            }
        }

        Command::State => show_state(&config.engine).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlx")]
async fn show_state(engine: &trove_common::config::EngineConfig) -> Result<()> {
    use trove_meta::store::{SqliteStateStore, StateStore};

    let Some(path) = &engine.database_path else {
        bail!("no [engine] database_path configured");
    };
    let store = SqliteStateStore::open(path).await?;

    for row in store.load_provider_states().await? {
        println!(
            "{:<16} {:<10} {:<8} ok={} failed={}",
            row.provider,
            row.active_version,
            if row.enabled { "enabled" } else { "disabled" },
            row.successes,
            row.failures
        );
    }
    for record in store.load_versions().await? {
        let status = match record.uninstalled_at {
            Some(at) => format!("uninstalled {}", at.to_rfc3339()),
            None => "live".to_string(),
        };
        println!(
            "  {} {} [{}] {}",
            record.provider, record.version, status, record.artifact
        );
    }
    Ok(())
}

#[cfg(not(feature = "sqlx"))]
async fn show_state(_engine: &trove_common::config::EngineConfig) -> Result<()> {
    bail!("built without the sqlx feature; no persisted state to show")
}
