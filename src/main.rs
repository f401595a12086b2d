use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::io::AsyncReadExt;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ouroboros_toolcache::hook::{self, HookInput, HookOutput, PendingSpool};
use ouroboros_toolcache::{AdapterOverrides, CacheConfig, FileStore, ToolCacheAdapter};

/// One post hook in this many also sweeps expired entries
const SWEEP_ONE_IN: u32 = 20;

#[derive(Parser)]
#[command(name = "toolcache")]
#[command(about = "Tool result cache for agent tool hooks", long_about = None)]
struct Cli {
    /// Cache directory
    #[arg(long, env = "TOOLCACHE_DIR", global = true)]
    cache_dir: Option<PathBuf>,

    /// JSON file with policy and invalidation overrides
    #[arg(long, global = true)]
    overrides: Option<PathBuf>,

    /// Emit the per-call cache trace on stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// PreToolUse hook: serve a cached result or let the tool run
    Pre,

    /// PostToolUse hook: invalidate and store the tool's result
    Post,

    /// Show cache statistics
    Stats,

    /// Remove cached entries
    Clear {
        /// Only clear entries for this tool
        #[arg(long)]
        tool: Option<String>,
    },

    /// Remove one entry by key
    Invalidate {
        key: String,
    },

    /// Remove every locator-scoped entry for a path
    InvalidatePath {
        path: String,
    },

    /// Remove expired entries and stale pending lookups
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    // stdout carries the hook protocol, so logs go to stderr
    let default_filter = if cli.debug {
        "ouroboros_toolcache=warn,toolcache::trace=debug"
    } else {
        "ouroboros_toolcache=warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Pre | Commands::Post => {
            // Hooks never fail the host: any error lets the tool run
            let output = match run_hook(&cli).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("toolcache hook degraded: {:#}", e);
                    HookOutput::allow()
                }
            };
            println!("{}", output.to_json());
        }

        Commands::Stats => {
            let adapter = open(&cli).await?;
            let stats = adapter.stats().await?;
            println!("Cache directory: {}", cache_dir(&cli).display());
            println!("{}", stats);
        }

        Commands::Clear { ref tool } => {
            let adapter = open(&cli).await?;
            let removed = adapter.clear(tool.as_deref()).await?;
            println!("Removed {} entries", removed);
        }

        Commands::Invalidate { ref key } => {
            let adapter = open(&cli).await?;
            if adapter.invalidate(key).await? {
                println!("Removed {}", key);
            } else {
                println!("No entry for {}", key);
            }
        }

        Commands::InvalidatePath { ref path } => {
            let adapter = open(&cli).await?;
            let removed = adapter.invalidate_by_locator(path).await?;
            println!("Removed {} entries for {}", removed, path);
        }

        Commands::Sweep => {
            let adapter = open(&cli).await?;
            let spool = PendingSpool::open(cache_dir(&cli)).await?;
            let expired = adapter.evict_expired().await?;
            let orphaned = spool.sweep(adapter.config().pending_ttl).await?;
            println!(
                "Removed {} expired entries and {} stale pending lookups",
                expired, orphaned
            );
        }
    }

    Ok(())
}

async fn run_hook(cli: &Cli) -> Result<HookOutput> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    let event = HookInput::parse(&raw)?;

    let adapter = open(cli).await?;
    // Pending lookups are per session; cached results are shared by all
    let spool = PendingSpool::for_session(cache_dir(cli), event.session_id.as_deref()).await?;

    let output = match cli.command {
        Commands::Pre => hook::handle_pre(&adapter, &spool, &event).await,
        _ => {
            let output = hook::handle_post(&adapter, &spool, &event).await;
            if rand::thread_rng().gen_ratio(1, SWEEP_ONE_IN) {
                adapter.evict_expired().await?;
                PendingSpool::open(cache_dir(cli))
                    .await?
                    .sweep(adapter.config().pending_ttl)
                    .await?;
            }
            output
        }
    };

    Ok(output)
}

fn cache_dir(cli: &Cli) -> PathBuf {
    cli.cache_dir.clone().unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ouroboros-toolcache")
    })
}

async fn open(cli: &Cli) -> Result<ToolCacheAdapter> {
    let root = cache_dir(cli);

    let mut config = CacheConfig::from_env()?;
    if cli.debug {
        config.debug = true;
    }

    let store = FileStore::from_config(&root, &config).await?;
    let mut builder = ToolCacheAdapter::builder()
        .config(config)
        .store(Arc::new(store));
    if let Some(path) = &cli.overrides {
        builder = builder.overrides(AdapterOverrides::from_file(path)?);
    }

    Ok(builder.build()?)
}
