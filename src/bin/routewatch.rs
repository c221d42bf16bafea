use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use routewatch::{
    BusSubscription, CanonicalNormalizer, Config, DetectorRegistry, Normalizer, Pipeline,
    RisLiveNormalizer,
};

/// routewatch - BGP prefix monitoring
#[derive(Debug, Parser)]
#[command(name = "routewatch", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read routing messages from stdin, one per line, and print alerts as JSON lines
    Run {
        /// Configuration file
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,

        /// Input is RIS Live frames instead of canonical events
        #[arg(long)]
        ris: bool,
    },

    /// Validate the configuration and prefix files
    Check {
        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
    },

    /// Fire the canned events of a detector and print the resulting alerts
    SelfTest {
        /// Detector channel or name (e.g. "hijack")
        target: String,

        #[arg(long, short, default_value = "config.yml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs on stderr, alerts on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, ris } => {
            let normalizer: Arc<dyn Normalizer> = if ris {
                Arc::new(RisLiveNormalizer)
            } else {
                Arc::new(CanonicalNormalizer)
            };
            run(&config, normalizer).await?;
        }
        Commands::Check { config } => {
            let (config, records) = load(&config)?;
            config.validate(&DetectorRegistry::default())?;
            routewatch::PolicyStore::new(records, config.pipeline.tie_break.clone())?;
            println!(
                "ok: {} monitors, {} prefix files",
                config.monitors.len(),
                config.monitored_prefixes_files.len()
            );
        }
        Commands::SelfTest { target, config } => {
            self_test(&config, &target).await?;
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<(Config, Vec<routewatch::PrefixRecord>)> {
    let config = Config::from_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let records = config
        .load_prefixes(base)
        .with_context(|| format!("loading prefixes for {}", path.display()))?;
    Ok((config, records))
}

async fn start(path: &Path, normalizer: Arc<dyn Normalizer>) -> anyhow::Result<(Pipeline, Vec<BusSubscription>)> {
    let (config, records) = load(path)?;
    let pipeline = Pipeline::start(&config, records, normalizer).await?;

    let mut channels: Vec<&str> = config.monitors.iter().map(|m| m.channel.as_str()).collect();
    channels.sort_unstable();
    channels.dedup();

    let mut subscriptions = Vec::with_capacity(channels.len());
    for channel in channels {
        subscriptions.push(pipeline.bus().subscribe(channel).await);
    }
    Ok((pipeline, subscriptions))
}

/// Print every alert until all subscriptions close
fn spawn_printer(subscriptions: Vec<BusSubscription>) -> tokio::task::JoinHandle<()> {
    let mut merged = stream::select_all(subscriptions.into_iter().map(BusSubscription::into_stream));
    tokio::spawn(async move {
        while let Some(message) = merged.next().await {
            let Some(alert) = message.alert() else {
                continue;
            };
            let line = serde_json::json!({ "channel": message.channel, "alert": alert });
            println!("{}", line);
        }
    })
}

async fn run(path: &Path, normalizer: Arc<dyn Normalizer>) -> anyhow::Result<()> {
    let (pipeline, subscriptions) = start(path, normalizer).await?;
    let printer = spawn_printer(subscriptions);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut events = 0usize;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        events += pipeline.ingest(&line).await?;
    }

    pipeline.flush().await?;
    tracing::info!(events, "Input exhausted");
    pipeline.shutdown().await;
    printer.await?;
    Ok(())
}

async fn self_test(path: &Path, target: &str) -> anyhow::Result<()> {
    let (pipeline, subscriptions) = start(path, Arc::new(CanonicalNormalizer)).await?;
    let printer = spawn_printer(subscriptions);

    pipeline.trigger_self_test(target).await?;
    pipeline.flush().await?;
    pipeline.shutdown().await;
    printer.await?;
    Ok(())
}
