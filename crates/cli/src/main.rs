//! depot-ingest: push one artifact through the ingestion path and report
//! where it landed, how fast, and its digests.

mod ingest;

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::AppConfig;
use depot_receiver::ReceiverFactory;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "depot-ingest")]
#[command(version, about = "Receive one artifact through the depot ingestion path", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEPOT_CONFIG")]
    config: Option<PathBuf>,

    /// Declared content length. Defaults to the input file's size.
    #[arg(long)]
    content_length: Option<u64>,

    /// Repository (`project/repo`) the artifact belongs to
    #[arg(long)]
    repository: Option<String>,

    /// Copy the received bytes here before the receiver is closed
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    print_metrics: bool,

    /// Input file, or `-` for stdin
    #[arg(default_value = "-")]
    input: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let store = match &config.storage {
        Some(storage) => Some(
            depot_storage::from_config(storage)
                .await
                .context("Failed to initialize storage backend")?,
        ),
        None => None,
    };
    let factory = ReceiverFactory::from_app_config(&config, store);
    let probe = factory.monitor().map(|monitor| monitor.clone().spawn());

    let repository = args.repository.as_deref();
    let output = args.output.as_deref();
    let report = if args.input == "-" {
        let mut stdin = tokio::io::stdin();
        ingest::ingest(&factory, &mut stdin, args.content_length, repository, output).await
    } else {
        let mut file = tokio::fs::File::open(&args.input)
            .await
            .with_context(|| format!("Failed to open {}", args.input))?;
        let content_length = match args.content_length {
            Some(length) => Some(length),
            None => Some(file.metadata().await?.len()),
        };
        ingest::ingest(&factory, &mut file, content_length, repository, output).await
    };

    if let Some(probe) = probe {
        probe.abort();
    }
    let report = report?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.print_metrics {
        eprint!("{}", depot_receiver::metrics::encode_metrics()?);
    }
    Ok(())
}
