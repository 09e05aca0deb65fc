//! # tagharvest
//!
//! Resolves a list of telemetry tags against a subscription server in
//! bounded batches, writing one value per tag to a timestamped CSV file.
//! Runs on a fixed cadence until Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser};
use tagharvest_config::{ConfigLoad, ConfigLoader};
use tagharvest_core::harvest::{HarvestConfig, HarvestProcessor, RunOutcome};
use tagharvest_core::input::{TagListFile, TagSource};
use tagharvest_core::output::CsvOutput;
use tagharvest_core::session::SubscriptionSession;
use tagharvest_service::{ServiceHost, demo, shutdown_signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "tagharvest")]
#[command(about = "Batch-resolve telemetry tags against a subscription server")]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Configuration file (TOML or JSON). Skips discovery.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server endpoint (overrides config)
    #[arg(long, env = "TAGHARVEST_ENDPOINT_URL")]
    endpoint: Option<String>,

    /// Tag list file (overrides config)
    #[arg(long, env = "TAGHARVEST_TAG_FILE")]
    tags: Option<PathBuf>,

    /// Folder for result files (overrides config)
    #[arg(long, env = "TAGHARVEST_RESULT_FOLDER")]
    output: Option<PathBuf>,

    /// Perform a single run and exit; non-zero exit status if it failed
    #[arg(long)]
    once: bool,

    /// Print the final run report as JSON (with --once)
    #[arg(long, requires = "once")]
    json: bool,

    /// Run against an in-memory server seeded with this many tags
    #[arg(long, value_name = "TAGS")]
    simulate: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Progress summaries on, per-notification noise off. Override via RUST_LOG.
                "info,harvest::drain=info,harvest::session=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = cli.run;
    let loader = ConfigLoader::new();
    let ConfigLoad {
        mut config,
        source,
        warnings,
    } = match &args.config {
        Some(path) => loader.load_file(path),
        None => loader.load(),
    }
    .context("failed to load configuration")?;
    info!(source = %source, warnings = warnings.len(), "configuration loaded");

    if let Some(endpoint) = args.endpoint.clone() {
        config.endpoint_url = endpoint;
    }
    if let Some(tags) = args.tags.clone() {
        config.input.tag_list_folder = tags
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        config.input.tag_list_file = tags
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("--tags must name a file")?;
    }
    if let Some(output) = args.output.clone() {
        config.output.result_folder = output;
    }

    let (session, tags): (Arc<dyn SubscriptionSession>, Arc<dyn TagSource>) = match args.simulate {
        Some(count) => {
            demo::quicken(&mut config);
            let (server, tags) = demo::demo_server(count);
            warn!(tags = count, "running against the in-memory simulated server");
            let session: Arc<dyn SubscriptionSession> = Arc::new(server.session());
            let tags: Arc<dyn TagSource> = Arc::new(tags);
            (session, tags)
        }
        None => {
            let tags: Arc<dyn TagSource> =
                Arc::new(TagListFile::new(config.input.tag_list_path()));
            (protocol_adapter(&config)?, tags)
        }
    };

    config.validate().context("invalid configuration after overrides")?;
    let processor = Arc::new(HarvestProcessor::new(
        config.clone(),
        session,
        tags,
        Arc::new(CsvOutput::new(config.output.clone())),
    ));
    let host = ServiceHost::new(processor, config.service.clone());

    let token = host.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        token.cancel();
    });

    if args.once {
        let report = host.run_once().await;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        if let RunOutcome::Failed(reason) = &report.outcome {
            bail!("run {} failed: {reason}", report.run_id);
        }
        return Ok(());
    }

    host.run().await;
    Ok(())
}

/// Session adapter for `config.endpoint_url`.
#[cfg(feature = "opcua")]
fn protocol_adapter(config: &HarvestConfig) -> anyhow::Result<Arc<dyn SubscriptionSession>> {
    use tagharvest_core::session::opcua::OpcUaSession;

    if !config.endpoint_url.starts_with("opc.tcp://") {
        bail!("unsupported endpoint {}; expected an opc.tcp:// url", config.endpoint_url);
    }
    Ok(Arc::new(OpcUaSession::from_config(config)))
}

#[cfg(not(feature = "opcua"))]
fn protocol_adapter(config: &HarvestConfig) -> anyhow::Result<Arc<dyn SubscriptionSession>> {
    bail!(
        "no protocol adapter is built into this binary for {}; \
         rebuild with `--features opcua` or use --simulate <TAGS>",
        config.endpoint_url
    )
}
