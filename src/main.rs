use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use kube_watch_input::{
    host::{
        registry::{default_registry, Resources},
        Input, InputError, Message,
    },
    watcher::client::KubeClient,
};

#[derive(Parser, Debug)]
#[command(name = "kube-watch-input", version, about = "Stream Kubernetes watch events as JSON lines")]
struct Cli {
    /// Log filter, e.g. "info" or "kube_watch_input=debug". Defaults to RUST_LOG, then "info".
    #[arg(long = "log-level", global = true, env = "KUBE_WATCH_INPUT_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured input and print every message to stdout
    Run {
        /// Pipeline config with an `input` section
        #[arg(long = "config", short = 'c')]
        config: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct PipelineConfig {
    input: serde_yaml::Value,
}

fn init_logging(filter: Option<&str>) {
    let mut builder = match filter {
        Some(filter) => {
            let mut builder = env_logger::Builder::new();
            builder.parse_filters(filter);
            builder
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    builder.target(env_logger::Target::Stderr).init();
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Run { config } => run(&config).await,
    }
}

async fn run(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let client = kube_client::Client::try_default()
        .await
        .context("connecting to the apiserver")?;
    let resources = Resources {
        client: Arc::new(KubeClient::new(client)),
    };
    let input = default_registry()
        .build(&config.input, &resources)
        .context("building input")?;
    input.connect().await.context("connecting input")?;

    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("interrupted, shutting down"),
                Err(err) => log::error!("cannot listen for ctrl-c: {err}"),
            }
            ctx.cancel();
        }
    });

    let pumped = pump(input.as_ref(), &ctx).await;
    let closed = input.close().await.context("closing input");
    pumped.and(closed)
}

/// Prints messages until the input ends or `ctx` is cancelled.
async fn pump(input: &dyn Input, ctx: &CancellationToken) -> Result<()> {
    loop {
        let (message, ack) = match input.read(ctx).await {
            Ok(read) => read,
            Err(InputError::EndOfInput) => {
                log::info!("input has no more messages");
                return Ok(());
            }
            Err(InputError::Cancelled) => return Ok(()),
            Err(err) => return Err(err).context("reading input"),
        };

        let printed = print(&message);
        ack(printed.as_ref().map(|_| ()).map_err(|err| err.to_string())).await;
        printed?;
    }
}

fn print(message: &Message) -> Result<()> {
    let payload: serde_json::Value = serde_json::from_slice(message.payload()).unwrap_or_default();
    let line = serde_json::json!({
        "metadata": message.metadata(),
        "payload": payload,
    });

    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, &line).context("encoding message")?;
    out.write_all(b"\n").context("writing message")?;
    out.flush().context("writing message")
}
