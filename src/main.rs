//! lamco-vpn-session - VPN session host
//!
//! Entry point for the host binary. Reads one JSON control request per line
//! on stdin and writes responses and events as JSON lines on stdout. Logs go
//! to stderr (and optionally a file) so stdout stays machine-readable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lamco_vpn_session::config::{Config, PermissionMode};
use lamco_vpn_session::control::ControlSurface;
use lamco_vpn_session::engine::process::ProcessEngine;
use lamco_vpn_session::engine::TunnelEngine;
use lamco_vpn_session::permission::{
    AlwaysGranted, PermissionApi, RequestToken, StoredPermission,
};
use lamco_vpn_session::store::{FileStore, PersistentStore};
use lamco_vpn_session::SessionController;

/// Command-line arguments for lamco-vpn-session
#[derive(Parser, Debug)]
#[command(name = "lamco-vpn-session")]
#[command(version, about = "VPN session lifecycle host", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/lamco-vpn-session/config.toml")]
    pub config: String,

    /// State file (overrides [store] path)
    #[arg(long, env = "LAMCO_VPN_STORE")]
    pub store: Option<PathBuf>,

    /// Engine binary (overrides [engine] binary)
    #[arg(long, env = "LAMCO_VPN_ENGINE")]
    pub engine_binary: Option<PathBuf>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = Config::load(&args.config);
    let config = match &loaded {
        Ok(config) => config.clone(),
        Err(_) => Config::default_config()?,
    }
    .with_overrides(args.store.clone(), args.engine_binary.clone());

    let _log_guard = init_logging(&args, &config)?;

    info!("════════════════════════════════════════════════════════");
    info!("  lamco-vpn-session v{}", env!("CARGO_PKG_VERSION"));
    info!("  Profile: {}", if cfg!(debug_assertions) { "debug" } else { "release" });
    info!("════════════════════════════════════════════════════════");

    match loaded {
        Ok(_) => info!("Configuration loaded from {}", args.config),
        Err(e) => {
            warn!("Failed to load config from {}: {:#}", args.config, e);
            warn!("Using default configuration");
        }
    }

    info!("Store: {:?}", config.store.path);
    info!("Engine: {:?}", config.engine.binary);
    info!("Permission mode: {:?}", config.permission.mode);

    if let Err(e) = run(config).await {
        eprintln!("{}", lamco_vpn_session::utils::format_user_error(&e));
        return Err(e);
    }

    info!("Session host stopped");
    Ok(())
}

/// Permission prompt forwarded to the host over stdout
struct HostPrompt {
    out: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl PermissionApi for HostPrompt {
    fn already_granted(&self) -> bool {
        false
    }

    async fn present(&self, token: &RequestToken) -> Result<()> {
        self.out
            .send(json!({"event": "permission_requested", "token": token}))
            .context("Output channel closed")
    }
}

async fn run(config: Config) -> Result<()> {
    let file_store = FileStore::open(&config.store.path).context("Failed to open state store")?;
    debug!("State file: {:?}", file_store.path());
    let store: Arc<dyn PersistentStore> = Arc::new(file_store);

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(write_output(out_rx));

    let permission: Arc<dyn PermissionApi> = match config.permission.mode {
        PermissionMode::Prompt => Arc::new(StoredPermission::new(
            HostPrompt {
                out: out_tx.clone(),
            },
            Arc::clone(&store),
        )),
        PermissionMode::Granted => Arc::new(AlwaysGranted),
    };

    let controller = SessionController::new(store, permission, config.controller_options());

    let engine_config = config.engine.clone();
    let surface = ControlSurface::new(controller, move || {
        let engine = ProcessEngine::new(&engine_config);
        debug!("Engine runtime dir: {:?}", engine.runtime_dir());
        Arc::new(engine) as Arc<dyn TunnelEngine>
    });

    let shutdown = CancellationToken::new();
    let forwarder = tokio::spawn(forward_stages(
        surface.controller().clone(),
        out_tx.clone(),
        shutdown.clone(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    info!("Reading control requests from stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                // Each request runs on its own task so a pending connect does
                // not block the permissionResult that completes it.
                let surface = surface.clone();
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let response = surface.handle_json(&line).await;
                    match serde_json::to_value(&response) {
                        Ok(value) => {
                            let _ = out.send(value);
                        }
                        Err(e) => warn!("Failed to encode response: {}", e),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
        }
    }

    shutdown.cancel();
    surface.controller().dispose().await;
    let _ = forwarder.await;

    drop(surface);
    drop(out_tx);
    let _ = writer.await;

    Ok(())
}

async fn forward_stages(
    controller: SessionController,
    out: mpsc::UnboundedSender<Value>,
    shutdown: CancellationToken,
) {
    while !shutdown.is_cancelled() {
        let mut stages = controller.subscribe().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    controller.unsubscribe_stream(&stages);
                    return;
                }
                stage = stages.next() => match stage {
                    Some(stage) => {
                        let _ = out.send(json!({"event": "stage", "stage": stage}));
                    }
                    None => break,
                },
            }
        }
        debug!("Stage stream ended, resubscribing");
    }
}

async fn write_output(mut rx: mpsc::UnboundedReceiver<Value>) {
    let mut stdout = tokio::io::stdout();
    while let Some(value) = rx.recv().await {
        let mut line = value.to_string();
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            warn!("Failed to write to stdout: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}

fn init_logging(
    args: &Args,
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = match args.verbose {
        0 => config.logging.level.to_lowercase(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "lamco_vpn_session={level},warn",
            level = log_level
        ))
    });

    let console = match args.log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let mut guard = None;
    let file_layer = if let Some(log_file_path) = &args.log_file {
        let file = std::fs::File::create(log_file_path)
            .context(format!("Failed to create log file: {}", log_file_path))?;
        Some(file_layer(&args.log_format, file))
    } else if let Some(dir) = &config.logging.log_dir {
        let (writer, worker) = rolling_writer(dir);
        guard = Some(worker);
        Some(file_layer(&args.log_format, writer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .init();

    if let Some(log_file_path) = &args.log_file {
        info!("Logging to file: {}", log_file_path);
    } else if let Some(dir) = &config.logging.log_dir {
        info!("Logging to directory: {:?}", dir);
    }

    Ok(guard)
}

fn rolling_writer(
    dir: &Path,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let appender = tracing_appender::rolling::daily(dir, "lamco-vpn-session.log");
    tracing_appender::non_blocking(appender)
}

fn file_layer<S, W>(format: &str, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
        "compact" => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
    }
}
