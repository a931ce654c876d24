//! Starfail daemon: drives multi-interface Internet failover for small
//! Linux edge routers.

mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use starfail_core::config::Config;
use starfail_core::rpc::{router, AppState};
use starfail_core::telemetry::TelemetryStore;

use supervisor::{Supervisor, SupervisorRpcBackend};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Starfail failover daemon.
#[derive(Parser, Debug)]
#[command(name = "starfaild", version = VERSION, about = "Multi-interface Internet failover daemon")]
struct Cli {
    /// Host config store path.
    #[arg(long, default_value = "/etc/config/starfail")]
    config: String,

    /// Log intended controller mutations without applying them.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Minimum log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file in addition to stderr.
    #[arg(long)]
    log_file: Option<String>,

    /// Emit log lines as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Also mirror logs to stdout (useful alongside --log-file).
    #[arg(long, default_value_t = false)]
    monitor: bool,

    /// Loopback address the local RPC API (and, if enabled, the health and
    /// metrics endpoints) binds to.
    #[arg(long, default_value = "127.0.0.1:9101")]
    rpc_addr: String,
}

type LogReloadHandle = tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn init_tracing(cli: &Cli) -> (Option<tracing_appender::non_blocking::WorkerGuard>, LogReloadHandle) {
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    let mut guard = None;
    let file_writer = cli.log_file.as_ref().map(|path| {
        let directory = std::path::Path::new(path).parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = std::path::Path::new(path).file_name().unwrap_or_default();
        let appender = tracing_appender::rolling::never(directory, file_name);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        non_blocking
    });

    let registry = tracing_subscriber::registry().with(filter);

    match (file_writer, cli.json) {
        (Some(file_writer), true) => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
                .with(cli.monitor.then(|| tracing_subscriber::fmt::layer().json()))
                .init();
        }
        (Some(file_writer), false) => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(file_writer))
                .with(cli.monitor.then(tracing_subscriber::fmt::layer))
                .init();
        }
        (None, true) => {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        }
        (None, false) => {
            registry.with(tracing_subscriber::fmt::layer().compact()).init();
        }
    }

    (guard, reload_handle)
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (_log_guard, reload_handle) = init_tracing(&cli);
    let log_filter_handle: Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync> = Arc::new(move |level: &str| {
        EnvFilter::try_new(level)
            .map_err(|e| e.to_string())
            .and_then(|filter| reload_handle.reload(filter).map_err(|e| e.to_string()))
    });

    tracing::info!(version = VERSION, config = %cli.config, dry_run = cli.dry_run, "starfaild starting");

    let text = tokio::fs::read_to_string(&cli.config).await.unwrap_or_default();
    let (config, warnings) = Config::from_str(&text);
    for warning in &warnings {
        tracing::warn!(section = %warning.section, option = %warning.option, detail = %warning.detail, "config warning");
    }
    let config = Arc::new(config);

    let store = Arc::new(TelemetryStore::new(
        config.main.max_samples_per_member,
        config.main.max_events,
        config.main.max_ram_mb,
        config.main.retention_hours,
    ));

    let supervisor = Arc::new(Supervisor::new(config.clone(), store.clone(), cli.dry_run));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tick_handle = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };

    // The RPC API itself always runs (it is the daemon's only control
    // surface); `health_listener`/`metrics_listener` additionally gate the
    // `/healthz` and `/metrics` routes folded into the same router.
    let backend: Arc<dyn starfail_core::rpc::RpcBackend> = Arc::new(SupervisorRpcBackend {
        supervisor: supervisor.clone(),
        store: store.clone(),
        rate_limiter: starfail_core::action::ActionRateLimiter::new(),
    });
    let app_state = Arc::new(AppState {
        store: store.clone(),
        backend,
        config: ArcSwap::from(config.clone()),
        started_at_ms: starfail_core::now_ms(),
        version: VERSION,
        log_filter_handle,
    });
    let addr: SocketAddr = cli.rpc_addr.parse()?;
    let app = router(app_state);
    let rpc_handle = tokio::spawn(async move {
        tracing::info!(%addr, "local RPC API listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok::<(), std::io::Error>(())
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        result = tick_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "supervisor task failed");
            }
        }
    }

    let _ = shutdown_tx.send(true);
    rpc_handle.abort();

    tracing::info!("starfaild stopped");
    Ok(())
}
