//! janitord - the janitor service
//!
//! This is the main entry point for the janitor. It wires together:
//! - Configuration loading
//! - Store initialization
//! - The orchestration service client
//! - The policy pipeline and its daily scheduler
//! - The HTTP control plane
//! - Ordered shutdown on SIGTERM/SIGINT/SIGHUP or a fatal error

use anyhow::{Context, Result};
use clap::Parser;
use janitor_api::Credential;
use janitor_config::{JanitorConfig, load_config};
use janitor_core::{
    DAILY_AT_EIGHT_AM, DailySchedule, PolicyCheck, PolicyPipeline, Scheduler, ShutdownCoordinator,
    ShutdownReason, ShutdownSignal, TeardownStage, default_warnings,
};
use janitor_rpc::{ClientOptions, RemoteClient};
use janitor_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use janitor_util::default_config_path;
use janitord::{ControlPlane, WORKER_NAME, WORKER_VERSION};
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long to let an in-flight tick finish once teardown is done
const TICK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// janitord - deletes idle and blocked users' machines on a daily schedule
#[derive(Parser, Debug)]
#[command(name = "janitord")]
#[command(about = "Daily machine-lifecycle policy enforcement", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/janitor/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Control-plane port override (or set JANITOR_PORT env var)
    #[arg(short, long, env = "JANITOR_PORT")]
    port: Option<u16>,

    /// Orchestration credential override (or set JANITOR_REMOTE_SECRET env var)
    #[arg(long, env = "JANITOR_REMOTE_SECRET", hide_env_values = true)]
    remote_secret: Option<String>,

    /// Data directory override (or set JANITOR_DATA_DIR env var)
    #[arg(short, long, env = "JANITOR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Load the config file and apply command-line overrides
fn load_settings(args: &Args) -> Result<JanitorConfig> {
    let mut config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(port) = args.port {
        config.service.port = port;
    }

    if let Some(secret) = &args.remote_secret {
        anyhow::ensure!(!secret.is_empty(), "Remote secret override must not be empty");
        config.remote.secret_key = secret.clone();
    }

    if let Some(data_dir) = &args.data_dir {
        config.store.relocate(&config.service.data_dir, data_dir);
        config.service.data_dir = data_dir.clone();
    }

    info!(
        config_path = %args.config.display(),
        port = config.service.port,
        remote = %config.remote.address,
        store = %config.store.path.display(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Bring every component up, then block until a termination signal.
///
/// Each component registers its teardown with `coordinator` as soon as it
/// exists, so a failure part-way through still releases what was started.
/// The scheduler is handed back through `scheduler` so the caller can drain
/// its in-flight tick on every exit path.
async fn run(
    args: &Args,
    coordinator: &ShutdownCoordinator,
    scheduler: &mut Option<Scheduler>,
) -> Result<ShutdownReason> {
    let config = load_settings(args)?;

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    // Store
    let store = Arc::new(
        SqliteStore::open(&config.store.path)
            .with_context(|| format!("Failed to open database {:?}", config.store.path))?,
    );
    info!(db_path = %config.store.path.display(), "Store initialized");

    let store_step = store.clone();
    coordinator.add_step(TeardownStage::Store, "store", move || async move {
        if let Err(e) = store_step.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to record service stop");
        }
        store_step.close()
    });

    // Orchestration client
    let options = ClientOptions {
        dial_timeout: config.remote.dial_timeout,
        request_timeout: config.remote.request_timeout,
        ..ClientOptions::default()
    };
    let remote = RemoteClient::connect(
        config.remote.address.clone(),
        Credential::janitor(config.remote.secret_key.clone()),
        options,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to connect to orchestration service at {}",
            config.remote.address
        )
    })?;

    let remote_step = remote.clone();
    coordinator.add_step(TeardownStage::RemoteClient, "remote-client", move || async move {
        remote_step.close().await;
        Ok::<(), Infallible>(())
    });

    // Pipeline and scheduler
    let checks = default_warnings()
        .into_iter()
        .map(|warning| Arc::new(warning) as Arc<dyn PolicyCheck>);
    let pipeline = Arc::new(PolicyPipeline::new(store.clone(), Arc::new(remote)).with_checks(checks));

    let schedule = DailySchedule::parse(DAILY_AT_EIGHT_AM).context("Invalid tick schedule")?;
    info!(
        schedule = %schedule,
        checks = ?pipeline.check_names(),
        "Policy pipeline scheduled"
    );

    *scheduler = Some(Scheduler::start(schedule, coordinator.signal().clone(), move || {
        let pipeline = pipeline.clone();
        async move {
            pipeline.run_once().await;
        }
    }));

    // Control plane
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.service.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind control plane on {}", addr))?;
    let control_plane = Arc::new(ControlPlane::serve(listener).context("Failed to start control plane")?);

    let listener_step = control_plane.clone();
    coordinator.add_step(TeardownStage::Listener, "control-plane", move || async move {
        listener_step.stop().await
    });

    store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;
    info!(addr = %control_plane.local_addr(), "Service running");

    let reason = tokio::select! {
        _ = sigterm.recv() => ShutdownReason::Signal("SIGTERM"),
        _ = sigint.recv() => ShutdownReason::Signal("SIGINT"),
        _ = sighup.recv() => ShutdownReason::Signal("SIGHUP"),
        outcome = control_plane.exited() => {
            let cause = outcome.err().unwrap_or_else(|| "server exited".to_string());
            anyhow::bail!("Control plane stopped unexpectedly: {}", cause);
        }
    };

    coordinator.run(reason.clone()).await;
    Ok(reason)
}

/// Let a tick that was already running finish, within `TICK_DRAIN_TIMEOUT`
async fn drain(scheduler: Option<Scheduler>) {
    if let Some(scheduler) = scheduler
        && !scheduler.stop_within(TICK_DRAIN_TIMEOUT).await
    {
        warn!("In-flight policy tick did not finish, exiting anyway");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        worker = WORKER_NAME,
        version = WORKER_VERSION,
        mock_time = janitor_util::is_mock_time_active(),
        "janitord starting"
    );

    let coordinator = ShutdownCoordinator::new(ShutdownSignal::new());

    let mut scheduler = None;
    let outcome = run(&args, &coordinator, &mut scheduler).await;

    if let Err(e) = &outcome {
        error!(error = %format!("{:#}", e), "Fatal error");
        coordinator.run(ShutdownReason::Fatal(format!("{:#}", e))).await;
    }
    drain(scheduler).await;

    match outcome {
        Ok(reason) => {
            info!(reason = %reason, "janitord stopped");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
