pub mod app_state;
pub mod config;
pub mod error;
pub mod events;
pub mod fota;
pub mod http;
pub mod metrics;
pub mod persistence;
pub mod policy;
pub mod services;
pub mod ssh;
pub mod telemetry;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::events::EventBus;
use crate::fota::SshFirmwareProbe;
use crate::services::rollout::RolloutRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
}

pub fn parse_command() -> Result<CommandMode> {
    let mut args = env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "--help" | "-h" => {
            println!("Usage: fwfleet\nRun without arguments to start the server.");
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

pub async fn run(mode: CommandMode) -> Result<()> {
    match mode {
        CommandMode::Serve => run_with_shutdown(shutdown_signal()).await,
    }
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = metrics::init_metrics_recorder();
    metrics::record_build_info();

    let db = persistence::migrations::init_pool(&app_config.database.url).await?;
    persistence::migrations::run_migrations(&db).await?;

    let recovery = services::recovery::reconcile_on_startup(&db).await?;
    if !recovery.is_clean() {
        info!(
            cancelled_jobs = recovery.cancelled_jobs,
            reset_routers = recovery.reset_routers,
            failed_attempts = recovery.failed_attempts,
            "startup recovery applied"
        );
    }

    let state = AppState {
        db,
        events: EventBus::new(),
        rollouts: RolloutRegistry::default(),
        probe: Arc::new(SshFirmwareProbe::new(app_config.ssh.clone())),
        rollout: app_config.rollout.clone(),
        metrics_handle,
    };

    let app = http::build_router().with_state(state);

    let addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "fwfleet listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| anyhow::anyhow!("server failed: {err}"))?;

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
