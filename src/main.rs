use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use axum_server::{Handle, tls_rustls::RustlsConfig};
use clap::Parser;
use gitward::{
    AppState, MemoryStore, PostgresStore, StartupError, StoreState,
    config::{AppConfig, Env, Protocol},
    create_app,
    session::SessionState,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired browser sessions are dropped from the session table.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(600);

/// How long open HTTPS connections may finish after a shutdown signal.
const HTTPS_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Cli
///
/// Only the port and the configuration file come from the command line; everything
/// else is configuration.
#[derive(Debug, Parser)]
#[command(name = "gitward", version, about = "Source hosting HTTP front with Git smart-HTTP")]
struct Cli {
    /// Port to listen on, overriding the configuration.
    #[arg(short, long)]
    port: Option<u16>,
    /// Configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// main
///
/// Loads the environment and flags, then hands over to `run`. Any fatal startup error
/// is logged and turned into exit status 1.
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Logging is not configured yet, so a config error goes to stderr.
    let config = match AppConfig::load(cli.config.as_deref(), cli.port) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(config.env);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            ExitCode::FAILURE
        }
    }
}

/// Pretty output for humans locally, JSON for log aggregation in production.
fn init_tracing(env: Env) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gitward=debug,tower_http=info".into());

    match env {
        Env::Local => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }
}

async fn connect_store(config: &AppConfig) -> Result<StoreState, StartupError> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("connected to PostgreSQL");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; using an empty in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn spawn_session_purge(sessions: SessionState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = sessions.purge_expired().await;
            if purged > 0 {
                tracing::debug!(purged, "expired sessions purged");
            }
        }
    });
}

async fn run(config: AppConfig) -> Result<(), StartupError> {
    tracing::info!("gitward starting in {:?} mode", config.env);

    let store = connect_store(&config).await?;
    let addr = config.bind_addr();
    let app_url = config.app_url.clone();
    let swagger = config.enable_swagger;
    let tls = match (config.protocol, &config.cert_file, &config.key_file) {
        (Protocol::Https, Some(cert), Some(key)) => Some(
            RustlsConfig::from_pem_file(cert, key)
                .await
                .map_err(StartupError::Tls)?,
        ),
        _ => None,
    };

    let state = AppState::new(config, store);
    spawn_session_purge(Arc::clone(&state.sessions));
    let app = create_app(state);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!("listening on {addr} ({app_url})");
    if swagger {
        tracing::info!("API documentation available at {app_url}swagger-ui");
    }

    match tls {
        Some(tls) => serve_https(listener, tls, app).await?,
        None => axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(StartupError::Serve)?,
    }

    tracing::info!("server stopped");
    Ok(())
}

/// Serves TLS on the already bound listener, draining connections on shutdown.
async fn serve_https(
    listener: TcpListener,
    tls: RustlsConfig,
    app: axum::Router,
) -> Result<(), StartupError> {
    let handle = Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.graceful_shutdown(Some(HTTPS_DRAIN_TIMEOUT));
    });

    let listener = listener.into_std().map_err(StartupError::Serve)?;
    axum_server::from_tcp_rustls(listener, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(StartupError::Serve)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for the shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
