//! Chatline server binary.

use chatline_db::DbPool;
use chatline_messages::PooledMessageStore;
use chatline_server::config::{self, Config, ConfigError};
use chatline_server::{app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Anything that stops the server before or while serving.
#[derive(Debug, Error)]
enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("database pool: {0}")]
    Pool(#[from] chatline_db::PoolError),

    #[error("checking out a connection for migrations: {0}")]
    Checkout(#[from] r2d2::Error),

    #[error("migrations: {0}")]
    Migration(#[from] chatline_db::MigrationError),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("serving: {0}")]
    Serve(std::io::Error),
}

/// Where the config file path came from, for the startup log.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    Argument,
    Environment,
    Default,
}

fn config_path() -> (String, ConfigSource) {
    let non_blank = |value: &String| !value.trim().is_empty();

    if let Some(path) = std::env::args().nth(1).filter(non_blank) {
        return (path, ConfigSource::Argument);
    }
    if let Some(path) = std::env::var("CHATLINE_CONFIG_PATH").ok().filter(non_blank) {
        return (path, ConfigSource::Environment);
    }
    (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Opens the pool and brings the chat schema up to date.
fn open_database(config: &Config) -> Result<DbPool, StartupError> {
    let settings = config.database.runtime_settings()?;
    let pool = chatline_db::create_pool(&config.database.path, settings)?;

    let conn = pool.get()?;
    let report = chatline_db::run_migrations(&conn)?;
    if report.is_noop() {
        tracing::debug!(version = report.version, "database schema is current");
    } else {
        tracing::info!(
            version = report.version,
            applied = ?report.applied,
            "database schema migrated"
        );
    }

    Ok(pool)
}

async fn run(config: Config) -> Result<(), StartupError> {
    let pool = open_database(&config)?;
    let store = Arc::new(PooledMessageStore::new(pool.clone()));
    let router = app(AppState::new(pool, store, &config));

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })?;
    tracing::info!(%addr, "chatline server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let (path, source) = config_path();

    // Logging is not up yet, so config errors go to stderr.
    let loaded = config::load_config(Some(path.as_str())).and_then(|c| c.validate().map(|()| c));
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chatline-server: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    init_tracing(&config.logging);
    tracing::info!(?source, path = %path, "configuration loaded");

    match run(config).await {
        Ok(()) => {
            tracing::info!("chatline server stopped");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "chatline server failed");
            std::process::ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM. Live sockets are dropped once axum stops.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
            _ = terminate.recv() => tracing::info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_database_migrates_in_memory_store() {
        let mut config = Config::default();
        config.database.path = chatline_db::IN_MEMORY.to_string();

        let pool = open_database(&config).expect("in-memory database should open");
        let conn = pool.get().unwrap();
        assert_eq!(chatline_db::schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn open_database_reports_bad_settings() {
        let mut config = Config::default();
        config.database.path = chatline_db::IN_MEMORY.to_string();
        config.database.synchronous = "eventually".to_string();

        let err = open_database(&config).unwrap_err();
        assert!(matches!(err, StartupError::Config(ConfigError::Invalid(_))));
    }
}
