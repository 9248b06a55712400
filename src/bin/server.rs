//! FloraTrack Sync Server
//!
//! Reference server for the FloraTrack sync protocol. Holds the
//! authoritative copy of each user's crops, tasks and orders.
//!
//! # Configuration
//!
//! Environment variables:
//! - `FLORA_PORT`: Port to listen on (default: 8080)
//! - `FLORA_DATA_DIR`: Directory to store user data (default: ~/.local/share/floratrack-server)
//! - `FLORA_SERVER_CONFIG`: Path to config file (default: ~/.config/floratrack-server/config.yaml)
//! - `FLORA_TOMBSTONE_RETENTION_SECS`: How long deletions stay in the changes
//!   feed (default: 30 days)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "nursery1"
//! ```
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /sync/changes?since=<timestamp>`: Changes since a cursor (auth required)
//! - `POST /sync/mutations`: Apply client mutations (auth required)

use floratrack::server::{router, ApiKeyStore, AppState, ServerStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory to store user data
    data_dir: PathBuf,
    /// Path to config file
    config_path: PathBuf,
    /// Age after which tombstones are purged
    tombstone_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("FLORA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("FLORA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("floratrack-server")
            });

        let config_path = std::env::var("FLORA_SERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("floratrack-server")
                    .join("config.yaml")
            });

        let tombstone_retention = std::env::var("FLORA_TOMBSTONE_RETENTION_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOMBSTONE_RETENTION);

        Self {
            port,
            data_dir,
            config_path,
            tombstone_retention,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "floratrack=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let api_keys = ApiKeyStore::load(&config.config_path);
    let state = AppState::new(api_keys, ServerStore::new(&config.data_dir));

    let retention = match chrono::Duration::from_std(config.tombstone_retention) {
        Ok(retention) => retention,
        Err(e) => {
            tracing::error!("Invalid tombstone retention: {}", e);
            std::process::exit(1);
        }
    };
    let store = state.store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_tombstones(retention) {
                Ok(0) => {}
                Ok(n) => tracing::info!("Purged {} tombstone(s)", n),
                Err(e) => tracing::warn!("Tombstone purge failed: {}", e),
            }
        }
    });

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
