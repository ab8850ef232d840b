//! Splitsync Server
//!
//! Stores the latest version of every synced record per user and relays
//! change announcements between a user's devices.
//!
//! # Configuration
//!
//! Environment variables:
//! - `SPLITSYNC_PORT`: Port to listen on (default: 8080)
//! - `SPLITSYNC_DATA_DIR`: Directory to store accounts (default: ~/.local/share/splitsync-server)
//! - `SPLITSYNC_SERVER_CONFIG`: Path to config file (default: ~/.config/splitsync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - "shared-secret"
//!   - key: "alice-secret"
//!     user_id: "alice"
//! ```
//!
//! Without a config file, or with one listing no keys, every request is
//! accepted. A config file that cannot be read or parsed refuses every
//! authenticated request.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /ws?userId=...&deviceId=...`: Real-time channel
//! - `POST /sync/upload`, `GET /sync/download`: Record-level sync
//! - `POST /sync/push`, `GET /sync/pull`: Whole-payload sync

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use splitsync::server::{router, ApiKeyStore, AppState, RemoteStore};
use splitsync::state::FileStateStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Directory to store accounts
    data_dir: PathBuf,
    /// Path to config file
    config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("SPLITSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("SPLITSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("splitsync-server")
            });

        let config_path = std::env::var("SPLITSYNC_SERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("splitsync-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "splitsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Ensure data directory exists
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let api_keys = ApiKeyStore::load(&config.config_path);
    let store = RemoteStore::with_state(Arc::new(FileStateStore::new(config.data_dir.clone())));
    let app = router(AppState::new(store, api_keys));

    // Start server
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
