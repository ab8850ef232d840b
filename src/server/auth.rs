//! API key authentication.
//!
//! Keys come from the server config file:
//!
//! ```yaml
//! api_keys:
//!   - "shared-secret"
//!   - key: "alice-phone"
//!     user_id: "alice"
//! ```
//!
//! A key with a `user_id` may only read and write that user's data. With no
//! config file, or one listing no keys, the server is open and every request
//! is accepted. A file that exists but cannot be read or parsed locks the
//! server instead: every authenticated request is refused.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::routes::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ApiKeyEntry {
    Plain(String),
    Scoped {
        key: String,
        #[serde(default)]
        user_id: Option<String>,
    },
}

/// Server config file structure
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    api_keys: Vec<ApiKeyEntry>,
}

/// What an accepted key may access, added to request extensions after auth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    /// `None` for unscoped keys and open servers
    pub user_id: Option<String>,
}

impl ApiKey {
    pub fn unrestricted() -> Self {
        Self { user_id: None }
    }

    pub fn permits(&self, user_id: &str) -> bool {
        self.user_id.as_deref().map_or(true, |scope| scope == user_id)
    }
}

/// API key store - maps key -> ApiKey
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, ApiKey>,
    /// Set when the key file was present but unusable
    locked: bool,
}

impl ApiKeyStore {
    /// A store with no keys; every request is accepted.
    pub fn open() -> Self {
        Self::default()
    }

    /// A store that refuses every key.
    pub fn locked() -> Self {
        Self {
            keys: HashMap::new(),
            locked: true,
        }
    }

    /// Unscoped keys.
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| (k.into(), ApiKey::unrestricted()))
                .collect(),
            locked: false,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, user_id: Option<String>) {
        self.keys.insert(key.into(), ApiKey { user_id });
    }

    fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        let config: ConfigFile = serde_yaml::from_str(contents)?;
        let mut store = Self::open();
        for entry in config.api_keys {
            match entry {
                ApiKeyEntry::Plain(key) => store.insert(key, None),
                ApiKeyEntry::Scoped { key, user_id } => store.insert(key, user_id),
            }
        }
        Ok(store)
    }

    /// Load API keys from the config file. A missing file leaves the server
    /// open; an unreadable or malformed one locks it.
    pub fn load(config_path: &Path) -> Self {
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match Self::from_yaml(&contents) {
                Ok(store) => {
                    if store.is_empty() {
                        tracing::warn!("Config file lists no API keys - accepting all requests");
                    } else {
                        tracing::info!("Loaded {} API key(s)", store.len());
                    }
                    store
                }
                Err(e) => {
                    tracing::error!("Failed to parse config file: {}", e);
                    tracing::error!("No API keys loaded - all authenticated requests will fail");
                    Self::locked()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "No config file at {} - accepting all requests",
                    config_path.display()
                );
                Self::open()
            }
            Err(e) => {
                tracing::error!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                );
                tracing::error!("No API keys loaded - all authenticated requests will fail");
                Self::locked()
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.locked && self.keys.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Validate an API key and return what it grants.
    pub fn validate(&self, key: &str) -> Option<ApiKey> {
        if self.locked {
            return None;
        }
        if self.is_open() {
            return Some(ApiKey::unrestricted());
        }
        self.keys.get(key).cloned()
    }
}

/// Auth error response
#[derive(Serialize)]
pub(crate) struct AuthError {
    pub error: &'static str,
    pub message: &'static str,
}

fn unauthorized(error: &'static str, message: &'static str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(AuthError { error, message })).into_response()
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.api_keys.is_open() {
        request.extensions_mut().insert(ApiKey::unrestricted());
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let api_key = match auth_header {
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(key) => key,
            None => {
                return unauthorized(
                    "invalid_auth",
                    "Authorization header must use Bearer scheme",
                )
            }
        },
        None => return unauthorized("missing_auth", "Authorization header required"),
    };

    match state.api_keys.validate(api_key) {
        Some(key) => {
            request.extensions_mut().insert(key);
            next.run(request).await
        }
        None => unauthorized("invalid_key", "Invalid API key"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_store_accepts_anything() {
        let store = ApiKeyStore::open();
        assert!(store.is_open());
        assert_eq!(store.validate("whatever"), Some(ApiKey::unrestricted()));
    }

    #[test]
    fn test_load_plain_and_scoped_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "api_keys:\n  - \"shared\"\n  - key: \"alice-phone\"\n    user_id: \"alice\""
        )
        .unwrap();

        let store = ApiKeyStore::load(file.path());
        assert_eq!(store.len(), 2);
        assert!(store.validate("shared").unwrap().permits("bob"));

        let scoped = store.validate("alice-phone").unwrap();
        assert!(scoped.permits("alice"));
        assert!(!scoped.permits("bob"));
        assert!(store.validate("nope").is_none());
    }

    #[test]
    fn test_missing_file_leaves_server_open() {
        let store = ApiKeyStore::load(Path::new("/nonexistent/splitsync/server.yaml"));
        assert!(store.is_open());
    }

    #[test]
    fn test_malformed_file_locks_server() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "api_keys: {{ not: [a list").unwrap();

        let store = ApiKeyStore::load(file.path());
        assert!(!store.is_open());
        assert!(store.is_locked());
        assert!(store.validate("").is_none());
        assert!(store.validate("anything").is_none());
    }

    #[test]
    fn test_unreadable_file_locks_server() {
        // A directory exists but cannot be read as a file
        let dir = tempfile::TempDir::new().unwrap();
        let store = ApiKeyStore::load(dir.path());
        assert!(store.is_locked());
        assert!(store.validate("shared").is_none());
    }

    #[test]
    fn test_file_without_keys_leaves_server_open() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "api_keys: []").unwrap();
        let store = ApiKeyStore::load(file.path());
        assert!(store.is_open());
        assert!(!store.is_locked());
    }
}
