//! Reference sync server: a per-user record store behind the REST and
//! real-time endpoints the client speaks.

pub mod auth;
pub mod hub;
pub mod routes;
pub mod store;

pub use auth::{ApiKey, ApiKeyStore};
pub use hub::{HubMessage, Origin, RealtimeHub};
pub use routes::{router, AppState};
pub use store::{RemoteStore, RemoteStoreError, UploadOutcome};
