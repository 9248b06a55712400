//! Server-side modules for the FloraTrack sync server.

pub mod auth;
pub mod routes;
pub mod store;

pub use auth::{ApiKeyStore, AuthUser};
pub use routes::{router, AppState};
pub use store::{ServerStore, ServerStoreError};
