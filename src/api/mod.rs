//! HTTP API.

mod auth;
mod error;
mod routes;
pub mod types;

pub use error::error_response;
pub use routes::{router, serve, AppState};
