//! HTTP surface for the chat bridge.

pub mod routes;

pub use routes::{AppState, worker_routes};
