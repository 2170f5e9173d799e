//! Site Assist — session and task core for a chat-driven change agent.

pub mod api;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod task;
pub mod worker;
