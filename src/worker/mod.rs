//! Background worker — session sweep, queue advancement, task dispatch.

pub mod runner;

pub use runner::WorkerLoop;
