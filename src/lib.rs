pub mod chain;
pub mod config;
pub mod decision;
pub mod errors;
pub mod events;
pub mod graph;
pub mod logging;
pub mod review;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod workspace;

pub use errors::{CoreError, Result};
