pub mod config;
pub mod error;
pub mod executor;
pub mod log_sanitize;
pub mod modules;
pub mod planner;
pub mod power;
pub mod version;
pub mod workspace;

pub use error::{Error, Result};
