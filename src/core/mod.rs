pub mod config;
pub mod error;
pub mod types;
pub mod workflow_graph;

pub use config::{ConfigLoader, ConfigValidator, EngineConfig};
pub use error::{AppError, ErrorSummary};
pub use types::*;
