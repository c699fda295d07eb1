pub mod config;
pub mod db;
pub mod error;
pub mod etl;
pub mod observability;

pub use config::{Backend, EtlConfig, SourceConfig};
pub use error::{EtlError, Result};
pub use etl::{Orchestrator, RunReport};
