//! `pls-core`: configuration shared by the queue library and the worker binary.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, PlsConfig, WorkerConfig};
pub use error::{CoreError, Result};
