//! silt-common: shared error taxonomy and configuration.

pub mod config;
pub mod error;

pub use config::BufferConfig;
pub use error::{SiltError, SiltResult};
