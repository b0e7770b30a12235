//! Utility modules for configuration, error handling and encoding.

pub mod config;
pub mod encoding;
pub mod errors;

pub use config::*;
pub use errors::*;
