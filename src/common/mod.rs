//! Common types shared across pserver components

pub mod config;
pub mod error;
pub mod utils;

pub use config::PserverConfig;
pub use error::{Error, ErrorCode, Result};
