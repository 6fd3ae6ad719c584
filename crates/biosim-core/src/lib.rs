//! Core types and utilities for the BioSim agent simulation.

pub mod types;
pub mod config;
pub mod error;
pub mod metrics;

pub use error::{Error, Result};
pub use types::*;
pub use config::*;
pub use metrics::*;
