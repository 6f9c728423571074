//! tankfeed core - tank-level ingestion and live broadcast
//!
//! This library watches external sources of tank readings and pushes them to
//! live subscribers:
//!
//! - File, directory and remote sources, watched or polled
//! - Format detection and parsing of delimited, JSON, XML, fixed-width and text content
//! - Column type inference and mapping onto canonical tank records
//! - Fan-out to subscribers with liveness probes

pub mod broadcast;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod health;
pub mod mapping;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod source;

// Re-export commonly used types
pub use config::Config;
pub use detect::Format;
pub use error::{Error, Result};
