//! Application configuration.
//!
//! Values come from the process environment (optionally seeded from a
//! `.env` file) and are handed to the services as plain values at
//! construction time.

pub mod settings;

pub use settings::{AppConfig, CacheConfig, ExtractionConfig, LogFormat, LoggingConfig};
