//! Parliamentary debate audio backend core.
//!
//! A two-tier cache (Redis with an in-process LRU fallback) and a
//! request-coalescing extraction controller that runs yt-dlp at most once per
//! artifact and within a global concurrency ceiling.

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extraction;
pub mod jobs;
pub mod logging;
pub mod services;

pub use error::{Error, ExtractionError, Result};
