//! Transport-facing types for the request-handling layer.

pub mod error;

pub use error::{ApiError, ApiErrorResponse, ApiResult};
