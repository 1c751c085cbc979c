//! The external extraction collaborator.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Artifact, ExtractionRequest};
use crate::error::ExtractionError;

/// Produces an [`Artifact`] for a resource, typically by running an external
/// tool.
///
/// Implementations must stop promptly once `cancel` fires or the returned
/// future is dropped; the caller enforces the overall timeout by dropping it.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn extract(
        &self,
        request: &ExtractionRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, ExtractionError>;
}
