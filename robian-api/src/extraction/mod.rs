//! Artifact extraction through external tools.

mod artifact;
mod extractor;
mod ytdlp;

pub use artifact::{Artifact, ArtifactKind, ExtractionRequest};
pub use extractor::Extractor;
pub use ytdlp::YtDlpExtractor;
