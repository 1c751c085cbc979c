//! yt-dlp backed extractor.
//!
//! Streaming artifacts come from a metadata dump (`--dump-json`), audio
//! artifacts from a full download transcoded by ffmpeg through yt-dlp's
//! `--extract-audio` post-processor.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use process_utils::{CapturedOutput, ProcessError};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Artifact, ArtifactKind, ExtractionRequest, Extractor};
use crate::config::ExtractionConfig;
use crate::error::ExtractionError;

/// Longest file stem derived from a resource id.
const MAX_STEM_LEN: usize = 100;

/// Subset of the yt-dlp info JSON we rely on.
#[derive(Debug, Default, Deserialize)]
struct MediaInfo {
    url: Option<String>,
    manifest_url: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    ext: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    #[serde(default)]
    requested_formats: Vec<FormatInfo>,
}

#[derive(Debug, Deserialize)]
struct FormatInfo {
    url: Option<String>,
    ext: Option<String>,
}

impl MediaInfo {
    /// Parse the first JSON document of a `--dump-json` run.
    fn parse(stdout: &str) -> Result<Self, String> {
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| "yt-dlp produced no metadata".to_string())?;
        serde_json::from_str(line).map_err(|e| format!("invalid yt-dlp metadata: {e}"))
    }

    /// Direct media URL of the selected format.
    fn media_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or_else(|| self.requested_formats.iter().find_map(|f| f.url.as_deref()))
            .or(self.manifest_url.as_deref())
    }

    fn format(&self) -> Option<String> {
        self.ext
            .clone()
            .or_else(|| self.requested_formats.iter().find_map(|f| f.ext.clone()))
    }
}

/// Extractor that shells out to yt-dlp.
pub struct YtDlpExtractor {
    config: ExtractionConfig,
}

impl YtDlpExtractor {
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Report the installed yt-dlp version, if the binary runs at all.
    pub async fn probe(&self) -> Option<String> {
        let mut cmd = process_utils::tokio_command(&self.config.ytdlp_binary);
        cmd.arg("--version");
        match process_utils::run_captured(cmd).await.and_then(CapturedOutput::check) {
            Ok(output) => Some(output.stdout.trim().to_string()),
            Err(e) => {
                warn!(binary = %self.config.ytdlp_binary, error = %e, "yt-dlp is not usable");
                None
            }
        }
    }

    /// URL handed to yt-dlp for `resource_id`.
    ///
    /// Ids that already are URLs are used verbatim.
    pub fn source_url(&self, resource_id: &str) -> String {
        if resource_id.starts_with("http://") || resource_id.starts_with("https://") {
            resource_id.to_string()
        } else {
            self.config.source_url_template.replace("{id}", resource_id)
        }
    }

    fn header_args(&self, args: &mut Vec<String>) {
        if let Some(ref referer) = self.config.referer {
            args.extend(["--add-header".to_string(), format!("Referer:{referer}")]);
        }
    }

    fn metadata_args(&self, url: &str, format: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-download".to_string(),
            "--no-playlist".to_string(),
        ];
        if let Some(format) = format {
            args.extend(["-f".to_string(), format.to_string()]);
        }
        self.header_args(&mut args);
        args.push(url.to_string());
        args
    }

    fn audio_args(&self, url: &str, stem: &Path) -> Vec<String> {
        let mut args = vec![
            "--extract-audio".to_string(),
            "--audio-format".to_string(),
            self.config.audio_format.clone(),
            "--audio-quality".to_string(),
            self.config.audio_quality.clone(),
            "--output".to_string(),
            format!("{}.%(ext)s", stem.to_string_lossy()),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
        ];
        if let Some(ref ffmpeg) = self.config.ffmpeg_binary {
            args.extend(["--ffmpeg-location".to_string(), ffmpeg.clone()]);
        }
        self.header_args(&mut args);
        args.push(url.to_string());
        args
    }

    /// Run yt-dlp with `args`, stopping early when `cancel` fires.
    async fn run(
        &self,
        resource_id: &str,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CapturedOutput, ExtractionError> {
        debug!(resource_id, ?args, "Running yt-dlp");
        let mut cmd = process_utils::tokio_command(&self.config.ytdlp_binary);
        cmd.args(&args);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ExtractionError::Cancelled {
                    resource_id: resource_id.to_string(),
                });
            }
            result = process_utils::run_captured(cmd) => result,
        };

        result
            .and_then(CapturedOutput::check)
            .map_err(|e| process_failure(resource_id, e))
    }

    fn check_duration(&self, resource_id: &str, info: &MediaInfo) -> Result<(), ExtractionError> {
        let max = self.config.max_duration;
        match info.duration {
            Some(secs) if !max.is_zero() && secs > max.as_secs_f64() => {
                Err(ExtractionError::failed(
                    resource_id,
                    format!(
                        "source lasts {:.0}s, longer than the {}s limit",
                        secs,
                        max.as_secs()
                    ),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn probe_media(
        &self,
        resource_id: &str,
        url: &str,
        format: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, ExtractionError> {
        let output = self
            .run(resource_id, self.metadata_args(url, format), cancel)
            .await?;
        let info = MediaInfo::parse(&output.stdout)
            .map_err(|reason| ExtractionError::failed(resource_id, reason))?;
        self.check_duration(resource_id, &info)?;
        Ok(info)
    }

    async fn extract_streaming(
        &self,
        request: &ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact, ExtractionError> {
        let url = self.source_url(&request.resource_id);
        let info = self
            .probe_media(
                &request.resource_id,
                &url,
                Some(&self.config.ytdlp_format),
                cancel,
            )
            .await?;

        let location = info.media_url().ok_or_else(|| {
            ExtractionError::failed(&request.resource_id, "no playable format found")
        })?;

        let mut artifact = Artifact::new(request, location);
        artifact.format = info.format();
        artifact.title = info.title.clone();
        artifact.duration_secs = info.duration;
        artifact.size_bytes = info.filesize.or(info.filesize_approx);
        Ok(artifact)
    }

    async fn extract_audio(
        &self,
        request: &ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<Artifact, ExtractionError> {
        let resource_id = request.resource_id.as_str();
        let url = self.source_url(resource_id);

        // Probe first so over-long sources are rejected before downloading.
        let info = self.probe_media(resource_id, &url, None, cancel).await?;

        tokio::fs::create_dir_all(&self.config.audio_dir)
            .await
            .map_err(|e| {
                ExtractionError::failed(resource_id, format!("cannot create audio directory: {e}"))
            })?;

        let stem = self.config.audio_dir.join(file_stem(resource_id));
        self.run(resource_id, self.audio_args(&url, &stem), cancel)
            .await?;

        let path = audio_path(&stem, &self.config.audio_format);
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            ExtractionError::failed(
                resource_id,
                format!("audio file missing after extraction: {e}"),
            )
        })?;

        let mut artifact = Artifact::new(request, path.to_string_lossy());
        artifact.format = Some(self.config.audio_format.clone());
        artifact.title = info.title;
        artifact.duration_secs = info.duration;
        artifact.size_bytes = Some(metadata.len());
        Ok(artifact)
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn extract(
        &self,
        request: &ExtractionRequest,
        cancel: CancellationToken,
    ) -> Result<Artifact, ExtractionError> {
        let started = Instant::now();
        let artifact = match request.kind {
            ArtifactKind::Streaming => self.extract_streaming(request, &cancel).await?,
            ArtifactKind::Audio => self.extract_audio(request, &cancel).await?,
        };

        info!(
            resource_id = %request.resource_id,
            kind = %request.kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "yt-dlp extraction finished"
        );
        Ok(artifact)
    }
}

/// Map a process error to the job error, keeping only the last stderr line.
fn process_failure(resource_id: &str, error: ProcessError) -> ExtractionError {
    let reason = match &error {
        ProcessError::NonZeroExit { stderr_tail, .. } => match stderr_tail.lines().last() {
            Some(line) if !line.trim().is_empty() => format!("{error}: {}", line.trim()),
            _ => error.to_string(),
        },
        _ => error.to_string(),
    };
    warn!(resource_id, error = %error, "yt-dlp failed");
    ExtractionError::failed(resource_id, reason)
}

/// File stem for a resource id: ASCII alphanumerics, `-` and `_` only.
fn file_stem(resource_id: &str) -> String {
    let stem: String = resource_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect();
    if stem.is_empty() {
        "audio".to_string()
    } else {
        stem
    }
}

fn audio_path(stem: &Path, format: &str) -> PathBuf {
    let mut path = stem.as_os_str().to_owned();
    path.push(".");
    path.push(format);
    PathBuf::from(path)
}
