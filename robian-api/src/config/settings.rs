//! Typed settings assembled from environment variables.
//!
//! Every section can be built from an arbitrary key lookup so tests never
//! touch the process environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::TtlPolicy;
use crate::error::{Error, Result};

/// Strip an inline `# comment` and surrounding whitespace from a raw value.
///
/// `.env` files in the wild often carry `CACHE_TTL_DEBATES=300  # 5 min`.
/// A `#` glued to other characters (passwords, URL fragments) is kept.
fn clean(raw: &str) -> &str {
    let comment = raw
        .char_indices()
        .find(|&(i, c)| c == '#' && (i == 0 || raw[..i].ends_with(char::is_whitespace)))
        .map(|(i, _)| i);
    match comment {
        Some(i) => raw[..i].trim(),
        None => raw.trim(),
    }
}

/// Small wrapper around a key lookup with typed accessors.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|raw| clean(&raw).to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn u64_opt(&self, key: &str) -> Result<Option<u64>> {
        self.string(key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|e| Error::config(format!("invalid value for {key}: {v:?} ({e})")))
            })
            .transpose()
    }

    fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.u64_opt(key)?.unwrap_or(default))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::config(format!("invalid boolean for {key}: {v:?}"))),
            },
        }
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Primary (Redis) connection URL; `None` runs memory-only.
    pub redis_url: Option<String>,
    /// Per-namespace default TTLs.
    pub ttl: TtlPolicy,
    /// Maximum number of entries kept in the in-process tier.
    pub memory_capacity: usize,
    /// Timeout applied to every primary operation, including connect.
    pub op_timeout: Duration,
    /// How long the primary is skipped after a failure. Zero means the next
    /// call tries it again.
    pub primary_retry_after: Duration,
    /// Interval of the in-process expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl: TtlPolicy::default(),
            memory_capacity: 1000,
            op_timeout: Duration::from_millis(500),
            primary_retry_after: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self> {
        let defaults = Self::default();

        let redis_url = if env.bool_or("CACHE_ENABLE_REDIS", true)? {
            env.string("REDIS_URL").or_else(|| {
                env.string("REDIS_HOST").map(|host| {
                    let port = env.string_or("REDIS_PORT", "6379");
                    let db = env.string_or("REDIS_DB", "0");
                    match env.string("REDIS_PASSWORD") {
                        Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
                        None => format!("redis://{host}:{port}/{db}"),
                    }
                })
            })
        } else {
            None
        };

        let default_ttl = env.u64_or("CACHE_TTL_DEFAULT", defaults.ttl.default.as_secs())?;
        let ttl = TtlPolicy {
            default: Duration::from_secs(default_ttl),
            debates: Duration::from_secs(
                env.u64_or("CACHE_TTL_DEBATES", defaults.ttl.debates.as_secs())?,
            ),
            streaming: Duration::from_secs(
                env.u64_or("CACHE_TTL_STREAMING", defaults.ttl.streaming.as_secs())?,
            ),
            metadata: Duration::from_secs(
                env.u64_or("CACHE_TTL_METADATA", defaults.ttl.metadata.as_secs())?,
            ),
            search: Duration::from_secs(env.u64_or("CACHE_TTL_SEARCH", default_ttl)?),
        };

        let memory_capacity =
            env.u64_or("CACHE_MEMORY_CAPACITY", defaults.memory_capacity as u64)?;
        if memory_capacity == 0 {
            return Err(Error::config("CACHE_MEMORY_CAPACITY must be at least 1"));
        }

        Ok(Self {
            redis_url,
            ttl,
            memory_capacity: memory_capacity as usize,
            op_timeout: Duration::from_millis(
                env.u64_or("CACHE_OP_TIMEOUT_MS", defaults.op_timeout.as_millis() as u64)?,
            ),
            primary_retry_after: Duration::from_secs(env.u64_or("CACHE_PRIMARY_RETRY_SECS", 0)?),
            sweep_interval: Duration::from_secs(
                env.u64_or("CACHE_SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?,
            ),
        })
    }
}

/// Extraction control and external tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum number of extractions in Running state.
    pub max_concurrent: usize,
    /// Hard ceiling for a single extraction.
    pub timeout: Duration,
    /// Reject with `CapacityExceeded` instead of queueing longer than this.
    pub max_queue_wait: Option<Duration>,
    /// How long terminal jobs stay visible to status polls.
    pub job_retention: Duration,
    /// Interval of the terminal-job purge task.
    pub purge_interval: Duration,
    pub ytdlp_binary: String,
    pub ffmpeg_binary: Option<String>,
    /// yt-dlp format selector used for streaming URLs.
    pub ytdlp_format: String,
    pub audio_format: String,
    pub audio_quality: String,
    pub audio_dir: PathBuf,
    /// Template mapping a resource id to its source page, `{id}` is replaced.
    pub source_url_template: String,
    pub referer: Option<String>,
    /// Sources longer than this are refused.
    pub max_duration: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            timeout: Duration::from_secs(1800),
            max_queue_wait: None,
            job_retention: Duration::from_secs(300),
            purge_interval: Duration::from_secs(30),
            ytdlp_binary: "yt-dlp".to_string(),
            ffmpeg_binary: None,
            ytdlp_format: "bestaudio/best".to_string(),
            audio_format: "mp3".to_string(),
            audio_quality: "128K".to_string(),
            audio_dir: PathBuf::from("./data/audio"),
            source_url_template: "https://videos.assemblee-nationale.fr/video.{id}".to_string(),
            referer: None,
            max_duration: Duration::from_secs(4 * 3600),
        }
    }
}

impl ExtractionConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self> {
        let defaults = Self::default();

        let max_concurrent =
            env.u64_or("MAX_CONCURRENT_EXTRACTIONS", defaults.max_concurrent as u64)?;
        if max_concurrent == 0 {
            return Err(Error::config("MAX_CONCURRENT_EXTRACTIONS must be at least 1"));
        }

        let timeout = env.u64_or("EXTRACTION_TIMEOUT", defaults.timeout.as_secs())?;
        if timeout == 0 {
            return Err(Error::config("EXTRACTION_TIMEOUT must be at least 1 second"));
        }

        let source_url_template =
            env.string_or("SOURCE_URL_TEMPLATE", &defaults.source_url_template);
        if !source_url_template.contains("{id}") {
            return Err(Error::config(
                "SOURCE_URL_TEMPLATE must contain an {id} placeholder",
            ));
        }

        Ok(Self {
            max_concurrent: max_concurrent as usize,
            timeout: Duration::from_secs(timeout),
            max_queue_wait: env
                .u64_opt("EXTRACTION_MAX_QUEUE_WAIT")?
                .map(Duration::from_secs),
            job_retention: Duration::from_secs(
                env.u64_or("JOB_RETENTION_SECS", defaults.job_retention.as_secs())?,
            ),
            purge_interval: Duration::from_secs(
                env.u64_or("JOB_PURGE_INTERVAL_SECS", defaults.purge_interval.as_secs())?,
            ),
            ytdlp_binary: env.string_or("YTDLP_BINARY", &defaults.ytdlp_binary),
            ffmpeg_binary: env.string("FFMPEG_BINARY"),
            ytdlp_format: env.string_or("YTDLP_FORMAT", &defaults.ytdlp_format),
            audio_format: env.string_or("AUDIO_FORMAT", &defaults.audio_format),
            audio_quality: env.string_or("AUDIO_QUALITY", &defaults.audio_quality),
            audio_dir: env
                .string("AUDIO_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.audio_dir),
            source_url_template,
            referer: env.string("SOURCE_REFERER"),
            max_duration: Duration::from_secs(
                env.u64_or("MAX_DURATION_SECS", defaults.max_duration.as_secs())?,
            ),
        })
    }
}

/// Output format of the console/file log layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive string.
    pub filter: String,
    pub format: LogFormat,
    /// Directory for daily-rolling log files; console only when `None`.
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: crate::logging::DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Text,
            logs_dir: None,
        }
    }
}

impl LoggingConfig {
    fn from_env<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<Self> {
        let filter = env
            .string("RUST_LOG")
            .or_else(|| {
                env.string("LOG_LEVEL").map(|level| {
                    let level = level.to_lowercase();
                    format!("robian_api={level},process_utils={level}")
                })
            })
            .unwrap_or_else(|| crate::logging::DEFAULT_LOG_FILTER.to_string());

        let format = match env.string("LOG_FORMAT").map(|f| f.to_lowercase()).as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(Error::config(format!(
                    "invalid LOG_FORMAT {other:?}, expected \"json\" or \"text\""
                )));
            }
        };

        Ok(Self {
            filter,
            format,
            logs_dir: env.string("LOGS_DIR").map(PathBuf::from),
        })
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub extraction: ExtractionConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        Ok(Self {
            cache: CacheConfig::from_env(&env)?,
            extraction: ExtractionConfig::from_env(&env)?,
            logging: LoggingConfig::from_env(&env)?,
        })
    }
}
