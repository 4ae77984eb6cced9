use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::SnapError;
use crate::paths;
use crate::progress::OutputMode;
use crate::util::parse_size_mb;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct BuildConfig {
    #[facet(default)]
    pub image: ImageConfig,
    #[facet(default)]
    pub stream: StreamConfig,
    #[facet(default)]
    pub resize: ResizeConfig,
    #[facet(default)]
    pub output: OutputConfig,
    #[facet(default)]
    pub logging: LoggingConfig,
}

/// Defaults for `LayerBuilder::create`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ImageConfig {
    #[facet(default = "morphvm-minimal")]
    pub id: String,
    #[facet(default = 1)]
    pub vcpus: u32,
    #[facet(default = "4G")]
    pub memory: String,
    #[facet(default = "8G")]
    pub disk_size: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            id: "morphvm-minimal".into(),
            vcpus: 1,
            memory: "4G".into(),
            disk_size: "8G".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct StreamConfig {
    #[facet(default = 24)]
    pub max_lines: usize,
    #[facet(default = 10)]
    pub poll_interval_ms: u64,
    #[facet(default = 4096)]
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_lines: 24,
            poll_interval_ms: 10,
            chunk_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ResizeConfig {
    #[facet(default = 10)]
    pub settle_secs: u64,
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self { settle_secs: 10 }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct OutputConfig {
    #[facet(default = "normal")]
    pub mode: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: "normal".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LoggingConfig {
    #[facet(default)]
    pub transcripts: bool,
    #[facet(default)]
    pub dir: String,
    #[facet(default = 10)]
    pub keep: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            transcripts: false,
            dir: String::new(),
            keep: 10,
        }
    }
}

// ── ResolvedConfig ────────────────────────────────────────

/// Validated config with sizes in MB and durations resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub image_id: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disk_size_mb: u64,
    pub max_lines: usize,
    pub poll_interval: Duration,
    pub chunk_size: usize,
    pub resize_settle: Duration,
    pub mode: OutputMode,
    /// `Some(dir)` when layer transcripts are enabled.
    pub transcript_dir: Option<PathBuf>,
    pub transcript_keep: usize,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            image_id: "morphvm-minimal".into(),
            vcpus: 1,
            memory_mb: 4096,
            disk_size_mb: 8192,
            max_lines: 24,
            poll_interval: Duration::from_millis(10),
            chunk_size: 4096,
            resize_settle: Duration::from_secs(10),
            mode: OutputMode::Normal,
            transcript_dir: None,
            transcript_keep: 10,
        }
    }
}

impl BuildConfig {
    pub fn resolve(&self) -> Result<ResolvedConfig, SnapError> {
        validate_config(self)?;

        let transcript_dir = if self.logging.transcripts {
            if self.logging.dir.is_empty() {
                Some(paths::logs_dir())
            } else {
                Some(PathBuf::from(&self.logging.dir))
            }
        } else {
            None
        };

        Ok(ResolvedConfig {
            image_id: self.image.id.clone(),
            vcpus: self.image.vcpus,
            memory_mb: parse_size_mb(&self.image.memory)?,
            disk_size_mb: parse_size_mb(&self.image.disk_size)?,
            max_lines: self.stream.max_lines,
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            chunk_size: self.stream.chunk_size,
            resize_settle: Duration::from_secs(self.resize.settle_secs),
            mode: parse_mode(&self.output.mode)?,
            transcript_dir,
            transcript_keep: self.logging.keep,
        })
    }
}

fn parse_mode(mode: &str) -> Result<OutputMode, SnapError> {
    match mode {
        "normal" => Ok(OutputMode::Normal),
        "verbose" => Ok(OutputMode::Verbose),
        "quiet" => Ok(OutputMode::Quiet),
        "plain" => Ok(OutputMode::Plain),
        other => Err(SnapError::Validation {
            message: format!("output.mode must be normal, verbose, quiet or plain (got '{other}')"),
        }),
    }
}

fn validate_config(config: &BuildConfig) -> Result<(), SnapError> {
    if config.image.id.is_empty() {
        return Err(SnapError::Validation {
            message: "image.id must not be empty".into(),
        });
    }
    if config.image.vcpus == 0 {
        return Err(SnapError::Validation {
            message: "image.vcpus must be at least 1".into(),
        });
    }
    // One line is reserved for the truncation marker.
    if config.stream.max_lines < 2 {
        return Err(SnapError::Validation {
            message: format!(
                "stream.max_lines must be at least 2 (got {})",
                config.stream.max_lines
            ),
        });
    }
    if config.stream.poll_interval_ms == 0 {
        return Err(SnapError::Validation {
            message: "stream.poll_interval_ms must be greater than 0".into(),
        });
    }
    if config.stream.chunk_size == 0 {
        return Err(SnapError::Validation {
            message: "stream.chunk_size must be greater than 0".into(),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<ResolvedConfig, SnapError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SnapError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, &path.display().to_string())
}

/// Parse and resolve config text; `origin` names the source in errors.
pub fn parse_config(contents: &str, origin: &str) -> Result<ResolvedConfig, SnapError> {
    let config: BuildConfig = facet_toml::from_str(contents).map_err(|e| SnapError::ConfigParse {
        path: origin.to_string(),
        message: e.to_string(),
    })?;
    config.resolve()
}
