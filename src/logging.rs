use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::progress::OutputMode;
use crate::util::utc_timestamp;

// ── Subscriber setup ─────────────────────────────────────

/// Install the global tracing subscriber.
///
/// The terminal layer stays off while the live view owns the terminal
/// (normal and quiet), since interleaved stderr lines break indicatif's
/// redraw bookkeeping. The file layer always records `snapstack=debug` but
/// discards until the returned handle is pointed at a file.
///
/// Calling this twice is harmless; the second call keeps the first
/// subscriber and returns a handle that is never read from.
pub fn init(mode: OutputMode) -> DeferredFileHandle {
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => {
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
        }
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(mode != OutputMode::Plain)
        .with_filter(terminal_filter);

    let (file_writer, file_handle) = DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("snapstack=debug"));

    if tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    file_handle
}

// ── DeferredFileWriter ───────────────────────────────────

type SharedFile = Arc<Mutex<Option<File>>>;

fn lock(inner: &SharedFile) -> MutexGuard<'_, Option<File>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before the caller knows where traces should
/// go, so file logging is switched on later.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: SharedFile,
}

/// Activation side of a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: SharedFile,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Open `path` in append mode and start writing to it.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner).is_some()
    }
}

pub struct DeferredWriter {
    inner: SharedFile,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()), // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match lock(&self.inner).as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── LayerLogger ──────────────────────────────────────────

/// Reduce a layer label (often a whole shell command) to something usable
/// inside a filename.
pub fn layer_slug(label: &str) -> String {
    let mut slug = String::new();
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "layer".to_string()
    } else {
        slug.to_string()
    }
}

/// Transcripts started within the same millisecond get distinct sequence numbers.
const MAX_SEQUENCE: u32 = 100;

/// Full, untruncated transcript of one layer's remote output.
///
/// Creates `<timestamp>-<seq>_<layer>_running.log` on construction, never
/// reusing a name an earlier transcript holds in any state.
/// `finish(success)` renames it to `_ok.log` or `_failed.log`.
pub struct LayerLogger {
    file: File,
    path: PathBuf,
}

impl LayerLogger {
    pub fn new(logs_dir: &Path, layer: &str) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let ts = utc_timestamp();
        let slug = layer_slug(layer);
        for seq in 0..MAX_SEQUENCE {
            let stem = format!("{ts}-{seq:02}_{slug}");
            let taken = ["ok", "failed"]
                .iter()
                .any(|state| logs_dir.join(format!("{stem}_{state}.log")).exists());
            if taken {
                continue;
            }
            let path = logs_dir.join(format!("{stem}_running.log"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(Self { file, path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free transcript name for {slug} at {ts}"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw output. Write errors only cost the transcript.
    pub fn write(&mut self, text: &str) {
        if let Err(e) = self.file.write_all(text.as_bytes()) {
            tracing::warn!(path = %self.path.display(), error = %e, "transcript write failed");
        }
    }

    pub fn write_line(&mut self, line: &str) {
        self.write(line);
        self.write("\n");
    }

    /// Rename to the final name and return it.
    pub fn finish(self, success: bool) -> PathBuf {
        let suffix = if success { "ok" } else { "failed" };
        let new_name = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        let Some(name) = new_name else {
            return self.path;
        };
        let new_path = self.path.with_file_name(name);
        match fs::rename(&self.path, &new_path) {
            Ok(()) => new_path,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "transcript rename failed");
                self.path
            }
        }
    }
}

// ── Log rotation ─────────────────────────────────────────

/// Delete the oldest finished transcripts of `layer`, keeping at most `keep`.
pub fn rotate_logs(logs_dir: &Path, layer: &str, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };
    let needle = format!("_{}_", layer_slug(layer));

    let mut matching: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| {
                    f.contains(&needle) && (f.ends_with("_ok.log") || f.ends_with("_failed.log"))
                })
        })
        .collect();

    // Timestamp prefix sorts chronologically.
    matching.sort();

    if matching.len() > keep {
        for old in &matching[..matching.len() - keep] {
            if let Err(e) = fs::remove_file(old) {
                tracing::debug!(path = %old.display(), error = %e, "could not remove old transcript");
            }
        }
    }
}
