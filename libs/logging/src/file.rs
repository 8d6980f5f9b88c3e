//! File logging layer.
//!
//! Events are handed to a background thread through a bounded channel so the
//! data plane never blocks on disk I/O. The returned [`Handle`] owns the
//! worker guard; dropping it flushes and stops the writer.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::Layer;

/// How many lines we will at most buffer for the background writer thread.
///
/// The daemon does not log a lot in steady state; this only needs to absorb
/// bursts (e.g. a reconnect storm).
const MAX_BUFFERED_LINES: usize = 1024;

/// Creates a file logging layer appending to `path`.
pub fn layer<T>(path: &Path, json: bool) -> Result<(Box<dyn Layer<T> + Send + Sync>, Handle)>
where
    T: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create `{}`", parent.display()))?;
    }

    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open `{}`", path.display()))?;

    let (writer, guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(MAX_BUFFERED_LINES)
        .finish(file);

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .event_format(crate::Format::new())
            .with_writer(writer)
            .boxed()
    };

    let handle = Handle {
        _guard: Arc::new(guard),
    };

    Ok((layer, handle))
}

/// A handle to the file logger.
///
/// Houses the [`WorkerGuard`] of the non-blocking appender. You MUST keep it
/// alive for as long as messages should arrive at the log file.
#[must_use]
#[derive(Clone, Debug)]
pub struct Handle {
    _guard: Arc<WorkerGuard>,
}
