//! Tracing setup for the tunnel daemon.
//!
//! The log filter sits behind a [`reload::Layer`] so that the reload
//! controller can swap it on a live process: writers resolve the current
//! filter on every event, a reload installs the new one atomically and never
//! touches the subscriber itself.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod file;
mod format;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{Subscriber, subscriber::DefaultGuard};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::ParseError,
    fmt,
    layer::SubscriberExt as _,
    reload,
    util::SubscriberInitExt as _,
};

pub use format::Format;

/// Registers the global subscriber: a stdout layer plus `additional_layer`
/// (typically the file layer), each behind its own reloadable filter.
pub fn setup_global_subscriber<L>(
    directives: &str,
    additional_layer: L,
    stdout_json: bool,
) -> Result<FilterReloadHandle>
where
    L: Layer<Registry> + Send + Sync,
{
    let (filter1, reload_handle1) = try_filter(directives).context("Failed to parse directives")?;
    let (filter2, reload_handle2) = try_filter(directives).context("Failed to parse directives")?;

    let subscriber = Registry::default()
        .with(additional_layer.with_filter(filter1))
        .with(match stdout_json {
            true => fmt::layer()
                .json()
                .flatten_event(true)
                .with_filter(filter2)
                .boxed(),
            false => fmt::layer()
                .with_ansi(stdout_supports_ansi())
                .event_format(Format::new())
                .with_filter(filter2)
                .boxed(),
        });
    init(subscriber)?;

    Ok(reload_handle1.merge(reload_handle2))
}

pub fn init(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
    tracing::subscriber::set_global_default(subscriber).context("Could not set global default")?;
    LogTracer::init().context("Failed to init LogTracer")?;

    Ok(())
}

pub fn stdout_supports_ansi() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}

/// Constructs an opinionated [`EnvFilter`] with some crates already silenced.
pub fn try_filter<S>(
    directives: &str,
) -> Result<(reload::Layer<EnvFilter, S>, FilterReloadHandle), ParseError>
where
    S: 'static,
{
    let env_filter = parse_filter(directives)?;

    let (layer, reload_handle) = reload::Layer::new(env_filter);
    let handle = FilterReloadHandle {
        inner: Arc::new(reload_handle),
    };

    Ok((layer, handle))
}

fn parse_filter(directives: &str) -> Result<EnvFilter, ParseError> {
    /// A filter directive that silences noisy crates.
    ///
    /// A catch-all directive like `debug` would otherwise drown the log in
    /// netlink and TLS internals; restate them with a lower filter
    /// (e.g. `netlink_proto=debug`) to get them back.
    const IRRELEVANT_CRATES: &str = "netlink_proto=warn,rustls=warn,notify=warn";

    let env_filter = if directives.is_empty() {
        EnvFilter::try_new(IRRELEVANT_CRATES)?
    } else {
        EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))?
    };

    Ok(env_filter)
}

/// A type-erased handle to every reloadable filter of the subscriber.
pub struct FilterReloadHandle {
    inner: Arc<dyn Reload + Send + Sync>,
}

impl std::fmt::Debug for FilterReloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FilterReloadHandle").finish_non_exhaustive()
    }
}

impl FilterReloadHandle {
    pub fn reload(&self, new_filter: &str) -> Result<()> {
        self.inner.reload(new_filter)?;

        Ok(())
    }

    pub fn merge(self, other: FilterReloadHandle) -> Self {
        Self {
            inner: Arc::new((self, other)),
        }
    }
}

trait Reload {
    fn reload(&self, new_filter: &str) -> Result<()>;
}

impl<S> Reload for tracing_subscriber::reload::Handle<EnvFilter, S>
where
    S: 'static,
{
    fn reload(&self, new_filter: &str) -> Result<()> {
        let filter = parse_filter(new_filter).context("Failed to parse new filter")?;

        self.reload(filter).context("Failed to reload filter")?;

        Ok(())
    }
}

impl Reload for (FilterReloadHandle, FilterReloadHandle) {
    fn reload(&self, new_filter: &str) -> Result<()> {
        let (a, b) = self;

        a.reload(new_filter)?;
        b.reload(new_filter)?;

        Ok(())
    }
}

/// Initialises a logger to be used in tests.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

pub fn test_global(directives: &str) {
    init(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(directives)
            .finish(),
    )
    .ok();
}
