//! Unix signal handling.
//!
//! All process signals the daemon reacts to are merged into one source so
//! the main loop has a single arm for them.

use std::future::poll_fn;
use std::task::Poll;

use anyhow::Result;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// SIGINT or SIGTERM: shut down cleanly.
    Terminate,
    /// SIGHUP: re-read the configuration file.
    ReloadConfig,
}

pub(crate) struct Signals {
    interrupt: Signal,
    terminate: Signal,
    hangup: Signal,
}

impl Signals {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the next signal of interest.
    pub(crate) async fn recv(&mut self) -> Event {
        poll_fn(|cx| {
            if self.hangup.poll_recv(cx).is_ready() {
                return Poll::Ready(Event::ReloadConfig);
            }

            if self.interrupt.poll_recv(cx).is_ready() || self.terminate.poll_recv(cx).is_ready() {
                return Poll::Ready(Event::Terminate);
            }

            Poll::Pending
        })
        .await
    }
}
