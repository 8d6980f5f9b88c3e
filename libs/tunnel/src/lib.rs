//! The tunnel engine: couples a TUN device and the framed TLS transport
//! through the rate limiters, and owns session lifecycle, reconnecting,
//! stats publication and live configuration reload.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod counters;
mod engine;
mod reload;
mod retry;
mod state;
mod stats;

use std::future::Future;

pub use counters::{CountersSnapshot, SessionCounters};
pub use engine::{
    Engine, EngineConfig, EngineHandle, Limiters, STATS_TARGET, SessionEnd, run_session,
};
pub use reload::{
    DEBOUNCE, ReloadController, ReloadHandles, bucket_config, changed, validate_throttle,
    watch_config,
};
pub use retry::{RetryAttempt, RetryPhase, RetryPolicy, RetryState};
pub use state::SessionState;
pub use stats::{StatsSettings, spawn_stats};

/// The engine's view of a virtual network interface.
///
/// [`sssonector_tun::TunDevice`] is the production implementation; tests
/// substitute an in-memory pair.
pub trait Tun: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    /// Reads exactly one IP datagram.
    fn read(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, sssonector_tun::Error>> + Send;

    /// Writes exactly one IP datagram.
    fn write(
        &self,
        datagram: &[u8],
    ) -> impl Future<Output = Result<(), sssonector_tun::Error>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(target_os = "linux")]
impl Tun for sssonector_tun::TunDevice {
    fn name(&self) -> &str {
        self.name()
    }

    fn mtu(&self) -> u16 {
        self.mtu()
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, sssonector_tun::Error> {
        self.read(buf).await
    }

    async fn write(&self, datagram: &[u8]) -> Result<(), sssonector_tun::Error> {
        self.write(datagram).await
    }

    async fn close(&self) {
        self.close().await;
    }
}

/// How the client engine establishes a transport session.
///
/// Dialing is injected so the reconnect machinery can be exercised without
/// sockets or certificates.
pub trait Connect: Send + 'static {
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static;

    fn connect(
        &mut self,
    ) -> impl Future<
        Output = Result<sssonector_transport::Session<Self::Stream>, sssonector_transport::Error>,
    > + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("peer broke the framing protocol; not reconnecting")]
    Corrupt(#[source] sssonector_transport::Error),
    #[error("peer authentication failed")]
    Auth(#[source] sssonector_transport::Error),
    #[error("retry budget exhausted")]
    RetriesExhausted,
    #[error("bandwidth shaping cannot pass a full-size datagram")]
    RateLimit(#[source] sssonector_ratelimit::Error),
    #[error("TUN device failed")]
    Tun(#[source] sssonector_tun::Error),
    #[error("internal error: {0}")]
    Internal(String),
}
