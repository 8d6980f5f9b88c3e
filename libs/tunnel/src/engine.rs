//! The per-session orchestrator.
//!
//! One engine owns one bridge: TUN ⇄ rate limiter ⇄ framed TLS transport.
//! The two directions run as separate tasks sharing a cancellation token, so
//! a fatal error on either side promptly tears down the other. Reconnecting
//! is driven by the pure [`RetryState`](crate::retry::RetryState) machine;
//! the engine only performs the waits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sssonector_ratelimit::RateLimiter;
use sssonector_transport::{Error as TransportError, Session, SessionReader, SessionWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::counters::SessionCounters;
use crate::retry::{RetryPolicy, RetryState};
use crate::state::SessionState;
use crate::{Connect, EngineError, Tun};

pub const STATS_TARGET: &str = "sssonector::stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Interval after which an idle outbound side emits a keepalive.
    pub keepalive: Duration,
    /// Bound on flushing pending outbound frames during shutdown.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// The two direction-scoped limiters of one session.
#[derive(Clone)]
pub struct Limiters {
    pub tun_to_net: RateLimiter,
    pub net_to_tun: RateLimiter,
}

impl Limiters {
    pub fn unlimited() -> Self {
        Self {
            tun_to_net: RateLimiter::unlimited(),
            net_to_tun: RateLimiter::unlimited(),
        }
    }
}

/// Why a session ended, short of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// External stop; do not reconnect.
    Stopped,
    /// The transport died; the caller may reconnect.
    Disconnected,
}

/// Control surface handed out by [`Engine::new`].
#[derive(Clone)]
pub struct EngineHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SessionState>,
    counters: Arc<SessionCounters>,
}

impl EngineHandle {
    /// Requests a clean shutdown; idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }
}

/// A client-side engine: connects, bridges, reconnects, stops.
pub struct Engine<T, C> {
    tun: Arc<T>,
    connector: C,
    limiters: Limiters,
    retry_policy: RetryPolicy,
    config: EngineConfig,
    counters: Arc<SessionCounters>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl<T, C> Engine<T, C>
where
    T: Tun,
    C: Connect,
{
    pub fn new(
        tun: Arc<T>,
        connector: C,
        limiters: Limiters,
        retry_policy: RetryPolicy,
        config: EngineConfig,
    ) -> (Self, EngineHandle) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let counters = Arc::new(SessionCounters::default());
        let cancel = CancellationToken::new();

        let handle = EngineHandle {
            cancel: cancel.clone(),
            state: state_rx,
            counters: counters.clone(),
        };

        (
            Self {
                tun,
                connector,
                limiters,
                retry_policy,
                config,
                counters,
                state_tx,
                cancel,
            },
            handle,
        )
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        self.counters.clone()
    }

    /// Runs until stopped, a fatal error occurs, or the retry budget runs out.
    ///
    /// All owned resources are released on every exit path; the final
    /// counters are published exactly once.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let result = self.run_inner().await;

        self.tun.close().await;
        self.counters.record_disconnect();

        let snapshot = self.counters.snapshot();
        tracing::info!(
            target: STATS_TARGET,
            bytes_tx = snapshot.bytes_tx,
            bytes_rx = snapshot.bytes_rx,
            packets_tx = snapshot.packets_tx,
            packets_rx = snapshot.packets_rx,
            errors = snapshot.errors,
            connect_count = snapshot.connect_count,
            "Final session counters"
        );

        self.state_tx.send_replace(match result {
            Ok(()) => SessionState::Stopped,
            Err(_) => SessionState::Failed,
        });

        result
    }

    async fn run_inner(&mut self) -> Result<(), EngineError> {
        loop {
            let Some(session) = self.establish().await? else {
                return Ok(()); // Stopped while (re)connecting.
            };

            self.counters.record_connect();
            self.state_tx.send_replace(SessionState::Running);

            let end = run_session(
                session,
                self.tun.clone(),
                self.limiters.clone(),
                self.counters.clone(),
                self.config,
                &self.cancel,
            )
            .await?;

            match end {
                SessionEnd::Stopped => return Ok(()),
                SessionEnd::Disconnected => {
                    self.counters.record_disconnect();
                    self.state_tx.send_replace(SessionState::Reconnecting);
                }
            }
        }
    }

    /// Connects, walking the retry schedule on failure.
    ///
    /// `Ok(None)` means an external stop arrived first.
    async fn establish(&mut self) -> Result<Option<Session<C::Stream>>, EngineError> {
        self.state_tx.send_replace(SessionState::Connecting);

        let mut retry = RetryState::new(self.retry_policy);

        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => return Ok(None),
                result = self.connector.connect() => result,
            };

            let error = match result {
                // Success discards the retry scratch record.
                Ok(session) => return Ok(Some(session)),
                Err(e @ TransportError::Auth(_)) => return Err(EngineError::Auth(e)),
                Err(e) => e,
            };

            self.counters.record_error();

            let Some(attempt) = retry.next_attempt() else {
                tracing::warn!("No retry budget left: {error}");
                return Err(EngineError::RetriesExhausted);
            };

            tracing::warn!(
                attempt = attempt.index,
                phase = %attempt.phase,
                next_delay = ?attempt.delay,
                "Connection attempt failed: {error}"
            );

            self.state_tx.send_replace(SessionState::Reconnecting);

            tokio::select! {
                () = self.cancel.cancelled() => return Ok(None),
                () = tokio::time::sleep(attempt.delay) => {}
            }

            self.state_tx.send_replace(SessionState::Connecting);
        }
    }
}

/// Bridges one established session until it ends.
///
/// Used by the client engine and, directly, by the server's accept loop.
/// `Corrupt` and TUN failures are fatal; everything else ends the session
/// with [`SessionEnd::Disconnected`] so the caller can decide to reconnect.
pub async fn run_session<S, T>(
    session: Session<S>,
    tun: Arc<T>,
    limiters: Limiters,
    counters: Arc<SessionCounters>,
    config: EngineConfig,
    stop: &CancellationToken,
) -> Result<SessionEnd, EngineError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: Tun,
{
    let (reader, writer) = session.split();

    let session_cancel = stop.child_token();

    let inbound = tokio::spawn(pump_inbound(
        reader,
        tun.clone(),
        limiters.net_to_tun,
        counters.clone(),
        session_cancel.clone(),
    ));
    let outbound = tokio::spawn(pump_outbound(
        writer,
        tun,
        limiters.tun_to_net,
        counters,
        session_cancel,
        config,
    ));

    let (inbound_end, outbound_end) = tokio::join!(inbound, outbound);

    let mut disconnected = false;

    for end in [inbound_end, outbound_end] {
        let end = end.map_err(|e| EngineError::Internal(format!("pump task panicked: {e}")))?;

        match end {
            PumpEnd::Cancelled => {}
            PumpEnd::Transport(e @ TransportError::Corrupt { .. }) => {
                return Err(EngineError::Corrupt(e));
            }
            PumpEnd::Transport(e) => {
                tracing::debug!("Session ended: {e}");
                disconnected = true;
            }
            PumpEnd::RateLimit(e) => return Err(EngineError::RateLimit(e)),
            PumpEnd::Tun(e) if !stop.is_cancelled() => return Err(EngineError::Tun(e)),
            PumpEnd::Tun(_) => {}
        }
    }

    if stop.is_cancelled() && !disconnected {
        return Ok(SessionEnd::Stopped);
    }

    Ok(SessionEnd::Disconnected)
}

enum PumpEnd {
    Cancelled,
    Transport(TransportError),
    Tun(sssonector_tun::Error),
    RateLimit(sssonector_ratelimit::Error),
}

async fn pump_outbound<S, T>(
    mut writer: SessionWriter<S>,
    tun: Arc<T>,
    limiter: RateLimiter,
    counters: Arc<SessionCounters>,
    cancel: CancellationToken,
    config: EngineConfig,
) -> PumpEnd
where
    S: AsyncRead + AsyncWrite + Send,
    T: Tun,
{
    let mut buf = vec![0u8; usize::from(tun.mtu()).max(576)];

    let mut keepalive = tokio::time::interval(tick_interval(config.keepalive));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let end = loop {
        tokio::select! {
            () = cancel.cancelled() => break PumpEnd::Cancelled,
            _ = keepalive.tick() => {
                if let Err(e) = writer.maybe_send_keepalive().await {
                    break PumpEnd::Transport(e);
                }
            }
            result = tun.read(&mut buf) => {
                let n = match result {
                    Ok(n) => n,
                    Err(e) => break PumpEnd::Tun(e),
                };

                if let Err(e) = limiter.acquire(n as u64).await {
                    // The datagram can never fit through the bucket and this
                    // layer does not fragment. Dropping it would be a silent
                    // hole in the bridge, so the session fails instead;
                    // startup validation makes this unreachable in practice.
                    counters.record_error();
                    break PumpEnd::RateLimit(e);
                }

                if let Err(e) = writer.write_frame(Bytes::copy_from_slice(&buf[..n])).await {
                    break PumpEnd::Transport(e);
                }

                counters.record_tx(n as u64);
            }
        }
    };

    if !matches!(end, PumpEnd::Cancelled) {
        // Take the peer direction down with us.
        cancel.cancel();
    }

    // Flush whatever is queued and say goodbye, but never hang the shutdown.
    let close = tokio::time::timeout(config.drain_timeout, writer.close()).await;
    match close {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Error closing the transport: {e}"),
        Err(_) => tracing::debug!("Timed out draining the transport"),
    }

    end
}

async fn pump_inbound<S, T>(
    mut reader: SessionReader<S>,
    tun: Arc<T>,
    limiter: RateLimiter,
    counters: Arc<SessionCounters>,
    cancel: CancellationToken,
) -> PumpEnd
where
    S: AsyncRead + AsyncWrite + Send,
    T: Tun,
{
    let end = loop {
        tokio::select! {
            () = cancel.cancelled() => break PumpEnd::Cancelled,
            result = reader.read_frame() => {
                let frame = match result {
                    Ok(frame) => frame,
                    Err(e) => break PumpEnd::Transport(e),
                };

                if let Err(e) = limiter.acquire(frame.len() as u64).await {
                    // Same contract as the outbound side: no fragmentation,
                    // therefore no silent drop. The session fails.
                    counters.record_error();
                    break PumpEnd::RateLimit(e);
                }

                match tun.write(&frame).await {
                    Ok(()) => counters.record_rx(frame.len() as u64),
                    Err(e @ sssonector_tun::Error::TooLarge { .. }) => {
                        // Peer sent something bigger than our MTU; drop it
                        // rather than killing the session.
                        tracing::warn!("Dropping inbound frame: {e}");
                        counters.record_error();
                    }
                    Err(e) => break PumpEnd::Tun(e),
                }
            }
        }
    };

    if !matches!(end, PumpEnd::Cancelled) {
        cancel.cancel();
    }

    end
}

fn tick_interval(keepalive: Duration) -> Duration {
    (keepalive / 2).max(Duration::from_millis(100))
}
