//! Daemon startup and the main event loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use sssonector_config::{Config, LogFormat, Mode, TlsVersion};
use sssonector_logging::FilterReloadHandle;
use sssonector_ratelimit::RateLimiter;
use sssonector_transport::{
    Listener, MinTlsVersion, Session, Timeouts, TlsMaterial, TlsSettings, TlsTcpStream,
};
use sssonector_tun::TunDevice;
use sssonector_tunnel::{
    Connect, DEBOUNCE, Engine, EngineConfig, EngineError, EngineHandle, Limiters,
    ReloadController, ReloadHandles, RetryPolicy, SessionCounters, SessionEnd, StatsSettings,
    bucket_config, changed, run_session, spawn_stats, watch_config,
};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::pid::PidFile;
use crate::signals;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Headroom above the MTU for the frame-length sanity bound. Anything larger
/// on the wire cannot be a single tunnelled datagram and is treated as a
/// corrupt stream.
const FRAME_MARGIN: u16 = 128;

pub(crate) fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    sssonector_tunnel::validate_throttle(&config.throttle, config.network.mtu)?;

    let stdout_json = config.logging.format == LogFormat::Json;
    let (file_layer, _file_handle) = config
        .logging
        .file
        .as_deref()
        .map(|path| sssonector_logging::file::layer(path, stdout_json))
        .transpose()?
        .unzip();

    let log_filter = sssonector_logging::setup_global_subscriber(
        &config.logging.directives(),
        file_layer,
        stdout_json,
    )
    .context("Failed to set up logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %config.mode,
        "Starting tunnel daemon"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let result = rt.block_on(run_daemon(config, config_path, log_filter));

    rt.shutdown_timeout(Duration::from_secs(1));

    result
}

async fn run_daemon(
    config: Config,
    config_path: &Path,
    log_filter: FilterReloadHandle,
) -> Result<()> {
    let _pid_file = PidFile::acquire()?;

    let material = TlsMaterial::load(
        &config.tunnel.cert_file,
        &config.tunnel.key_file,
        &config.tunnel.ca_file,
        tls_settings(&config),
    )?;

    let tun = Arc::new(
        TunDevice::open(
            &config.network.interface,
            config.network.address.ip,
            config.network.address.prefix,
            config.network.mtu,
        )
        .await?,
    );

    let limiters = Limiters {
        tun_to_net: RateLimiter::new(bucket_config(
            &config.throttle,
            config.throttle.upload_kbps,
        )),
        net_to_tun: RateLimiter::new(bucket_config(
            &config.throttle,
            config.throttle.download_kbps,
        )),
    };

    let max_frame = config.network.mtu.saturating_add(FRAME_MARGIN);
    let timeouts = Timeouts {
        handshake: config.tunnel.handshake_timeout,
        write: WRITE_TIMEOUT,
        keepalive: config.tunnel.keepalive,
    };
    let engine_config = EngineConfig {
        keepalive: config.tunnel.keepalive,
        drain_timeout: DRAIN_TIMEOUT,
    };

    let stop = CancellationToken::new();
    let (stats_tx, stats_rx) = watch::channel(StatsSettings::from(&config.monitoring));

    let (mut driver, counters, stopper) = match config.mode {
        Mode::Server => {
            let listen_address = config
                .tunnel
                .listen_address
                .context("server mode requires tunnel.listen_address")?;
            let listener =
                sssonector_transport::listen(listen_address, &material, max_frame, timeouts)
                    .await?;
            let counters = Arc::new(SessionCounters::default());

            let driver = tokio::spawn(serve(
                listener,
                tun.clone(),
                limiters.clone(),
                counters.clone(),
                engine_config,
                stop.clone(),
            ));

            (driver, counters, Stopper::Server(stop.clone()))
        }
        Mode::Client => {
            let endpoint = config
                .tunnel
                .server
                .clone()
                .context("client mode requires tunnel.server")?;

            let connector = TlsConnect {
                endpoint,
                material,
                max_frame,
                timeouts,
            };
            let (engine, handle) = Engine::new(
                tun.clone(),
                connector,
                limiters.clone(),
                RetryPolicy::from(&config.connection.retry),
                engine_config,
            );
            let counters = engine.counters();

            (tokio::spawn(engine.run()), counters, Stopper::Client(handle))
        }
    };

    let _stats = spawn_stats(counters, limiters.clone(), stats_rx, stop.clone());

    let mut controller = ReloadController::new(
        config,
        ReloadHandles {
            tun_to_net: limiters.tun_to_net,
            net_to_tun: limiters.net_to_tun,
            log_filter,
            stats: stats_tx,
        },
    );

    // Keep the watcher alive for the lifetime of the daemon.
    let (_watcher, mut raw_changes) = watch_config(config_path)
        .with_context(|| format!("Failed to watch `{}`", config_path.display()))?;

    let (debounced_tx, mut changes) = mpsc::channel(1);
    tokio::spawn(async move {
        while changed(&mut raw_changes, DEBOUNCE).await.is_some() {
            if debounced_tx.send(()).await.is_err() {
                break;
            }
        }
    });

    let mut signals = signals::Signals::new()?;

    let result = loop {
        tokio::select! {
            event = signals.recv() => match event {
                signals::Event::Terminate => {
                    // The driver observes the stop and finishes; the next
                    // loop iteration joins it.
                    tracing::info!("Caught SIGINT / SIGTERM, shutting down");
                    stopper.stop();
                }
                signals::Event::ReloadConfig => {
                    tracing::info!("Caught SIGHUP, reloading configuration");
                    controller.reload_from_file(config_path);
                }
            },
            Some(()) = changes.recv() => {
                tracing::debug!("Configuration file changed");
                controller.reload_from_file(config_path);
            }
            result = join_driver(&mut driver) => break result,
        }
    };

    stop.cancel();

    if let Err(e) = &result {
        tracing::error!(code = fatal_code(e), "Tunnel failed: {e}");
    }

    result?;

    Ok(())
}

fn fatal_code(e: &EngineError) -> &'static str {
    match e {
        EngineError::Corrupt(_) => "corrupt_frame",
        EngineError::Auth(_) => "auth_failure",
        EngineError::RetriesExhausted => "retries_exhausted",
        EngineError::RateLimit(_) => "rate_limit_misconfigured",
        EngineError::Tun(_) => "tun_failure",
        EngineError::Internal(_) => "internal",
    }
}

async fn join_driver(
    driver: &mut tokio::task::JoinHandle<Result<(), EngineError>>,
) -> Result<(), EngineError> {
    driver
        .await
        .unwrap_or_else(|e| Err(EngineError::Internal(format!("driver task died: {e}"))))
}

enum Stopper {
    Server(CancellationToken),
    Client(EngineHandle),
}

impl Stopper {
    fn stop(&self) {
        match self {
            Self::Server(token) => token.cancel(),
            Self::Client(handle) => handle.stop(),
        }
    }
}

fn tls_settings(config: &Config) -> TlsSettings {
    TlsSettings {
        min_version: match config.security.tls.min_version {
            TlsVersion::Tls12 => MinTlsVersion::V1_2,
            TlsVersion::Tls13 => MinTlsVersion::V1_3,
        },
        mutual_auth: config.security.tls.mutual_auth,
        verify_cert: config.security.tls.verify_cert,
    }
}

/// Dials the configured server; one fresh TLS session per attempt.
struct TlsConnect {
    endpoint: String,
    material: TlsMaterial,
    max_frame: u16,
    timeouts: Timeouts,
}

impl Connect for TlsConnect {
    type Stream = TlsTcpStream;

    async fn connect(&mut self) -> Result<Session<TlsTcpStream>, sssonector_transport::Error> {
        sssonector_transport::connect(&self.endpoint, &self.material, self.max_frame, self.timeouts)
            .await
    }
}

/// The server's accept loop: one bridged peer at a time.
///
/// A failed or unauthorized handshake is logged and the next client is
/// awaited; only a stop request or a fatal session error ends the loop.
async fn serve(
    listener: Listener,
    tun: Arc<TunDevice>,
    limiters: Limiters,
    counters: Arc<SessionCounters>,
    config: EngineConfig,
    stop: CancellationToken,
) -> Result<(), EngineError> {
    let result = accept_loop(&listener, &tun, &limiters, &counters, config, &stop).await;

    tun.close().await;
    counters.record_disconnect();

    let snapshot = counters.snapshot();
    tracing::info!(
        target: sssonector_tunnel::STATS_TARGET,
        bytes_tx = snapshot.bytes_tx,
        bytes_rx = snapshot.bytes_rx,
        packets_tx = snapshot.packets_tx,
        packets_rx = snapshot.packets_rx,
        errors = snapshot.errors,
        connect_count = snapshot.connect_count,
        "Final session counters"
    );

    result
}

async fn accept_loop(
    listener: &Listener,
    tun: &Arc<TunDevice>,
    limiters: &Limiters,
    counters: &Arc<SessionCounters>,
    config: EngineConfig,
    stop: &CancellationToken,
) -> Result<(), EngineError> {
    loop {
        let accepted = tokio::select! {
            () = stop.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        let session = match accepted {
            Ok((session, _remote)) => session,
            Err(e) => {
                tracing::warn!("Rejected client: {e}");
                counters.record_error();
                continue;
            }
        };

        counters.record_connect();

        match run_session(
            session,
            tun.clone(),
            limiters.clone(),
            counters.clone(),
            config,
            stop,
        )
        .await?
        {
            SessionEnd::Stopped => return Ok(()),
            SessionEnd::Disconnected => {
                counters.record_disconnect();
                tracing::info!("Peer disconnected, waiting for the next client");
            }
        }
    }
}
