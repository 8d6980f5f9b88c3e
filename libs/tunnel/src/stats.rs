//! Periodic counters publication.
//!
//! A small task that logs a wait-free snapshot of the session counters and
//! limiter metrics to a dedicated target. The interval (and whether it runs
//! at all) is live-reloadable through a watch channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::counters::SessionCounters;
use crate::engine::{Limiters, STATS_TARGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSettings {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&sssonector_config::Monitoring> for StatsSettings {
    fn from(monitoring: &sssonector_config::Monitoring) -> Self {
        Self {
            enabled: monitoring.enabled,
            interval: monitoring.interval.max(Duration::from_secs(1)),
        }
    }
}

/// Spawns the stats publisher task.
pub fn spawn_stats(
    counters: Arc<SessionCounters>,
    limiters: Limiters,
    mut settings_rx: watch::Receiver<StatsSettings>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let settings = *settings_rx.borrow_and_update();

            if !settings.enabled {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    result = settings_rx.changed() => {
                        if result.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                result = settings_rx.changed() => {
                    if result.is_err() {
                        return;
                    }
                }
                () = tokio::time::sleep(settings.interval) => {
                    publish(&counters, &limiters);
                }
            }
        }
    })
}

fn publish(counters: &SessionCounters, limiters: &Limiters) {
    let snapshot = counters.snapshot();
    let up = limiters.tun_to_net.metrics();
    let down = limiters.net_to_tun.metrics();

    tracing::debug!(
        target: STATS_TARGET,
        bytes_tx = snapshot.bytes_tx,
        bytes_rx = snapshot.bytes_rx,
        packets_tx = snapshot.packets_tx,
        packets_rx = snapshot.packets_rx,
        errors = snapshot.errors,
        connect_count = snapshot.connect_count,
        up_rate = up.rate,
        up_limit_hits = up.limit_hits,
        down_rate = down.rate,
        down_limit_hits = down.limit_hits,
        "Session stats"
    );
}
