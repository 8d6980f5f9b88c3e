//! Live configuration reload.
//!
//! The controller watches the config file, validates each new document
//! against the running one, and pushes the reloadable subset into the
//! running components in a fixed order: rate limiters first, then the log
//! filter, then the stats publisher. A document touching frozen fields is
//! rejected wholesale; a per-field failure rolls back what was already
//! applied. A reload never tears the session down.

use std::path::Path;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use sssonector_config::{Config, Error as ConfigError, Reloadable, Throttle, check_reload};
use sssonector_logging::FilterReloadHandle;
use sssonector_ratelimit::{BucketConfig, RateLimiter, kbps_to_bytes};
use tokio::sync::{mpsc, watch};

use crate::stats::StatsSettings;

/// Debounce window for file change events; editors tend to write in
/// several steps.
pub const DEBOUNCE: Duration = Duration::from_millis(150);

/// Builds the shaping configuration for one direction.
pub fn bucket_config(throttle: &Throttle, kbps: u64) -> BucketConfig {
    if !throttle.enabled {
        return BucketConfig::unlimited();
    }

    let dynamic_enabled = throttle.dynamic.enabled && kbps != 0;

    BucketConfig {
        base_rate: kbps_to_bytes(kbps),
        min_rate: if dynamic_enabled {
            kbps_to_bytes(throttle.dynamic.min_kbps)
        } else {
            0
        },
        max_rate: if dynamic_enabled {
            kbps_to_bytes(throttle.dynamic.max_kbps)
        } else {
            0
        },
        dynamic_enabled,
        cooldown: throttle.dynamic.cooldown,
        increase_threshold: throttle.dynamic.increase_threshold,
        decrease_threshold: throttle.dynamic.decrease_threshold,
        ..BucketConfig::default()
    }
}

/// Rejects shaping settings whose burst cannot hold one full-size datagram.
///
/// The pumps never fragment: a datagram larger than the burst capacity can
/// never pass the bucket and would fail the session. With dynamic
/// adjustment enabled the rate may sink to the configured floor, so the
/// floor's burst must hold an MTU-sized datagram too.
pub fn validate_throttle(throttle: &Throttle, mtu: u16) -> Result<(), ConfigError> {
    if !throttle.enabled {
        return Ok(());
    }

    for (field, kbps) in [
        ("throttle.upload_kbps", throttle.upload_kbps),
        ("throttle.download_kbps", throttle.download_kbps),
    ] {
        if kbps == 0 {
            continue;
        }

        let config = bucket_config(throttle, kbps);
        let lowest_rate = if config.dynamic_enabled {
            config.min_rate
        } else {
            config.base_rate
        };

        let burst = config.burst_capacity(lowest_rate);
        if burst < u64::from(mtu) {
            return Err(ConfigError::Invalid {
                field,
                reason: format!(
                    "burst capacity of {burst} bytes cannot hold one {mtu}-byte datagram; \
                     raise the rate (or dynamic.min_kbps) or lower network.mtu"
                ),
            });
        }
    }

    Ok(())
}

/// Everything the controller may mutate on a live session.
pub struct ReloadHandles {
    pub tun_to_net: RateLimiter,
    pub net_to_tun: RateLimiter,
    pub log_filter: FilterReloadHandle,
    pub stats: watch::Sender<StatsSettings>,
}

pub struct ReloadController {
    active: Config,
    handles: ReloadHandles,
}

impl ReloadController {
    pub fn new(active: Config, handles: ReloadHandles) -> Self {
        Self { active, handles }
    }

    pub fn active(&self) -> &Config {
        &self.active
    }

    /// Re-reads the config file and applies it; logs the outcome.
    pub fn reload_from_file(&mut self, path: &Path) {
        match Config::load(path).and_then(|new| self.apply(new)) {
            Ok(()) => tracing::info!("Configuration reloaded"),
            Err(e) => {
                tracing::error!(code = "config_reload_rejected", "Reload rejected: {e:#}");
            }
        }
    }

    /// Validates and applies `new`.
    ///
    /// On any error the active configuration and all components are left as
    /// they were. Applying an identical document is a no-op.
    pub fn apply(&mut self, new: Config) -> Result<(), ConfigError> {
        let reloadable = check_reload(&self.active, &new)?;

        // `network.mtu` is frozen, so the active value is the one to hold
        // the new throttle against.
        validate_throttle(&new.throttle, self.active.network.mtu)?;

        if reloadable == Reloadable::of(&self.active) {
            tracing::debug!("Configuration unchanged");
            self.active = new;

            return Ok(());
        }

        let old_throttle = self.active.throttle.clone();

        self.handles
            .tun_to_net
            .reconfigure(bucket_config(&new.throttle, new.throttle.upload_kbps));
        self.handles
            .net_to_tun
            .reconfigure(bucket_config(&new.throttle, new.throttle.download_kbps));

        if let Err(e) = self
            .handles
            .log_filter
            .reload(&new.logging.directives())
        {
            self.rollback_throttle(&old_throttle);

            return Err(ConfigError::Invalid {
                field: "logging",
                reason: format!("{e:#}"),
            });
        }

        let _ = self.handles.stats.send(StatsSettings::from(&new.monitoring));

        tracing::info!(
            upload_kbps = new.throttle.upload_kbps,
            download_kbps = new.throttle.download_kbps,
            level = new.logging.level.as_str(),
            "Applied reloadable configuration"
        );

        self.active = new;

        Ok(())
    }

    fn rollback_throttle(&self, old: &Throttle) {
        self.handles
            .tun_to_net
            .reconfigure(bucket_config(old, old.upload_kbps));
        self.handles
            .net_to_tun
            .reconfigure(bucket_config(old, old.download_kbps));
    }
}

/// Starts watching the config file for changes.
///
/// The watcher observes the parent directory because editors typically
/// replace the file by rename. Keep the returned watcher alive; events
/// arrive on the channel and should be drained via [`changed`].
pub fn watch_config(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>), notify::Error> {
    let (tx, rx) = mpsc::channel(8);
    let file_name = path.file_name().map(ToOwned::to_owned);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        let Ok(event) = result else {
            return;
        };

        let relevant = event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
        let ours = event
            .paths
            .iter()
            .any(|p| p.file_name() == file_name.as_deref());

        if relevant && ours {
            let _ = tx.try_send(());
        }
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    Ok((watcher, rx))
}

/// Waits for the next change event, absorbing the burst an editor produces.
pub async fn changed(rx: &mut mpsc::Receiver<()>, debounce: Duration) -> Option<()> {
    rx.recv().await?;

    tokio::time::sleep(debounce).await;
    while rx.try_recv().is_ok() {}

    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sssonector_config::Mode;
    use tokio::sync::watch;

    fn example_config() -> (Config, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();

        for name in ["server.crt", "server.key", "ca.crt"] {
            std::fs::write(dir.path().join(name), "dummy").unwrap();
        }

        let yaml = format!(
            r#"
mode: server
network:
  address: 10.0.0.1/24
tunnel:
  listen_address: 0.0.0.0:8443
  cert_file: {dir}/server.crt
  key_file: {dir}/server.key
  ca_file: {dir}/ca.crt
throttle:
  upload_kbps: 1024
  download_kbps: 1024
"#,
            dir = dir.path().display()
        );

        let config = Config::parse(&yaml, false).unwrap();
        config.validate().unwrap();

        (config, dir)
    }

    fn controller(config: &Config) -> (ReloadController, watch::Receiver<StatsSettings>) {
        let (_, log_filter) = sssonector_logging::try_filter::<()>("info").unwrap();
        let (stats_tx, stats_rx) = watch::channel(StatsSettings::default());

        let handles = ReloadHandles {
            tun_to_net: RateLimiter::new(bucket_config(
                &config.throttle,
                config.throttle.upload_kbps,
            )),
            net_to_tun: RateLimiter::new(bucket_config(
                &config.throttle,
                config.throttle.download_kbps,
            )),
            log_filter,
            stats: stats_tx,
        };

        (ReloadController::new(config.clone(), handles), stats_rx)
    }

    #[tokio::test]
    async fn throttle_change_reaches_the_limiters() {
        let (config, _guard) = example_config();
        let (mut controller, _stats) = controller(&config);

        let mut new = config.clone();
        new.throttle.upload_kbps = 2048;

        controller.apply(new).unwrap();

        assert_eq!(
            controller.handles.tun_to_net.metrics().rate,
            kbps_to_bytes(2048)
        );
        // The other direction is untouched.
        assert_eq!(
            controller.handles.net_to_tun.metrics().rate,
            kbps_to_bytes(1024)
        );
    }

    #[tokio::test]
    async fn frozen_field_change_is_rejected_and_nothing_moves() {
        let (config, _guard) = example_config();
        let (mut controller, _stats) = controller(&config);

        let mut new = config.clone();
        new.mode = Mode::Client;
        new.tunnel.server = Some("example.com:8443".to_owned());
        new.throttle.upload_kbps = 9999;

        assert!(matches!(
            controller.apply(new),
            Err(ConfigError::FrozenFieldsChanged(_))
        ));

        assert_eq!(controller.active().throttle.upload_kbps, 1024);
        assert_eq!(
            controller.handles.tun_to_net.metrics().rate,
            kbps_to_bytes(1024)
        );
    }

    #[tokio::test]
    async fn applying_the_same_document_twice_is_idempotent() {
        let (config, _guard) = example_config();
        let (mut controller, _stats) = controller(&config);

        let mut new = config.clone();
        new.throttle.upload_kbps = 2048;

        controller.apply(new.clone()).unwrap();
        let first = controller.handles.tun_to_net.metrics();

        controller.apply(new.clone()).unwrap();
        let second = controller.handles.tun_to_net.metrics();

        assert_eq!(first, second);
        assert_eq!(controller.active(), &new);
    }

    #[test]
    fn rejects_a_burst_smaller_than_one_datagram() {
        let throttle = Throttle {
            // 100 kbit/s: burst = 12500 * 1.05 * 0.1 = 1312 bytes.
            upload_kbps: 100,
            download_kbps: 1024,
            ..Throttle::default()
        };

        let err = validate_throttle(&throttle, 1500).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "throttle.upload_kbps",
                ..
            }
        ));

        assert!(validate_throttle(&throttle, 1000).is_ok());
    }

    #[test]
    fn accepts_reasonable_rates_and_unlimited_directions() {
        let throttle = Throttle {
            upload_kbps: 1024,
            download_kbps: 0,
            ..Throttle::default()
        };

        assert!(validate_throttle(&throttle, 1500).is_ok());

        let disabled = Throttle {
            enabled: false,
            upload_kbps: 1,
            ..Throttle::default()
        };

        assert!(validate_throttle(&disabled, 1500).is_ok());
    }

    #[test]
    fn dynamic_floor_must_also_hold_one_datagram() {
        let mut throttle = Throttle {
            upload_kbps: 1024,
            download_kbps: 1024,
            ..Throttle::default()
        };
        throttle.dynamic.enabled = true;
        throttle.dynamic.min_kbps = 50; // Floor burst = 656 bytes.
        throttle.dynamic.max_kbps = 2048;

        assert!(validate_throttle(&throttle, 1500).is_err());

        throttle.dynamic.min_kbps = 512;

        assert!(validate_throttle(&throttle, 1500).is_ok());
    }

    #[tokio::test]
    async fn reload_cannot_shrink_the_burst_below_one_datagram() {
        let (config, _guard) = example_config();
        let (mut controller, _stats) = controller(&config);

        let mut new = config.clone();
        new.throttle.upload_kbps = 100;

        assert!(matches!(
            controller.apply(new),
            Err(ConfigError::Invalid {
                field: "throttle.upload_kbps",
                ..
            })
        ));

        // The active configuration and the limiters are untouched.
        assert_eq!(controller.active().throttle.upload_kbps, 1024);
        assert_eq!(
            controller.handles.tun_to_net.metrics().rate,
            kbps_to_bytes(1024)
        );
    }

    #[tokio::test]
    async fn disabling_the_throttle_lifts_the_limit() {
        let (config, _guard) = example_config();
        let (mut controller, _stats) = controller(&config);

        let mut new = config.clone();
        new.throttle.enabled = false;

        controller.apply(new).unwrap();

        assert_eq!(controller.handles.tun_to_net.metrics().rate, 0);
    }

    #[tokio::test]
    async fn monitoring_change_reaches_the_stats_task() {
        let (config, _guard) = example_config();
        let (mut controller, stats) = controller(&config);

        let mut new = config.clone();
        new.monitoring.enabled = true;
        new.monitoring.interval = Duration::from_secs(5);

        controller.apply(new).unwrap();

        let settings = *stats.borrow();
        assert!(settings.enabled);
        assert_eq!(settings.interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn file_watcher_reports_changes_debounced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "a: 1").unwrap();

        let (_watcher, mut rx) = watch_config(&path).unwrap();

        // An editor writing in several steps.
        std::fs::write(&path, "a: 2").unwrap();
        std::fs::write(&path, "a: 3").unwrap();

        let change = tokio::time::timeout(
            Duration::from_secs(5),
            changed(&mut rx, Duration::from_millis(100)),
        )
        .await
        .expect("watcher should deliver an event");
        assert!(change.is_some());

        // The burst collapsed into one notification.
        assert!(rx.try_recv().is_err());
    }
}
