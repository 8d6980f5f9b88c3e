//! Reload delta computation.
//!
//! Everything under `throttle`, `logging` and `monitoring` may change on a
//! live session. `mode`, the whole `network` section, the tunnel endpoints,
//! the certificate paths and the whole `security` section are frozen until
//! the next full restart.

use crate::{Config, Error, Logging, Monitoring, Throttle};

/// The subset of the configuration that may be applied to a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct Reloadable {
    pub throttle: Throttle,
    pub logging: Logging,
    pub monitoring: Monitoring,
}

impl Reloadable {
    pub fn of(config: &Config) -> Self {
        Self {
            throttle: config.throttle.clone(),
            logging: config.logging.clone(),
            monitoring: config.monitoring.clone(),
        }
    }
}

/// Names of all frozen fields that differ between `old` and `new`.
pub fn frozen_delta(old: &Config, new: &Config) -> Vec<&'static str> {
    let mut changed = Vec::new();

    if old.mode != new.mode {
        changed.push("mode");
    }
    if old.network.interface != new.network.interface {
        changed.push("network.interface");
    }
    if old.network.address != new.network.address {
        changed.push("network.address");
    }
    if old.network.mtu != new.network.mtu {
        changed.push("network.mtu");
    }
    if old.tunnel.listen_address != new.tunnel.listen_address {
        changed.push("tunnel.listen_address");
    }
    if old.tunnel.server != new.tunnel.server {
        changed.push("tunnel.server");
    }
    if old.tunnel.cert_file != new.tunnel.cert_file {
        changed.push("tunnel.cert_file");
    }
    if old.tunnel.key_file != new.tunnel.key_file {
        changed.push("tunnel.key_file");
    }
    if old.tunnel.ca_file != new.tunnel.ca_file {
        changed.push("tunnel.ca_file");
    }
    if old.security != new.security {
        changed.push("security");
    }

    changed
}

/// Validates `new` as a reload of `old`.
///
/// Returns the reloadable subset of `new`, or an error naming every frozen
/// field the document tries to change. The active configuration is never
/// touched here; applying the subset is the caller's job.
pub fn check_reload(old: &Config, new: &Config) -> Result<Reloadable, Error> {
    new.validate()?;

    let frozen = frozen_delta(old, new);
    if !frozen.is_empty() {
        return Err(Error::FrozenFieldsChanged(frozen));
    }

    Ok(Reloadable::of(new))
}
