//! Configuration schema for the tunnel daemon.
//!
//! The canonical on-disk format is YAML; JSON is accepted with identical keys
//! (selected by file extension). All durations accept humantime strings such
//! as `30s` or `1h`.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod delta;

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use delta::{Reloadable, check_reload, frozen_delta};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse YAML document")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse JSON document")]
    Json(#[from] serde_json::Error),
    #[error("`{field}` is invalid: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("refusing to change frozen fields: {}", .0.join(", "))]
    FrozenFieldsChanged(Vec<&'static str>),
}

impl Error {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,
    pub network: Network,
    pub tunnel: Tunnel,
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub throttle: Throttle,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub monitoring: Monitoring,
}

impl Config {
    /// Reads and validates a configuration document.
    ///
    /// `.json` files are parsed as JSON, everything else as YAML.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&raw, path.extension().is_some_and(|e| e == "json"))?;
        config.validate()?;

        Ok(config)
    }

    pub fn parse(raw: &str, json: bool) -> Result<Self, Error> {
        let config = if json {
            serde_json::from_str(raw)?
        } else {
            serde_yaml::from_str(raw)?
        };

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.network.mtu < MIN_MTU {
            return Err(Error::invalid(
                "network.mtu",
                format!("must be at least {MIN_MTU}"),
            ));
        }

        match self.mode {
            Mode::Server => {
                if self.tunnel.listen_address.is_none() {
                    return Err(Error::invalid(
                        "tunnel.listen_address",
                        "required in server mode",
                    ));
                }
            }
            Mode::Client => {
                let Some(server) = self.tunnel.server.as_deref() else {
                    return Err(Error::invalid("tunnel.server", "required in client mode"));
                };

                if !has_port(server) {
                    return Err(Error::invalid("tunnel.server", "expected `host:port`"));
                }
            }
        }

        for (field, path) in [
            ("tunnel.cert_file", &self.tunnel.cert_file),
            ("tunnel.key_file", &self.tunnel.key_file),
            ("tunnel.ca_file", &self.tunnel.ca_file),
        ] {
            if !path.is_file() {
                return Err(Error::invalid(
                    field,
                    format!("`{}` does not exist", path.display()),
                ));
            }
        }

        if self.tunnel.keepalive.is_zero() {
            return Err(Error::invalid("tunnel.keepalive", "must be non-zero"));
        }
        if self.tunnel.handshake_timeout.is_zero() {
            return Err(Error::invalid(
                "tunnel.handshake_timeout",
                "must be non-zero",
            ));
        }

        self.throttle.validate()?;

        Ok(())
    }

    /// The endpoint a client dials, e.g. `vpn.example.com:8443`.
    pub fn server_endpoint(&self) -> Option<&str> {
        self.tunnel.server.as_deref()
    }
}

const MIN_MTU: u16 = 576;

fn has_port(endpoint: &str) -> bool {
    endpoint
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Network {
    /// Interface name; the OS picks one if empty.
    #[serde(default)]
    pub interface: String,
    pub address: IfaceAddr,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

fn default_mtu() -> u16 {
    1500
}

/// An interface address with prefix length, e.g. `10.0.0.1/24`.
///
/// Host bits are allowed, unlike a plain network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl FromStr for IfaceAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, prefix) = s.split_once('/').ok_or("expected `a.b.c.d/prefix`")?;

        let ip = ip.parse().map_err(|_| "invalid IPv4 address")?;
        let prefix = prefix.parse().map_err(|_| "invalid prefix length")?;

        if prefix > 32 {
            return Err("prefix length must be <= 32".to_owned());
        }

        Ok(Self { ip, prefix })
    }
}

impl fmt::Display for IfaceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

impl Serialize for IfaceAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IfaceAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;

        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tunnel {
    /// Server only.
    #[serde(default)]
    pub listen_address: Option<SocketAddr>,
    /// Client only; `host:port`.
    #[serde(default)]
    pub server: Option<String>,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    #[serde(with = "humantime_serde", default = "default_keepalive")]
    pub keepalive: Duration,
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
}

fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Security {
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tls {
    #[serde(default)]
    pub min_version: TlsVersion,
    #[serde(default = "default_true")]
    pub mutual_auth: bool,
    #[serde(default = "default_true")]
    pub verify_cert: bool,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::default(),
            mutual_auth: true,
            verify_cert: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Throttle {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 0 = unlimited.
    #[serde(default)]
    pub upload_kbps: u64,
    /// 0 = unlimited.
    #[serde(default)]
    pub download_kbps: u64,
    #[serde(default)]
    pub dynamic: Dynamic,
}

impl Default for Throttle {
    fn default() -> Self {
        Self {
            enabled: true,
            upload_kbps: 0,
            download_kbps: 0,
            dynamic: Dynamic::default(),
        }
    }
}

impl Throttle {
    fn validate(&self) -> Result<(), Error> {
        if !self.dynamic.enabled {
            return Ok(());
        }

        if self.dynamic.min_kbps > self.dynamic.max_kbps {
            return Err(Error::invalid(
                "throttle.dynamic",
                "min_kbps must not exceed max_kbps",
            ));
        }

        for (field, rate) in [
            ("throttle.upload_kbps", self.upload_kbps),
            ("throttle.download_kbps", self.download_kbps),
        ] {
            if rate != 0 && !(self.dynamic.min_kbps..=self.dynamic.max_kbps).contains(&rate) {
                return Err(Error::invalid(
                    field,
                    "must lie within [dynamic.min_kbps, dynamic.max_kbps]",
                ));
            }
        }

        let Dynamic {
            increase_threshold: inc,
            decrease_threshold: dec,
            ..
        } = self.dynamic;

        if !(0.0..=1.0).contains(&inc) || !(0.0..=1.0).contains(&dec) || dec >= inc {
            return Err(Error::invalid(
                "throttle.dynamic",
                "thresholds must satisfy 0 <= decrease < increase <= 1",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dynamic {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_kbps: u64,
    #[serde(default)]
    pub max_kbps: u64,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    #[serde(default = "default_increase_threshold")]
    pub increase_threshold: f64,
    #[serde(default = "default_decrease_threshold")]
    pub decrease_threshold: f64,
}

impl Default for Dynamic {
    fn default() -> Self {
        Self {
            enabled: false,
            min_kbps: 0,
            max_kbps: 0,
            cooldown: default_cooldown(),
            increase_threshold: default_increase_threshold(),
            decrease_threshold: default_decrease_threshold(),
        }
    }
}

fn default_cooldown() -> Duration {
    Duration::from_secs(1)
}

fn default_increase_threshold() -> f64 {
    0.8
}

fn default_decrease_threshold() -> f64 {
    0.2
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    #[serde(default)]
    pub retry: Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    #[serde(default)]
    pub immediate: ImmediateRetry,
    #[serde(default)]
    pub gradual: GradualRetry,
    #[serde(default)]
    pub persistent: PersistentRetry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImmediateRetry {
    #[serde(default = "default_immediate_attempts")]
    pub attempts: u32,
    #[serde(with = "humantime_serde", default = "default_immediate_interval")]
    pub interval: Duration,
}

impl Default for ImmediateRetry {
    fn default() -> Self {
        Self {
            attempts: default_immediate_attempts(),
            interval: default_immediate_interval(),
        }
    }
}

fn default_immediate_attempts() -> u32 {
    3
}

fn default_immediate_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GradualRetry {
    #[serde(default = "default_gradual_attempts")]
    pub attempts: u32,
    #[serde(with = "humantime_serde", default = "default_gradual_base")]
    pub base_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_gradual_max")]
    pub max_interval: Duration,
}

impl Default for GradualRetry {
    fn default() -> Self {
        Self {
            attempts: default_gradual_attempts(),
            base_interval: default_gradual_base(),
            max_interval: default_gradual_max(),
        }
    }
}

fn default_gradual_attempts() -> u32 {
    5
}

fn default_gradual_base() -> Duration {
    Duration::from_secs(5)
}

fn default_gradual_max() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistentRetry {
    #[serde(default)]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_persistent_interval")]
    pub interval: Duration,
}

impl Default for PersistentRetry {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_persistent_interval(),
        }
    }
}

fn default_persistent_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Logging {
    #[serde(default)]
    pub level: Level,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
    /// Targets to force up to `debug`, regardless of `level`.
    #[serde(default)]
    pub debug_categories: Vec<String>,
}

impl Logging {
    /// Renders the section as an `EnvFilter` directive string.
    pub fn directives(&self) -> String {
        let mut directives = self.level.as_str().to_owned();

        for category in &self.debug_categories {
            directives.push(',');
            directives.push_str(category);
            directives.push_str("=debug");
        }

        directives
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Monitoring {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bind_endpoint: Option<SocketAddr>,
    #[serde(with = "humantime_serde", default = "default_monitoring_interval")]
    pub interval: Duration,
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_endpoint: None,
            interval: default_monitoring_interval(),
        }
    }
}

fn default_monitoring_interval() -> Duration {
    Duration::from_secs(60)
}
