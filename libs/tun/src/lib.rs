//! Virtual network interface handling.
//!
//! A [`TunDevice`] is a point-to-point layer-3 interface: reads and writes
//! move exactly one IP datagram each, never a partial one. The kernel
//! destroys a non-persistent TUN device when its file descriptor closes, so
//! dropping the handle releases the OS resource on every exit path.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::io;

#[cfg(target_os = "linux")]
mod device;
#[cfg(target_os = "linux")]
mod ioctl;
#[cfg(target_os = "linux")]
mod netlink;

#[cfg(target_os = "linux")]
pub use device::TunDevice;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("permission denied; creating TUN devices requires CAP_NET_ADMIN")]
    Permission,
    #[error("interface `{0}` is already in use")]
    InUse(String),
    #[error("TUN devices are not supported on this system")]
    Unsupported,
    #[error("invalid interface address: {0}")]
    InvalidAddress(String),
    #[error("the TUN device is closed")]
    Closed,
    #[error("datagram of {len} bytes exceeds the interface MTU of {mtu}")]
    TooLarge { len: usize, mtu: u16 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[cfg(target_os = "linux")]
impl Error {
    pub(crate) fn from_os(err: io::Error, interface: &str) -> Self {
        match err.raw_os_error() {
            Some(libc::EPERM | libc::EACCES) => Self::Permission,
            Some(libc::EBUSY) => Self::InUse(interface.to_owned()),
            Some(libc::ENOENT | libc::ENODEV | libc::EOPNOTSUPP) => Self::Unsupported,
            Some(_) | None => Self::Io(err),
        }
    }
}
