use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use crate::ioctl;
use crate::netlink;
use crate::Error;

const TUN_FILE: &CStr = c"/dev/net/tun";

/// An open, configured TUN device.
///
/// Reads and writes are datagram-granular; the kernel never hands out or
/// accepts a partial IP packet on a TUN fd.
pub struct TunDevice {
    fd: Mutex<Option<Arc<AsyncFd<OwnedFd>>>>,
    name: String,
    mtu: u16,
    netlink: netlink::Connection,
}

impl TunDevice {
    /// Creates the interface, assigns `ip/prefix` and brings it up.
    ///
    /// With an empty `name` the OS picks the next free `tunN`.
    pub async fn open(name: &str, ip: Ipv4Addr, prefix: u8, mtu: u16) -> Result<Self, Error> {
        let (fd, name) = open_tun(name)?;

        let netlink = netlink::Connection::connect()?;
        netlink.configure(&name, ip, prefix, mtu).await?;

        tracing::info!(%name, %ip, %prefix, %mtu, "Created TUN device");

        Ok(Self {
            fd: Mutex::new(Some(Arc::new(fd))),
            name,
            mtu,
            netlink,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Reads exactly one IP datagram into `buf`.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let fd = self.shared_fd()?;

        let n = fd
            .async_io(Interest::READABLE, |fd| read(fd.as_raw_fd(), buf))
            .await?;

        if n == 0 {
            return Err(Error::Closed);
        }

        Ok(n)
    }

    /// Writes one IP datagram atomically.
    pub async fn write(&self, datagram: &[u8]) -> Result<(), Error> {
        if datagram.len() > usize::from(self.mtu) {
            return Err(Error::TooLarge {
                len: datagram.len(),
                mtu: self.mtu,
            });
        }

        let fd = self.shared_fd()?;

        fd.async_io(Interest::WRITABLE, |fd| write(fd.as_raw_fd(), datagram))
            .await?;

        Ok(())
    }

    /// Releases the interface.
    ///
    /// Idempotent. Subsequent (and in-flight, once they resume) reads and
    /// writes fail with [`Error::Closed`]. The kernel deletes the
    /// non-persistent device when the last fd reference drops; we down the
    /// link first so the name frees up even if a pump still holds one.
    pub async fn close(&self) {
        let fd = self.fd.lock().unwrap_or_else(|e| e.into_inner()).take();

        if fd.is_none() {
            return;
        }

        if let Err(e) = self.netlink.deconfigure(&self.name).await {
            tracing::debug!(name = %self.name, "Failed to bring TUN device down: {e}");
        }

        tracing::info!(name = %self.name, "Closed TUN device");
    }

    fn shared_fd(&self) -> Result<Arc<AsyncFd<OwnedFd>>, Error> {
        self.fd
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .cloned()
            .ok_or(Error::Closed)
    }
}

fn open_tun(requested_name: &str) -> Result<(AsyncFd<OwnedFd>, String), Error> {
    let fd = match unsafe { libc::open(TUN_FILE.as_ptr() as _, libc::O_RDWR | libc::O_CLOEXEC) } {
        -1 => {
            return Err(Error::from_os(io::Error::last_os_error(), requested_name));
        }
        fd => fd,
    };

    // Safety: We just opened this fd and nothing else owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut req = ioctl::IfReq::tun(requested_name)?;

    // Safety: The fd is open and `IfReq` matches the TUNSETIFF layout.
    unsafe {
        ioctl::exec(fd.as_raw_fd(), ioctl::TUNSETIFF, &mut req)
            .map_err(|e| Error::from_os(e, requested_name))?;
    }

    let name = req.name().into_owned();

    set_non_blocking(fd.as_raw_fd())?;

    let fd = AsyncFd::new(fd)?;

    Ok((fd, name))
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { libc::fcntl(fd, libc::F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}

/// Read from the given file descriptor into the buffer.
fn read(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    // Safety: Within this module, the file descriptor is always valid.
    match unsafe { libc::read(fd, dst.as_mut_ptr() as _, dst.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Write the datagram to the given file descriptor.
fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // Safety: Within this module, the file descriptor is always valid.
    match unsafe { libc::write(fd, buf.as_ptr() as _, buf.len() as _) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
