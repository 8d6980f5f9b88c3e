use std::borrow::Cow;
use std::ffi::CStr;
use std::io;
use std::os::fd::RawFd;

pub(crate) const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// An `ifreq` for `TUNSETIFF`.
///
/// The kernel writes the assigned interface name back into `name`, which is
/// how an empty requested name resolves to the next free `tunN`.
#[repr(C)]
pub(crate) struct IfReq {
    name: [libc::c_uchar; libc::IF_NAMESIZE],
    flags: libc::c_short,
}

impl IfReq {
    pub(crate) fn tun(requested_name: &str) -> io::Result<Self> {
        let bytes = requested_name.as_bytes();

        if bytes.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name `{requested_name}` is too long"),
            ));
        }

        let mut name = [0u8; libc::IF_NAMESIZE];
        name[..bytes.len()].copy_from_slice(bytes);

        Ok(Self {
            name,
            flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
        })
    }

    pub(crate) fn name(&self) -> Cow<'_, str> {
        // Safety: The kernel NUL-terminates `name` within `IF_NAMESIZE`.
        let cstr = unsafe { CStr::from_ptr(self.name.as_ptr() as _) };

        cstr.to_string_lossy()
    }
}

/// Executes the `ioctl` syscall on the given file descriptor.
///
/// # Safety
///
/// The file descriptor must be open and `code` must match the request layout.
pub(crate) unsafe fn exec(fd: RawFd, code: libc::c_ulong, req: &mut IfReq) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_over_long_names() {
        assert!(IfReq::tun("a-name-that-is-way-too-long").is_err());
    }

    #[test]
    fn empty_name_is_allowed() {
        let req = IfReq::tun("").unwrap();

        assert_eq!(req.name(), "");
    }

    #[test]
    fn name_round_trips() {
        let req = IfReq::tun("tun-sss0").unwrap();

        assert_eq!(req.name(), "tun-sss0");
    }
}
