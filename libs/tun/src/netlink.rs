//! Interface configuration over rtnetlink.

use std::net::Ipv4Addr;

use futures::TryStreamExt as _;
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec};

use crate::Error;

/// A netlink socket plus the task driving it.
pub(crate) struct Connection {
    handle: Handle,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Connection {
    /// Opens a netlink socket.
    ///
    /// Panics if called without a Tokio runtime.
    pub(crate) fn connect() -> Result<Self, Error> {
        let (cxn, handle, _) = rtnetlink::new_connection()?;
        let task = tokio::spawn(cxn);

        Ok(Self { handle, task })
    }

    /// Assigns the address, sets the MTU and brings the interface up.
    ///
    /// Any addresses a previous process left on the interface are removed
    /// first so the device always carries exactly the configured one.
    pub(crate) async fn configure(
        &self,
        interface: &str,
        ip: Ipv4Addr,
        prefix: u8,
        mtu: u16,
    ) -> Result<(), Error> {
        let handle = &self.handle;
        let index = self.device_index(interface).await?;

        let existing = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        existing
            .try_for_each(|addr| handle.address().del(addr).execute())
            .await
            .map_err(|e| netlink_error(e, interface))?;

        handle
            .address()
            .add(index, ip.into(), prefix)
            .execute()
            .await
            .map_err(|e| match e {
                NetlinkError(ref inner) if inner.raw_code() == -libc::EINVAL => {
                    Error::InvalidAddress(format!("{ip}/{prefix}"))
                }
                _ => netlink_error(e, interface),
            })?;

        handle
            .link()
            .set(LinkUnspec::new_with_index(index).mtu(u32::from(mtu)).build())
            .execute()
            .await
            .map_err(|e| netlink_error(e, interface))?;

        handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(|e| netlink_error(e, interface))?;

        Ok(())
    }

    /// Brings the interface down again.
    ///
    /// Best-effort: the kernel deletes the device once the TUN fd closes, but
    /// downing it first makes the name immediately reusable even where
    /// deletion needs more privilege than we still have.
    pub(crate) async fn deconfigure(&self, interface: &str) -> Result<(), Error> {
        let index = self.device_index(interface).await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).down().build())
            .execute()
            .await
            .map_err(|e| netlink_error(e, interface))?;

        Ok(())
    }

    async fn device_index(&self, interface: &str) -> Result<u32, Error> {
        let link = self
            .handle
            .link()
            .get()
            .match_name(interface.to_owned())
            .execute()
            .try_next()
            .await
            .map_err(|e| netlink_error(e, interface))?
            .ok_or(Error::Closed)?;

        Ok(link.header.index)
    }
}

fn netlink_error(err: rtnetlink::Error, interface: &str) -> Error {
    if let NetlinkError(ref inner) = err {
        let io = std::io::Error::from_raw_os_error(-inner.raw_code());

        return Error::from_os(io, interface);
    }

    Error::Io(std::io::Error::other(err))
}
