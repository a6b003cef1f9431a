//! A `NETLINK_NETFILTER` datagram socket wrapped for async reads, in the
//! same `AsyncFd`-driven reader-loop shape used elsewhere in this crate
//! for raw kernel sockets.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

const NETLINK_NETFILTER: i32 = 12;

pub struct NetlinkSocket {
    inner: AsyncFd<Socket>,
}

impl NetlinkSocket {
    /// Opens a netlink socket bound to the given multicast group mask
    /// (`NFNLGRP_*` bits OR'd together).
    pub fn open(groups: u32) -> io::Result<Self> {
        let socket = Socket::new(Domain::from(libc::AF_NETLINK), Type::RAW, Some(Protocol::from(NETLINK_NETFILTER)))?;
        socket.set_nonblocking(true)?;
        bind_netlink(socket.as_raw_fd(), groups)?;
        Ok(Self { inner: AsyncFd::new(socket)? })
    }

    pub async fn recv(&self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.inner.readable().await?;
            let mut buf = vec![0u8; 64 * 1024];
            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

fn bind_netlink(fd: RawFd, groups: u32) -> io::Result<()> {
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr.nl_groups = groups;
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
