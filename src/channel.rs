//! The UDP endpoint a multiplexer owns. Abstracted behind a trait so queue
//!  and dispatch tests can run against a mock instead of real sockets.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::engine::BindParams;

/// Address family of a channel, used for multiplexer matching.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn of(addr: &SocketAddr) -> AddrFamily {
        if addr.is_ipv4() {
            AddrFamily::V4
        }
        else {
            AddrFamily::V6
        }
    }

    /// The wildcard address of this family with an autoselected port.
    pub fn any_addr(&self) -> SocketAddr {
        match self {
            AddrFamily::V4 => (Ipv4Addr::UNSPECIFIED, 0).into(),
            AddrFamily::V6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait UdpChannel: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Mark the channel closed. I/O after this returns an error; the OS socket
    ///  itself is released when the channel is dropped.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// The production channel: a non-blocking UDP socket with the IP options from
///  [`BindParams`] applied at creation time.
pub struct TokioUdpChannel {
    socket: tokio::net::UdpSocket,
    closed: AtomicBool,
}

impl TokioUdpChannel {
    /// Bind to the wildcard address of `family`, autoselecting the port.
    pub fn open(
        family: AddrFamily,
        params: &BindParams,
        udp_bufs: (usize, usize),
    ) -> io::Result<TokioUdpChannel> {
        Self::open_at(family.any_addr(), params, udp_bufs)
    }

    /// Bind to a concrete address (the port may still be 0 for autoselection).
    pub fn open_at(
        addr: SocketAddr,
        params: &BindParams,
        udp_bufs: (usize, usize),
    ) -> io::Result<TokioUdpChannel> {
        let domain = match AddrFamily::of(&addr) {
            AddrFamily::V4 => Domain::IPV4,
            AddrFamily::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if params.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        if let Some(v6only) = params.v6only {
            if domain == Domain::IPV6 {
                socket.set_only_v6(v6only)?;
            }
        }
        socket.set_ttl(params.ttl)?;
        if params.tos != 0 {
            socket.set_tos(params.tos)?;
        }
        socket.set_send_buffer_size(udp_bufs.0)?;
        socket.set_recv_buffer_size(udp_bufs.1)?;

        socket.bind(&addr.into())?;
        Self::from_socket2(socket)
    }

    /// Wrap an already bound OS socket supplied by the application.
    pub fn attach(socket: std::net::UdpSocket) -> io::Result<TokioUdpChannel> {
        Self::from_socket2(socket.into())
    }

    fn from_socket2(socket: Socket) -> io::Result<TokioUdpChannel> {
        socket.set_nonblocking(true)?;
        let socket = tokio::net::UdpSocket::from_std(socket.into())?;
        debug!("channel bound to {:?}", socket.local_addr()?);
        Ok(TokioUdpChannel {
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl UdpChannel for TokioUdpChannel {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.send_to(buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.is_closed() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.socket.recv_from(buf).await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
