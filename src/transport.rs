//! The duplex transport seam between the exchange engine and the
//! network: plain UDP here, DTLS in the `dtls` module.

use std::io::{Error, ErrorKind, Result as IoResult};
use std::net::SocketAddr;

use async_trait::async_trait;
use log::debug;
use tokio::net::{lookup_host, UdpSocket};

/// Largest datagram the client will receive.
pub const COAP_MTU: usize = 1600;

/// An established duplex channel to one remote endpoint.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn send(&self, buf: &[u8]) -> IoResult<usize>;
    async fn recv(&self, buf: &mut [u8]) -> IoResult<usize>;
    async fn close(&self) -> IoResult<()>;
}

/// Resolve a host/port pair to the first usable socket address.
pub(crate) async fn resolve(host: &str, port: u16) -> IoResult<SocketAddr> {
    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::NotFound, "no peer address found"))
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an unspecified local socket of the peer's address family and
    /// connect it to the peer.
    pub async fn connect(host: &str, port: u16) -> IoResult<UdpTransport> {
        let peer_addr = resolve(host, port).await?;

        let bind_addr = match peer_addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer_addr).await?;
        debug!(
            "bound {} for peer {}",
            socket.local_addr()?,
            peer_addr
        );

        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    async fn send(&self, buf: &[u8]) -> IoResult<usize> {
        self.socket.send(buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> IoResult<usize> {
        self.socket.recv(buf).await
    }

    async fn close(&self) -> IoResult<()> {
        // dropping the socket releases it
        Ok(())
    }
}
