//! this file is included by enabling the "dtls" feature. It provides a
//! pre-shared-key DTLS transport using webrtc-rs's dtls implementation.

use std::io::{Error, ErrorKind, Result as IoResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use webrtc_dtls::cipher_suite::CipherSuiteId;
use webrtc_dtls::config::Config;
use webrtc_dtls::conn::DTLSConn;

use crate::client::SecurityParameters;
use crate::transport::ClientTransport;

/// Handshake configuration for a pre-shared-key session with `host`.
/// The key callback answers the server's identity hint from the
/// registered key material.
pub(crate) fn psk_config(host: &str, params: &SecurityParameters) -> Config {
    let keys = params.clone();
    Config {
        psk: Some(Arc::new(move |hint: &[u8]| {
            Ok(keys.key_for(hint).unwrap_or_default())
        })),
        psk_identity_hint: params.identity().map(|id| id.to_vec()),
        cipher_suites: vec![CipherSuiteId::Tls_Psk_With_Aes_128_Ccm_8],
        server_name: host.to_string(),
        ..Default::default()
    }
}

pub struct DtlsConnection {
    conn: Arc<DTLSConn>,
}

impl DtlsConnection {
    /// Bind a fresh local socket of the peer's address family, connect
    /// it and run the DTLS handshake.
    ///
    /// # Errors
    ///
    /// This function will return an error if the handshake fails or if
    /// it times out.
    pub async fn connect(
        peer: SocketAddr,
        config: Config,
        handshake_timeout: Duration,
    ) -> IoResult<DtlsConnection> {
        let bind_addr = match peer {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;

        debug!("dtls handshake with {}", peer);
        let conn = timeout(
            handshake_timeout,
            DTLSConn::new(Arc::new(socket), config, true, None),
        )
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, "no response on DTLS handshake"))?
        .map_err(|e| Error::new(ErrorKind::Other, e))?;

        Ok(DtlsConnection {
            conn: Arc::new(conn),
        })
    }
}

#[async_trait]
impl ClientTransport for DtlsConnection {
    async fn send(&self, buf: &[u8]) -> IoResult<usize> {
        self.conn
            .write(buf, None)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))
    }

    async fn recv(&self, buf: &mut [u8]) -> IoResult<usize> {
        self.conn
            .read(buf, None)
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))
    }

    async fn close(&self) -> IoResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| Error::new(ErrorKind::Other, e))
    }
}
