//! Network Module
//!
//! TCP (optionally TLS) transport shared by the dump service and the I/O
//! worker. Both sides work with a boxed duplex stream so the protocol code
//! does not care whether TLS is in use.

pub mod tls;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Duplex byte stream
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// Connect to `host:port`, upgrading to TLS when a connector is given
pub async fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    tls: Option<&TlsConnector>,
) -> Result<BoxStream> {
    let address = format!("{}:{}", host, port);
    let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::ConnectionFailed {
                address,
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(Error::ConnectionTimeout(address)),
    };
    stream.set_nodelay(true)?;

    match tls {
        None => Ok(Box::new(stream)),
        Some(connector) => {
            let name = tls::server_name(host)?;
            let handshake = connector.connect(name, stream);
            match timeout(connect_timeout, handshake).await {
                Ok(Ok(tls_stream)) => Ok(Box::new(tls_stream)),
                Ok(Err(e)) => Err(Error::Tls(format!("handshake with {} failed: {}", address, e))),
                Err(_) => Err(Error::ConnectionTimeout(address)),
            }
        }
    }
}

/// Wrap an accepted socket, performing the TLS handshake when configured
pub async fn accept(socket: TcpStream, tls: Option<&TlsAcceptor>) -> Result<BoxStream> {
    socket.set_nodelay(true)?;
    match tls {
        None => Ok(Box::new(socket)),
        Some(acceptor) => {
            let stream = acceptor
                .accept(socket)
                .await
                .map_err(|e| Error::Tls(format!("handshake failed: {}", e)))?;
            Ok(Box::new(stream))
        }
    }
}
