//! Connector behind a route's pooled HTTP/1.1 client

use crate::forwarder::ForwarderConfig;
use aggregator_core::Destination;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials a single destination and completes the TLS handshake under the
/// route's trust policy. The URI handed over by the pool is not consulted.
#[derive(Clone)]
pub struct BackendConnector {
    destination: Destination,
    server_name: ServerName<'static>,
    tls: TlsConnector,
    connect_timeout: Duration,
    tls_handshake_timeout: Duration,
}

impl BackendConnector {
    pub(crate) fn new(
        destination: Destination,
        server_name: ServerName<'static>,
        tls: TlsConnector,
        config: &ForwarderConfig,
    ) -> Self {
        Self {
            destination,
            server_name,
            tls,
            connect_timeout: config.connect_timeout,
            tls_handshake_timeout: config.tls_handshake_timeout,
        }
    }

    async fn connect(self) -> io::Result<BackendStream> {
        let address = (self.destination.host(), self.destination.port());
        let tcp = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        tcp.set_nodelay(true)?;

        // Certificate rejections surface here as io::Error wrapping rustls::Error
        let tls = timeout(self.tls_handshake_timeout, self.tls.connect(self.server_name, tcp))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;

        debug!(destination = %self.destination, "Opened backend connection");
        Ok(BackendStream {
            inner: TokioIo::new(tls),
        })
    }
}

impl tower::Service<Uri> for BackendConnector {
    type Response = BackendStream;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = io::Result<BackendStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        Box::pin(self.clone().connect())
    }
}

/// Established TLS connection to a backend
pub struct BackendStream {
    inner: TokioIo<TlsStream<TcpStream>>,
}

impl Connection for BackendStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Write for BackendStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }
}
