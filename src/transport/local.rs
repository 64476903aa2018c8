//! Dialing the local service a tunnel exposes.

use {
    std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, ReadBuf},
        net::TcpStream,
    },
    tokio_rustls::client::TlsStream,
    tracing::debug,
};

use super::{connect_tcp, server_name, tls_connector};

/// A connection to the local service, over plain TCP or TLS.
pub enum LocalStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Dials the local service, by TCP or (certificate-blind) TLS.
pub(crate) struct LocalDialer {
    pub local_address: String,
    pub local_port: u16,
    pub secure: bool,
}

impl LocalDialer {
    pub async fn dial(&self) -> Result<LocalStream, io::Error> {
        let tcp_stream = connect_tcp(&self.local_address, self.local_port).await?;
        debug!(address = %self.local_address, port = self.local_port, "connected to local service");

        if !self.secure {
            return Ok(LocalStream::Tcp(tcp_stream));
        }

        let domain = server_name(&self.local_address);
        let tls_stream = tls_connector()
            .connect(domain.as_ref(), tcp_stream)
            .await?;
        Ok(LocalStream::Tls(Box::new(tls_stream)))
    }
}

// Both transports poll identically; the enum exists only to erase the choice,
// so every poll method is the same one-line dispatch.
macro_rules! delegate_to_stream {
    ($self:expr, $stream:ident => $poll:expr) => {
        match $self.get_mut() {
            LocalStream::Tcp($stream) => $poll,
            LocalStream::Tls($stream) => $poll,
        }
    };
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate_to_stream!(self, stream => Pin::new(stream).poll_read(cx, buf))
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate_to_stream!(self, stream => Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_to_stream!(self, stream => Pin::new(stream).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_to_stream!(self, stream => Pin::new(stream).poll_shutdown(cx))
    }
}
