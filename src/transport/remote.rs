//! Dialing and authenticating pool connections to the remote tunnel server.

use {
    k256::ecdsa::SigningKey,
    std::io,
    thiserror::Error,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
    tokio_rustls::client::TlsStream,
    tracing::debug,
};

use super::{connect_tcp, server_name, tls_connector};
use crate::handshake::{Handshake, HandshakeError};

/// An established TLS session to the remote tunnel endpoint.
pub(crate) type RemoteStream = TlsStream<TcpStream>;

/// Upper bound on the challenge blob; the remote sends it as a single write.
const CHALLENGE_BUFFER_SIZE: usize = 1024;

/// The error returned when a pool connection cannot be established or
/// authenticated.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteDialError {
    #[error("tunnel connection failed: {0}")]
    Io(#[from] io::Error),
    #[error("tunnel server closed the connection before sending a challenge")]
    MissingChallenge,
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl RemoteDialError {
    /// Whether the remote actively refused the connection.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, RemoteDialError::Io(error) if error.kind() == io::ErrorKind::ConnectionRefused)
    }
}

/// Dials the remote tunnel endpoint over TLS.
pub(crate) struct RemoteDialer {
    pub remote_address: String,
    pub remote_port: u16,
}

impl RemoteDialer {
    /// Open a TLS session to the remote tunnel endpoint.
    pub async fn connect(&self) -> Result<RemoteStream, RemoteDialError> {
        let tcp_stream = connect_tcp(&self.remote_address, self.remote_port).await?;
        let domain = server_name(&self.remote_address);
        let tls_stream = tls_connector()
            .connect(domain.as_ref(), tcp_stream)
            .await?;
        debug!(address = %self.remote_address, port = self.remote_port, "connected to tunnel server");
        Ok(tls_stream)
    }

    /// Run the challenge/response exchange on a freshly opened connection.
    ///
    /// The remote sends the challenge as its first write; the signed response
    /// goes back as one write, and the connection counts as authenticated
    /// without waiting for a server acknowledgement.
    pub async fn authenticate(
        &self,
        stream: &mut RemoteStream,
        signing_key: &SigningKey,
    ) -> Result<(), RemoteDialError> {
        let mut challenge = [0; CHALLENGE_BUFFER_SIZE];
        let read = stream.read(&mut challenge).await?;
        if read == 0 {
            return Err(RemoteDialError::MissingChallenge);
        }

        let response = Handshake::from_bytes(&challenge[..read])?.sign(signing_key);
        stream.write_all(&response.to_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}
