//! The transport layer: dialers for the remote tunnel endpoint and the local
//! service, the byte bridge that joins them, and the Host-header rewrite
//! applied to proxied requests.

use {
    std::{io, sync::Arc},
    tokio::net::TcpStream,
    tokio_rustls::{
        rustls,
        webpki::{DNSName, DNSNameRef},
        TlsConnector,
    },
};

pub mod local;
pub mod remote;
pub mod rewrite;

pub(crate) mod bridge;

/// A certificate verifier that accepts whatever the peer presents.
///
/// The remote serves its tunnel endpoint with the same self-signed certificate
/// it uses for the user-facing proxy, so there is no chain to verify; the
/// connection is authenticated by the key handshake instead. Kept in one place
/// so certificate pinning can be added here later without touching the
/// dialers.
struct AcceptAnyCertificate;

impl rustls::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _roots: &rustls::RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<rustls::ServerCertVerified, rustls::TLSError> {
        Ok(rustls::ServerCertVerified::assertion())
    }
}

/// A TLS connector with server-certificate verification disabled.
pub(crate) fn tls_connector() -> TlsConnector {
    let mut tls_config = rustls::ClientConfig::new();
    tls_config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    TlsConnector::from(Arc::new(tls_config))
}

/// The name presented for SNI. IP literals are not valid DNS names; since no
/// certificate is verified against it, a fixed placeholder stands in for them.
pub(crate) fn server_name(host: &str) -> DNSName {
    DNSNameRef::try_from_ascii_str(host)
        .unwrap_or_else(|_| {
            DNSNameRef::try_from_ascii_str("tunnel.invalid")
                .expect("placeholder server name is a valid DNS name")
        })
        .to_owned()
}

/// Open a TCP connection to `host:port`, trying each resolved address in turn
/// and succeeding on the first that connects.
pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, io::Error> {
    let mut addresses = tokio::net::lookup_host((host, port)).await?;

    let mut connection_error = None;
    loop {
        if let Some(address) = addresses.next() {
            match TcpStream::connect(address).await {
                Ok(tcp_stream) => {
                    // Proxied requests may be small; send them immediately
                    tcp_stream.set_nodelay(true)?;
                    break Ok(tcp_stream);
                }
                Err(e) => connection_error = Some(e),
            }
        } else {
            break Err(connection_error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("unknown host: {}", host),
                )
            }));
        }
    }
}
