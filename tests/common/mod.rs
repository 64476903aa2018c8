//! In-process fakes standing in for the remote tunnel server and the local
//! service, plus configuration helpers shared by the integration tests.

#![allow(dead_code)]

use {
    k256::ecdsa::{signature::Verifier, Signature, VerifyingKey},
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
        time::Duration,
    },
    tokio_rustls::{rustls, TlsAcceptor},
};

use burrow::TunnelConfig;

/// Length of the challenge nonce the fake remote issues.
pub const NONCE_LENGTH: usize = 32;

/// Length of the response frame the agent must send back.
pub const RESPONSE_LENGTH: usize = 33 + 64;

/// A TLS acceptor using a fresh self-signed certificate, the same trust model
/// the real remote uses.
pub fn tls_acceptor() -> TlsAcceptor {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("self-signed certificate generates");
    let certificates = vec![rustls::Certificate(certified.cert.der().to_vec())];
    let private_key = rustls::PrivateKey(certified.key_pair.serialize_der());

    let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
    config
        .set_single_cert(certificates, private_key)
        .expect("test certificate is valid");
    TlsAcceptor::from(Arc::new(config))
}

/// Behavior knobs for [`spawn_remote`].
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    /// Bytes pushed down the tunnel right after a successful handshake, as a
    /// user request forwarded by the proxy would be.
    pub payload: Option<Vec<u8>>,
    /// Serve only this many connections; anything accepted past the limit is
    /// dropped before the TLS handshake, so those dials fail.
    pub accept_limit: Option<usize>,
}

/// A fake rendezvous server: accepts TLS connections, issues a challenge,
/// verifies the signed response, then optionally plays a payload and records
/// whatever flows back.
pub struct FakeRemote {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u8>>>,
    connections: Arc<Mutex<Vec<oneshot::Sender<()>>>>,
}

impl FakeRemote {
    /// How many TCP connections have been accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// How many authenticated connections are currently held open.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock").len()
    }

    /// Everything the agent has sent back after authentication.
    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.lock().expect("received lock").clone()
    }

    /// Close one held connection from the remote side.
    pub fn kick_one(&self) {
        if let Some(kick) = self.connections.lock().expect("connections lock").pop() {
            let _ = kick.send(());
        }
    }
}

pub async fn spawn_remote(options: RemoteOptions) -> FakeRemote {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("fake remote binds");
    spawn_remote_listener(listener, options)
}

/// Bind the fake remote on a specific port, e.g. one the agent is already
/// trying to reconnect to.
pub async fn spawn_remote_on_port(port: u16, options: RemoteOptions) -> FakeRemote {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("fake remote binds requested port");
    spawn_remote_listener(listener, options)
}

fn spawn_remote_listener(listener: TcpListener, options: RemoteOptions) -> FakeRemote {
    let port = listener.local_addr().expect("listener address").port();
    let acceptor = tls_acceptor();
    let accepted = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(Mutex::new(Vec::new()));

    let remote = FakeRemote {
        port,
        accepted: accepted.clone(),
        received: received.clone(),
        connections: connections.clone(),
    };

    tokio::spawn(async move {
        loop {
            let (tcp_stream, _) = match listener.accept().await {
                Ok(connection) => connection,
                Err(_) => break,
            };
            let arrival = accepted.fetch_add(1, Ordering::SeqCst) + 1;

            let acceptor = acceptor.clone();
            let options = options.clone();
            let received = received.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                if let Some(limit) = options.accept_limit {
                    if arrival > limit {
                        // Dropping the TCP stream here fails the dial on the
                        // agent's side mid-handshake.
                        return;
                    }
                }

                let mut stream = match acceptor.accept(tcp_stream).await {
                    Ok(stream) => stream,
                    Err(_) => return,
                };

                // Challenge, then the signed response frame.
                let nonce: [u8; NONCE_LENGTH] = rand::random();
                if stream.write_all(&nonce).await.is_err() {
                    return;
                }
                let mut response = [0; RESPONSE_LENGTH];
                if stream.read_exact(&mut response).await.is_err() {
                    return;
                }
                let public_key = VerifyingKey::from_sec1_bytes(&response[..33])
                    .expect("response starts with a public key");
                let signature = Signature::from_slice(&response[33..])
                    .expect("response ends with a signature");
                public_key
                    .verify(&nonce, &signature)
                    .expect("challenge signature verifies");

                if let Some(payload) = &options.payload {
                    if stream.write_all(payload).await.is_err() {
                        return;
                    }
                }

                let (kick, mut kicked) = oneshot::channel();
                connections.lock().expect("connections lock").push(kick);

                let mut buffer = [0; 4096];
                loop {
                    tokio::select! {
                        _ = &mut kicked => return,
                        read = stream.read(&mut buffer) => match read {
                            Ok(0) | Err(_) => return,
                            Ok(count) => received
                                .lock()
                                .expect("received lock")
                                .extend_from_slice(&buffer[..count]),
                        },
                    }
                }
            });
        }
    });

    remote
}

/// A fake local service: records everything it receives and optionally writes
/// a canned reply after the first read.
pub struct FakeLocal {
    pub port: u16,
    received: Arc<Mutex<Vec<u8>>>,
}

impl FakeLocal {
    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.lock().expect("received lock").clone()
    }
}

pub async fn spawn_local(reply: Option<Vec<u8>>) -> FakeLocal {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("fake local service binds");
    let port = listener.local_addr().expect("listener address").port();
    let received = Arc::new(Mutex::new(Vec::new()));

    let recorder = received.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(connection) => connection,
                Err(_) => break,
            };
            let received = recorder.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                let mut buffer = [0; 4096];
                let mut replied = false;
                loop {
                    match stream.read(&mut buffer).await {
                        Ok(0) | Err(_) => return,
                        Ok(count) => {
                            received
                                .lock()
                                .expect("received lock")
                                .extend_from_slice(&buffer[..count]);
                            if !replied {
                                if let Some(reply) = &reply {
                                    if stream.write_all(reply).await.is_err() {
                                        return;
                                    }
                                }
                                replied = true;
                            }
                        }
                    }
                }
            });
        }
    });

    FakeLocal { port, received }
}

/// A valid test private key: 0x01 repeated.
pub fn test_key_hex() -> String {
    "01".repeat(32)
}

/// A configuration pointing at the fakes, with a heartbeat long enough not to
/// interfere with short tests.
pub fn test_config(remote_port: u16, local_port: u16, max_connections: usize) -> TunnelConfig {
    test_config_with_interval(remote_port, local_port, max_connections, "5s")
}

pub fn test_config_with_interval(
    remote_port: u16,
    local_port: u16,
    max_connections: usize,
    interval: &str,
) -> TunnelConfig {
    let contents = format!(
        "local_address = \"localhost\"\n\
         local_port = {}\n\
         remote_address = \"127.0.0.1\"\n\
         remote_port = {}\n\
         max_connections = {}\n\
         private_key = \"{}\"\n\
         auto_reconnect_interval = \"{}\"\n",
        local_port,
        remote_port,
        max_connections,
        test_key_hex(),
        interval,
    );
    toml::from_str(&contents).expect("test config parses")
}

/// Poll until `condition` holds, or panic after a few seconds.
pub async fn eventually(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", description);
}
