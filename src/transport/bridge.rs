//! The bridge: bidirectional byte piping between one authenticated remote
//! connection and its paired local connection.

use {
    std::io,
    tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
        sync::oneshot,
    },
};

use super::rewrite::HostHeaderRewriter;
use crate::config::ByteTransform;

const CHUNK_SIZE: usize = 16 * 1024;

/// Why a bridge stopped piping.
pub(crate) enum BridgeEnd {
    /// The remote closed or failed; the local side has been shut down.
    Remote(Option<io::Error>),
    /// The local side closed or failed; the remote has been shut down.
    Local(Option<io::Error>),
    /// The supervisor asked the bridge to stop.
    Shutdown,
}

/// One paired (remote, local) connection duo.
///
/// Bytes from the remote pass through the Host-header rewriter (when present)
/// and then the user transform before reaching the local service; bytes from
/// the local service go back untouched.
pub(crate) struct Bridge<Remote, Local> {
    remote: Remote,
    local: Local,
    rewriter: Option<HostHeaderRewriter>,
    transform: Option<ByteTransform>,
}

impl<Remote, Local> Bridge<Remote, Local>
where
    Remote: AsyncRead + AsyncWrite + Send,
    Local: AsyncRead + AsyncWrite + Send,
{
    pub fn new(
        remote: Remote,
        local: Local,
        rewriter: Option<HostHeaderRewriter>,
        transform: Option<ByteTransform>,
    ) -> Self {
        Bridge {
            remote,
            local,
            rewriter,
            transform,
        }
    }

    /// Pipe bytes in both directions until either side closes, either side
    /// fails, or the supervisor signals shutdown. The surviving side is always
    /// shut down before returning, so no half-open pair is left behind.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> BridgeEnd {
        let Bridge {
            remote,
            local,
            mut rewriter,
            transform,
        } = self;

        let (mut remote_rx, mut remote_tx) = tokio::io::split(remote);
        let (mut local_rx, mut local_tx) = tokio::io::split(local);
        let mut remote_buffer = vec![0; CHUNK_SIZE];
        let mut local_buffer = vec![0; CHUNK_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    let _ = remote_tx.shutdown().await;
                    let _ = local_tx.shutdown().await;
                    return BridgeEnd::Shutdown;
                }
                read = remote_rx.read(&mut remote_buffer) => match read {
                    Ok(0) => {
                        let _ = local_tx.shutdown().await;
                        return BridgeEnd::Remote(None);
                    }
                    Ok(count) => {
                        let mut chunk = remote_buffer[..count].to_vec();
                        if let Some(rewriter) = rewriter.as_mut() {
                            chunk = rewriter.apply(chunk);
                        }
                        if let Some(transform) = transform.as_ref() {
                            chunk = transform(chunk);
                        }
                        if let Err(error) = local_tx.write_all(&chunk).await {
                            let _ = remote_tx.shutdown().await;
                            return BridgeEnd::Local(Some(error));
                        }
                    }
                    Err(error) => {
                        let _ = local_tx.shutdown().await;
                        return BridgeEnd::Remote(Some(error));
                    }
                },
                read = local_rx.read(&mut local_buffer) => match read {
                    Ok(0) => {
                        let _ = remote_tx.shutdown().await;
                        return BridgeEnd::Local(None);
                    }
                    Ok(count) => {
                        if let Err(error) = remote_tx.write_all(&local_buffer[..count]).await {
                            let _ = local_tx.shutdown().await;
                            return BridgeEnd::Remote(Some(error));
                        }
                    }
                    Err(error) => {
                        let _ = remote_tx.shutdown().await;
                        return BridgeEnd::Local(Some(error));
                    }
                },
            }
        }
    }
}
