//! The tunnel supervisor: owns the connection pool, reacts to connection loss
//! with bounded reconnection, and refreshes the pool on a heartbeat.

use {
    futures::future,
    k256::ecdsa::SigningKey,
    std::{
        io,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, MutexGuard,
        },
    },
    thiserror::Error,
    tokio::{
        sync::{broadcast, oneshot},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use crate::{
    config::{ConfigError, TunnelConfig},
    identity::TunnelIdentity,
    pool::Pool,
    status::{self, ProxyInfoOptions, StatusError},
    transport::{
        bridge::{Bridge, BridgeEnd},
        local::LocalDialer,
        remote::{RemoteDialError, RemoteDialer},
        rewrite::HostHeaderRewriter,
    },
};

/// Identifies one pool connection for the lifetime of a tunnel.
pub type ConnectionId = u64;

/// Events with no live subscriber are dropped; a lagging subscriber loses the
/// oldest events first.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Observable tunnel lifecycle events.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TunnelEvent {
    /// A pool connection reached the remote endpoint.
    Open { connection: ConnectionId },
    /// A pool connection was paired with a local connection and is bridging.
    Connected { connection: ConnectionId },
    /// The remote refused a connection attempt.
    Disconnected { message: String },
    /// The tunnel was torn down by an external close.
    Closed,
}

/// The error surfaced by [`Tunnel::open`] when a dial fails.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    #[error(transparent)]
    RemoteDial(#[from] RemoteDialError),
    #[error("failed to connect to local service: {0}")]
    LocalDial(#[source] io::Error),
}

impl TunnelError {
    fn is_connection_refused(&self) -> bool {
        matches!(self, TunnelError::RemoteDial(error) if error.is_connection_refused())
    }
}

/// A reverse-tunnel agent: one identity, one local service, one pool of
/// authenticated connections to the remote.
///
/// Cloning is cheap; clones share the same pool and supervision state.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

struct Shared {
    config: TunnelConfig,
    identity: TunnelIdentity,
    signing_key: SigningKey,
    supervision: Mutex<Supervision>,
    closing: AtomicBool,
    next_connection_id: AtomicU64,
    next_timer_token: AtomicU64,
    events: broadcast::Sender<TunnelEvent>,
}

/// Pool membership, the reconnect-timer slot, and the pool generation share
/// one lock, so the `should_reconnect` decision is always ordered after the
/// pool change that prompted it.
struct Supervision {
    pool: Pool,
    timer: Option<ReconnectTimer>,
    /// Bumped by every pool teardown. A dial carries the epoch it started
    /// under and backs out if a teardown has intervened by the time it would
    /// join the pool or schedule a retry, so no connection or timer can
    /// outlive the close that should have covered it.
    epoch: u64,
}

struct ReconnectTimer {
    token: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone, Copy)]
enum TimerAction {
    /// Error-driven: try to refill the pool.
    Reopen,
    /// Heartbeat: tear the pool down and rebuild it.
    Refresh,
}

impl Tunnel {
    /// Validate the configuration and derive the tunnel identity. No I/O
    /// happens until [`open`](Tunnel::open) is called.
    pub fn new(config: TunnelConfig) -> Result<Tunnel, ConfigError> {
        config.validate()?;
        let signing_key = config.private_key.signing_key()?;
        let identity = TunnelIdentity::new(&signing_key);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Tunnel {
            shared: Arc::new(Shared {
                config,
                identity,
                signing_key,
                supervision: Mutex::new(Supervision {
                    pool: Pool::default(),
                    timer: None,
                    epoch: 0,
                }),
                closing: AtomicBool::new(false),
                next_connection_id: AtomicU64::new(0),
                next_timer_token: AtomicU64::new(0),
                events,
            }),
        })
    }

    /// The 40-character hex tunnel id.
    pub fn id(&self) -> &str {
        self.shared.identity.id()
    }

    pub fn identity(&self) -> &TunnelIdentity {
        &self.shared.identity
    }

    /// The public URL users hit to reach this tunnel.
    pub fn url(&self) -> String {
        self.shared
            .identity
            .public_url(&self.shared.config.remote_address)
    }

    /// The URL form for a caller-supplied alias registered with the remote.
    pub fn alias_url(&self, alias: &str) -> String {
        TunnelIdentity::alias_url(alias, &self.shared.config.remote_address)
    }

    /// Subscribe to tunnel lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// The number of connections currently in the pool.
    pub fn pool_size(&self) -> usize {
        self.supervision().pool.size()
    }

    /// Open `count` pool connections concurrently, or enough to fill the pool
    /// to `max_connections` when `count` is `None`. Completes when every dial
    /// has finished.
    ///
    /// Any pending reconnect timer is cancelled first. On success the refresh
    /// heartbeat is (re)scheduled; if any dial fails, the first error is
    /// returned after the error-driven reconnection policy has run for each
    /// failure.
    pub async fn open(&self, count: Option<usize>) -> Result<(), TunnelError> {
        let epoch = self.current_epoch();
        self.open_at(epoch, count).await
    }

    /// Tear the tunnel down: stop every pooled connection and cancel any
    /// pending reconnection. Completes once the pool is empty; no replacements
    /// are scheduled for connections closed this way.
    pub async fn close(&self) {
        self.close_pool().await;
        self.emit(TunnelEvent::Closed);
    }

    /// Arm the refresh heartbeat: after `auto_reconnect_interval` the whole
    /// pool is torn down and rebuilt, and the heartbeat re-armed. Any pending
    /// timer is cancelled first; at most one timer is ever pending.
    pub fn reconnect(&self) {
        let mut supervision = self.supervision();
        self.arm_timer(&mut supervision, TimerAction::Refresh);
    }

    /// Fetch the remote's status record for this tunnel.
    pub async fn query_proxy_info(
        &self,
        options: ProxyInfoOptions,
    ) -> Result<serde_json::Value, StatusError> {
        status::query_proxy_info(
            &self.shared.config.remote_address,
            self.shared.identity.id(),
            options,
        )
        .await
    }

    fn supervision(&self) -> MutexGuard<Supervision> {
        self.shared
            .supervision
            .lock()
            .expect("supervision lock never poisoned")
    }

    fn emit(&self, event: TunnelEvent) {
        // Nobody listening is fine
        let _ = self.shared.events.send(event);
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }

    fn current_epoch(&self) -> u64 {
        self.supervision().epoch
    }

    /// Open dials under the given epoch; they back out instead of joining the
    /// pool if a teardown intervenes while they are in flight.
    async fn open_at(&self, epoch: u64, count: Option<usize>) -> Result<(), TunnelError> {
        self.clear_timer();

        let count = count.unwrap_or_else(|| {
            self.shared
                .config
                .max_connections
                .saturating_sub(self.supervision().pool.size())
        });
        debug!(count, "opening pool connections");

        let dials = (0..count).map(|_| self.establish(epoch));
        let mut first_error = None;
        for result in future::join_all(dials).await {
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            None => {
                self.arm_timer_if_current(epoch, TimerAction::Refresh);
                Ok(())
            }
            Some(error) => Err(error),
        }
    }

    /// Dial one pool connection end-to-end, applying the error-driven
    /// reconnection policy on failure.
    async fn establish(&self, epoch: u64) -> Result<(), TunnelError> {
        let connection = self
            .shared
            .next_connection_id
            .fetch_add(1, Ordering::Relaxed);
        match self.try_establish(connection, epoch).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.handle_dial_failure(connection, &error, epoch);
                Err(error)
            }
        }
    }

    async fn try_establish(
        &self,
        connection: ConnectionId,
        epoch: u64,
    ) -> Result<(), TunnelError> {
        let remote_dialer = RemoteDialer {
            remote_address: self.shared.config.remote_address.clone(),
            remote_port: self.shared.config.remote_port,
        };
        let mut remote = remote_dialer.connect().await.map_err(TunnelError::from)?;

        // The connection joins the pool as soon as it reaches the remote; a
        // failed handshake takes it back out through the error path. The
        // epoch comparison shares the pool's lock, so a dial that straddled a
        // teardown backs out here instead of joining a pool that close() has
        // already emptied.
        let (shutdown, shutdown_receiver) = oneshot::channel();
        {
            let mut supervision = self.supervision();
            if self.is_closing() || supervision.epoch != epoch {
                return Ok(());
            }
            supervision.pool.add(connection, shutdown);
        }
        self.emit(TunnelEvent::Open { connection });

        remote_dialer
            .authenticate(&mut remote, &self.shared.signing_key)
            .await
            .map_err(TunnelError::from)?;

        // The remote is not read again until the local side is connected, so
        // no proxied bytes can arrive before there is somewhere to put them.
        let local_dialer = LocalDialer {
            local_address: self.shared.config.local_address.clone(),
            local_port: self.shared.config.local_port,
            secure: self.shared.config.secure_local_connection,
        };
        let local = local_dialer.dial().await.map_err(TunnelError::LocalDial)?;

        let rewriter = if HostHeaderRewriter::applies_to(&self.shared.config.local_address) {
            Some(HostHeaderRewriter::new(&self.shared.config.local_address))
        } else {
            None
        };
        let bridge = Bridge::new(
            remote,
            local,
            rewriter,
            self.shared.config.transform.clone(),
        );

        let tunnel = self.clone();
        let task = tokio::spawn(async move {
            let end = bridge.run(shutdown_receiver).await;
            tunnel.handle_bridge_end(connection, end).await;
        });
        self.supervision().pool.attach_task(connection, task);
        self.emit(TunnelEvent::Connected { connection });
        Ok(())
    }

    /// The error-driven reconnection policy. The failed connection leaves the
    /// pool before the timer decision is made; a dial that straddled a
    /// teardown is removed but schedules nothing.
    fn handle_dial_failure(&self, connection: ConnectionId, error: &TunnelError, epoch: u64) {
        warn!(connection, %error, "pool connection failed");

        let mut supervision = self.supervision();
        supervision.pool.remove(connection);
        if self.is_closing() || supervision.epoch != epoch {
            return;
        }

        if error.is_connection_refused() {
            self.emit(TunnelEvent::Disconnected {
                message: "Tunnel connection refused".into(),
            });
        }
        if !self.shared.config.auto_reconnect {
            return;
        }
        let should_reconnect = supervision.pool.is_empty() && supervision.timer.is_none();
        if should_reconnect {
            self.arm_timer(&mut supervision, TimerAction::Reopen);
        }
    }

    /// Runs when a bridge stops piping: drop the connection from the pool and,
    /// unless the tunnel is closing, dial exactly one replacement to hold the
    /// pool at steady state.
    async fn handle_bridge_end(&self, connection: ConnectionId, end: BridgeEnd) {
        match end {
            // close() owns the teardown of connections it signalled.
            BridgeEnd::Shutdown => return,
            BridgeEnd::Remote(None) => debug!(connection, "remote closed pool connection"),
            BridgeEnd::Remote(Some(error)) => {
                warn!(connection, %error, "pool connection errored")
            }
            BridgeEnd::Local(None) => debug!(connection, "local service closed the connection"),
            BridgeEnd::Local(Some(error)) => {
                warn!(connection, %error, "local connection errored")
            }
        }

        // The replacement dial inherits the epoch observed at removal, so it
        // cannot join the pool if a close lands in between.
        let (removed, epoch) = {
            let mut supervision = self.supervision();
            let removed = supervision.pool.remove(connection).is_some();
            (removed, supervision.epoch)
        };
        if !removed || self.is_closing() {
            return;
        }
        if let Err(error) = self.open_at(epoch, Some(1)).await {
            warn!(%error, "replacement dial failed");
        }
    }

    /// Stop every pooled connection and wait for their bridge tasks. Also used
    /// by the heartbeat, which rebuilds the pool right afterwards.
    async fn close_pool(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);

        // Bumping the epoch under the lock invalidates every dial still in
        // flight: when one completes, its epoch no longer matches and it backs
        // out instead of joining the drained pool or arming a timer.
        let mut members = {
            let mut supervision = self.supervision();
            supervision.epoch += 1;
            if let Some(timer) = supervision.timer.take() {
                timer.handle.abort();
            }
            supervision.pool.drain()
        };
        for member in members.iter_mut() {
            member.signal_shutdown();
        }
        for member in members {
            member.join().await;
        }

        self.shared.closing.store(false, Ordering::SeqCst);
    }

    fn clear_timer(&self) {
        if let Some(timer) = self.supervision().timer.take() {
            timer.handle.abort();
        }
    }

    /// Claim the pending timer if `token` still owns the slot, returning the
    /// epoch to dial under. A timer that was replaced or cancelled right as it
    /// fired claims nothing and must not act.
    fn claim_timer(&self, token: u64) -> Option<u64> {
        let mut supervision = self.supervision();
        match &supervision.timer {
            Some(timer) if timer.token == token => {
                supervision.timer = None;
                Some(supervision.epoch)
            }
            _ => None,
        }
    }

    /// Arm `action` unless a teardown has intervened since `epoch` was read;
    /// a timer must not appear after the close that should have covered it.
    fn arm_timer_if_current(&self, epoch: u64, action: TimerAction) {
        let mut supervision = self.supervision();
        if supervision.epoch != epoch {
            return;
        }
        self.arm_timer(&mut supervision, action);
    }

    /// Replace whatever timer is pending with a fresh one; there is never more
    /// than one.
    fn arm_timer(&self, supervision: &mut Supervision, action: TimerAction) {
        if let Some(timer) = supervision.timer.take() {
            timer.handle.abort();
        }

        let token = self.shared.next_timer_token.fetch_add(1, Ordering::Relaxed);
        let delay = self.shared.config.auto_reconnect_interval;
        let tunnel = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let epoch = match tunnel.claim_timer(token) {
                Some(epoch) => epoch,
                None => return,
            };
            match action {
                TimerAction::Reopen => {
                    if let Err(error) = tunnel.open_at(epoch, None).await {
                        warn!(%error, "reconnect attempt failed");
                    }
                }
                TimerAction::Refresh => {
                    tunnel.close_pool().await;
                    let epoch = tunnel.current_epoch();
                    if let Err(error) = tunnel.open_at(epoch, None).await {
                        warn!(%error, "pool refresh failed");
                    }
                    // The heartbeat outlives a failed rebuild: re-arm whether
                    // or not every dial landed, so the next cycle retries the
                    // whole pool instead of going quiet.
                    tunnel.arm_timer_if_current(epoch, TimerAction::Refresh);
                }
            }
        });
        supervision.timer = Some(ReconnectTimer { token, handle });
    }
}
