//! Accounting for the set of live pool connections.
//!
//! The pool holds one handle per remote connection, keyed by connection id.
//! Membership changes happen under the supervisor's lock so that reconnection
//! decisions always observe them.

use {
    std::collections::HashMap,
    tokio::{sync::oneshot, task::JoinHandle},
};

use crate::tunnel::ConnectionId;

/// Handle to one live pool connection and its bridge task.
pub(crate) struct PoolMember {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PoolMember {
    /// Ask the connection's bridge to stop. Idempotent.
    pub fn signal_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Wait for the connection's bridge task to finish.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

#[derive(Default)]
pub(crate) struct Pool {
    members: HashMap<ConnectionId, PoolMember>,
}

impl Pool {
    /// Add a connection that has reached the remote. The bridge task is
    /// attached separately once pairing completes.
    pub fn add(&mut self, id: ConnectionId, shutdown: oneshot::Sender<()>) {
        self.members.insert(
            id,
            PoolMember {
                shutdown: Some(shutdown),
                task: None,
            },
        );
    }

    /// Record the bridge task for a pooled connection. Returns false if the
    /// connection has already left the pool.
    pub fn attach_task(&mut self, id: ConnectionId, task: JoinHandle<()>) -> bool {
        match self.members.get_mut(&id) {
            Some(member) => {
                member.task = Some(task);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<PoolMember> {
        self.members.remove(&id)
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Take a snapshot of every member, emptying the pool.
    pub fn drain(&mut self) -> Vec<PoolMember> {
        self.members.drain().map(|(_, member)| member).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_channel() -> oneshot::Sender<()> {
        let (shutdown, _receiver) = oneshot::channel();
        shutdown
    }

    #[test]
    fn tracks_membership_and_size() {
        let mut pool = Pool::default();
        assert!(pool.is_empty());

        pool.add(1, member_channel());
        pool.add(2, member_channel());
        assert_eq!(pool.size(), 2);

        assert!(pool.remove(1).is_some());
        assert!(pool.remove(1).is_none());
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn drain_empties_the_pool() {
        let mut pool = Pool::default();
        pool.add(1, member_channel());
        pool.add(2, member_channel());

        let members = pool.drain();
        assert_eq!(members.len(), 2);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn attach_task_requires_membership() {
        let mut pool = Pool::default();
        pool.add(7, member_channel());

        assert!(pool.attach_task(7, tokio::spawn(async {})));
        assert!(!pool.attach_task(8, tokio::spawn(async {})));
    }
}
