use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;

/// Opaque identifier minted by a [`ConnectionRegistry`].
///
/// Ids come from a monotonically increasing counter, so a recycled socket
/// descriptor can never alias a connection that has already gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The set of currently open connections.
///
/// Insert, remove and snapshot serialize on one lock. Iteration always walks a
/// snapshot outside the lock, so a broadcast pass never holds up accepts and
/// never observes a member removed before the pass began.
pub struct ConnectionRegistry<T> {
    members: Mutex<HashMap<ConnectionId, T>>,
    next_id: AtomicU64,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, member: T) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.members.lock().await.insert(id, member);
        id
    }

    /// Removes `id`, returning the member if it was still registered.
    pub async fn remove(&self, id: ConnectionId) -> Option<T> {
        self.members.lock().await.remove(&id)
    }

    pub async fn snapshot(&self) -> Vec<(ConnectionId, T)> {
        let members = self.members.lock().await;
        members
            .iter()
            .map(|(id, member)| (*id, member.clone()))
            .collect()
    }

    /// Runs `f` over a snapshot of the registry and returns how many members
    /// it visited.
    pub async fn for_each<F>(&self, mut f: F) -> usize
    where
        F: FnMut(ConnectionId, &T),
    {
        let snapshot = self.snapshot().await;
        for (id, member) in &snapshot {
            f(*id, member);
        }
        snapshot.len()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }
}
