//! The presence registry: the authoritative in-memory map from identity to
//! live connection.
//!
//! Every question of the form "is X online right now" is answered here and
//! nowhere else.  Sessions register an identity together with a push handle
//! for their connection; the registry broadcasts the resulting status change
//! to every connected session over a [`broadcast`] channel.
//!
//! Entries are never removed.  Disconnecting flips `online` to false but
//! keeps the last-known connection id, which is what makes stale disconnect
//! signals cheap to detect: a disconnect only counts if it names the entry's
//! *current* connection.  Registering again overwrites the handle, so a
//! second login from a new tab silently supersedes the first, and the
//! orphaned connection's later disconnect is a no-op.
//!
//! The map sits behind one `std::sync::Mutex` with minimal scope.  The lock
//! is never held across a channel send or any I/O: mutations collect what
//! they need, release, then broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};

use crate::protocol::ServerEvent;

/// Opaque handle naming one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Push target for one connection: events sent here are written to that
/// connection's socket by its session task.
pub type PushSender = mpsc::UnboundedSender<ServerEvent>;

struct Entry {
    conn: ConnectionId,
    push: PushSender,
    online: bool,
}

pub struct PresenceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    status_tx: broadcast::Sender<ServerEvent>,
    next_conn: AtomicU64,
}

impl PresenceRegistry {
    pub fn new(status_capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(status_capacity);
        Self {
            entries: Mutex::new(HashMap::new()),
            status_tx,
            next_conn: AtomicU64::new(1),
        }
    }

    /// Hand out a fresh connection id for a newly accepted socket.
    pub fn allocate(&self) -> ConnectionId {
        ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed))
    }

    /// Subscribe to status-change broadcasts. Sessions do this once at
    /// connect time, before any identity is registered.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.status_tx.subscribe()
    }

    /// Insert or overwrite the entry for `identity` and announce it online.
    ///
    /// Re-registration is not an error: a reconnect or a second tab simply
    /// supersedes the previous handle. Messages routed afterwards go to the
    /// new connection; the old one is orphaned until it disconnects.
    pub fn register(&self, identity: &str, conn: ConnectionId, push: PushSender) {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(
                identity.to_string(),
                Entry {
                    conn,
                    push,
                    online: true,
                },
            );
        }
        let _ = self.status_tx.send(ServerEvent::StatusUpdate {
            identity: identity.to_string(),
            online: true,
        });
    }

    /// Mark every identity whose *current* connection is `conn` offline and
    /// broadcast each transition. Returns the affected identities.
    ///
    /// A connection whose registration was superseded matches nothing, and
    /// an already-offline entry is skipped, so duplicate disconnect signals
    /// broadcast at most once.
    pub fn mark_offline(&self, conn: ConnectionId) -> Vec<String> {
        let went_offline: Vec<String> = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.conn == conn && entry.online)
                .map(|(identity, entry)| {
                    entry.online = false;
                    identity.clone()
                })
                .collect()
        };
        for identity in &went_offline {
            let _ = self.status_tx.send(ServerEvent::StatusUpdate {
                identity: identity.clone(),
                online: false,
            });
        }
        went_offline
    }

    /// Pure read: the identity's current connection and online flag.
    pub fn lookup(&self, identity: &str) -> Option<(ConnectionId, bool)> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(identity)
            .map(|entry| (entry.conn, entry.online))
    }

    pub fn is_online(&self, identity: &str) -> bool {
        matches!(self.lookup(identity), Some((_, true)))
    }

    /// Push handle for an identity, `Some` only while it is online.
    pub fn push_target(&self, identity: &str) -> Option<PushSender> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(identity)
            .filter(|entry| entry.online)
            .map(|entry| entry.push.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (PushSender, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    fn drain_status(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn register_then_lookup() {
        let registry = PresenceRegistry::new(16);
        assert!(registry.lookup("alice").is_none());
        assert!(!registry.is_online("alice"));

        let conn = registry.allocate();
        let (tx, _rx) = channel();
        registry.register("alice", conn, tx);

        assert_eq!(registry.lookup("alice"), Some((conn, true)));
        assert!(registry.is_online("alice"));
        assert!(registry.push_target("alice").is_some());
    }

    #[test]
    fn register_broadcasts_to_subscribers() {
        let registry = PresenceRegistry::new(16);
        let mut status_rx = registry.subscribe();

        let (tx, _rx) = channel();
        registry.register("alice", registry.allocate(), tx);

        assert_eq!(
            drain_status(&mut status_rx),
            vec![ServerEvent::StatusUpdate {
                identity: "alice".to_string(),
                online: true,
            }]
        );
    }

    #[test]
    fn disconnect_flips_offline_and_keeps_entry() {
        let registry = PresenceRegistry::new(16);
        let conn = registry.allocate();
        let (tx, _rx) = channel();
        registry.register("alice", conn, tx);
        let mut status_rx = registry.subscribe();

        assert_eq!(registry.mark_offline(conn), vec!["alice".to_string()]);
        // Entry survives with its last-known connection id
        assert_eq!(registry.lookup("alice"), Some((conn, false)));
        assert!(registry.push_target("alice").is_none());
        assert_eq!(
            drain_status(&mut status_rx),
            vec![ServerEvent::StatusUpdate {
                identity: "alice".to_string(),
                online: false,
            }]
        );
    }

    #[test]
    fn duplicate_disconnect_broadcasts_at_most_once() {
        let registry = PresenceRegistry::new(16);
        let conn = registry.allocate();
        let (tx, _rx) = channel();
        registry.register("alice", conn, tx);
        let mut status_rx = registry.subscribe();

        assert_eq!(registry.mark_offline(conn).len(), 1);
        assert_eq!(registry.mark_offline(conn).len(), 0);
        assert_eq!(drain_status(&mut status_rx).len(), 1);
    }

    #[test]
    fn reregistration_supersedes_old_connection() {
        let registry = PresenceRegistry::new(16);
        let old_conn = registry.allocate();
        let (old_tx, _old_rx) = channel();
        registry.register("alice", old_conn, old_tx);

        let new_conn = registry.allocate();
        let (new_tx, mut new_rx) = channel();
        registry.register("alice", new_conn, new_tx);

        // The old connection's disconnect must not take the new entry offline
        assert!(registry.mark_offline(old_conn).is_empty());
        assert_eq!(registry.lookup("alice"), Some((new_conn, true)));

        // Pushes route to the new connection
        let push = registry.push_target("alice").unwrap();
        push.send(ServerEvent::Typing {
            from: "bob".to_string(),
            to: "alice".to_string(),
        })
        .unwrap();
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn unknown_connection_disconnect_is_noop() {
        let registry = PresenceRegistry::new(16);
        let mut status_rx = registry.subscribe();
        assert!(registry.mark_offline(registry.allocate()).is_empty());
        assert!(drain_status(&mut status_rx).is_empty());
    }
}
