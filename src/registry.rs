use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{MAX_CHAT_CHARS, Message};

/// Identity of one registered connection. Handed out by the registry so
/// sessions over in-memory transports work the same as TCP sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-session outbound queue. The session's writer task drains the other
/// end, so broadcasting never touches a socket directly.
///
/// The queue is unbounded: a peer whose socket stalls keeps its writer task
/// blocked mid-write and accumulates pending broadcasts until the transport
/// errors out and its session tears down. Bounding it would force a
/// drop-or-disconnect choice on overflow inside `broadcast`; chat traffic is
/// small enough that the simpler queue wins for now.
pub type Outbound = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone)]
struct Peer {
    username: String,
    outbound: Outbound,
}

/// Live mapping of authenticated connections to usernames, one per server
/// instance.
///
/// The guard is held only for map reads and writes, never across a send.
/// Iteration always works on a [`snapshot`](Registry::snapshot) copy.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    // Ids are monotonic, so iterating the map visits peers in registration
    // order.
    peers: Mutex<BTreeMap<ConnId, Peer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an authenticated connection and returns its identity. A peer is
    /// only ever registered with a username; there is no half-registered
    /// state.
    pub fn register(&self, username: String, outbound: Outbound) -> ConnId {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, Peer { username, outbound });
        id
    }

    /// Removes a connection, returning its username. Removing an absent
    /// connection is a no-op: teardown races against broadcast-side cleanup
    /// and both paths call this.
    pub fn remove(&self, id: ConnId) -> Option<String> {
        self.lock().remove(&id).map(|peer| peer.username)
    }

    /// Copy of the current entries, safe to iterate without the guard.
    pub fn snapshot(&self) -> Vec<(ConnId, String, Outbound)> {
        self.lock()
            .iter()
            .map(|(id, peer)| (*id, peer.username.clone(), peer.outbound.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fans `message` out to every registered connection except `exclude`.
    ///
    /// Chat messages are gated first: whitespace-only text or text over
    /// [`MAX_CHAT_CHARS`] is dropped silently. Join and leave events always
    /// go through. A refused send means that peer's writer task is already
    /// gone; its own session handles removal and the leave event, so the
    /// failure is logged and skipped without disturbing the remaining
    /// recipients.
    pub fn broadcast(&self, message: &Message, exclude: Option<ConnId>) {
        if let Message::Chat { text, .. } = message {
            if text.trim().is_empty() || text.chars().count() > MAX_CHAT_CHARS {
                debug!("dropping chat message that failed validation");
                return;
            }
        }

        for (id, username, outbound) in self.snapshot() {
            if Some(id) == exclude {
                continue;
            }
            if outbound.send(message.clone()).is_err() {
                debug!(%id, %username, "peer unreachable, leaving cleanup to its session");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ConnId, Peer>> {
        self.peers.lock().expect("registry lock poisoned")
    }
}
