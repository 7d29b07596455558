//! Session registry: the single owner of every connected client's state
//!
//! This module handles the server-side bookkeeping of admitted clients:
//! - Identity allocation from a monotonically increasing counter
//! - Insertion at handshake time and removal on disconnect or staleness
//! - Application of drained updates by the update loop
//! - Consistent point-in-time snapshots for broadcasting
//! - Lobby rooms and pushes back to a client's reliable channel
//!
//! Sessions live behind one async read-write lock. Registration can happen
//! from any connection handler while the update loop is mutating or reading,
//! and a snapshot taken under the read lock never observes a half-applied
//! update.
//!
//! Every session is linked to the connection that registered it. Removing a
//! session, for whatever reason, fires that link's close signal so the
//! connection handler shuts down and frees its slot.

use log::{debug, info, warn};
use shared::{ClientId, Message, PlayerState, PlayerUpdate};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Notify, RwLock};

/// Pushes buffered per session before further ones are dropped
pub const OUTBOUND_QUEUE_LEN: usize = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no session with id {0}")]
    UnknownSession(ClientId),

    #[error("no player ids left")]
    IdsExhausted,

    #[error("client {0} cannot invite itself")]
    SelfInvite(ClientId),

    #[error("client {0} is not accepting messages")]
    Unreachable(ClientId),
}

/// Server-side record of one admitted client
///
/// Each session keeps:
/// - Identity and the address it connected from
/// - Authoritative game state last reported by the client
/// - The UDP port its most recent accepted datagram came from
/// - When that datagram was applied, for staleness checks
/// - The lobby room it is in, if any
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: ClientId,
    pub addr: IpAddr,
    pub state: PlayerState,
    /// Source port of the most recent applied datagram
    pub reply_port: Option<u16>,
    pub last_update: Instant,
    /// `None` while idle in the lobby
    pub room: Option<ClientId>,
}

impl ClientSession {
    pub fn new(id: ClientId, display_name: impl Into<String>, addr: IpAddr) -> Self {
        Self {
            id,
            addr,
            state: PlayerState::new(id, display_name),
            reply_port: None,
            last_update: Instant::now(),
            room: None,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.state.display_name
    }

    /// Checks if the session has gone quiet for longer than `timeout`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > timeout
    }
}

/// Connection-side ends of a freshly registered session
#[derive(Debug)]
pub struct SessionChannel {
    pub id: ClientId,
    /// Messages the server pushes to this client
    pub outbound: mpsc::Receiver<Message>,
    /// Notified once the session leaves the registry
    pub closed: Arc<Notify>,
}

#[derive(Debug)]
struct SessionLink {
    outbound: mpsc::Sender<Message>,
    closed: Arc<Notify>,
}

impl SessionLink {
    fn push(&self, id: ClientId, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping push to client {}: {}", id, e);
                false
            }
        }
    }
}

struct Entry {
    session: ClientSession,
    link: SessionLink,
}

pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<ClientId, Entry>>,
    next_id: AtomicU32,
}

impl SessionRegistry {
    /// Creates an empty registry; the first issued id is 0
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    fn starting_at(first_id: ClientId) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU32::new(first_id),
        }
    }

    /// Admits a new client and returns its freshly allocated id
    ///
    /// Ids come from an atomic counter, so concurrent callers always get
    /// distinct values and an id is never handed out twice in one run. Once
    /// the counter would wrap, registration fails instead.
    pub async fn register(
        &self,
        display_name: &str,
        addr: IpAddr,
    ) -> Result<SessionChannel, RegistryError> {
        let id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(1))
            .map_err(|_| RegistryError::IdsExhausted)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let closed = Arc::new(Notify::new());
        let entry = Entry {
            session: ClientSession::new(id, display_name, addr),
            link: SessionLink {
                outbound: outbound_tx,
                closed: Arc::clone(&closed),
            },
        };

        self.sessions.write().await.insert(id, entry);
        info!("Client {} ({:?}) registered from {}", id, display_name, addr);

        Ok(SessionChannel {
            id,
            outbound: outbound_rx,
            closed,
        })
    }

    pub async fn lookup(&self, id: ClientId) -> Option<ClientSession> {
        self.sessions
            .read()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    /// Applies a client-reported update and refreshes its liveness
    ///
    /// Called only from the update loop. Unknown ids are reported back to the
    /// caller rather than creating a session.
    pub async fn apply_update(
        &self,
        update: &PlayerUpdate,
        source: SocketAddr,
        now: Instant,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = &mut sessions
            .get_mut(&update.id)
            .ok_or(RegistryError::UnknownSession(update.id))?
            .session;

        session.state.apply(update);
        session.reply_port = Some(source.port());
        session.last_update = now;
        Ok(())
    }

    /// Removes a session, returning it if it existed
    ///
    /// The session's connection is told to close, and a room partner left
    /// alone is sent back to the lobby.
    pub async fn remove(&self, id: ClientId) -> Option<ClientSession> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.remove(&id)?;
        close(&mut sessions, &entry);

        info!(
            "Client {} ({:?}) removed",
            entry.session.id,
            entry.session.display_name()
        );
        Some(entry.session)
    }

    /// Returns every session, ordered by id, as of a single instant
    pub async fn snapshot_all(&self) -> Vec<ClientSession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Drops sessions whose last update is older than `timeout`
    ///
    /// Returns the removed ids so callers can log or notify.
    pub async fn evict_stale(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut sessions = self.sessions.write().await;
        let stale: Vec<ClientId> = sessions
            .values()
            .filter(|entry| entry.session.is_stale(now, timeout))
            .map(|entry| entry.session.id)
            .collect();

        for id in &stale {
            if let Some(entry) = sessions.remove(id) {
                close(&mut sessions, &entry);
                info!(
                    "Client {} ({:?}) timed out",
                    entry.session.id,
                    entry.session.display_name()
                );
            }
        }

        if !stale.is_empty() {
            debug!("Evicted {} stale sessions", stale.len());
        }
        stale
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Queues a message on one client's reliable channel
    pub async fn send_to(&self, id: ClientId, message: Message) -> Result<(), RegistryError> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(&id).ok_or(RegistryError::UnknownSession(id))?;
        if entry.link.push(id, message) {
            Ok(())
        } else {
            Err(RegistryError::Unreachable(id))
        }
    }

    /// Queues a message on every client's reliable channel
    ///
    /// Returns how many clients it was queued for.
    pub async fn broadcast_message(&self, message: &Message) -> usize {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(id, entry)| entry.link.push(**id, message.clone()))
            .count()
    }

    /// Sessions not in any room, except `requester`, ordered by id
    pub async fn idle_clients(&self, requester: ClientId) -> Vec<(ClientId, String)> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.session.id != requester && entry.session.room.is_none())
            .map(|entry| (entry.session.id, entry.session.display_name().to_string()))
            .collect()
    }

    /// Puts `requester` in a room with `target` and tells both to enter it
    ///
    /// Joins the target's room if it already has one; otherwise a new room
    /// named after the target is opened. Returns the room id.
    pub async fn invite(
        &self,
        requester: ClientId,
        target: ClientId,
    ) -> Result<ClientId, RegistryError> {
        if requester == target {
            return Err(RegistryError::SelfInvite(requester));
        }

        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&requester) {
            return Err(RegistryError::UnknownSession(requester));
        }
        let room = sessions
            .get(&target)
            .ok_or(RegistryError::UnknownSession(target))?
            .session
            .room
            .unwrap_or(target);

        let previous = sessions
            .get_mut(&requester)
            .and_then(|entry| entry.session.room.replace(room));
        if let Some(entry) = sessions.get_mut(&target) {
            entry.session.room = Some(room);
        }
        if let Some(previous) = previous.filter(|&previous| previous != room) {
            idle_if_alone(&mut sessions, previous);
        }

        for id in [target, requester] {
            if let Some(entry) = sessions.get(&id) {
                entry.link.push(id, Message::enter_game(room));
            }
        }

        info!("Client {} joined client {} in room {}", requester, target, room);
        Ok(room)
    }

    /// Returns a client to the lobby
    pub async fn go_idle(&self, id: ClientId) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let room = sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?
            .session
            .room
            .take();

        if let Some(room) = room {
            debug!("Client {} left room {}", id, room);
            idle_if_alone(&mut sessions, room);
        }
        Ok(())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Signals a removed session's connection and tidies up its room
fn close(sessions: &mut BTreeMap<ClientId, Entry>, removed: &Entry) {
    removed.link.closed.notify_one();
    if let Some(room) = removed.session.room {
        idle_if_alone(sessions, room);
    }
}

/// Sends the last member of a room back to the lobby
fn idle_if_alone(sessions: &mut BTreeMap<ClientId, Entry>, room: ClientId) {
    let members: Vec<ClientId> = sessions
        .values()
        .filter(|entry| entry.session.room == Some(room))
        .map(|entry| entry.session.id)
        .collect();

    if members.len() > 1 {
        return;
    }

    for id in members {
        if let Some(entry) = sessions.get_mut(&id) {
            entry.session.room = None;
            entry.link.push(id, Message::go_idle());
            info!("Client {} is alone in room {}, back to the lobby", id, room);
        }
    }
}
