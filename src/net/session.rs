//! Session management module
//!
//! A logged-in connection is split in two:
//! - `SessionHandle`, shared with the I/O tasks: the bounded inbound queue,
//!   the disconnect signal and the dropped message counter
//! - `GameSession`, owned by the player on the tick thread: the inbound
//!   receiver, the outbound cipher and the pending outbound bytes
//!
//! `SessionRegistry` tracks every open connection for per-address limits and
//! "already logged in" checks.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::error::{NetworkError, ProtocolError};
use crate::net::codec::{Frame, FrameEncoder, GameMessage};

/// Unique session identifier
pub type SessionId = u64;

/// I/O side of a logged-in session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    address: SocketAddr,
    inbound: mpsc::Sender<GameMessage>,
    disconnected: AtomicBool,
    closed: Notify,
    dropped: AtomicU64,
    username: RwLock<Option<String>>,
}

impl SessionHandle {
    /// Create a handle and the receiving end of its inbound queue
    pub fn new(
        id: SessionId,
        address: SocketAddr,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<GameMessage>) {
        let (inbound, receiver) = mpsc::channel(capacity.max(1));
        let handle = Arc::new(Self {
            id,
            address,
            inbound,
            disconnected: AtomicBool::new(false),
            closed: Notify::new(),
            dropped: AtomicU64::new(0),
            username: RwLock::new(None),
        });
        (handle, receiver)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn set_username(&self, username: impl Into<String>) {
        *self.username.write() = Some(username.into());
    }

    /// Hand a decoded message to the tick thread without waiting.
    ///
    /// A full queue drops the message and counts it.
    pub fn offer(&self, message: GameMessage) -> bool {
        match self.inbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(session_id = self.id, opcode = message.opcode, "Inbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Mark the session as gone. Returns true only for the first call.
    pub fn signal_disconnect(&self) -> bool {
        let first = !self.disconnected.swap(true, Ordering::AcqRel);
        if first {
            debug!(session_id = self.id, "Disconnect signalled");
            self.closed.notify_waiters();
        }
        first
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Resolves once the session has been marked as gone
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_disconnected() {
            return;
        }
        notified.await;
    }

    /// Messages dropped since the last call
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

/// Tick side of a logged-in session
#[derive(Debug)]
pub struct GameSession {
    handle: Arc<SessionHandle>,
    inbound: mpsc::Receiver<GameMessage>,
    encoder: FrameEncoder,
    pending: BytesMut,
    outbound: mpsc::Sender<Bytes>,
    disconnect_seen: bool,
}

impl GameSession {
    pub fn new(
        handle: Arc<SessionHandle>,
        inbound: mpsc::Receiver<GameMessage>,
        encoder: FrameEncoder,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            handle,
            inbound,
            encoder,
            pending: BytesMut::new(),
            outbound,
            disconnect_seen: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Next inbound message, if one has arrived
    pub fn dequeue(&mut self) -> Option<GameMessage> {
        self.inbound.try_recv().ok()
    }

    /// Encode `frame` into the pending buffer without writing it
    pub fn queue(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.encoder.encode(frame, &mut self.pending)
    }

    /// Bytes queued since the last flush
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Hand everything queued this tick to the writer task.
    ///
    /// A writer that is gone or too far behind disconnects the session.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = self.pending.split().freeze();
        if let Err(e) = self.outbound.try_send(batch) {
            let reason = match e {
                TrySendError::Full(_) => "writer backlog full",
                TrySendError::Closed(_) => "writer closed",
            };
            warn!(session_id = self.id(), reason, "Dropping session on flush");
            self.handle.signal_disconnect();
        }
    }

    /// True exactly once, on the first tick after a disconnect was signalled
    pub fn poll_disconnect(&mut self) -> bool {
        if self.disconnect_seen || !self.handle.is_disconnected() {
            return false;
        }
        self.disconnect_seen = true;
        true
    }
}

/// Thread-safe registry of open connections
#[derive(Debug)]
pub struct SessionRegistry {
    connections: DashMap<SessionId, SocketAddr>,
    handles: DashMap<SessionId, Arc<SessionHandle>>,
    usernames: DashMap<String, SessionId>,
    per_ip: DashMap<IpAddr, usize>,
    next_id: AtomicU64,
    max_per_ip: usize,
}

impl SessionRegistry {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            connections: DashMap::new(),
            handles: DashMap::new(),
            usernames: DashMap::new(),
            per_ip: DashMap::new(),
            next_id: AtomicU64::new(1),
            max_per_ip,
        }
    }

    /// Register a new connection, enforcing the per-address limit
    pub fn open(&self, address: SocketAddr) -> Result<SessionId, NetworkError> {
        let ip = address.ip();
        {
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= self.max_per_ip {
                warn!(ip = %ip, count = *count, max = self.max_per_ip, "Connection limit exceeded for IP");
                return Err(NetworkError::TooManyConnections(ip.to_string()));
            }
            *count += 1;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(id, address);
        debug!(session_id = id, address = %address, "Connection opened");
        Ok(id)
    }

    /// Reserve `username` for session `id`. False when already taken.
    pub fn claim_username(&self, id: SessionId, username: &str) -> bool {
        match self.usernames.entry(username.to_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(id);
                true
            }
        }
    }

    pub fn is_logged_in(&self, username: &str) -> bool {
        self.usernames.contains_key(&username.to_lowercase())
    }

    /// Release `username` if `id` still holds it
    pub fn release_username(&self, id: SessionId, username: &str) {
        self.usernames
            .remove_if(&username.to_lowercase(), |_, holder| *holder == id);
    }

    /// Record the I/O handle of a session that made it into the world
    pub fn attach(&self, handle: Arc<SessionHandle>) {
        info!(session_id = handle.id(), username = ?handle.username(), "Session attached");
        self.handles.insert(handle.id(), handle);
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.handles.get(&id).map(|entry| entry.clone())
    }

    /// Forget a connection once its socket is gone
    pub fn close(&self, id: SessionId) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            if let Some(username) = handle.username() {
                self.release_username(id, &username);
            }
        }
        let Some((_, address)) = self.connections.remove(&id) else {
            return;
        };
        let ip = address.ip();
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.per_ip.remove_if(&ip, |_, count| *count == 0);
        debug!(session_id = id, address = %address, "Connection closed");
    }

    /// Open connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Sessions that made it into the world
    pub fn player_count(&self) -> usize {
        self.handles.len()
    }

    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map_or(0, |count| *count)
    }

    /// Mark every attached session as gone
    pub fn disconnect_all(&self) {
        for entry in self.handles.iter() {
            entry.value().signal_disconnect();
        }
    }
}
