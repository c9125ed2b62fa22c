//! Rooms: one shared document, one awareness table, many connections.
//!
//! ```text
//!                         ┌────────────────────────────┐
//!   conn A ── frames ───► │  Room "design-doc"         │
//!   conn B ── frames ───► │   ├─ DocReplica (CRDT)     │ ──► broadcast ──► conn A
//!   conn C ── frames ───► │   ├─ AwarenessRegister     │ ──► channel   ──► conn B
//!                         │   └─ members + controlled  │               ──► conn C
//!                         └────────────────────────────┘
//! ```
//!
//! All state behind one async mutex per room, so message handling is
//! serialized per room and concurrent across rooms. Inbound frames mutate
//! the room; everything that must reach the other members goes out through
//! a single broadcast channel of pre-encoded frames. Each frame carries the
//! originating connection id when the channel's policy excludes the sender,
//! and receivers skip their own.
//!
//! What each inbound frame does:
//!
//! | frame            | room mutation       | reply to sender | fan-out        |
//! |------------------|---------------------|-----------------|----------------|
//! | sync step 1      | none                | one step 2      | none           |
//! | sync step 2      | apply update        | none            | update (hook)  |
//! | sync update      | apply update        | none            | update (hook)  |
//! | awareness        | apply entries       | none            | accepted entries|
//!
//! Reference: Kleppmann, "Designing Data-Intensive Applications",
//! Chapter 5 — this is leaderless replication with the room as a relay.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessRegister, OUTDATED_TIMEOUT};
use crate::doc::DocReplica;
use crate::protocol::{decode_awareness_entries, Message, ProtocolError, SyncMessage};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a fan-out channel delivers a frame back to the connection that
/// caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastPolicy {
    /// Skip the originating connection. The sender already has the change.
    ExcludeOrigin,
    /// Deliver to every member, the originator included.
    IncludeOrigin,
}

/// Per-room tuning, shared by every room a manager creates.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Capacity of the per-room broadcast channel. A member that falls this
    /// far behind is disconnected rather than allowed to stall the room.
    pub broadcast_capacity: usize,
    /// Awareness entries older than this are swept.
    pub outdated_timeout: Duration,
    /// Fan-out policy for document updates.
    pub update_policy: BroadcastPolicy,
    /// Fan-out policy for awareness changes. Included by default so a
    /// client sees its own announcements confirmed.
    pub awareness_policy: BroadcastPolicy,
    /// How long an empty room lingers before it is retired. `None` keeps
    /// rooms in memory for the life of the process.
    pub empty_room_grace: Option<Duration>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            outdated_timeout: OUTDATED_TIMEOUT,
            update_policy: BroadcastPolicy::ExcludeOrigin,
            awareness_policy: BroadcastPolicy::IncludeOrigin,
            empty_room_grace: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fan-out
// ─────────────────────────────────────────────────────────────────────────────

/// A pre-encoded frame travelling the room's broadcast channel.
///
/// The payload is shared, not copied, across receivers. `origin` is set
/// when the producing channel's policy excludes the originator; that member
/// drops the frame instead of sending it.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub origin: Option<Uuid>,
    pub payload: Arc<Vec<u8>>,
}

/// Point-in-time counters for one room.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomStats {
    pub connections: usize,
    pub messages_in: u64,
    pub updates_applied: u64,
    pub broadcasts_sent: u64,
    pub corrupt_updates: u64,
}

#[derive(Debug, Default)]
struct AtomicRoomStats {
    messages_in: AtomicU64,
    updates_applied: AtomicU64,
    broadcasts_sent: AtomicU64,
    corrupt_updates: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Room
// ─────────────────────────────────────────────────────────────────────────────

/// Per-member bookkeeping.
#[derive(Debug, Default)]
struct MemberState {
    /// Awareness client ids announced over this connection; forced offline
    /// when the connection goes away.
    controlled: HashSet<u64>,
}

struct RoomState {
    doc: DocReplica,
    awareness: AwarenessRegister,
    members: HashMap<Uuid, MemberState>,
}

/// One collaboration session. Created through a [`RoomManager`].
pub struct Room {
    name: String,
    state: Mutex<RoomState>,
    tx: broadcast::Sender<BroadcastFrame>,
    awareness_policy: BroadcastPolicy,
    stats: Arc<AtomicRoomStats>,
}

impl Room {
    pub fn new(name: impl Into<String>, config: &RoomConfig) -> Arc<Self> {
        let name = name.into();
        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        let stats = Arc::new(AtomicRoomStats::default());

        // Every committed change to the document, no matter which member it
        // came from, becomes exactly one update frame on the channel.
        let mut doc = DocReplica::new();
        {
            let tx = tx.clone();
            let stats = stats.clone();
            let policy = config.update_policy;
            doc.on_update(move |update, origin| {
                let frame_origin = match policy {
                    BroadcastPolicy::ExcludeOrigin => origin,
                    BroadcastPolicy::IncludeOrigin => None,
                };
                let payload = Arc::new(Message::sync_update(update.to_vec()).encode());
                if tx
                    .send(BroadcastFrame {
                        origin: frame_origin,
                        payload,
                    })
                    .is_ok()
                {
                    stats.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        Arc::new(Self {
            name,
            state: Mutex::new(RoomState {
                doc,
                awareness: AwarenessRegister::with_timeout(config.outdated_timeout),
                members: HashMap::new(),
            }),
            tx,
            awareness_policy: config.awareness_policy,
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a member and hands it the room's fan-out receiver.
    /// Frames broadcast after this call are guaranteed to reach it.
    pub async fn join(&self, conn_id: Uuid) -> broadcast::Receiver<BroadcastFrame> {
        let mut state = self.state.lock().await;
        state.members.insert(conn_id, MemberState::default());
        log::debug!("Connection {conn_id} joined room {}", self.name);
        self.tx.subscribe()
    }

    /// The frames a relay sends to a connection the moment it joins: a
    /// step 1 carrying the room's state vector, and the current awareness
    /// table if anyone is in it.
    pub async fn open_frames(&self) -> Vec<Vec<u8>> {
        let state = self.state.lock().await;
        let mut frames = vec![Message::sync_step1(state.doc.state_vector()).encode()];
        let snapshot = state.awareness.snapshot();
        if !snapshot.is_empty() {
            frames.push(Message::awareness(&snapshot).encode());
        }
        frames
    }

    /// Feeds one inbound frame from `conn_id` into the room and returns the
    /// frames to send back to that connection.
    ///
    /// An `Err` means the frame violated the protocol and the connection
    /// should be closed. A payload that decodes as a frame but fails as a
    /// CRDT update is dropped with a warning instead; one bad update is not
    /// a reason to tear down an otherwise healthy peer.
    pub async fn handle_message(
        &self,
        conn_id: Uuid,
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.stats.messages_in.fetch_add(1, Ordering::Relaxed);
        let message = Message::decode(data)?;
        let mut state = self.state.lock().await;
        match message {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                match state.doc.diff_since(&state_vector) {
                    Ok(diff) => Ok(vec![Message::sync_step2(diff).encode()]),
                    Err(e) => {
                        self.stats.corrupt_updates.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Dropping unreadable state vector from {conn_id} in room {}: {e}",
                            self.name
                        );
                        Ok(Vec::new())
                    }
                }
            }
            Message::Sync(SyncMessage::Step2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                match state.doc.apply_update(&update, Some(conn_id)) {
                    Ok(()) => {
                        self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.stats.corrupt_updates.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Dropping corrupt update from {conn_id} in room {}: {e}",
                            self.name
                        );
                    }
                }
                Ok(Vec::new())
            }
            Message::Awareness(payload) => {
                let entries = decode_awareness_entries(&payload)?;
                let change = state.awareness.apply_remote(entries);
                if let Some(member) = state.members.get_mut(&conn_id) {
                    // A re-announcement classifies as "updated" when the
                    // entry is already online, e.g. a reconnect on a fresh
                    // connection; this connection now speaks for that id.
                    for id in change.added.iter().chain(&change.updated) {
                        member.controlled.insert(*id);
                    }
                    for id in &change.removed {
                        member.controlled.remove(id);
                    }
                }
                self.broadcast_awareness(&change, Some(conn_id));
                Ok(Vec::new())
            }
        }
    }

    /// Removes a member and announces the departure of every awareness
    /// client it controlled. Returns how many members remain.
    pub async fn leave(&self, conn_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        if let Some(member) = state.members.remove(&conn_id) {
            if !member.controlled.is_empty() {
                let ids: Vec<u64> = member.controlled.into_iter().collect();
                let change = state.awareness.remove_states(&ids);
                self.broadcast_awareness(&change, Some(conn_id));
            }
            log::debug!("Connection {conn_id} left room {}", self.name);
        }
        state.members.len()
    }

    /// Evicts awareness entries whose last refresh predates the configured
    /// timeout, announcing evictions of still-online clients to the room.
    /// Returns the number of announced evictions.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        let change = state.awareness.sweep_expired(now);
        let evicted = change.removed.len();
        if evicted > 0 {
            log::debug!(
                "Evicted {evicted} stale awareness entries from room {}",
                self.name
            );
            self.broadcast_awareness(&change, None);
        }
        evicted
    }

    /// A fan-out receiver without membership, for observers and tests.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastFrame> {
        self.tx.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// The room document's current state vector.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.doc.state_vector()
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.lock().await;
        RoomStats {
            connections: state.members.len(),
            messages_in: self.stats.messages_in.load(Ordering::Relaxed),
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            broadcasts_sent: self.stats.broadcasts_sent.load(Ordering::Relaxed),
            corrupt_updates: self.stats.corrupt_updates.load(Ordering::Relaxed),
        }
    }

    fn broadcast_awareness(&self, change: &AwarenessChange, origin: Option<Uuid>) {
        if change.is_empty() {
            return;
        }
        let frame_origin = match self.awareness_policy {
            BroadcastPolicy::ExcludeOrigin => origin,
            BroadcastPolicy::IncludeOrigin => None,
        };
        let payload = Arc::new(Message::awareness(&change.entries).encode());
        if self
            .tx
            .send(BroadcastFrame {
                origin: frame_origin,
                payload,
            })
            .is_ok()
        {
            self.stats.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Room manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the name → room table. Servers hold one behind an `Arc`; separate
/// managers never share rooms, so several independent relays can live in
/// one process.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Looks up or creates the room and joins `conn_id` to it in one step.
    ///
    /// Joining happens under the table lock, which excludes a concurrent
    /// retirement of the same room: a member either joins before the empty
    /// check runs (and the room survives) or after the room is gone (and a
    /// fresh one is created).
    pub async fn attach(
        &self,
        name: &str,
        conn_id: Uuid,
    ) -> (Arc<Room>, broadcast::Receiver<BroadcastFrame>) {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                let rx = room.join(conn_id).await;
                return (room.clone(), rx);
            }
        }
        let mut rooms = self.rooms.write().await;
        // Re-check: another connection may have created it meanwhile.
        if let Some(room) = rooms.get(name) {
            let rx = room.join(conn_id).await;
            return (room.clone(), rx);
        }
        let room = self.create_locked(&mut rooms, name);
        let rx = room.join(conn_id).await;
        (room, rx)
    }

    /// Removes `conn_id` from the room and, if that left it empty and a
    /// grace period is configured, schedules its retirement.
    pub async fn detach(&self, name: &str, room: &Room, conn_id: Uuid) {
        let remaining = room.leave(conn_id).await;
        if remaining == 0 {
            if let Some(grace) = self.config.empty_room_grace {
                self.schedule_retire(name.to_string(), grace);
            }
        }
    }

    /// Looks up or creates a room without joining it.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        self.create_locked(&mut rooms, name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_names(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Members in the named room, or `None` if it does not exist.
    pub async fn connection_count(&self, name: &str) -> Option<usize> {
        let room = self.get(name).await?;
        Some(room.connection_count().await)
    }

    /// Drops the named room if it has no members. Returns whether it was
    /// removed.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(name) {
            Some(room) => room.connection_count().await == 0,
            None => return false,
        };
        if empty {
            rooms.remove(name);
            log::info!("Removed empty room {name:?}");
        }
        empty
    }

    fn create_locked(&self, rooms: &mut HashMap<String, Arc<Room>>, name: &str) -> Arc<Room> {
        let room = Room::new(name, &self.config);
        Self::spawn_sweeper(&room, self.config.outdated_timeout);
        rooms.insert(name.to_string(), room.clone());
        log::info!("Created room {name:?}");
        room
    }

    /// Periodic awareness eviction, one task per room. The task holds only
    /// a weak reference and exits when the room is dropped.
    fn spawn_sweeper(room: &Arc<Room>, outdated_timeout: Duration) {
        let weak = Arc::downgrade(room);
        let period = (outdated_timeout / 10).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(room) = weak.upgrade() else { break };
                room.sweep(Instant::now()).await;
            }
        });
    }

    fn schedule_retire(&self, name: String, grace: Duration) {
        let rooms = self.rooms.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut rooms = rooms.write().await;
            let still_empty = match rooms.get(&name) {
                Some(room) => room.connection_count().await == 0,
                None => false,
            };
            if still_empty {
                rooms.remove(&name);
                log::info!("Retired empty room {name:?}");
            }
        });
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}
