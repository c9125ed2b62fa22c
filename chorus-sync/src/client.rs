//! Client-side provider: keeps a local replica synchronized with one room
//! on a relay server.
//!
//! ```text
//!   local edits ──► DocReplica ──hook──► outgoing queue ──► writer task ──► ws
//!   ws ──► reader task ──► DocReplica / AwarenessRegister ──► events
//!   maintenance task: re-announce own presence, sweep stale peers
//! ```
//!
//! The provider connects, sends a step 1 carrying its state vector plus its
//! own presence if announced, and from then on relays every committed local
//! edit upstream while applying everything the server sends. Updates the
//! server relays back are applied under a private origin tag so the update
//! hook can tell them apart from local edits and not echo them.
//!
//! There is no automatic reconnect: when the socket drops, the provider
//! emits [`SyncEvent::Disconnected`] and goes quiet. The replica and the
//! local awareness table stay usable offline, and a later `connect` starts
//! a fresh handshake that reconciles whatever happened in between.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::awareness::{AwarenessChange, AwarenessRegister, OUTDATED_TIMEOUT};
use crate::doc::DocReplica;
use crate::protocol::{decode_awareness_entries, AwarenessEntry, Message, SyncMessage};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Re-run the step 1 handshake this often to heal any missed updates.
    /// `None` disables periodic resync.
    pub resync_interval: Option<Duration>,
    /// Stale-entry timeout for the local awareness table. The client also
    /// re-announces its own state at half this age so peers never evict a
    /// quiet but connected client.
    pub outdated_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resync_interval: None,
            outdated_timeout: OUTDATED_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications delivered through the receiver from
/// [`SyncClient::take_event_rx`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    /// The first step 2 arrived and was applied; the local replica now has
    /// the server's history.
    Synced,
    AwarenessChanged {
        added: Vec<u64>,
        updated: Vec<u64>,
        removed: Vec<u64>,
    },
    Disconnected,
}

#[derive(Debug)]
pub enum ClientError {
    /// The WebSocket connection could not be established.
    Connect(String),
    /// No live connection to send on.
    NotConnected,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "connection failed: {reason}"),
            Self::NotConnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ClientError {}

/// A synchronized document client.
pub struct SyncClient {
    url: String,
    config: ClientConfig,
    doc: Arc<DocReplica>,
    awareness: Arc<Mutex<AwarenessRegister>>,
    client_id: u64,
    /// Origin tag for updates applied from the server.
    remote_origin: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    outgoing: Arc<StdMutex<Option<mpsc::Sender<WsMessage>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Creates a disconnected client for `url` (e.g.
    /// `ws://127.0.0.1:9090/design-doc`; the path picks the room).
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let outgoing: Arc<StdMutex<Option<mpsc::Sender<WsMessage>>>> =
            Arc::new(StdMutex::new(None));
        let remote_origin = Uuid::new_v4();
        let outdated_timeout = config.outdated_timeout;

        // Every committed local edit goes upstream; server-applied updates
        // carry the remote origin tag and are not echoed.
        let mut doc = DocReplica::new();
        {
            let outgoing = outgoing.clone();
            doc.on_update(move |update, origin| {
                if origin == Some(remote_origin) {
                    return;
                }
                let sender = outgoing.lock().ok().and_then(|slot| slot.as_ref().cloned());
                if let Some(sender) = sender {
                    let frame = Message::sync_update(update.to_vec()).encode();
                    if sender.try_send(WsMessage::Binary(frame.into())).is_err() {
                        log::warn!("Outgoing queue full; dropping local update");
                    }
                }
            });
        }
        let client_id = doc.client_id();

        Self {
            url: url.into(),
            config,
            doc: Arc::new(doc),
            awareness: Arc::new(Mutex::new(AwarenessRegister::with_timeout(outdated_timeout))),
            client_id,
            remote_origin,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// The underlying document, for local edits and reads.
    pub fn doc(&self) -> &yrs::Doc {
        self.doc.doc()
    }

    /// The CRDT client id this client's edits and presence are keyed by.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.state_vector()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The event receiver. Yields `None` after the first call.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Snapshot of everything the local awareness table knows.
    pub async fn awareness_states(&self) -> Vec<AwarenessEntry> {
        self.awareness.lock().await.snapshot()
    }

    /// The announced state of one client, if online.
    pub async fn awareness_state_of(&self, client_id: u64) -> Option<Vec<u8>> {
        let reg = self.awareness.lock().await;
        reg.state(client_id).and_then(|s| s.map(|b| b.to_vec()))
    }

    /// Connects and runs the opening handshake. Already being connected is
    /// not an error.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let (ws_stream, _) = match connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        log::info!("Connected to {}", self.url);

        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(256);

        // Writer task: single owner of the socket's send half.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(frame).await.is_err() {
                    break;
                }
            }
        });

        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = Some(out_tx.clone());
        }

        // Opening frames: what we have, and who we are if announced.
        let step1 = Message::sync_step1(self.doc.state_vector()).encode();
        out_tx
            .send(WsMessage::Binary(step1.into()))
            .await
            .map_err(|_| ClientError::NotConnected)?;
        let own = { self.awareness.lock().await.entry(self.client_id) };
        if let Some(entry) = own {
            if entry.state.is_some() {
                let frame = Message::awareness(&[entry]).encode();
                let _ = out_tx.send(WsMessage::Binary(frame.into())).await;
            }
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(SyncEvent::Connected);

        self.spawn_reader(ws_reader, out_tx.clone());
        self.spawn_resync(out_tx.clone());
        self.spawn_maintenance(out_tx);
        Ok(())
    }

    /// Announces this client's presence state (serialized JSON by
    /// convention); `None` announces departure. Applies locally even while
    /// offline; the next `connect` re-announces it.
    pub async fn set_awareness(&self, state: Option<Vec<u8>>) {
        let change = {
            let mut reg = self.awareness.lock().await;
            reg.set_local_state(self.client_id, state)
        };
        if change.is_empty() {
            return;
        }
        let _ = self.event_tx.try_send(SyncEvent::AwarenessChanged {
            added: change.added.clone(),
            updated: change.updated.clone(),
            removed: change.removed.clone(),
        });
        self.send_entries(&change.entries).await;
    }

    /// Announces departure and closes the connection. The replica and the
    /// awareness table remain usable offline.
    pub async fn close(&self) {
        let change = {
            let mut reg = self.awareness.lock().await;
            reg.set_local_state(self.client_id, None)
        };
        if !change.is_empty() {
            let _ = self.event_tx.try_send(SyncEvent::AwarenessChanged {
                added: change.added.clone(),
                updated: change.updated.clone(),
                removed: change.removed.clone(),
            });
        }

        let sender = self.sender();
        if let Some(sender) = sender {
            if !change.entries.is_empty() {
                let frame = Message::awareness(&change.entries).encode();
                let _ = sender.send(WsMessage::Binary(frame.into())).await;
            }
            let _ = sender.send(WsMessage::Close(None)).await;
        }
        if let Ok(mut slot) = self.outgoing.lock() {
            *slot = None;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    fn sender(&self) -> Option<mpsc::Sender<WsMessage>> {
        self.outgoing.lock().ok().and_then(|slot| slot.as_ref().cloned())
    }

    async fn send_entries(&self, entries: &[AwarenessEntry]) {
        if entries.is_empty() {
            return;
        }
        if let Some(sender) = self.sender() {
            let frame = Message::awareness(entries).encode();
            if sender.send(WsMessage::Binary(frame.into())).await.is_err() {
                log::debug!("Not connected; awareness change kept locally");
            }
        }
    }

    fn spawn_reader(
        &self,
        mut ws_reader: impl Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin
            + Send
            + 'static,
        out_tx: mpsc::Sender<WsMessage>,
    ) {
        let doc = self.doc.clone();
        let awareness = self.awareness.clone();
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        let remote_origin = self.remote_origin;
        let client_id = self.client_id;
        tokio::spawn(async move {
            let mut synced = false;
            while let Some(incoming) = ws_reader.next().await {
                match incoming {
                    Ok(WsMessage::Binary(data)) => {
                        if data.is_empty() {
                            continue;
                        }
                        match Message::decode(&data) {
                            Ok(Message::Sync(SyncMessage::Step1(state_vector))) => {
                                match doc.diff_since(&state_vector) {
                                    Ok(diff) => {
                                        let frame = Message::sync_step2(diff).encode();
                                        if out_tx
                                            .send(WsMessage::Binary(frame.into()))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!(
                                            "Dropping unreadable state vector from server: {e}"
                                        );
                                    }
                                }
                            }
                            Ok(Message::Sync(SyncMessage::Step2(update))) => {
                                match doc.apply_update(&update, Some(remote_origin)) {
                                    Ok(()) => {
                                        if !synced {
                                            synced = true;
                                            // Events are advisory; never block
                                            // the reader on a slow consumer.
                                            let _ = event_tx.try_send(SyncEvent::Synced);
                                        }
                                    }
                                    Err(e) => log::warn!("Dropping corrupt step 2: {e}"),
                                }
                            }
                            Ok(Message::Sync(SyncMessage::Update(update))) => {
                                if let Err(e) = doc.apply_update(&update, Some(remote_origin)) {
                                    log::warn!("Dropping corrupt update: {e}");
                                }
                            }
                            Ok(Message::Awareness(payload)) => {
                                match decode_awareness_entries(&payload) {
                                    Ok(entries) => {
                                        let (change, revival) = {
                                            let mut reg = awareness.lock().await;
                                            apply_server_awareness(&mut reg, client_id, entries)
                                        };
                                        if !change.is_empty() {
                                            let _ =
                                                event_tx.try_send(SyncEvent::AwarenessChanged {
                                                    added: change.added,
                                                    updated: change.updated,
                                                    removed: change.removed,
                                                });
                                        }
                                        if !revival.entries.is_empty() {
                                            let frame =
                                                Message::awareness(&revival.entries).encode();
                                            if out_tx
                                                .send(WsMessage::Binary(frame.into()))
                                                .await
                                                .is_err()
                                            {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Server sent malformed awareness payload: {e}");
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("Server sent malformed frame: {e}");
                                break;
                            }
                        }
                    }
                    Ok(WsMessage::Ping(payload)) => {
                        let _ = out_tx.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            if let Ok(mut slot) = outgoing.lock() {
                *slot = None;
            }
            let _ = event_tx.try_send(SyncEvent::Disconnected);
            log::info!("Disconnected from server");
        });
    }

    fn spawn_resync(&self, out_tx: mpsc::Sender<WsMessage>) {
        let Some(period) = self.config.resync_interval else {
            return;
        };
        let doc = self.doc.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let frame = Message::sync_step1(doc.state_vector()).encode();
                if out_tx.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_maintenance(&self, out_tx: mpsc::Sender<WsMessage>) {
        let awareness = self.awareness.clone();
        let state = self.state.clone();
        let event_tx = self.event_tx.clone();
        let client_id = self.client_id;
        let timeout = self.config.outdated_timeout;
        let period = (timeout / 10).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if *state.read().await != ConnectionState::Connected {
                    break;
                }
                let (renewal, swept) = {
                    let mut reg = awareness.lock().await;
                    let due = reg
                        .last_updated(client_id)
                        .is_some_and(|at| at.elapsed() >= timeout / 2);
                    let renewal = match reg.entry(client_id) {
                        Some(entry) if entry.state.is_some() && due => {
                            Some(reg.set_local_state(client_id, entry.state))
                        }
                        _ => None,
                    };
                    (renewal, reg.sweep_expired(Instant::now()))
                };
                if let Some(change) = renewal {
                    if !change.entries.is_empty() {
                        let frame = Message::awareness(&change.entries).encode();
                        if out_tx.send(WsMessage::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                }
                if !swept.is_empty() {
                    let _ = event_tx.try_send(SyncEvent::AwarenessChanged {
                        added: swept.added,
                        updated: swept.updated,
                        removed: swept.removed,
                    });
                }
            }
        });
    }
}

/// Applies a batch of server entries to the local register.
///
/// An entry that declares this client offline while it still holds a local
/// state is not applied. Servers null a departed client at a bumped clock,
/// so after an ungraceful drop the reconnect handshake delivers our own
/// tombstone ahead of anything we can announce; the register answers by
/// re-announcing the state just past the peer's clock. The second change
/// returned is that revival, which the caller forwards upstream.
fn apply_server_awareness(
    reg: &mut AwarenessRegister,
    own_id: u64,
    entries: Vec<AwarenessEntry>,
) -> (AwarenessChange, AwarenessChange) {
    let own_state = reg.state(own_id).and_then(|s| s.map(|b| b.to_vec()));
    let mut keep = Vec::with_capacity(entries.len());
    let mut outbid = None;
    for entry in entries {
        if entry.client_id == own_id && entry.state.is_none() && own_state.is_some() {
            outbid = Some(entry.clock + 1);
        } else {
            keep.push(entry);
        }
    }
    let change = reg.apply_remote(keep);
    let revival = match (outbid, own_state) {
        (Some(clock), Some(state)) => reg.apply_remote(vec![AwarenessEntry {
            client_id: own_id,
            clock,
            state: Some(state),
        }]),
        _ => AwarenessChange::default(),
    };
    (change, revival)
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{Text, Transact, WriteTxn};

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = SyncClient::new("ws://127.0.0.1:9/doc", ClientConfig::default());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.awareness_states().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is never a WebSocket server.
        let mut client = SyncClient::new("ws://127.0.0.1:1/doc", ClientConfig::default());
        let result = client.connect().await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_set_awareness_offline_applies_locally() {
        let mut client = SyncClient::new("ws://127.0.0.1:9/doc", ClientConfig::default());
        let mut events = client.take_event_rx().unwrap();

        client.set_awareness(Some(b"{\"user\":\"a\"}".to_vec())).await;
        assert_eq!(
            client.awareness_state_of(client.client_id()).await,
            Some(b"{\"user\":\"a\"}".to_vec())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::AwarenessChanged {
                added: vec![client.client_id()],
                updated: vec![],
                removed: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_local_edits_work_offline() {
        let client = SyncClient::new("ws://127.0.0.1:9/doc", ClientConfig::default());
        {
            let mut txn = client.doc().transact_mut();
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, 0, "offline");
        }
        assert_ne!(client.state_vector(), vec![0]);
    }

    #[tokio::test]
    async fn test_take_event_rx_only_once() {
        let mut client = SyncClient::new("ws://127.0.0.1:9/doc", ClientConfig::default());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_close_without_connect() {
        let client = SyncClient::new("ws://127.0.0.1:9/doc", ClientConfig::default());
        client.close().await;
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_own_offline_announcement_is_outbid() {
        let mut reg = AwarenessRegister::new();
        reg.set_local_state(7, Some(b"here".to_vec()));

        let (change, revival) = apply_server_awareness(
            &mut reg,
            7,
            vec![AwarenessEntry {
                client_id: 7,
                clock: 2,
                state: None,
            }],
        );
        assert!(change.is_empty(), "the removal must not be applied");
        assert_eq!(revival.updated, vec![7]);
        assert_eq!(
            revival.entries,
            vec![AwarenessEntry {
                client_id: 7,
                clock: 3,
                state: Some(b"here".to_vec()),
            }]
        );
        assert_eq!(reg.state(7), Some(Some(&b"here"[..])));
    }

    #[test]
    fn test_peer_entries_pass_through_untouched() {
        let mut reg = AwarenessRegister::new();
        let (change, revival) = apply_server_awareness(
            &mut reg,
            7,
            vec![AwarenessEntry {
                client_id: 9,
                clock: 1,
                state: Some(b"peer".to_vec()),
            }],
        );
        assert_eq!(change.added, vec![9]);
        assert!(revival.is_empty());
    }

    #[test]
    fn test_own_tombstone_lands_when_no_local_state() {
        // Nothing to defend: the client never announced, so the tombstone
        // is stored like any other entry.
        let mut reg = AwarenessRegister::new();
        let (change, revival) = apply_server_awareness(
            &mut reg,
            7,
            vec![AwarenessEntry {
                client_id: 7,
                clock: 4,
                state: None,
            }],
        );
        assert!(change.is_empty());
        assert!(revival.is_empty());
        assert_eq!(reg.clock(7), Some(4));
    }

    #[test]
    fn test_stale_own_tombstone_yields_no_revival() {
        let mut reg = AwarenessRegister::new();
        reg.set_local_state(7, Some(b"s".to_vec()));
        reg.set_local_state(7, Some(b"s2".to_vec()));
        reg.set_local_state(7, Some(b"s3".to_vec())); // clock 3

        // A long-delayed removal from before our announcements. Outbidding
        // it would not beat our own clock, so nothing goes upstream.
        let (change, revival) = apply_server_awareness(
            &mut reg,
            7,
            vec![AwarenessEntry {
                client_id: 7,
                clock: 1,
                state: None,
            }],
        );
        assert!(change.is_empty());
        assert!(revival.is_empty());
        assert_eq!(reg.clock(7), Some(3));
        assert_eq!(reg.state(7), Some(Some(&b"s3"[..])));
    }
}
