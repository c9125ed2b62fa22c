//! Real-time document synchronization over WebSocket.
//!
//! Rooms of connected peers share a CRDT document and an ephemeral
//! awareness table. The server is a relay: it merges updates into its own
//! replica so late joiners can bootstrap from a single diff, and otherwise
//! fans frames out to the rest of the room without interpreting them.
//!
//! ```text
//! ┌────────────┐     updates, presence      ┌────────────────────┐
//! │ SyncClient │ ◄════════════════════════► │ SyncServer         │
//! │  replica   │         WebSocket          │  RoomManager       │
//! │  awareness │                            │   └─ Room per name │
//! └────────────┘                            └────────────────────┘
//! ```
//!
//! | module      | concern                                        |
//! |-------------|------------------------------------------------|
//! | `protocol`  | varint codec and the binary message envelope   |
//! | `doc`       | CRDT replica handle with origin-tagged updates |
//! | `awareness` | presence register ordered by logical clocks    |
//! | `room`      | shared session state and broadcast fan-out     |
//! | `server`    | WebSocket relay                                |
//! | `client`    | provider that keeps a local replica in sync    |

pub mod awareness;
pub mod client;
pub mod doc;
pub mod protocol;
pub mod room;
pub mod server;

pub use awareness::{AwarenessChange, AwarenessRegister, OUTDATED_TIMEOUT};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use doc::{DocError, DocReplica};
pub use protocol::{AwarenessEntry, Message, ProtocolError, SyncMessage};
pub use room::{BroadcastFrame, BroadcastPolicy, Room, RoomConfig, RoomManager, RoomStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
