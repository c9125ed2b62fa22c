//! Document replica: a thin handle over the CRDT that the sync layer talks
//! through.
//!
//! The replica exposes exactly the operations the protocol needs — encode a
//! state vector, diff against one, apply an update — plus an update hook
//! that reports *where* each change came from. Applying a remote update
//! runs in a transaction tagged with the originating connection id; the
//! hook reads that tag off the transaction so relays can skip echoing an
//! update back to its sender and clients can tell their own edits from the
//! server's. Local edits commit untagged transactions and report no origin,
//! however they interleave with remote applies.
//!
//! Convergence, idempotence, and commutativity of updates are properties of
//! the CRDT itself; this layer only has to deliver bytes and never reorder
//! a single peer's frames.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types"
//! (INRIA RR-7687, 2011).

use std::error::Error;
use std::fmt;

use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

/// Errors from feeding CRDT payloads into the replica.
///
/// Unlike framing errors these are recoverable: the offending payload is
/// dropped and the replica (and the connection that sent it) live on.
#[derive(Debug, Clone)]
pub enum DocError {
    /// The payload failed to decode or apply as a CRDT update.
    CorruptUpdate(String),
}

impl fmt::Display for DocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptUpdate(reason) => write!(f, "corrupt update: {reason}"),
        }
    }
}

impl Error for DocError {}

/// A synchronized document replica.
pub struct DocReplica {
    doc: Doc,
    _subscription: Option<Subscription>,
}

/// A connection id as a transaction origin tag.
fn origin_tag(id: Uuid) -> Origin {
    Origin::from(&id.as_bytes()[..])
}

/// The connection id carried by a transaction origin, if it is one.
fn origin_id(origin: &Origin) -> Option<Uuid> {
    Uuid::from_slice(origin.as_ref()).ok()
}

impl DocReplica {
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            _subscription: None,
        }
    }

    /// The underlying document, for local edits and reads.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The CRDT client id local edits are attributed to.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Encodes the replica's state vector ("what I have seen").
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encodes everything the holder of `state_vector` is missing.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocError::CorruptUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Encodes the entire document as one update.
    pub fn full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Applies an encoded update, attributing it to `origin`. Applying the
    /// same update twice is a no-op, so redelivery is harmless.
    pub fn apply_update(&self, update: &[u8], origin: Option<Uuid>) -> Result<(), DocError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocError::CorruptUpdate(e.to_string()))?;
        // The origin rides on the transaction itself, so concurrent local
        // edits in their own transactions stay unattributed.
        let mut txn = match origin {
            Some(id) => self.doc.transact_mut_with(origin_tag(id)),
            None => self.doc.transact_mut(),
        };
        txn.apply_update(decoded)
            .map_err(|e| DocError::CorruptUpdate(e.to_string()))
    }

    /// Registers the update hook. Fires once per committed transaction that
    /// actually changed the document, with the encoded incremental update
    /// and the origin it was applied under (`None` for local edits).
    ///
    /// Call before sharing the replica; later registrations replace the
    /// earlier hook.
    pub fn on_update(&mut self, callback: impl Fn(&[u8], Option<Uuid>) + Send + Sync + 'static) {
        match self.doc.observe_update_v1(move |txn, event| {
            let origin = txn.origin().and_then(origin_id);
            callback(&event.update, origin);
        }) {
            Ok(subscription) => self._subscription = Some(subscription),
            Err(e) => log::error!("Failed to register document update hook: {e}"),
        }
    }
}

impl Default for DocReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use yrs::{GetString, Text, WriteTxn};

    fn insert_text(replica: &DocReplica, name: &str, index: u32, chunk: &str) {
        let mut txn = replica.doc().transact_mut();
        let text = txn.get_or_insert_text(name);
        text.insert(&mut txn, index, chunk);
    }

    fn read_text(replica: &DocReplica, name: &str) -> String {
        let txn = replica.doc().transact();
        txn.get_text(name)
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[test]
    fn test_empty_state_vector_is_single_zero() {
        let replica = DocReplica::new();
        assert_eq!(replica.state_vector(), vec![0]);
    }

    #[test]
    fn test_diff_since_empty_returns_full_history() {
        let a = DocReplica::new();
        insert_text(&a, "body", 0, "hello");

        let b = DocReplica::new();
        let diff = a.diff_since(&b.state_vector()).unwrap();
        b.apply_update(&diff, None).unwrap();
        assert_eq!(read_text(&b, "body"), "hello");
    }

    #[test]
    fn test_handshake_reaches_equal_state_vectors() {
        let a = DocReplica::new();
        let b = DocReplica::new();
        insert_text(&a, "body", 0, "server side");
        insert_text(&b, "body", 0, "client side");

        // Both directions of the step1/step2 exchange.
        let to_b = a.diff_since(&b.state_vector()).unwrap();
        let to_a = b.diff_since(&a.state_vector()).unwrap();
        b.apply_update(&to_b, None).unwrap();
        a.apply_update(&to_a, None).unwrap();

        assert_eq!(a.state_vector(), b.state_vector());
        assert_eq!(read_text(&a, "body"), read_text(&b, "body"));
    }

    #[test]
    fn test_updates_commute() {
        let a = DocReplica::new();
        let b = DocReplica::new();
        insert_text(&a, "body", 0, "aaa");
        insert_text(&b, "body", 0, "bbb");
        let update_a = a.full_state();
        let update_b = b.full_state();

        let first = DocReplica::new();
        first.apply_update(&update_a, None).unwrap();
        first.apply_update(&update_b, None).unwrap();

        let second = DocReplica::new();
        second.apply_update(&update_b, None).unwrap();
        second.apply_update(&update_a, None).unwrap();

        assert_eq!(first.full_state(), second.full_state());
        assert_eq!(read_text(&first, "body"), read_text(&second, "body"));
    }

    #[test]
    fn test_duplicate_apply_is_noop() {
        let a = DocReplica::new();
        insert_text(&a, "body", 0, "once");
        let update = a.full_state();

        let b = DocReplica::new();
        b.apply_update(&update, None).unwrap();
        let before = b.state_vector();
        b.apply_update(&update, None).unwrap();
        assert_eq!(b.state_vector(), before);
        assert_eq!(read_text(&b, "body"), "once");
    }

    #[test]
    fn test_corrupt_update_is_reported_and_survivable() {
        let replica = DocReplica::new();
        insert_text(&replica, "body", 0, "keep");

        let err = replica.apply_update(&[0xFF, 0x00, 0x13, 0x37], None);
        assert!(matches!(err, Err(DocError::CorruptUpdate(_))));

        // The replica keeps working after rejecting garbage.
        insert_text(&replica, "body", 4, " going");
        assert_eq!(read_text(&replica, "body"), "keep going");
    }

    #[test]
    fn test_corrupt_state_vector_is_reported() {
        let replica = DocReplica::new();
        assert!(matches!(
            replica.diff_since(&[0xFF, 0xFF, 0xFF]),
            Err(DocError::CorruptUpdate(_))
        ));
    }

    #[test]
    fn test_update_hook_reports_origin() {
        let seen: Arc<Mutex<Vec<Option<Uuid>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut replica = DocReplica::new();
        {
            let seen = seen.clone();
            replica.on_update(move |_update, origin| {
                seen.lock().unwrap().push(origin);
            });
        }

        // Local edit: no origin.
        insert_text(&replica, "body", 0, "local");

        // Remote update: tagged with the connection it came from.
        let remote = DocReplica::new();
        insert_text(&remote, "body", 0, "remote");
        let origin = Uuid::new_v4();
        replica.apply_update(&remote.full_state(), Some(origin)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[None, Some(origin)]);
    }

    #[test]
    fn test_local_edits_stay_unattributed_under_concurrent_applies() {
        let seen: Arc<Mutex<Vec<Option<Uuid>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut replica = DocReplica::new();
        {
            let seen = seen.clone();
            replica.on_update(move |_update, origin| {
                seen.lock().unwrap().push(origin);
            });
        }

        // Independent remote updates, each changing the document.
        let remote_origin = Uuid::new_v4();
        let updates: Vec<Vec<u8>> = (0..32)
            .map(|i| {
                let source = DocReplica::new();
                insert_text(&source, "remote", 0, &format!("r{i}"));
                source.full_state()
            })
            .collect();

        // Local edits race the remote applies; every local transaction
        // must still report no origin.
        std::thread::scope(|s| {
            s.spawn(|| {
                for update in &updates {
                    replica.apply_update(update, Some(remote_origin)).unwrap();
                }
            });
            for _ in 0..32 {
                insert_text(&replica, "local", 0, "x");
            }
        });

        let seen = seen.lock().unwrap();
        let local = seen.iter().filter(|o| o.is_none()).count();
        let remote = seen.iter().filter(|o| **o == Some(remote_origin)).count();
        assert_eq!(local, 32, "a local edit picked up a remote origin");
        assert_eq!(remote, 32);
    }

    #[test]
    fn test_update_hook_silent_on_duplicate() {
        let source = DocReplica::new();
        insert_text(&source, "body", 0, "dup");
        let update = source.full_state();

        let fired = Arc::new(Mutex::new(0usize));
        let mut replica = DocReplica::new();
        {
            let fired = fired.clone();
            replica.on_update(move |_, _| {
                *fired.lock().unwrap() += 1;
            });
        }

        replica.apply_update(&update, None).unwrap();
        replica.apply_update(&update, None).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_hook_update_bytes_replay_elsewhere() {
        let captured: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let mut a = DocReplica::new();
        {
            let captured = captured.clone();
            a.on_update(move |update, _| {
                captured.lock().unwrap().push(update.to_vec());
            });
        }
        insert_text(&a, "body", 0, "stream");
        insert_text(&a, "body", 6, "ed");

        let b = DocReplica::new();
        for update in captured.lock().unwrap().iter() {
            b.apply_update(update, None).unwrap();
        }
        assert_eq!(read_text(&b, "body"), "streamed");
    }
}
