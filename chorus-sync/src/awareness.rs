//! Ephemeral presence: a per-room register of client states ordered by
//! logical clocks.
//!
//! Unlike document content, awareness state (cursors, selections, user
//! names) is never merged and never persisted. Each client owns exactly one
//! entry, identified by its numeric client id, and newer announcements
//! simply replace older ones. A per-client logical clock decides "newer":
//!
//! ```text
//! incoming (clock, state) vs known (clock, state)
//! ────────────────────────────────────────────────
//! clock  > known.clock                → accept
//! clock == known.clock, state = null  → accept if known is non-null
//! otherwise                           → reject (stale, silent)
//! ```
//!
//! The null tie-break lets a relay declare a client offline at the clock it
//! last saw, without racing announcements the client made just before it
//! vanished. Entries that stop being refreshed are swept after
//! [`OUTDATED_TIMEOUT`], so a crashed peer disappears even if nobody
//! announced its departure.
//!
//! Reference: Kleppmann, "Designing Data-Intensive Applications", Chapter 8
//! (unreliable clocks — this is why the ordering is logical, not wall-time).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::AwarenessEntry;

/// How long an entry may go without a refresh before the sweeper deletes it.
pub const OUTDATED_TIMEOUT: Duration = Duration::from_millis(30_000);

/// One client's tracked state.
#[derive(Debug, Clone)]
struct ClientEntry {
    state: Option<Vec<u8>>,
    clock: u64,
    last_updated: Instant,
}

impl ClientEntry {
    fn is_online(&self) -> bool {
        self.state.is_some()
    }
}

/// The classified outcome of a register mutation.
///
/// `added` / `updated` / `removed` partition the client ids whose visible
/// state changed; `entries` carries the wire-ready form of each accepted
/// entry so the caller can forward exactly what it applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessChange {
    /// True when no visible state changed (nothing to forward or report).
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Register
// ─────────────────────────────────────────────────────────────────────────────

/// The awareness table for one room (or one client's local view).
///
/// Not internally synchronized; callers wrap it in whatever lock guards the
/// rest of the room state.
#[derive(Debug)]
pub struct AwarenessRegister {
    entries: HashMap<u64, ClientEntry>,
    outdated_timeout: Duration,
}

impl AwarenessRegister {
    pub fn new() -> Self {
        Self::with_timeout(OUTDATED_TIMEOUT)
    }

    pub fn with_timeout(outdated_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            outdated_timeout,
        }
    }

    pub fn outdated_timeout(&self) -> Duration {
        self.outdated_timeout
    }

    /// Number of tracked entries, offline tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of clients currently announcing a non-null state.
    pub fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_online()).count()
    }

    /// The tracked state of `client_id`: `None` if never seen, `Some(None)`
    /// if seen but offline.
    pub fn state(&self, client_id: u64) -> Option<Option<&[u8]>> {
        self.entries
            .get(&client_id)
            .map(|e| e.state.as_deref())
    }

    pub fn clock(&self, client_id: u64) -> Option<u64> {
        self.entries.get(&client_id).map(|e| e.clock)
    }

    pub fn last_updated(&self, client_id: u64) -> Option<Instant> {
        self.entries.get(&client_id).map(|e| e.last_updated)
    }

    /// The wire-ready form of one entry.
    pub fn entry(&self, client_id: u64) -> Option<AwarenessEntry> {
        self.entries.get(&client_id).map(|e| AwarenessEntry {
            client_id,
            clock: e.clock,
            state: e.state.clone(),
        })
    }

    /// Every tracked entry in wire form, suitable for bootstrapping a peer
    /// that just joined.
    pub fn snapshot(&self) -> Vec<AwarenessEntry> {
        self.entries
            .iter()
            .map(|(&client_id, e)| AwarenessEntry {
                client_id,
                clock: e.clock,
                state: e.state.clone(),
            })
            .collect()
    }

    /// Announces this process's own state, bumping the entry's clock so the
    /// announcement supersedes everything peers have seen from this client.
    pub fn set_local_state(&mut self, client_id: u64, state: Option<Vec<u8>>) -> AwarenessChange {
        let clock = self.entries.get(&client_id).map_or(0, |e| e.clock) + 1;
        let mut change = AwarenessChange::default();
        self.accept(client_id, clock, state, Instant::now(), &mut change);
        change
    }

    /// Applies a batch of entries received from a peer. Stale entries are
    /// dropped silently; everything else replaces what is known.
    pub fn apply_remote(&mut self, incoming: Vec<AwarenessEntry>) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();
        for entry in incoming {
            let accepted = match self.entries.get(&entry.client_id) {
                None => true,
                Some(known) => {
                    entry.clock > known.clock
                        || (entry.clock == known.clock
                            && entry.state.is_none()
                            && known.is_online())
                }
            };
            if accepted {
                self.accept(entry.client_id, entry.clock, entry.state, now, &mut change);
            } else {
                log::trace!("Ignoring stale awareness entry for client {}", entry.client_id);
            }
        }
        change
    }

    /// Forces the given clients offline, as when the connection that spoke
    /// for them goes away. Clocks are bumped past the departed client's own
    /// announcements; ids that were never tracked are skipped.
    pub fn remove_states(&mut self, client_ids: &[u64]) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();
        for &client_id in client_ids {
            if let Some(known) = self.entries.get(&client_id) {
                let clock = known.clock + 1;
                self.accept(client_id, clock, None, now, &mut change);
            }
        }
        change
    }

    /// Deletes every entry whose last refresh is older than the configured
    /// timeout, announcing the deletion of any that were still online. The
    /// announced entries reuse the evicted clock: the null tie-break makes
    /// peers accept them without a bump the absent client never made.
    pub fn sweep_expired(&mut self, now: Instant) -> AwarenessChange {
        let timeout = self.outdated_timeout;
        let mut change = AwarenessChange::default();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_updated) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for client_id in expired {
            if let Some(entry) = self.entries.remove(&client_id) {
                if entry.is_online() {
                    change.removed.push(client_id);
                    change.entries.push(AwarenessEntry {
                        client_id,
                        clock: entry.clock,
                        state: None,
                    });
                }
            }
        }
        change
    }

    /// Records an accepted transition and classifies it. A transition from
    /// absent-or-offline to offline updates the clock but is not a visible
    /// change, so it produces no classification.
    fn accept(
        &mut self,
        client_id: u64,
        clock: u64,
        state: Option<Vec<u8>>,
        now: Instant,
        change: &mut AwarenessChange,
    ) {
        let was_online = self
            .entries
            .get(&client_id)
            .is_some_and(|e| e.is_online());
        let visible = match (was_online, state.is_some()) {
            (false, true) => {
                change.added.push(client_id);
                true
            }
            (true, true) => {
                change.updated.push(client_id);
                true
            }
            (true, false) => {
                change.removed.push(client_id);
                true
            }
            (false, false) => false,
        };
        if visible {
            change.entries.push(AwarenessEntry {
                client_id,
                clock,
                state: state.clone(),
            });
        }
        self.entries.insert(
            client_id,
            ClientEntry {
                state,
                clock,
                last_updated: now,
            },
        );
    }
}

impl Default for AwarenessRegister {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(client_id: u64, clock: u64, state: Option<&[u8]>) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            clock,
            state: state.map(|s| s.to_vec()),
        }
    }

    // ── Clock ordering ──

    #[test]
    fn test_higher_clock_wins() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.apply_remote(vec![entry(1, 6, Some(b"b"))]);
        assert_eq!(change.updated, vec![1]);
        assert_eq!(reg.state(1), Some(Some(&b"b"[..])));
        assert_eq!(reg.clock(1), Some(6));
    }

    #[test]
    fn test_equal_clock_rejected() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.apply_remote(vec![entry(1, 5, Some(b"b"))]);
        assert!(change.is_empty());
        assert_eq!(reg.state(1), Some(Some(&b"a"[..])));
    }

    #[test]
    fn test_lower_clock_rejected() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.apply_remote(vec![entry(1, 4, Some(b"old"))]);
        assert!(change.is_empty());
        assert_eq!(reg.clock(1), Some(5));
    }

    #[test]
    fn test_equal_clock_null_tie_break() {
        // An offline announcement at the same clock beats the online state,
        // then the same-clock online state cannot come back.
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.apply_remote(vec![entry(1, 5, None)]);
        assert_eq!(change.removed, vec![1]);
        assert_eq!(reg.state(1), Some(None));

        let change = reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        assert!(change.is_empty());
        assert_eq!(reg.state(1), Some(None));
    }

    #[test]
    fn test_reannounce_after_tie_break_needs_bump() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        reg.apply_remote(vec![entry(1, 5, None)]);
        let change = reg.apply_remote(vec![entry(1, 6, Some(b"a"))]);
        assert_eq!(change.added, vec![1]);
        assert_eq!(reg.state(1), Some(Some(&b"a"[..])));
    }

    #[test]
    fn test_unknown_client_inserted() {
        let mut reg = AwarenessRegister::new();
        let change = reg.apply_remote(vec![entry(42, 17, Some(b"s"))]);
        assert_eq!(change.added, vec![42]);
        assert_eq!(reg.clock(42), Some(17));
    }

    #[test]
    fn test_unknown_client_null_inserts_tombstone_silently() {
        let mut reg = AwarenessRegister::new();
        let change = reg.apply_remote(vec![entry(9, 3, None)]);
        assert!(change.is_empty());
        assert_eq!(reg.state(9), Some(None));
        assert_eq!(reg.clock(9), Some(3));
    }

    #[test]
    fn test_batch_mixes_accept_and_reject() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a")), entry(2, 2, Some(b"b"))]);
        let change = reg.apply_remote(vec![
            entry(1, 4, Some(b"stale")),
            entry(2, 3, Some(b"b2")),
            entry(3, 1, Some(b"c")),
        ]);
        assert_eq!(change.added, vec![3]);
        assert_eq!(change.updated, vec![2]);
        assert!(change.removed.is_empty());
        assert_eq!(change.entries.len(), 2);
    }

    // ── Local state ──

    #[test]
    fn test_set_local_state_bumps_clock() {
        let mut reg = AwarenessRegister::new();
        let change = reg.set_local_state(1, Some(b"x".to_vec()));
        assert_eq!(change.added, vec![1]);
        assert_eq!(reg.clock(1), Some(1));

        let change = reg.set_local_state(1, Some(b"y".to_vec()));
        assert_eq!(change.updated, vec![1]);
        assert_eq!(reg.clock(1), Some(2));

        let change = reg.set_local_state(1, None);
        assert_eq!(change.removed, vec![1]);
        assert_eq!(reg.clock(1), Some(3));
        assert_eq!(reg.state(1), Some(None));
    }

    #[test]
    fn test_set_local_null_without_prior_state_is_silent() {
        let mut reg = AwarenessRegister::new();
        let change = reg.set_local_state(1, None);
        assert!(change.is_empty());
        // The tombstone still exists with a bumped clock.
        assert_eq!(reg.clock(1), Some(1));
    }

    #[test]
    fn test_change_entries_carry_wire_form() {
        let mut reg = AwarenessRegister::new();
        let change = reg.set_local_state(5, Some(b"st".to_vec()));
        assert_eq!(change.entries, vec![entry(5, 1, Some(b"st"))]);
    }

    // ── Removal ──

    #[test]
    fn test_remove_states_bumps_past_own_clock() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.remove_states(&[1]);
        assert_eq!(change.removed, vec![1]);
        assert_eq!(change.entries, vec![entry(1, 6, None)]);
        assert_eq!(reg.state(1), Some(None));
    }

    #[test]
    fn test_remove_states_skips_unknown_ids() {
        let mut reg = AwarenessRegister::new();
        let change = reg.remove_states(&[99]);
        assert!(change.is_empty());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_double_remove_is_silent_but_bumps() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        reg.remove_states(&[1]);
        let change = reg.remove_states(&[1]);
        assert!(change.is_empty());
        assert_eq!(reg.clock(1), Some(7));
    }

    // ── Sweep ──

    #[test]
    fn test_sweep_deletes_expired_entries() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let future = Instant::now() + Duration::from_millis(31_000);
        let change = reg.sweep_expired(future);
        assert_eq!(change.removed, vec![1]);
        // Same clock, null state: peers accept it via the tie-break.
        assert_eq!(change.entries, vec![entry(1, 5, None)]);
        assert_eq!(reg.state(1), None);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a"))]);
        let change = reg.sweep_expired(Instant::now() + Duration::from_millis(29_000));
        assert!(change.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_sweep_deletes_tombstones_silently() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, None)]);
        let change = reg.sweep_expired(Instant::now() + Duration::from_millis(31_000));
        assert!(change.is_empty());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_sweep_respects_custom_timeout() {
        let mut reg = AwarenessRegister::with_timeout(Duration::from_millis(100));
        reg.apply_remote(vec![entry(1, 1, Some(b"a"))]);
        let change = reg.sweep_expired(Instant::now() + Duration::from_millis(150));
        assert_eq!(change.removed, vec![1]);
    }

    #[test]
    fn test_accepted_entry_refreshes_timestamp() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 1, Some(b"a"))]);
        let first = reg.last_updated(1).unwrap();
        reg.apply_remote(vec![entry(1, 2, Some(b"b"))]);
        assert!(reg.last_updated(1).unwrap() >= first);

        // A rejected entry must not extend the lease.
        let before = reg.last_updated(1).unwrap();
        reg.apply_remote(vec![entry(1, 1, Some(b"stale"))]);
        assert_eq!(reg.last_updated(1).unwrap(), before);
    }

    // ── Snapshot ──

    #[test]
    fn test_snapshot_includes_tombstones() {
        let mut reg = AwarenessRegister::new();
        reg.apply_remote(vec![entry(1, 5, Some(b"a")), entry(2, 3, None)]);
        let mut snapshot = reg.snapshot();
        snapshot.sort_by_key(|e| e.client_id);
        assert_eq!(
            snapshot,
            vec![entry(1, 5, Some(b"a")), entry(2, 3, None)]
        );
        assert_eq!(reg.online_count(), 1);
    }

    #[test]
    fn test_snapshot_roundtrips_through_fresh_register() {
        let mut reg = AwarenessRegister::new();
        reg.set_local_state(1, Some(b"here".to_vec()));
        reg.apply_remote(vec![entry(2, 9, Some(b"there"))]);

        let mut other = AwarenessRegister::new();
        let change = other.apply_remote(reg.snapshot());
        assert_eq!(change.added.len(), 2);
        assert_eq!(other.state(2), Some(Some(&b"there"[..])));
    }
}
