// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-id lifecycle: the pool of ids we issued (SCIDs) and the
//! rings of ids the peer issued to us (DCIDs).

use crate::{MAX_DCID_POOL, MAX_DCID_RETIRED};
use quill_core::{
    connection::{ConnectionId, StatelessResetToken},
    frame::NewConnectionId,
    time::Timestamp,
    transport::{Error, Result},
    varint::VarInt,
};
use std::collections::VecDeque;

/// A source id we issued to the peer
#[derive(Clone, Debug)]
pub struct ScidEntry {
    pub seq: u64,
    pub cid: ConnectionId,
    pub token: StatelessResetToken,
    /// Seen on an inbound packet at least once
    pub used: bool,
    pub retired: bool,
    pub ts_retired: Option<Timestamp>,
}

/// The ordered set of source ids, replenished via the embedder
#[derive(Debug, Default)]
pub struct ScidPool {
    entries: Vec<ScidEntry>,
    next_seq: u64,
}

impl ScidPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the pool with the handshake-time id (sequence zero)
    pub fn insert_initial(&mut self, cid: ConnectionId, token: StatelessResetToken) {
        debug_assert_eq!(self.next_seq, 0);
        self.entries.push(ScidEntry {
            seq: 0,
            cid,
            token,
            used: true,
            retired: false,
            ts_retired: None,
        });
        self.next_seq = 1;
    }

    /// The handshake-time id (sequence zero)
    pub fn initial_cid(&self) -> ConnectionId {
        debug_assert!(!self.entries.is_empty());
        self.entries[0].cid
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.entries
            .iter()
            .any(|e| !e.retired && e.cid == *cid)
    }

    pub fn find(&mut self, cid: &ConnectionId) -> Option<&mut ScidEntry> {
        self.entries
            .iter_mut()
            .find(|e| !e.retired && e.cid == *cid)
    }

    /// Count of ids the peer has not retired and never seen on a packet
    pub fn unused(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.retired && !e.used)
            .count()
    }

    /// Replenishes the pool to `min` unused ids
    ///
    /// `generate` is the embedder capability; an id colliding with an
    /// extant entry is rejected and the capability asked again.
    pub fn replenish(
        &mut self,
        min: usize,
        mut generate: impl FnMut() -> Result<(ConnectionId, StatelessResetToken)>,
    ) -> Result<Vec<NewConnectionId>> {
        let mut frames = Vec::new();

        while self.unused() < min {
            let mut attempts = 0;
            let (cid, token) = loop {
                let (cid, token) = generate()?;
                if !self.entries.iter().any(|e| e.cid == cid) {
                    break (cid, token);
                }
                attempts += 1;
                if attempts >= 8 {
                    return Err(Error::CallbackFailure);
                }
            };

            let seq = self.next_seq;
            self.next_seq += 1;
            self.entries.push(ScidEntry {
                seq,
                cid,
                token,
                used: false,
                retired: false,
                ts_retired: None,
            });

            frames.push(NewConnectionId {
                sequence: VarInt::new(seq).map_err(|_| Error::Internal)?,
                cid,
                stateless_reset_token: token,
            });
        }

        Ok(frames)
    }

    /// Handles a peer RETIRE_CONNECTION_ID
    ///
    /// The entry is kept for a reordering grace; [`ScidPool::gc`] removes
    /// it later.
    pub fn retire(&mut self, seq: u64, now: Timestamp) -> Result<()> {
        if seq >= self.next_seq {
            //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.16
            //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
            //# number greater than any previously sent to the peer MAY be
            //# treated as a ... PROTOCOL_VIOLATION.
            return Err(Error::Proto);
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.seq == seq) {
            if !entry.retired {
                entry.retired = true;
                entry.ts_retired = Some(now);
            }
        }
        Ok(())
    }

    /// Removes retired entries whose grace has elapsed
    pub fn gc(&mut self, grace: core::time::Duration, now: Timestamp) -> Vec<ScidEntry> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            let expired = e
                .ts_retired
                .map(|ts| (ts + grace).has_elapsed(now))
                .unwrap_or(false);
            if expired {
                removed.push(e.clone());
            }
            !expired
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A destination id the peer issued to us
#[derive(Clone, Debug)]
pub struct DcidEntry {
    pub seq: u64,
    pub cid: ConnectionId,
    pub token: Option<StatelessResetToken>,
    pub ts_retired: Option<Timestamp>,
}

/// The destination-id rings: current, unused and retired
///
/// An id bound to an in-progress path validation lives inside the
/// validator itself; only one validation runs at a time.
#[derive(Debug)]
pub struct DcidTable {
    current: DcidEntry,
    unused: VecDeque<DcidEntry>,
    retired: VecDeque<DcidEntry>,
    /// RETIRE_CONNECTION_ID sequence numbers awaiting transmission
    retire_queue: Vec<u64>,
    largest_seq_seen: u64,
}

impl DcidTable {
    /// Starts with the handshake-time id as sequence zero
    pub fn new(initial: ConnectionId) -> Self {
        Self {
            current: DcidEntry {
                seq: 0,
                cid: initial,
                token: None,
                ts_retired: None,
            },
            unused: VecDeque::new(),
            retired: VecDeque::new(),
            retire_queue: Vec::new(),
            largest_seq_seen: 0,
        }
    }

    #[inline]
    pub fn current(&self) -> &DcidEntry {
        &self.current
    }

    /// The handshake peer id changes as the server reveals its real SCID
    pub fn update_current_cid(&mut self, cid: ConnectionId) {
        self.current.cid = cid;
    }

    /// The peer's handshake transport parameters carry the reset token for
    /// the current id
    pub fn set_current_token(&mut self, token: StatelessResetToken) {
        self.current.token = Some(token);
    }

    pub fn has_unused(&self) -> bool {
        !self.unused.is_empty()
    }

    /// Records a NEW_CONNECTION_ID frame
    pub fn on_new_connection_id(&mut self, frame: &NewConnectionId) -> Result<()> {
        let seq = frame.sequence.as_u64();
        let token = frame.stateless_reset_token;

        // retransmissions must agree with what we already hold
        let all = core::iter::once(&self.current)
            .chain(self.unused.iter())
            .chain(self.retired.iter());
        for known in all {
            if known.seq == seq {
                if known.cid != frame.cid || known.token.is_some_and(|t| t != token) {
                    return Err(Error::Proto);
                }
                return Ok(());
            }
            if known.cid == frame.cid && known.seq != seq {
                return Err(Error::Proto);
            }
        }

        // a sequence we already retired and forgot
        if self.retire_queue.contains(&seq) {
            return Ok(());
        }

        self.largest_seq_seen = self.largest_seq_seen.max(seq);

        if self.unused.len() >= MAX_DCID_POOL {
            // no room: retire the newcomer immediately
            self.retire_queue.push(seq);
            return Ok(());
        }

        self.unused.push_back(DcidEntry {
            seq,
            cid: frame.cid,
            token: Some(token),
            ts_retired: None,
        });
        Ok(())
    }

    /// Takes an unused id for a path probe or migration
    pub fn take_unused(&mut self) -> Option<DcidEntry> {
        self.unused.pop_front()
    }

    /// Swaps the active id without retiring anything, returning the old
    /// one; migration holds it as the fallback
    pub fn replace_current(&mut self, next: DcidEntry) -> DcidEntry {
        core::mem::replace(&mut self.current, next)
    }

    /// Retires an id we are finished with: a RETIRE_CONNECTION_ID is
    /// queued and the entry parks in the retired ring for the reordering
    /// grace. Returns an entry displaced past the ring bound, which must
    /// be reported to the embedder immediately.
    pub fn retire_entry(&mut self, mut entry: DcidEntry, now: Timestamp) -> Option<DcidEntry> {
        entry.ts_retired = Some(now);
        self.retire_queue.push(entry.seq);
        self.retired.push_back(entry);

        if self.retired.len() > MAX_DCID_RETIRED {
            return self.retired.pop_front();
        }
        None
    }

    /// Sequence numbers to emit RETIRE_CONNECTION_ID frames for
    pub fn drain_retire_queue(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.retire_queue)
    }

    pub fn requeue_retire(&mut self, seq: u64) {
        self.retire_queue.push(seq);
    }

    /// Removes retired entries whose grace elapsed, reporting them so the
    /// embedder can unmap the ids
    pub fn gc(&mut self, grace: core::time::Duration, now: Timestamp) -> Vec<DcidEntry> {
        let mut removed = Vec::new();
        while let Some(front) = self.retired.front() {
            let expired = front
                .ts_retired
                .map(|ts| (ts + grace).has_elapsed(now))
                .unwrap_or(true);
            if !expired {
                break;
            }
            removed.push(self.retired.pop_front().expect("front just observed"));
        }
        removed
    }

    /// Constant-time match of a trailing stateless-reset token against
    /// every id associated with the peer
    pub fn token_matches(&self, candidate: &StatelessResetToken) -> bool {
        core::iter::once(&self.current)
            .chain(self.unused.iter())
            .filter_map(|e| e.token.as_ref())
            .any(|token| token == candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn cid(b: u8) -> ConnectionId {
        ConnectionId::try_from_slice(&[b; 8]).unwrap()
    }

    fn token(b: u8) -> StatelessResetToken {
        StatelessResetToken::new([b; 16])
    }

    fn ncid(seq: u64, b: u8) -> NewConnectionId {
        NewConnectionId {
            sequence: VarInt::new(seq).unwrap(),
            cid: cid(b),
            stateless_reset_token: token(b),
        }
    }

    #[test]
    fn scid_pool_replenishes_and_rejects_collisions() {
        let mut pool = ScidPool::new();
        pool.insert_initial(cid(0), token(0));

        // the generator collides once, then produces fresh ids
        let mut counter = 0u8;
        let frames = pool
            .replenish(2, || {
                counter += 1;
                if counter == 1 {
                    Ok((cid(0), token(0)))
                } else {
                    Ok((cid(counter), token(counter)))
                }
            })
            .unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 1u64);
        assert_eq!(frames[1].sequence, 2u64);
        assert_eq!(pool.unused(), 2);
        assert!(pool.contains(&cid(2)));
    }

    #[test]
    fn scid_retire_grace() {
        let mut pool = ScidPool::new();
        pool.insert_initial(cid(0), token(0));
        pool.replenish(1, || Ok((cid(1), token(1)))).unwrap();

        let now = Timestamp::ZERO;
        pool.retire(1, now).unwrap();
        // still present during the grace: reordered packets may use it
        assert_eq!(pool.len(), 2);

        let grace = Duration::from_secs(2);
        assert!(pool.gc(grace, now + Duration::from_secs(1)).is_empty());
        let removed = pool.gc(grace, now + Duration::from_secs(2));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].seq, 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn scid_retire_of_unissued_seq_is_a_violation() {
        let mut pool = ScidPool::new();
        pool.insert_initial(cid(0), token(0));
        assert_eq!(pool.retire(7, Timestamp::ZERO).unwrap_err(), Error::Proto);
    }

    #[test]
    fn dcid_pool_caps_and_retires_overflow() {
        let mut table = DcidTable::new(cid(0));
        for seq in 1..=(MAX_DCID_POOL as u64 + 2) {
            table.on_new_connection_id(&ncid(seq, seq as u8)).unwrap();
        }
        // two newcomers over the cap went straight to the retire queue
        assert_eq!(table.drain_retire_queue().len(), 2);
        assert!(table.has_unused());
    }

    #[test]
    fn dcid_retransmissions_must_agree() {
        let mut table = DcidTable::new(cid(0));
        table.on_new_connection_id(&ncid(1, 1)).unwrap();
        // exact retransmission: fine
        table.on_new_connection_id(&ncid(1, 1)).unwrap();
        // same sequence, different id: protocol violation
        assert_eq!(
            table.on_new_connection_id(&ncid(1, 9)).unwrap_err(),
            Error::Proto
        );
        // same id, different sequence: protocol violation
        let mut dup = ncid(2, 1);
        dup.stateless_reset_token = token(1);
        assert_eq!(table.on_new_connection_id(&dup).unwrap_err(), Error::Proto);
    }

    #[test]
    fn migration_swaps_then_retires() {
        let mut table = DcidTable::new(cid(0));
        table.on_new_connection_id(&ncid(1, 1)).unwrap();

        let next = table.take_unused().unwrap();
        let now = Timestamp::ZERO;
        let old = table.replace_current(next);
        assert_eq!(table.current().seq, 1);
        assert_eq!(old.seq, 0);

        // validation succeeded: the old id is done for good
        assert!(table.retire_entry(old, now).is_none());
        assert_eq!(table.drain_retire_queue(), vec![0]);

        let removed = table.gc(Duration::from_secs(1), now + Duration::from_secs(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].seq, 0);
    }

    #[test]
    fn reset_token_detection() {
        let mut table = DcidTable::new(cid(0));
        table.set_current_token(token(5));
        assert!(table.token_matches(&token(5)));
        assert!(!table.token_matches(&token(6)));
    }
}
