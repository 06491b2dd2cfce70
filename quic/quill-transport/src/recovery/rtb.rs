// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-flight packet records: ack processing and loss detection feed off
//! the entries kept here.

use crate::recovery::PACKET_THRESHOLD;
use core::time::Duration;
use quill_core::{frame::FrameOwned, time::Timestamp};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Entry property bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtbFlags(u8);

impl RtbFlags {
    pub const ACK_ELICITING: Self = Self(0x01);
    pub const CRYPTO_PKT: Self = Self(0x02);
    pub const PROBE: Self = Self(0x04);

    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A sent, not-yet-acknowledged packet; immutable once created
///
/// The entry owns the frames to reschedule if the packet is declared
/// lost. Rescheduling transfers them back to their per-kind queues.
#[derive(Debug)]
pub struct RtbEntry {
    pub pkt_num: u64,
    pub frames: SmallVec<[FrameOwned; 4]>,
    pub ts: Timestamp,
    /// Wire size, the packet's contribution to bytes in flight
    pub size: usize,
    pub flags: RtbFlags,
    /// Largest-acknowledged field of an ACK frame this packet carried
    pub ack_largest: Option<u64>,
}

impl RtbEntry {
    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        self.flags.contains(RtbFlags::ACK_ELICITING)
    }

    #[inline]
    pub fn is_crypto(&self) -> bool {
        self.flags.contains(RtbFlags::CRYPTO_PKT)
    }

    #[inline]
    pub fn is_probe(&self) -> bool {
        self.flags.contains(RtbFlags::PROBE)
    }
}

/// Per-space retransmit buffer keyed by packet number
#[derive(Debug, Default)]
pub struct RetransmitBuffer {
    entries: BTreeMap<u64, RtbEntry>,
    /// Earliest future time at which an entry crosses the time threshold
    loss_time: Option<Timestamp>,
}

impl RetransmitBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: RtbEntry) {
        debug_assert!(!self.entries.contains_key(&entry.pkt_num));
        self.entries.insert(entry.pkt_num, entry);
    }

    pub fn remove(&mut self, pkt_num: u64) -> Option<RtbEntry> {
        self.entries.remove(&pkt_num)
    }

    pub fn contains(&self, pkt_num: u64) -> bool {
        self.entries.contains_key(&pkt_num)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn loss_time(&self) -> Option<Timestamp> {
        self.loss_time
    }

    pub fn has_ack_eliciting(&self) -> bool {
        self.entries.values().any(|e| e.is_ack_eliciting())
    }

    pub fn has_crypto_inflight(&self) -> bool {
        self.entries.values().any(|e| e.is_crypto())
    }

    /// Send time of the newest ack-eliciting entry
    pub fn last_eliciting_ts(&self) -> Option<Timestamp> {
        self.entries
            .values()
            .rev()
            .find(|e| e.is_ack_eliciting())
            .map(|e| e.ts)
    }

    /// Declares entries below `largest_acked` lost by packet threshold or
    /// by age, removes and returns them, and re-arms `loss_time` for the
    /// survivors
    pub fn detect_lost(
        &mut self,
        largest_acked: u64,
        loss_delay: Duration,
        now: Timestamp,
    ) -> Vec<RtbEntry> {
        let mut lost = Vec::new();
        self.loss_time = None;

        let candidates: Vec<u64> = self
            .entries
            .range(..largest_acked)
            .map(|(&pkt_num, _)| pkt_num)
            .collect();

        for pkt_num in candidates {
            let entry = &self.entries[&pkt_num];

            let by_packets = largest_acked - pkt_num >= PACKET_THRESHOLD;
            let by_time = (entry.ts + loss_delay).has_elapsed(now);

            if by_packets || by_time {
                lost.push(self.entries.remove(&pkt_num).expect("candidate key present"));
            } else {
                let when = entry.ts + loss_delay;
                self.loss_time = Some(match self.loss_time {
                    Some(t) => t.min(when),
                    None => when,
                });
            }
        }

        lost
    }

    /// Removes and returns every entry in the inclusive packet-number
    /// range, lowest first
    pub fn take_range(&mut self, smallest: u64, largest: u64) -> Vec<RtbEntry> {
        let keys: Vec<u64> = self
            .entries
            .range(smallest..=largest)
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter()
            .map(|k| self.entries.remove(&k).expect("key just collected"))
            .collect()
    }

    /// Removes and returns every entry carrying CRYPTO data, for handshake
    /// retransmission
    pub fn drain_crypto(&mut self) -> Vec<RtbEntry> {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_crypto())
            .map(|(&k, _)| k)
            .collect();
        keys.into_iter()
            .map(|k| self.entries.remove(&k).expect("key just collected"))
            .collect()
    }

    /// Removes and returns everything (Retry flush, rejected early data)
    pub fn drain_all(&mut self) -> Vec<RtbEntry> {
        self.loss_time = None;
        let entries = core::mem::take(&mut self.entries);
        entries.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::{loss_delay, RttEstimator};
    use quill_core::frame::{Frame, Ping};
    use smallvec::smallvec;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    fn entry(pkt_num: u64, at: Timestamp) -> RtbEntry {
        RtbEntry {
            pkt_num,
            frames: smallvec![Frame::Ping(Ping)],
            ts: at,
            size: 1200,
            flags: RtbFlags::ACK_ELICITING,
            ack_largest: None,
        }
    }

    #[test]
    fn ack_removes_entry() {
        let mut rtb = RetransmitBuffer::new();
        rtb.add(entry(1, ts(0)));
        rtb.add(entry(2, ts(0)));
        assert!(rtb.remove(1).is_some());
        assert!(rtb.remove(1).is_none());
        assert_eq!(rtb.len(), 1);
    }

    #[test]
    fn reordered_ack_declares_stragglers_lost() {
        // packets 1, 2, 3 in flight at t=0 with srtt = 20ms; at t=40ms the
        // peer acks only packet 3
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::from_millis(20), Duration::ZERO, Duration::ZERO);

        let mut rtb = RetransmitBuffer::new();
        rtb.add(entry(1, ts(0)));
        rtb.add(entry(2, ts(0)));
        rtb.add(entry(3, ts(0)));

        // the time threshold is computed before this ack's RTT sample
        let delay = loss_delay(&rtt);
        assert_eq!(delay, Duration::from_micros(22_500));

        let acked = rtb.remove(3).unwrap();
        assert_eq!(acked.pkt_num, 3);

        let lost = rtb.detect_lost(3, delay, ts(40));
        let lost_nums: Vec<u64> = lost.iter().map(|e| e.pkt_num).collect();
        assert_eq!(lost_nums, vec![1, 2]);
        assert!(rtb.is_empty());

        // their frames come back for rescheduling
        for entry in &lost {
            assert_eq!(entry.frames.len(), 1);
        }
    }

    #[test]
    fn packet_threshold_alone_declares_loss() {
        let mut rtb = RetransmitBuffer::new();
        rtb.add(entry(0, ts(0)));
        rtb.add(entry(9, ts(0)));

        // enormous delay so only the packet threshold can fire
        let lost = rtb.detect_lost(10, Duration::from_secs(3600), ts(1));
        let lost_nums: Vec<u64> = lost.iter().map(|e| e.pkt_num).collect();
        assert_eq!(lost_nums, vec![0]);

        // packet 9 survives and arms the loss timer
        assert!(rtb.loss_time().is_some());
        assert!(!rtb.is_empty());
    }

    #[test]
    fn entries_above_largest_acked_are_untouched() {
        let mut rtb = RetransmitBuffer::new();
        rtb.add(entry(5, ts(0)));
        let lost = rtb.detect_lost(5, Duration::ZERO, ts(1000));
        assert!(lost.is_empty());
        assert!(rtb.contains(5));
        assert!(rtb.loss_time().is_none());
    }

    #[test]
    fn crypto_drain_is_selective() {
        let mut rtb = RetransmitBuffer::new();
        let mut crypto = entry(1, ts(0));
        crypto.flags = RtbFlags::ACK_ELICITING.with(RtbFlags::CRYPTO_PKT);
        rtb.add(crypto);
        rtb.add(entry(2, ts(0)));

        let drained = rtb.drain_crypto();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pkt_num, 1);
        assert!(rtb.contains(2));
    }
}
