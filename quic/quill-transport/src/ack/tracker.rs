// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tracks which received packets still need acknowledging and builds ACK
//! frames.

use core::time::Duration;
use quill_core::{
    frame::{ack, Ack, AckBlock},
    time::Timestamp,
    varint::VarInt,
};
use smallvec::SmallVec;

/// A contiguous run of received packet numbers `[largest - len + 1, largest]`
#[derive(Clone, Copy, Debug)]
struct Run {
    largest: u64,
    len: u64,
    /// Receipt time of the newest packet in the run
    ts: Timestamp,
}

/// The set of acknowledgeable packets for one packet-number space
///
/// Runs are bounded: once the tracker is full the lowest run is dropped,
/// so an ACK built later may forget old ranges. Peers recover by
/// retransmitting, which re-enters the range here.
#[derive(Debug, Default)]
pub struct AckTracker {
    /// Descending by `largest`; at most `MAX_ACK_BLKS + 1` runs
    runs: SmallVec<[Run; ack::MAX_ACK_BLKS + 1]>,
    /// Set on reordered arrivals; the next send must carry an ACK
    immediate: bool,
    /// Ack-eliciting packets received since the last ACK was sent
    eliciting_unacked: usize,
    first_eliciting_ts: Option<Timestamp>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records receipt of `pkt_num`; duplicates must be filtered out by the
    /// caller via the gap tracker
    pub fn add(&mut self, pkt_num: u64, eliciting: bool, ts: Timestamp) {
        if eliciting {
            self.eliciting_unacked += 1;
            self.first_eliciting_ts.get_or_insert(ts);
        }

        let in_order = match self.runs.first() {
            None => pkt_num == 0,
            Some(top) => pkt_num == top.largest + 1,
        };
        if !in_order {
            self.immediate = true;
        }

        // find the run the number touches, or the insertion point in the
        // descending run list
        let mut idx = 0;
        while idx < self.runs.len() {
            let run = &self.runs[idx];
            if run.largest < pkt_num {
                break;
            }
            let smallest = run.largest - (run.len - 1);
            if pkt_num + 1 >= smallest {
                // touches or extends this run from below; in-run duplicates
                // were already excluded by the caller
                break;
            }
            idx += 1;
        }

        if let Some(run) = self.runs.get_mut(idx) {
            let smallest = run.largest - (run.len - 1);
            if pkt_num == run.largest + 1 {
                run.largest = pkt_num;
                run.len += 1;
                run.ts = ts;
                self.merge_with_prev(idx);
                return;
            }
            if pkt_num + 1 == smallest {
                run.len += 1;
                self.merge_with_next(idx);
                return;
            }
        }

        self.runs.insert(
            idx,
            Run {
                largest: pkt_num,
                len: 1,
                ts,
            },
        );

        // bounded memory: forget the lowest run when full
        if self.runs.len() > ack::MAX_ACK_BLKS + 1 {
            self.runs.pop();
        }
    }

    fn merge_with_prev(&mut self, idx: usize) {
        if idx == 0 {
            return;
        }
        let prev_smallest = self.runs[idx - 1].largest - (self.runs[idx - 1].len - 1);
        if prev_smallest == self.runs[idx].largest + 1 {
            self.runs[idx - 1].len += self.runs[idx].len;
            self.runs.remove(idx);
        }
    }

    fn merge_with_next(&mut self, idx: usize) {
        if idx + 1 >= self.runs.len() {
            return;
        }
        let smallest = self.runs[idx].largest - (self.runs[idx].len - 1);
        if self.runs[idx + 1].largest + 1 == smallest {
            self.runs[idx].len += self.runs[idx + 1].len;
            self.runs.remove(idx + 1);
        }
    }

    /// True when the next transmission must include an ACK frame
    ///
    /// `ack_delay` is the delay budget; older ack-eliciting receipts force
    /// the ACK out, as does the reorder flag or a two-packet backlog.
    pub fn require_active_ack(&self, ack_delay: Duration, now: Timestamp) -> bool {
        if self.immediate {
            return true;
        }
        if self.eliciting_unacked >= 2 {
            return true;
        }
        match self.first_eliciting_ts {
            Some(first) if self.eliciting_unacked > 0 => (first + ack_delay).has_elapsed(now),
            _ => false,
        }
    }

    /// When the delayed-ack timer fires, or `None` while nothing is pending
    pub fn ack_delay_expiry(&self, max_ack_delay: Duration) -> Option<Timestamp> {
        if self.eliciting_unacked == 0 {
            return None;
        }
        self.first_eliciting_ts.map(|first| first + max_ack_delay)
    }

    /// Builds an ACK frame covering the tracked runs
    ///
    /// `encode_delay` scales the host delay into the wire representation
    /// (the local ack_delay_exponent).
    pub fn generate(
        &self,
        now: Timestamp,
        encode_delay: impl Fn(Duration) -> VarInt,
    ) -> Option<Ack> {
        let top = self.runs.first()?;

        let ack_delay = encode_delay(now.saturating_duration_since(top.ts));
        let mut blocks = SmallVec::new();
        let mut prev_smallest = top.largest - (top.len - 1);

        for run in self.runs.iter().skip(1).take(ack::MAX_ACK_BLKS) {
            let gap = prev_smallest - run.largest - 2;
            blocks.push(AckBlock {
                gap: VarInt::new(gap).ok()?,
                len: VarInt::new(run.len - 1).ok()?,
            });
            prev_smallest = run.largest - (run.len - 1);
        }

        Some(Ack {
            largest_ack: VarInt::new(top.largest).ok()?,
            ack_delay,
            first_block: VarInt::new(top.len - 1).ok()?,
            blocks,
            ecn: None,
        })
    }

    /// Called after an ACK frame was sent successfully
    pub fn commit_ack(&mut self) {
        self.immediate = false;
        self.eliciting_unacked = 0;
        self.first_eliciting_ts = None;
    }

    /// Drops runs at or below `largest`: the peer acknowledged an ACK of
    /// ours that covered them, so re-acking is pointless
    pub fn forget(&mut self, largest: u64) {
        self.runs.retain(|run| run.largest > largest);
        // a surviving run may still dip below the threshold; trim it
        if let Some(last) = self.runs.last_mut() {
            let smallest = last.largest - (last.len - 1);
            if smallest <= largest {
                last.len = last.largest - largest;
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.runs.is_empty()
    }

    pub fn pending_eliciting(&self) -> usize {
        self.eliciting_unacked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    fn raw_delay(d: Duration) -> VarInt {
        VarInt::new(d.as_micros() as u64).unwrap_or(VarInt::MAX)
    }

    #[test]
    fn ack_generation_with_gaps() {
        // received packet numbers {0, 1, 2, 4, 6, 7}
        let mut acktr = AckTracker::new();
        for pkt_num in [0u64, 1, 2, 4, 6, 7] {
            acktr.add(pkt_num, true, ts(pkt_num));
        }

        let frame = acktr.generate(ts(10), raw_delay).unwrap();
        assert_eq!(frame.largest_ack, 7u64);
        assert_eq!(frame.first_block, 1u64);
        assert_eq!(frame.blocks.len(), 2);
        // skipping 5
        assert_eq!(frame.blocks[0].gap, 0u64);
        assert_eq!(frame.blocks[0].len, 0u64);
        // skipping 3, covering 0..2
        assert_eq!(frame.blocks[1].gap, 0u64);
        assert_eq!(frame.blocks[1].len, 2u64);

        frame.validate().unwrap();
    }

    #[test]
    fn in_order_runs_coalesce() {
        let mut acktr = AckTracker::new();
        for pkt_num in 0..100u64 {
            acktr.add(pkt_num, true, ts(pkt_num));
        }
        let frame = acktr.generate(ts(100), raw_delay).unwrap();
        assert_eq!(frame.largest_ack, 99u64);
        assert_eq!(frame.first_block, 99u64);
        assert!(frame.blocks.is_empty());
    }

    #[test]
    fn gap_fill_merges_runs() {
        let mut acktr = AckTracker::new();
        acktr.add(0, true, ts(0));
        acktr.add(2, true, ts(1));
        acktr.add(1, true, ts(2));
        let frame = acktr.generate(ts(3), raw_delay).unwrap();
        assert_eq!(frame.largest_ack, 2u64);
        assert_eq!(frame.first_block, 2u64);
        assert!(frame.blocks.is_empty());
    }

    #[test]
    fn reorder_forces_immediate_ack() {
        let mut acktr = AckTracker::new();
        acktr.add(0, true, ts(0));
        assert!(!acktr.require_active_ack(Duration::from_millis(25), ts(1)));

        acktr.add(2, true, ts(1));
        assert!(acktr.require_active_ack(Duration::from_millis(25), ts(1)));

        acktr.commit_ack();
        assert!(!acktr.require_active_ack(Duration::from_millis(25), ts(2)));
    }

    #[test]
    fn two_eliciting_packets_force_ack() {
        let mut acktr = AckTracker::new();
        acktr.add(0, true, ts(0));
        acktr.add(1, true, ts(1));
        assert!(acktr.require_active_ack(Duration::from_millis(25), ts(1)));
    }

    #[test]
    fn delay_budget_expires() {
        let mut acktr = AckTracker::new();
        acktr.add(0, true, ts(0));
        let delay = Duration::from_millis(3);
        assert!(!acktr.require_active_ack(delay, ts(2)));
        assert!(acktr.require_active_ack(delay, ts(3)));
        assert_eq!(
            acktr.ack_delay_expiry(Duration::from_millis(25)),
            Some(ts(25))
        );
    }

    #[test]
    fn non_eliciting_receipts_do_not_arm_the_timer() {
        let mut acktr = AckTracker::new();
        acktr.add(0, false, ts(0));
        assert!(acktr.ack_delay_expiry(Duration::from_millis(25)).is_none());
        assert!(!acktr.require_active_ack(Duration::from_millis(25), ts(100)));
        // still reportable once an ACK does go out
        assert!(acktr.generate(ts(100), raw_delay).is_some());
    }

    #[test]
    fn overflow_forgets_lowest_run() {
        let mut acktr = AckTracker::new();
        // isolated runs: 0, 10, 20, ... far apart
        for i in 0..(quill_core::frame::ack::MAX_ACK_BLKS as u64 + 3) {
            acktr.add(i * 10, true, ts(i));
        }
        let frame = acktr.generate(ts(100), raw_delay).unwrap();
        // the lowest runs fell off; the frame still validates
        frame.validate().unwrap();
        assert_eq!(frame.blocks.len(), quill_core::frame::ack::MAX_ACK_BLKS);
    }

    #[test]
    fn forget_drops_acked_history() {
        let mut acktr = AckTracker::new();
        for pkt_num in [0u64, 1, 2, 5, 6, 10] {
            acktr.add(pkt_num, true, ts(pkt_num));
        }
        acktr.forget(6);
        let frame = acktr.generate(ts(20), raw_delay).unwrap();
        assert_eq!(frame.largest_ack, 10u64);
        assert_eq!(frame.first_block, 0u64);
        assert!(frame.blocks.is_empty());
    }
}
