// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state: offsets, flow-control windows, reassembly and the
//! outbound fragment queue.

pub mod map;

pub use map::StreamMap;

use crate::{ack::GapTracker, buffer::ReassemblyBuffer};
use quill_core::{
    stream::StreamId,
    transport::{Error, Result},
};
use std::collections::BinaryHeap;

/// Stream lifecycle bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags(u16);

impl StreamFlags {
    /// Our read side is closed; inbound data is discarded
    pub const SHUT_RD: Self = Self(0x01);
    /// Our write side accepts no further data
    pub const SHUT_WR: Self = Self(0x02);
    /// We sent RESET_STREAM
    pub const SENT_RST: Self = Self(0x04);
    /// The peer reset its sending side
    pub const RECV_RST: Self = Self(0x08);
    /// The peer asked us to stop sending
    pub const RECV_STOP_SENDING: Self = Self(0x10);
    /// Our RESET_STREAM was acknowledged
    pub const RST_ACKED: Self = Self(0x20);
    /// We sent a frame carrying FIN
    pub const FIN_SENT: Self = Self(0x40);
    /// The FIN-carrying frame was acknowledged
    pub const FIN_ACKED: Self = Self(0x80);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// A pending run of outbound stream bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamChunk {
    pub offset: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

impl Ord for StreamChunk {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // min-heap by offset via Reverse at the call sites
        self.offset
            .cmp(&other.offset)
            .then_with(|| self.data.len().cmp(&other.data.len()))
    }
}

impl PartialOrd for StreamChunk {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One application stream
#[derive(Debug)]
pub struct Stream {
    id: StreamId,

    // -- send direction
    /// Next fresh byte offset; everything below was enqueued at least once
    tx_offset: u64,
    /// Pending fragments, fresh and rescheduled, lowest offset first
    tx_queue: BinaryHeap<core::cmp::Reverse<StreamChunk>>,
    /// Bytes queued but not yet handed to a packet
    tx_queued_bytes: usize,
    /// The peer's MAX_STREAM_DATA for this stream
    max_tx_offset: u64,
    /// Highest offset ever put on the wire; bytes beyond it are fresh and
    /// consume the connection-level window
    tx_sent_max: u64,
    /// Byte ranges the peer acknowledged
    tx_acked: GapTracker,
    /// Final size once FIN is queued
    fin_tx_offset: Option<u64>,

    // -- receive direction
    rob: ReassemblyBuffer,
    /// The limit we advertised
    max_rx_offset: u64,
    /// The limit we will advertise next, grown as the application reads
    unsent_max_rx_offset: u64,
    /// Initial window size; MAX_STREAM_DATA is scheduled at half-window
    rx_window: u64,
    /// Largest offset seen, for connection-level accounting
    rx_largest_offset: u64,
    /// The peer's final size once known from FIN or RESET_STREAM
    fin_rx_offset: Option<u64>,

    flags: StreamFlags,
    app_error_code: u16,
    /// Round-robin fairness counter for the tx scheduler
    cycle: u64,
    /// True while sitting in the scheduler heap
    scheduled: bool,
    /// The FIN has been handed to the application
    fin_signalled: bool,
}

impl Stream {
    pub fn new(id: StreamId, max_tx_offset: u64, max_rx_offset: u64) -> Self {
        Self {
            id,
            tx_offset: 0,
            tx_queue: BinaryHeap::new(),
            tx_queued_bytes: 0,
            max_tx_offset,
            tx_sent_max: 0,
            tx_acked: GapTracker::new(),
            fin_tx_offset: None,
            rob: ReassemblyBuffer::new(),
            max_rx_offset,
            unsent_max_rx_offset: max_rx_offset,
            rx_window: max_rx_offset,
            rx_largest_offset: 0,
            fin_rx_offset: None,
            flags: StreamFlags::default(),
            app_error_code: 0,
            cycle: 0,
            scheduled: false,
            fin_signalled: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    #[inline]
    pub fn app_error_code(&self) -> u16 {
        self.app_error_code
    }

    #[inline]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub(crate) fn set_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    pub(crate) fn set_scheduled(&mut self, scheduled: bool) {
        self.scheduled = scheduled;
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    // ---- send side ----------------------------------------------------

    /// Queues application bytes, optionally closing the write side
    pub fn write(&mut self, data: &[u8], fin: bool) -> Result<()> {
        if self
            .flags
            .contains(StreamFlags::SHUT_WR)
            || self.flags.contains(StreamFlags::SENT_RST)
        {
            return Err(Error::StreamShutWr);
        }

        let offset = self.tx_offset;
        self.tx_offset += data.len() as u64;

        if fin {
            self.fin_tx_offset = Some(self.tx_offset);
            self.flags.set(StreamFlags::SHUT_WR);
        }

        if !data.is_empty() || fin {
            self.tx_queued_bytes += data.len();
            self.tx_queue.push(core::cmp::Reverse(StreamChunk {
                offset,
                data: data.to_vec(),
                fin,
            }));
        }

        Ok(())
    }

    /// Bytes the peer's window still lets us put on the wire
    pub fn tx_window_left(&self) -> u64 {
        let lowest = self
            .tx_queue
            .peek()
            .map_or(self.tx_offset, |c| c.0.offset);
        self.max_tx_offset.saturating_sub(lowest)
    }

    pub fn has_pending_tx(&self) -> bool {
        !self.tx_queue.is_empty()
    }

    pub fn pending_tx_bytes(&self) -> usize {
        self.tx_queued_bytes
    }

    /// Pops the next fragment, clipped to `max_bytes` and the stream
    /// window; the remainder stays queued
    ///
    /// Returns `None` when nothing is sendable, distinguishing "window
    /// blocked" via [`Stream::is_tx_blocked`].
    pub fn next_tx_chunk(&mut self, max_bytes: usize) -> Option<StreamChunk> {
        let core::cmp::Reverse(chunk) = self.tx_queue.pop()?;

        let window_left = self.max_tx_offset.saturating_sub(chunk.offset) as usize;
        let budget = max_bytes.min(window_left);

        if budget == 0 && !(chunk.data.is_empty() && chunk.fin) {
            self.tx_queue.push(core::cmp::Reverse(chunk));
            return None;
        }

        if chunk.data.len() <= budget {
            self.tx_queued_bytes -= chunk.data.len();
            return Some(chunk);
        }

        let taken = StreamChunk {
            offset: chunk.offset,
            data: chunk.data[..budget].to_vec(),
            fin: false,
        };
        let rest = StreamChunk {
            offset: chunk.offset + budget as u64,
            data: chunk.data[budget..].to_vec(),
            fin: chunk.fin,
        };
        self.tx_queued_bytes -= taken.data.len();
        self.tx_queue.push(core::cmp::Reverse(rest));
        Some(taken)
    }

    /// Requeues a fragment (lost packet, or no packet room after all)
    pub fn requeue_tx_chunk(&mut self, chunk: StreamChunk) {
        // drop ranges the peer has already acknowledged
        let end = chunk.offset + chunk.data.len() as u64;
        if self.tx_acked.is_range_pushed(chunk.offset, end) {
            let fin_outstanding = chunk.fin && !self.flags.contains(StreamFlags::FIN_ACKED);
            if !fin_outstanding {
                return;
            }
        }
        self.tx_queued_bytes += chunk.data.len();
        self.tx_queue.push(core::cmp::Reverse(chunk));
    }

    /// True when the queue has data the peer's window will not accept
    pub fn is_tx_blocked(&self) -> bool {
        match self.tx_queue.peek() {
            Some(core::cmp::Reverse(chunk)) => {
                !chunk.data.is_empty() && chunk.offset >= self.max_tx_offset
            }
            None => false,
        }
    }

    pub fn max_tx_offset(&self) -> u64 {
        self.max_tx_offset
    }

    /// Bytes of `[offset, end)` never sent before, for connection-level
    /// window accounting
    pub fn fresh_bytes(&self, end: u64) -> u64 {
        end.saturating_sub(self.tx_sent_max)
    }

    pub fn note_sent(&mut self, end: u64) {
        self.tx_sent_max = self.tx_sent_max.max(end);
    }

    pub fn on_max_stream_data(&mut self, max: u64) {
        self.max_tx_offset = self.max_tx_offset.max(max);
    }

    /// Records a peer acknowledgment of `[offset, offset + len)` (+ FIN)
    pub fn on_stream_frame_acked(&mut self, offset: u64, len: usize, fin: bool) {
        self.tx_acked.push_range(offset, offset + len as u64);
        if fin {
            self.flags.set(StreamFlags::FIN_ACKED);
        }
    }

    pub fn on_reset_acked(&mut self) {
        self.flags.set(StreamFlags::RST_ACKED);
    }

    /// All queued bytes (and the FIN, if sent) have been acknowledged
    pub fn is_all_tx_acked(&self) -> bool {
        if self.flags.contains(StreamFlags::SENT_RST) {
            return self.flags.contains(StreamFlags::RST_ACKED);
        }
        if self.fin_tx_offset.is_some() && !self.flags.contains(StreamFlags::FIN_ACKED) {
            return false;
        }
        self.tx_offset == 0 || self.tx_acked.is_range_pushed(0, self.tx_offset)
    }

    /// The peer asked us to stop: abandon queued data and reset
    ///
    /// Returns the final size to carry in our RESET_STREAM.
    pub fn on_stop_sending(&mut self, app_error_code: u16) -> Option<u64> {
        if self.flags.contains(StreamFlags::SENT_RST) {
            return None;
        }
        self.flags.set(StreamFlags::RECV_STOP_SENDING);
        self.reset_tx(app_error_code)
    }

    /// Abandons the send direction, returning the final size for
    /// RESET_STREAM, or `None` if one was already sent
    pub fn reset_tx(&mut self, app_error_code: u16) -> Option<u64> {
        if self.flags.contains(StreamFlags::SENT_RST) {
            return None;
        }
        self.flags.set(StreamFlags::SENT_RST);
        self.flags.set(StreamFlags::SHUT_WR);
        self.app_error_code = app_error_code;
        self.tx_queue.clear();
        self.tx_queued_bytes = 0;
        Some(self.tx_offset)
    }

    // ---- receive side -------------------------------------------------

    /// Accepts an inbound STREAM frame after connection-level checks
    ///
    /// Returns the number of bytes beyond the previous largest offset, the
    /// growth the connection-level window must account for.
    pub fn recv_stream_frame(&mut self, offset: u64, data: &[u8], fin: bool) -> Result<u64> {
        let end = offset + data.len() as u64;

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#4.1
        //# A receiver MUST close the connection with a FLOW_CONTROL_ERROR
        //# error if the sender violates the advertised... stream data limits.
        if end > self.max_rx_offset {
            return Err(Error::FlowControl);
        }

        if let Some(final_size) = self.fin_rx_offset {
            //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#4.4
            //# Once a final size for a stream is known, it cannot change.  If
            //# a RESET_STREAM or STREAM frame is received indicating a change
            //# in the final size for the stream, an endpoint SHOULD respond
            //# with a FINAL_SIZE_ERROR error.
            if end > final_size || (fin && end != final_size) {
                return Err(Error::FinalSize);
            }
        }

        if fin {
            if self.rx_largest_offset > end {
                return Err(Error::FinalSize);
            }
            self.fin_rx_offset = Some(end);
        }

        let growth = end.saturating_sub(self.rx_largest_offset);
        self.rx_largest_offset = self.rx_largest_offset.max(end);

        if !self.flags.contains(StreamFlags::SHUT_RD) {
            self.rob.push(offset, data);
        }

        Ok(growth)
    }

    /// Pops contiguous received bytes, and reports whether the FIN has now
    /// been fully delivered
    pub fn pop_rx(&mut self) -> Option<(u64, Vec<u8>, bool)> {
        let (offset, data) = self.rob.pop(usize::MAX)?;
        let fin_reached = self.fin_rx_offset == Some(self.rob.delivered_offset());
        Some((offset, data, fin_reached))
    }

    /// True once the FIN offset itself is deliverable (covers empty FINs)
    pub fn fin_delivered(&self) -> bool {
        self.fin_rx_offset == Some(self.rob.delivered_offset()) && self.rob.readable() == 0
    }

    /// Returns true exactly once, when the FIN becomes deliverable
    pub fn take_fin_signal(&mut self) -> bool {
        if !self.fin_signalled && self.fin_delivered() {
            self.fin_signalled = true;
            true
        } else {
            false
        }
    }

    /// The offset delivery has reached
    pub fn rx_delivered_offset(&self) -> u64 {
        self.rob.delivered_offset()
    }

    /// The peer reset its sending side
    ///
    /// Returns the window growth the connection must account for.
    pub fn on_reset_stream(&mut self, final_size: u64, app_error_code: u16) -> Result<u64> {
        if final_size > self.max_rx_offset {
            return Err(Error::FlowControl);
        }
        if let Some(known) = self.fin_rx_offset {
            if known != final_size {
                return Err(Error::FinalSize);
            }
        }
        if self.rx_largest_offset > final_size {
            return Err(Error::FinalSize);
        }

        let growth = final_size.saturating_sub(self.rx_largest_offset);
        self.rx_largest_offset = final_size;
        self.fin_rx_offset = Some(final_size);
        self.flags.set(StreamFlags::RECV_RST);
        self.flags.set(StreamFlags::SHUT_RD);
        self.app_error_code = app_error_code;
        self.rob.discard_to(final_size);
        Ok(growth)
    }

    /// The application stops reading; inbound data will be discarded
    pub fn shutdown_rx(&mut self, app_error_code: u16) {
        self.flags.set(StreamFlags::SHUT_RD);
        self.app_error_code = app_error_code;
        self.rob.discard_to(self.rx_largest_offset);
    }

    /// Grows the receive window as the application consumes data
    pub fn extend_max_rx_offset(&mut self, delta: u64) {
        self.unsent_max_rx_offset = self.unsent_max_rx_offset.saturating_add(delta);
    }

    /// Half-window rule: is a MAX_STREAM_DATA update worth sending?
    pub fn wants_max_stream_data(&self) -> bool {
        if self.flags.contains(StreamFlags::SHUT_RD) || self.fin_rx_offset.is_some() {
            return false;
        }
        self.unsent_max_rx_offset - self.max_rx_offset >= self.rx_window / 2
    }

    /// The value to advertise; the caller commits it once the frame is on
    /// the wire
    pub fn pending_max_rx_offset(&self) -> u64 {
        self.unsent_max_rx_offset
    }

    pub fn commit_max_rx_offset(&mut self, advertised: u64) {
        self.max_rx_offset = self.max_rx_offset.max(advertised);
    }

    pub fn max_rx_offset(&self) -> u64 {
        self.max_rx_offset
    }

    pub fn rx_largest_offset(&self) -> u64 {
        self.rx_largest_offset
    }

    pub fn is_shut_rd(&self) -> bool {
        self.flags.contains(StreamFlags::SHUT_RD)
    }

    pub fn is_shut_wr(&self) -> bool {
        self.flags.contains(StreamFlags::SHUT_WR)
    }

    /// Both directions have finished; the stream can be destroyed
    pub fn is_done(&self) -> bool {
        let rx_done = self.flags.contains(StreamFlags::RECV_RST)
            || self.fin_delivered()
            || self.flags.contains(StreamFlags::SHUT_RD);
        let tx_done = self.is_shut_wr() && self.is_all_tx_acked();
        rx_done && tx_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::varint::VarInt;

    fn stream() -> Stream {
        Stream::new(StreamId::from_varint(VarInt::from_u8(0)), 100, 100)
    }

    #[test]
    fn write_then_drain_in_order() {
        let mut s = stream();
        s.write(b"hello", false).unwrap();
        s.write(b" world", true).unwrap();

        let c1 = s.next_tx_chunk(usize::MAX).unwrap();
        assert_eq!(c1.offset, 0);
        assert_eq!(c1.data, b"hello");
        let c2 = s.next_tx_chunk(usize::MAX).unwrap();
        assert_eq!(c2.offset, 5);
        assert!(c2.fin);
        assert!(s.next_tx_chunk(usize::MAX).is_none());
    }

    #[test]
    fn window_clips_and_blocks() {
        let mut s = stream();
        let data = vec![0u8; 120];
        s.write(&data, false).unwrap();

        // the peer advertised 100; only 100 bytes may leave
        let c = s.next_tx_chunk(usize::MAX).unwrap();
        assert_eq!(c.data.len(), 100);
        assert!(s.next_tx_chunk(usize::MAX).is_none());
        assert!(s.is_tx_blocked());
        assert_eq!(s.pending_tx_bytes(), 20);

        // a MAX_STREAM_DATA update releases the rest
        s.on_max_stream_data(200);
        let c = s.next_tx_chunk(usize::MAX).unwrap();
        assert_eq!(c.offset, 100);
        assert_eq!(c.data.len(), 20);
        assert!(!s.is_tx_blocked());
    }

    #[test]
    fn fin_ack_completes_tx() {
        let mut s = stream();
        s.write(b"abc", true).unwrap();
        let c = s.next_tx_chunk(usize::MAX).unwrap();
        assert!(!s.is_all_tx_acked());
        s.on_stream_frame_acked(c.offset, c.data.len(), c.fin);
        assert!(s.is_all_tx_acked());
        assert!(s.is_shut_wr());
    }

    #[test]
    fn requeue_skips_acked_ranges() {
        let mut s = stream();
        s.write(b"abcdef", false).unwrap();
        let c = s.next_tx_chunk(usize::MAX).unwrap();
        s.on_stream_frame_acked(0, 6, false);
        // a lost copy of fully-acked data vanishes instead of requeueing
        s.requeue_tx_chunk(c);
        assert!(!s.has_pending_tx());
    }

    #[test]
    fn rx_final_size_is_sticky() {
        let mut s = stream();
        assert_eq!(s.recv_stream_frame(0, b"abc", true).unwrap(), 3);
        // same end offset with FIN again: idempotent
        s.recv_stream_frame(0, b"abc", true).unwrap();
        // disagreeing final size
        assert_eq!(
            s.recv_stream_frame(0, b"abcd", true).unwrap_err(),
            Error::FinalSize
        );
        // bytes beyond the final size
        assert_eq!(
            s.recv_stream_frame(3, b"x", false).unwrap_err(),
            Error::FinalSize
        );
    }

    #[test]
    fn rx_flow_control_is_enforced() {
        let mut s = stream();
        let oversized = vec![0u8; 101];
        assert_eq!(
            s.recv_stream_frame(0, &oversized, false).unwrap_err(),
            Error::FlowControl
        );
    }

    #[test]
    fn reset_after_fin_must_agree() {
        let mut s = stream();
        s.recv_stream_frame(0, b"abc", true).unwrap();
        assert_eq!(s.on_reset_stream(5, 1).unwrap_err(), Error::FinalSize);
        s.on_reset_stream(3, 1).unwrap();
        assert!(s.flags().contains(StreamFlags::RECV_RST));
    }

    #[test]
    fn stop_sending_turns_into_reset() {
        let mut s = stream();
        s.write(b"queued", false).unwrap();
        let final_size = s.on_stop_sending(7).unwrap();
        assert_eq!(final_size, 6);
        assert!(!s.has_pending_tx());
        assert!(s.flags().contains(StreamFlags::SENT_RST));
        // a second STOP_SENDING does not produce another reset
        assert!(s.on_stop_sending(7).is_none());
    }

    #[test]
    fn half_window_rule() {
        let mut s = stream();
        s.recv_stream_frame(0, &vec![0u8; 50], false).unwrap();
        s.pop_rx().unwrap();
        assert!(!s.wants_max_stream_data());
        s.extend_max_rx_offset(49);
        assert!(!s.wants_max_stream_data());
        s.extend_max_rx_offset(1);
        assert!(s.wants_max_stream_data());

        let advertised = s.pending_max_rx_offset();
        assert_eq!(advertised, 150);
        s.commit_max_rx_offset(advertised);
        assert!(!s.wants_max_stream_data());
    }
}
