// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per packet-number-space state: numbering, keys, ack bookkeeping, the
//! crypto stream and pending frames.

use crate::{
    ack::{AckTracker, GapTracker},
    buffer::ReassemblyBuffer,
    recovery::RetransmitBuffer,
};
use quill_core::{
    crypto::CryptoKeys,
    frame::FrameOwned,
    packet::{PacketNumber, PacketNumberSpace},
    transport::{Error, Result},
};
use std::collections::{BinaryHeap, VecDeque};

/// A run of outbound handshake-stream bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CryptoChunk {
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Ord for CryptoChunk {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.offset
            .cmp(&other.offset)
            .then_with(|| self.data.len().cmp(&other.data.len()))
    }
}

impl PartialOrd for CryptoChunk {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One of the three packet-number spaces
#[derive(Debug)]
pub(crate) struct SpaceCtx {
    pub space: PacketNumberSpace,

    /// Last packet number sent; strictly increasing
    pub last_tx_pkt_num: Option<PacketNumber>,
    /// Largest packet number received and authenticated
    pub largest_rx_pkt_num: Option<PacketNumber>,
    /// Largest of our packet numbers the peer has acknowledged
    pub largest_acked_tx: Option<PacketNumber>,

    /// Every received packet number, for duplicate suppression
    pub rx_pngap: GapTracker,
    pub acktr: AckTracker,
    pub rtb: RetransmitBuffer,

    /// Inbound handshake-stream reassembly
    pub crypto_rx: ReassemblyBuffer,
    /// Outbound handshake chunks ordered by offset
    crypto_tx: BinaryHeap<core::cmp::Reverse<CryptoChunk>>,
    /// Next fresh outbound handshake offset
    crypto_tx_offset: u64,
    /// Handshake byte ranges the peer acknowledged
    pub crypto_acked: GapTracker,

    /// Pending non-stream frames awaiting (re)transmission
    pub tx_frq: VecDeque<FrameOwned>,

    /// Packets that arrived before their keys; bounded replay queue
    pub buffered_rx: VecDeque<Vec<u8>>,

    pub rx_ckm: Option<CryptoKeys>,
    pub tx_ckm: Option<CryptoKeys>,
}

impl SpaceCtx {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            last_tx_pkt_num: None,
            largest_rx_pkt_num: None,
            largest_acked_tx: None,
            rx_pngap: GapTracker::new(),
            acktr: AckTracker::new(),
            rtb: RetransmitBuffer::new(),
            crypto_rx: ReassemblyBuffer::new(),
            crypto_tx: BinaryHeap::new(),
            crypto_tx_offset: 0,
            crypto_acked: GapTracker::new(),
            tx_frq: VecDeque::new(),
            buffered_rx: VecDeque::new(),
            rx_ckm: None,
            tx_ckm: None,
        }
    }

    /// The number the next sent packet will carry
    pub fn next_pkt_num(&self) -> Result<PacketNumber> {
        match self.last_tx_pkt_num {
            None => Ok(PacketNumber::ZERO),
            Some(last) => last.next().ok_or(Error::PacketNumExhausted),
        }
    }

    pub fn commit_tx_pkt_num(&mut self, pkt_num: PacketNumber) {
        debug_assert!(self
            .last_tx_pkt_num
            .map_or(true, |last| pkt_num > last));
        self.last_tx_pkt_num = Some(pkt_num);
    }

    pub fn note_rx_pkt_num(&mut self, pkt_num: PacketNumber) {
        self.rx_pngap.push(pkt_num.as_u64());
        self.largest_rx_pkt_num = Some(
            self.largest_rx_pkt_num
                .map_or(pkt_num, |largest| largest.max(pkt_num)),
        );
    }

    pub fn is_duplicate(&self, pkt_num: PacketNumber) -> bool {
        self.rx_pngap.is_pushed(pkt_num.as_u64())
    }

    // ---- outbound crypto stream ---------------------------------------

    /// Appends fresh handshake bytes at the stream tail
    pub fn submit_crypto_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let chunk = CryptoChunk {
            offset: self.crypto_tx_offset,
            data: data.to_vec(),
        };
        self.crypto_tx_offset += data.len() as u64;
        self.crypto_tx.push(core::cmp::Reverse(chunk));
    }

    /// Requeues a chunk from a lost packet, dropping acknowledged ranges
    pub fn requeue_crypto_chunk(&mut self, mut chunk: CryptoChunk) {
        let end = chunk.offset + chunk.data.len() as u64;
        if self.crypto_acked.is_range_pushed(chunk.offset, end) {
            return;
        }
        // trim an acknowledged prefix so retransmissions shrink
        let mut skip = 0;
        while skip < chunk.data.len() && self.crypto_acked.is_pushed(chunk.offset + skip as u64) {
            skip += 1;
        }
        if skip > 0 {
            chunk.data.drain(..skip);
            chunk.offset += skip as u64;
        }
        if !chunk.data.is_empty() {
            self.crypto_tx.push(core::cmp::Reverse(chunk));
        }
    }

    /// Pops the lowest-offset pending chunk, clipped to `max_len`
    pub fn next_crypto_chunk(&mut self, max_len: usize) -> Option<CryptoChunk> {
        if max_len == 0 {
            return None;
        }
        loop {
            let core::cmp::Reverse(chunk) = self.crypto_tx.pop()?;
            let end = chunk.offset + chunk.data.len() as u64;
            if self.crypto_acked.is_range_pushed(chunk.offset, end) {
                continue;
            }
            if chunk.data.len() <= max_len {
                return Some(chunk);
            }
            let rest = CryptoChunk {
                offset: chunk.offset + max_len as u64,
                data: chunk.data[max_len..].to_vec(),
            };
            self.crypto_tx.push(core::cmp::Reverse(rest));
            return Some(CryptoChunk {
                offset: chunk.offset,
                data: chunk.data[..max_len].to_vec(),
            });
        }
    }

    pub fn has_pending_crypto(&self) -> bool {
        self.crypto_tx
            .iter()
            .any(|core::cmp::Reverse(c)| {
                !self
                    .crypto_acked
                    .is_range_pushed(c.offset, c.offset + c.data.len() as u64)
            })
    }

    pub fn on_crypto_range_acked(&mut self, offset: u64, len: usize) {
        self.crypto_acked.push_range(offset, offset + len as u64);
    }

    pub fn has_rx_keys(&self) -> bool {
        self.rx_ckm.is_some()
    }

    pub fn has_tx_keys(&self) -> bool {
        self.tx_ckm.is_some()
    }

    /// Drops everything when a space is abandoned (handshake done)
    pub fn discard(&mut self) {
        self.rx_ckm = None;
        self.tx_ckm = None;
        self.crypto_tx.clear();
        self.tx_frq.clear();
        self.rtb.drain_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_numbers_are_strictly_increasing() {
        let mut ctx = SpaceCtx::new(PacketNumberSpace::Initial);
        let first = ctx.next_pkt_num().unwrap();
        assert_eq!(first, PacketNumber::ZERO);
        ctx.commit_tx_pkt_num(first);
        let second = ctx.next_pkt_num().unwrap();
        assert!(second > first);
    }

    #[test]
    fn duplicate_detection() {
        let mut ctx = SpaceCtx::new(PacketNumberSpace::Initial);
        let pn = PacketNumber::new(42).unwrap();
        assert!(!ctx.is_duplicate(pn));
        ctx.note_rx_pkt_num(pn);
        assert!(ctx.is_duplicate(pn));
        assert_eq!(ctx.largest_rx_pkt_num, Some(pn));
    }

    #[test]
    fn crypto_chunks_come_out_in_offset_order() {
        let mut ctx = SpaceCtx::new(PacketNumberSpace::Initial);
        ctx.submit_crypto_data(b"aaaa");
        ctx.submit_crypto_data(b"bbbb");

        let c1 = ctx.next_crypto_chunk(usize::MAX).unwrap();
        assert_eq!(c1.offset, 0);
        let c2 = ctx.next_crypto_chunk(usize::MAX).unwrap();
        assert_eq!(c2.offset, 4);
        assert!(ctx.next_crypto_chunk(usize::MAX).is_none());
    }

    #[test]
    fn clipped_chunks_requeue_their_tail() {
        let mut ctx = SpaceCtx::new(PacketNumberSpace::Initial);
        ctx.submit_crypto_data(b"abcdef");
        let c = ctx.next_crypto_chunk(4).unwrap();
        assert_eq!(c.data, b"abcd");
        let c = ctx.next_crypto_chunk(usize::MAX).unwrap();
        assert_eq!(c.offset, 4);
        assert_eq!(c.data, b"ef");
    }

    #[test]
    fn acked_ranges_are_skipped_on_requeue() {
        let mut ctx = SpaceCtx::new(PacketNumberSpace::Initial);
        ctx.submit_crypto_data(b"abcdef");
        let chunk = ctx.next_crypto_chunk(usize::MAX).unwrap();

        ctx.on_crypto_range_acked(0, 6);
        ctx.requeue_crypto_chunk(chunk);
        assert!(!ctx.has_pending_crypto());

        // a partially acked chunk sheds the acknowledged prefix
        ctx.submit_crypto_data(b"ghij");
        let chunk = ctx.next_crypto_chunk(usize::MAX).unwrap();
        ctx.on_crypto_range_acked(6, 2);
        ctx.requeue_crypto_chunk(chunk);
        let requeued = ctx.next_crypto_chunk(usize::MAX).unwrap();
        assert_eq!(requeued.offset, 8);
        assert_eq!(requeued.data, b"ij");
    }
}
