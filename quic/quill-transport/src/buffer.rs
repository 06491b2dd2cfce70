// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Out-of-order byte reassembly for stream and crypto data.

use std::collections::BTreeMap;

/// A sparse offset-indexed byte container delivering a contiguous prefix
///
/// Overlapping or duplicate pushes are idempotent: bytes below the first
/// gap come out exactly once, in order, regardless of arrival interleaving.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    /// Non-overlapping segments above `delivered`, keyed by start offset
    segments: BTreeMap<u64, Vec<u8>>,
    /// Everything below this offset has been popped by the consumer
    delivered: u64,
    /// Total bytes currently buffered
    buffered: usize,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The offset of the first byte not yet received; data below it is
    /// contiguous from `delivered`
    pub fn first_gap_offset(&self) -> u64 {
        let mut end = self.delivered;
        for (&start, data) in &self.segments {
            if start > end {
                break;
            }
            end = end.max(start + data.len() as u64);
        }
        end
    }

    /// The number of contiguous bytes ready to pop
    pub fn readable(&self) -> usize {
        (self.first_gap_offset() - self.delivered) as usize
    }

    /// Total bytes held, contiguous or not
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// The offset the consumer has popped up to
    pub fn delivered_offset(&self) -> u64 {
        self.delivered
    }

    /// Inserts bytes at `offset`, coalescing overlaps
    pub fn push(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut start = offset;
        let mut data = data;

        // clip anything already delivered
        if start < self.delivered {
            let skip = (self.delivered - start) as usize;
            if skip >= data.len() {
                return;
            }
            data = &data[skip..];
            start = self.delivered;
        }

        let end = start + data.len() as u64;

        // absorb the new range and every segment it touches into one span
        let mut span_start = start;
        let mut span: Vec<u8> = Vec::new();

        // segments starting at or before `start` may overlap from the left
        if let Some((&seg_start, seg)) = self.segments.range(..=start).next_back() {
            if seg_start + seg.len() as u64 >= start {
                span_start = seg_start;
            }
        }

        // collect all segments intersecting [span_start, end]
        let touched: Vec<u64> = self
            .segments
            .range(span_start..=end)
            .map(|(&s, _)| s)
            .collect();

        let mut pieces: Vec<(u64, Vec<u8>)> = Vec::with_capacity(touched.len() + 1);
        for s in touched {
            let seg = self.segments.remove(&s).expect("segment key just observed");
            self.buffered -= seg.len();
            pieces.push((s, seg));
        }
        pieces.push((start, data.to_vec()));
        pieces.sort_by_key(|(s, _)| *s);

        span_start = pieces[0].0;
        for (s, piece) in pieces {
            let span_end = span_start + span.len() as u64;
            debug_assert!(s <= span_end, "selected pieces must touch the span");
            if s == span_end {
                span.extend_from_slice(&piece);
            } else {
                let overlap = (span_end - s) as usize;
                if overlap < piece.len() {
                    span.extend_from_slice(&piece[overlap..]);
                }
            }
        }

        self.buffered += span.len();
        self.segments.insert(span_start, span);
    }

    /// Pops up to `max` contiguous bytes from the delivered offset
    ///
    /// Returns the offset the bytes start at and the bytes themselves, or
    /// `None` when nothing contiguous is pending.
    pub fn pop(&mut self, max: usize) -> Option<(u64, Vec<u8>)> {
        let (&start, _) = self.segments.first_key_value()?;
        if start > self.delivered {
            return None;
        }

        let seg = self.segments.remove(&start).expect("first key just observed");
        self.buffered -= seg.len();
        let offset = self.delivered;

        // skip the part a previous partial pop already delivered
        let skip = (self.delivered - start) as usize;
        let available = seg.len() - skip;
        let take = available.min(max);
        let out = seg[skip..skip + take].to_vec();

        if take < available {
            // keep the segment; `delivered` marks where the split happened
            self.buffered += seg.len();
            self.segments.insert(start, seg);
        }

        self.delivered += take as u64;
        Some((offset, out))
    }

    /// Borrows the contiguous bytes at the delivered offset without popping
    pub fn data_at_delivered(&self) -> Option<&[u8]> {
        let (&start, seg) = self.segments.first_key_value()?;
        if start > self.delivered {
            return None;
        }
        let skip = (self.delivered - start) as usize;
        Some(&seg[skip..])
    }

    /// Drops everything and fast-forwards to `offset` (reset teardown)
    pub fn discard_to(&mut self, offset: u64) {
        self.segments.clear();
        self.buffered = 0;
        self.delivered = self.delivered.max(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    fn drain(rob: &mut ReassemblyBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some((_, bytes)) = rob.pop(usize::MAX) {
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[test]
    fn in_order_delivery() {
        let mut rob = ReassemblyBuffer::new();
        rob.push(0, b"hello ");
        rob.push(6, b"world");
        assert_eq!(rob.first_gap_offset(), 11);
        assert_eq!(drain(&mut rob), b"hello world");
    }

    #[test]
    fn out_of_order_delivery() {
        let mut rob = ReassemblyBuffer::new();
        rob.push(6, b"world");
        assert_eq!(rob.first_gap_offset(), 0);
        assert!(rob.pop(usize::MAX).is_none());

        rob.push(0, b"hello ");
        assert_eq!(rob.first_gap_offset(), 11);
        assert_eq!(drain(&mut rob), b"hello world");
    }

    #[test]
    fn overlapping_pushes_are_idempotent() {
        let mut rob = ReassemblyBuffer::new();
        rob.push(0, b"abcd");
        rob.push(2, b"cdef");
        rob.push(0, b"abcd");
        rob.push(1, b"bc");
        assert_eq!(drain(&mut rob), b"abcdef");
    }

    #[test]
    fn partial_pop_resumes() {
        let mut rob = ReassemblyBuffer::new();
        rob.push(0, b"abcdef");
        let (offset, bytes) = rob.pop(3).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(bytes, b"abc");
        let (offset, bytes) = rob.pop(usize::MAX).unwrap();
        assert_eq!(offset, 3);
        assert_eq!(bytes, b"def");
    }

    #[test]
    fn delivered_bytes_are_never_repeated() {
        let mut rob = ReassemblyBuffer::new();
        rob.push(0, b"abc");
        assert_eq!(drain(&mut rob), b"abc");
        // retransmission of already-delivered data is dropped
        rob.push(0, b"abc");
        assert!(rob.pop(usize::MAX).is_none());
        rob.push(1, b"bcde");
        assert_eq!(drain(&mut rob), b"de");
    }

    #[test]
    fn interleaving_matches_single_push() {
        check!()
            .with_type::<(Vec<(u8, u8)>, u8)>()
            .cloned()
            .for_each(|(pushes, total)| {
                let total = (total as usize).min(64);
                let reference: Vec<u8> = (0..total as u8).collect();

                let mut rob = ReassemblyBuffer::new();
                for (offset, len) in pushes {
                    let offset = (offset as usize) % (total + 1);
                    let end = (offset + 1 + len as usize).min(total);
                    rob.push(offset as u64, &reference[offset..end]);
                }
                // a final in-order push closes any remaining gaps
                rob.push(0, &reference);

                assert_eq!(drain(&mut rob), reference);
            });
    }
}
