// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{transport, varint::VarInt};
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};
use smallvec::SmallVec;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.3
//# Receivers send ACK frames (types 0x02 and 0x03) to inform senders of
//# packets they have received and processed.  The ACK frame contains one
//# or more ACK Blocks.  ACK Blocks are ranges of acknowledged packets.
//# If the frame type is 0x03, ACK frames also contain the sum of QUIC
//# packets with associated ECN marks received on the connection up until
//# this point.

pub const ACK_TAG: u8 = 0x02;
pub const ACK_ECN_TAG: u8 = 0x03;

/// Blocks kept inline when decoding; later blocks in an oversized frame
/// are consumed but forgotten, so re-sent ACKs simply shrink
pub const MAX_ACK_BLKS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

/// A gap of unacknowledged packets followed by a run of acknowledged ones,
/// both encoded off-by-one per the wire format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckBlock {
    pub gap: VarInt,
    pub len: VarInt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub largest_ack: VarInt,
    /// Raw wire value; scale with the peer's ack_delay_exponent
    pub ack_delay: VarInt,
    /// Count of packets acknowledged below `largest_ack` in the first block
    pub first_block: VarInt,
    pub blocks: SmallVec<[AckBlock; MAX_ACK_BLKS]>,
    pub ecn: Option<EcnCounts>,
}

impl Ack {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.ecn.is_some() {
            ACK_ECN_TAG
        } else {
            ACK_TAG
        }
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.3.1
    //# If any computed packet number is negative, an endpoint MUST
    //# generate a connection error of type FRAME_ENCODING_ERROR
    /// Rejects frames whose block chain descends below packet number zero
    pub fn validate(&self) -> transport::Result {
        let mut smallest = self
            .largest_ack
            .as_u64()
            .checked_sub(self.first_block.as_u64())
            .ok_or(transport::Error::AckFrame)?;

        for block in &self.blocks {
            smallest = smallest
                .checked_sub(block.gap.as_u64() + 2)
                .ok_or(transport::Error::AckFrame)?;
            smallest = smallest
                .checked_sub(block.len.as_u64())
                .ok_or(transport::Error::AckFrame)?;
        }

        Ok(())
    }

    /// Iterates the acknowledged ranges as inclusive `(smallest, largest)`
    /// pairs, in descending packet-number order
    pub fn ranges(&self) -> AckRangeIter<'_> {
        AckRangeIter {
            ack: self,
            next_block: 0,
            prev_smallest: 0,
            started: false,
        }
    }
}

pub struct AckRangeIter<'a> {
    ack: &'a Ack,
    next_block: usize,
    prev_smallest: u64,
    started: bool,
}

impl Iterator for AckRangeIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if !self.started {
            self.started = true;
            let largest = self.ack.largest_ack.as_u64();
            let smallest = largest.checked_sub(self.ack.first_block.as_u64())?;
            self.prev_smallest = smallest;
            return Some((smallest, largest));
        }

        let block = self.ack.blocks.get(self.next_block)?;
        self.next_block += 1;

        let largest = self.prev_smallest.checked_sub(block.gap.as_u64() + 2)?;
        let smallest = largest.checked_sub(block.len.as_u64())?;
        self.prev_smallest = smallest;
        Some((smallest, largest))
    }
}

decoder_parameterized_value!(
    impl<'a> Ack {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (largest_ack, buffer) = buffer.decode::<VarInt>()?;
            let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
            let (block_count, buffer) = buffer.decode::<VarInt>()?;
            let (first_block, buffer) = buffer.decode::<VarInt>()?;

            let mut blocks = SmallVec::new();
            let mut buffer = buffer;
            for _ in 0..block_count.as_u64() {
                let (gap, rest) = buffer.decode::<VarInt>()?;
                let (len, rest) = rest.decode::<VarInt>()?;
                if blocks.len() < MAX_ACK_BLKS {
                    blocks.push(AckBlock { gap, len });
                }
                buffer = rest;
            }

            let (ecn, buffer) = if tag == ACK_ECN_TAG {
                let (ect0, buffer) = buffer.decode::<VarInt>()?;
                let (ect1, buffer) = buffer.decode::<VarInt>()?;
                let (ce, buffer) = buffer.decode::<VarInt>()?;
                (Some(EcnCounts { ect0, ect1, ce }), buffer)
            } else {
                (None, buffer)
            };

            let frame = Ack {
                largest_ack,
                ack_delay,
                first_block,
                blocks,
                ecn,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Ack {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.largest_ack);
        buffer.encode(&self.ack_delay);
        buffer.encode(
            &VarInt::try_from(self.blocks.len()).expect("block count is bounded"),
        );
        buffer.encode(&self.first_block);

        for block in &self.blocks {
            buffer.encode(&block.gap);
            buffer.encode(&block.len);
        }

        if let Some(ecn) = &self.ecn {
            buffer.encode(&ecn.ect0);
            buffer.encode(&ecn.ect1);
            buffer.encode(&ecn.ce);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_codec::DecoderBuffer;
    use smallvec::smallvec;

    fn decode(bytes: &[u8]) -> Ack {
        let tag = bytes[0];
        let buffer = DecoderBuffer::new(&bytes[1..]);
        let (ack, remaining) = buffer.decode_parameterized::<Ack>(tag).unwrap();
        assert!(remaining.is_empty());
        ack
    }

    #[test]
    fn round_trip() {
        let frame = Ack {
            largest_ack: VarInt::from_u8(7),
            ack_delay: VarInt::from_u8(0),
            first_block: VarInt::from_u8(1),
            blocks: smallvec![
                AckBlock {
                    gap: VarInt::ZERO,
                    len: VarInt::ZERO,
                },
                AckBlock {
                    gap: VarInt::ZERO,
                    len: VarInt::from_u8(2),
                },
            ],
            ecn: None,
        };
        frame.validate().unwrap();

        let bytes = frame.encode_to_vec();
        assert_eq!(decode(&bytes), frame);
    }

    #[test]
    fn ecn_round_trip() {
        let frame = Ack {
            largest_ack: VarInt::from_u32(100_000),
            ack_delay: VarInt::from_u8(30),
            first_block: VarInt::from_u8(0),
            blocks: smallvec![],
            ecn: Some(EcnCounts {
                ect0: VarInt::from_u8(1),
                ect1: VarInt::from_u8(2),
                ce: VarInt::from_u8(3),
            }),
        };
        let bytes = frame.encode_to_vec();
        assert_eq!(bytes[0], ACK_ECN_TAG);
        assert_eq!(decode(&bytes), frame);
    }

    #[test]
    fn ranges_descend() {
        // received {0, 1, 2, 4, 6, 7}
        let frame = Ack {
            largest_ack: VarInt::from_u8(7),
            ack_delay: VarInt::ZERO,
            first_block: VarInt::from_u8(1),
            blocks: smallvec![
                AckBlock {
                    gap: VarInt::ZERO,
                    len: VarInt::ZERO,
                },
                AckBlock {
                    gap: VarInt::ZERO,
                    len: VarInt::from_u8(2),
                },
            ],
            ecn: None,
        };
        let ranges: Vec<_> = frame.ranges().collect();
        assert_eq!(ranges, vec![(6, 7), (4, 4), (0, 2)]);
    }

    #[test]
    fn underflow_is_rejected() {
        let frame = Ack {
            largest_ack: VarInt::from_u8(1),
            ack_delay: VarInt::ZERO,
            first_block: VarInt::from_u8(2),
            blocks: smallvec![],
            ecn: None,
        };
        assert!(frame.validate().is_err());

        let frame = Ack {
            largest_ack: VarInt::from_u8(4),
            ack_delay: VarInt::ZERO,
            first_block: VarInt::ZERO,
            blocks: smallvec![AckBlock {
                gap: VarInt::from_u8(4),
                len: VarInt::ZERO,
            }],
            ecn: None,
        };
        assert!(frame.validate().is_err());
    }

    #[test]
    fn excess_blocks_are_forgotten() {
        let mut frame = Ack {
            largest_ack: VarInt::from_u32(1 << 16),
            ack_delay: VarInt::ZERO,
            first_block: VarInt::ZERO,
            blocks: smallvec![],
            ecn: None,
        };
        for _ in 0..MAX_ACK_BLKS {
            frame.blocks.push(AckBlock {
                gap: VarInt::ZERO,
                len: VarInt::ZERO,
            });
        }
        let mut bytes = frame.encode_to_vec();
        // splice four extra blocks past the inline capacity
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        let count_offset = 1
            + frame.largest_ack.encoding_size()
            + frame.ack_delay.encoding_size();
        bytes[count_offset] = (MAX_ACK_BLKS + 4) as u8;

        let decoded = decode(&bytes);
        assert_eq!(decoded.blocks.len(), MAX_ACK_BLKS);
    }
}
