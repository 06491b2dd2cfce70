// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use core::fmt;
use quill_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#12.3
//# Packet numbers are divided into 3 spaces in QUIC:
//#
//# o  Initial space: All Initial packets (Section 17.2.2) are in this
//#    space.
//#
//# o  Handshake space: All Handshake packets (Section 17.2.4) are in
//#    this space.
//#
//# o  Application data space: All 0-RTT and 1-RTT encrypted packets
//#    (Section 12.1) are in this space.

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum PacketNumberSpace {
    Initial,
    Handshake,
    ApplicationData,
}

impl PacketNumberSpace {
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::ApplicationData];

    #[inline]
    pub fn is_application_data(self) -> bool {
        matches!(self, Self::ApplicationData)
    }
}

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#12.3
//# The packet number is an integer in the range 0 to 2^62-1.

/// A full packet number within one space
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PacketNumber(VarInt);

impl fmt::Debug for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PacketNumber({})", self.0)
    }
}

impl fmt::Display for PacketNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PacketNumber {
    pub const ZERO: Self = Self(VarInt::ZERO);
    pub const MAX: Self = Self(VarInt::MAX);

    #[inline]
    pub const fn from_varint(value: VarInt) -> Self {
        Self(value)
    }

    #[inline]
    pub fn new(value: u64) -> Option<Self> {
        VarInt::new(value).ok().map(Self)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    /// The next packet number, or `None` once the space is exhausted
    #[inline]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(VarInt::from_u8(1)).map(Self)
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.1
    //# The sender MUST use a packet number size able to represent more than
    //# twice as large a range than the difference between the largest
    //# acknowledged packet and packet number being sent.
    /// Truncates the packet number for the wire, relative to the largest
    /// acknowledged number (if any)
    #[inline]
    pub fn truncate(self, largest_acked: Option<PacketNumber>) -> TruncatedPacketNumber {
        let base = largest_acked.map_or(0, |largest| largest.as_u64());
        // count of contiguous unacknowledged numbers, including this one
        let unacked = self.as_u64().saturating_sub(base);
        let needed = unacked.saturating_mul(2).saturating_add(1);

        let len = if needed <= 0xff {
            1
        } else if needed <= 0xffff {
            2
        } else if needed <= 0x00ff_ffff {
            3
        } else {
            4
        };

        let mask = (1u64 << (len * 8)) - 1;
        TruncatedPacketNumber {
            value: (self.as_u64() & mask) as u32,
            len,
        }
    }
}

/// A packet number reduced to its 1..=4 least significant bytes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TruncatedPacketNumber {
    value: u32,
    len: usize,
}

impl TruncatedPacketNumber {
    #[inline]
    pub fn new(value: u32, len: usize) -> Self {
        debug_assert!((1..=4).contains(&len));
        debug_assert!(len == 4 || value < 1 << (len * 8));
        Self { value, len }
    }

    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.value as u64
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.len
    }

    #[inline]
    pub const fn bitsize(self) -> usize {
        self.len * 8
    }

    #[inline]
    pub fn encode<E: Encoder>(self, encoder: &mut E) {
        let bytes = self.value.to_be_bytes();
        encoder.write_slice(&bytes[4 - self.len..]);
    }

    #[inline]
    pub fn decode(buffer: DecoderBuffer<'_>, len: usize) -> DecoderBufferResult<'_, Self> {
        if !(1..=4).contains(&len) {
            return Err(DecoderError::InvariantViolation("invalid packet number length"));
        }
        let (bytes, buffer) = buffer.decode_slice(len)?;
        let mut value = 0u32;
        for byte in bytes.as_less_safe_slice() {
            value = (value << 8) | u32::from(*byte);
        }
        Ok((Self { value, len }, buffer))
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#A
    //# DecodePacketNumber(largest_pn, truncated_pn, pn_nbits):
    //#    expected_pn  = largest_pn + 1
    //#    pn_win       = 1 << pn_nbits
    //#    pn_hwin      = pn_win / 2
    //#    pn_mask      = pn_win - 1
    //#    candidate_pn = (expected_pn & ~pn_mask) | truncated_pn
    //#    if candidate_pn <= expected_pn - pn_hwin:
    //#       return candidate_pn + pn_win
    //#    // Note, this addition may overflow the packet number space
    //#    if candidate_pn > expected_pn + pn_hwin and candidate_pn > pn_win:
    //#       return candidate_pn - pn_win
    //#    return candidate_pn
    /// Recovers the full packet number closest to `largest + 1`
    #[inline]
    pub fn expand(self, largest: Option<PacketNumber>) -> PacketNumber {
        let expected = largest.map_or(0, |pn| pn.as_u64() + 1);
        let pn_win = 1u64 << self.bitsize();
        let pn_hwin = pn_win / 2;
        let pn_mask = pn_win - 1;

        let candidate = (expected & !pn_mask) | self.into_u64();

        let adjusted = if expected
            .checked_sub(pn_hwin)
            .is_some_and(|low| candidate <= low)
            && candidate
                .checked_add(pn_win)
                .is_some_and(|v| v <= VarInt::MAX.as_u64())
        {
            candidate + pn_win
        } else if expected
            .checked_add(pn_hwin)
            .is_some_and(|high| candidate > high)
            && candidate >= pn_win
        {
            candidate - pn_win
        } else {
            candidate
        };

        PacketNumber::new(adjusted).unwrap_or(PacketNumber::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    fn pn(value: u64) -> PacketNumber {
        PacketNumber::new(value).unwrap()
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#A
    //= type=test
    //# For example, if the highest successfully authenticated packet had a
    //# packet number of 0xa82f30ea, then a packet containing a 16-bit value
    //# of 0x9b32 will be decoded as 0xa82f9b32.
    #[test]
    fn draft_example() {
        let truncated = TruncatedPacketNumber::new(0x9b32, 2);
        assert_eq!(
            truncated.expand(Some(pn(0xa82f_30ea))),
            pn(0xa82f_9b32)
        );
    }

    #[test]
    fn window_wraps_downward() {
        // closest candidate to largest + 1 = 11 within a +-128 window is 0
        let truncated = TruncatedPacketNumber::new(0, 1);
        assert_eq!(truncated.expand(Some(pn(10))), pn(0));
    }

    #[test]
    fn expand_without_history() {
        let truncated = TruncatedPacketNumber::new(7, 1);
        assert_eq!(truncated.expand(None), pn(7));
    }

    #[test]
    fn truncation_is_minimal() {
        // nothing acked yet: packet 0 fits in one byte
        assert_eq!(pn(0).truncate(None).len(), 1);
        // a large unacked range needs more bytes
        assert_eq!(pn(0x1_0000).truncate(None).len(), 3);
        // an up-to-date peer keeps encodings short again
        assert_eq!(pn(0x1_0000).truncate(Some(pn(0xffff))).len(), 1);
    }

    #[test]
    fn truncate_expand_round_trip() {
        check!()
            .with_type::<(u64, u16)>()
            .cloned()
            .for_each(|(largest, delta)| {
                let Some(largest) = PacketNumber::new(largest & VarInt::MAX.as_u64()) else {
                    return;
                };
                let Some(next) = PacketNumber::new(largest.as_u64().saturating_add(delta as u64))
                else {
                    return;
                };
                let truncated = next.truncate(Some(largest));
                assert_eq!(truncated.expand(Some(largest)), next);
            });
    }

    #[test]
    fn size_of_snapshots() {
        use insta::assert_debug_snapshot;

        assert_debug_snapshot!(core::mem::size_of::<PacketNumber>(), @"8");
        assert_debug_snapshot!(core::mem::size_of::<TruncatedPacketNumber>(), @"16");
    }

    #[test]
    fn encode_decode_round_trip() {
        use quill_codec::EncoderBuffer;

        for (value, len) in [(0u32, 1), (0xff, 1), (0x1234, 2), (0xab_cdef, 3), (0xdead_beef, 4)] {
            let truncated = TruncatedPacketNumber::new(value, len);
            let mut buf = [0u8; 4];
            let mut encoder = EncoderBuffer::new(&mut buf);
            truncated.encode(&mut encoder);
            assert_eq!(encoder.len(), len);

            let (decoded, _) = TruncatedPacketNumber::decode(DecoderBuffer::new(&buf[..len]), len)
                .unwrap();
            assert_eq!(decoded, truncated);
        }
    }
}
