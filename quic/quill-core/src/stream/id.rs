// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint::Role, varint::VarInt};
use core::fmt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#2.1
//# The least significant bit (0x1) of the stream ID identifies the
//# initiator of the stream.  Client-initiated streams have even-numbered
//# stream IDs (with the bit set to 0), and server-initiated streams have
//# odd-numbered stream IDs (with the bit set to 1).

const INITIATOR_BIT: u64 = 0x1;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#2.1
//# The second least significant bit (0x2) of the stream ID distinguishes
//# between bidirectional streams (with the bit set to 0) and
//# unidirectional streams (with the bit set to 1).

const UNI_BIT: u64 = 0x2;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamKind {
    Bidirectional,
    Unidirectional,
}

/// A 62-bit stream identifier whose low two bits encode initiator and kind
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StreamId(VarInt);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamId")
            .field("id", &self.0.as_u64())
            .field("initiator", &self.initiator())
            .field("kind", &self.kind())
            .finish()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StreamId {
    #[inline]
    pub const fn from_varint(id: VarInt) -> Self {
        Self(id)
    }

    /// Returns the `n`th stream id opened by `initiator` of the given kind
    #[inline]
    pub fn nth(initiator: Role, kind: StreamKind, n: u64) -> Option<Self> {
        let mut id = n.checked_mul(4)?;
        if matches!(initiator, Role::Server) {
            id |= INITIATOR_BIT;
        }
        if matches!(kind, StreamKind::Unidirectional) {
            id |= UNI_BIT;
        }
        Some(Self(VarInt::new(id).ok()?))
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub fn initiator(self) -> Role {
        if self.0.as_u64() & INITIATOR_BIT == 0 {
            Role::Client
        } else {
            Role::Server
        }
    }

    #[inline]
    pub fn kind(self) -> StreamKind {
        if self.0.as_u64() & UNI_BIT == 0 {
            StreamKind::Bidirectional
        } else {
            StreamKind::Unidirectional
        }
    }

    #[inline]
    pub fn is_bidirectional(self) -> bool {
        matches!(self.kind(), StreamKind::Bidirectional)
    }

    #[inline]
    pub fn is_local_initiated(self, local_role: Role) -> bool {
        self.initiator() == local_role
    }

    /// Returns the zero-based index of this stream within its class
    #[inline]
    pub fn stream_index(self) -> u64 {
        self.0.as_u64() >> 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_layout() {
        let id = StreamId::from_varint(VarInt::from_u8(0));
        assert_eq!(id.initiator(), Role::Client);
        assert_eq!(id.kind(), StreamKind::Bidirectional);

        let id = StreamId::from_varint(VarInt::from_u8(1));
        assert_eq!(id.initiator(), Role::Server);
        assert_eq!(id.kind(), StreamKind::Bidirectional);

        let id = StreamId::from_varint(VarInt::from_u8(2));
        assert_eq!(id.initiator(), Role::Client);
        assert_eq!(id.kind(), StreamKind::Unidirectional);

        let id = StreamId::from_varint(VarInt::from_u8(3));
        assert_eq!(id.initiator(), Role::Server);
        assert_eq!(id.kind(), StreamKind::Unidirectional);
    }

    #[test]
    fn nth_round_trips() {
        for n in 0..16 {
            for (role, kind) in [
                (Role::Client, StreamKind::Bidirectional),
                (Role::Client, StreamKind::Unidirectional),
                (Role::Server, StreamKind::Bidirectional),
                (Role::Server, StreamKind::Unidirectional),
            ] {
                let id = StreamId::nth(role, kind, n).unwrap();
                assert_eq!(id.initiator(), role);
                assert_eq!(id.kind(), kind);
                assert_eq!(id.stream_index(), n);
            }
        }
    }
}
