// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quill_codec::{Encoder, EncoderValue};
use subtle::ConstantTimeEq;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2
//# In QUIC version 1, this value MUST NOT exceed 20 bytes.

// The draft-era length nibble encodes 0 or (len - 3) for 4..=18.
pub const MIN_LEN: usize = 4;
pub const MAX_LEN: usize = 18;

/// A connection identifier of 0 or 4..=18 bytes, stored inline
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ConnectionId {
    bytes: [u8; MAX_LEN],
    len: u8,
}

#[derive(Debug)]
pub struct InvalidLength;

impl ConnectionId {
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };

    /// Creates an id from a slice, enforcing the valid length set {0, 4..=18}
    #[inline]
    pub fn try_from_slice(slice: &[u8]) -> Result<Self, InvalidLength> {
        if !slice.is_empty() && !(MIN_LEN..=MAX_LEN).contains(&slice.len()) {
            return Err(InvalidLength);
        }
        let mut bytes = [0; MAX_LEN];
        bytes[..slice.len()].copy_from_slice(slice);
        Ok(Self {
            bytes,
            len: slice.len() as u8,
        })
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for ConnectionId {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.as_slice() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl EncoderValue for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self.as_slice())
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.len()
    }
}

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#10.4
//# A stateless reset token is specific to a connection ID.

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// A per-connection-id secret; comparisons run in constant time
#[derive(Clone, Copy, Eq, Hash)]
pub struct StatelessResetToken([u8; STATELESS_RESET_TOKEN_LEN]);

impl StatelessResetToken {
    pub const ZEROED: Self = Self([0; STATELESS_RESET_TOKEN_LEN]);

    #[inline]
    pub const fn new(bytes: [u8; STATELESS_RESET_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; STATELESS_RESET_TOKEN_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub const fn into_inner(self) -> [u8; STATELESS_RESET_TOKEN_LEN] {
        self.0
    }
}

impl PartialEq for StatelessResetToken {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for StatelessResetToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never log token material
        f.write_str("StatelessResetToken(..)")
    }
}

impl EncoderValue for StatelessResetToken {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&self.0)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        STATELESS_RESET_TOKEN_LEN
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        STATELESS_RESET_TOKEN_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_validation() {
        assert!(ConnectionId::try_from_slice(&[]).is_ok());
        assert!(ConnectionId::try_from_slice(&[1, 2, 3]).is_err());
        assert!(ConnectionId::try_from_slice(&[0; 4]).is_ok());
        assert!(ConnectionId::try_from_slice(&[0; 18]).is_ok());
        assert!(ConnectionId::try_from_slice(&[0; 19]).is_err());
    }

    #[test]
    fn token_compare() {
        let a = StatelessResetToken::new([1; 16]);
        let b = StatelessResetToken::new([1; 16]);
        let c = StatelessResetToken::new([2; 16]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
