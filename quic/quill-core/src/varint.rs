// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::Deref,
};
use quill_codec::{decoder_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#16
//# QUIC packets and frames commonly use a variable-length encoding for
//# non-negative integer values.  This encoding ensures that smaller
//# integer values need fewer bytes to encode.
//#
//# The QUIC variable-length integer encoding reserves the two most
//# significant bits of the first byte to encode the base 2 logarithm of
//# the integer encoding length in bytes.  The integer value is encoded
//# on the remaining bits, in network byte order.
//#
//# This means that integers are encoded on 1, 2, 4, or 8 bytes and can
//# encode 6, 14, 30, or 62 bit values respectively.

pub const MAX_VARINT_VALUE: u64 = 4_611_686_018_427_387_903;

#[derive(Debug)]
pub struct VarIntError;

impl fmt::Display for VarIntError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "varint range exceeded")
    }
}

impl std::error::Error for VarIntError {}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct VarInt(u64);

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl VarInt {
    pub const MAX: Self = Self(MAX_VARINT_VALUE);

    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn new(v: u64) -> Result<Self, VarIntError> {
        if v > MAX_VARINT_VALUE {
            return Err(VarIntError);
        }
        Ok(Self(v))
    }

    pub const fn from_u8(v: u8) -> Self {
        Self(v as u64)
    }

    pub const fn from_u16(v: u16) -> Self {
        Self(v as u64)
    }

    pub const fn from_u32(v: u32) -> Self {
        Self(v as u64)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn checked_add(self, value: Self) -> Option<Self> {
        Self::new(self.0.checked_add(value.0)?).ok()
    }

    #[inline]
    pub fn checked_add_usize(self, value: usize) -> Option<Self> {
        let value = value.try_into().ok()?;
        self.checked_add(value)
    }

    #[inline]
    #[must_use]
    pub fn saturating_add(self, value: Self) -> Self {
        Self::new(self.0.saturating_add(value.0)).unwrap_or(Self::MAX)
    }

    #[inline]
    pub fn checked_sub(self, value: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(value.0)?))
    }

    #[inline]
    #[must_use]
    pub fn saturating_sub(self, value: Self) -> Self {
        Self(self.0.saturating_sub(value.0))
    }

    #[inline]
    pub fn checked_mul(self, value: Self) -> Option<Self> {
        Self::new(self.0.checked_mul(value.0)?).ok()
    }

    /// Returns the number of bytes the two-bit-prefix encoding needs
    #[inline]
    pub fn encoding_len(self) -> usize {
        match self.0 {
            0..=63 => 1,
            64..=16_383 => 2,
            16_384..=1_073_741_823 => 4,
            _ => 8,
        }
    }
}

impl EncoderValue for VarInt {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let len = self.encoding_len();
        let two_bit = (len.trailing_zeros() as u64) & 0b11;
        let bytes = ((two_bit << (len * 8 - 2)) | self.0).to_be_bytes();
        encoder.write_sized(len, |buffer| {
            buffer.copy_from_slice(&bytes[8 - len..]);
        })
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.encoding_len()
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.encoding_len()
    }
}

decoder_value!(
    impl<'a> VarInt {
        fn decode(buffer: Buffer) -> Result<Self> {
            let header = buffer.peek_byte(0)?;

            Ok(match (header >> 6) & 0b11 {
                0b00 => {
                    let value = header & (2u8.pow(6) - 1);
                    let buffer = buffer.skip(1)?;
                    (Self(value.into()), buffer)
                }
                0b01 => {
                    let (value, buffer) = buffer.decode::<u16>()?;
                    let value = value & (2u16.pow(14) - 1);
                    (Self(value.into()), buffer)
                }
                0b10 => {
                    let (value, buffer) = buffer.decode::<u32>()?;
                    let value = value & (2u32.pow(30) - 1);
                    (Self(value.into()), buffer)
                }
                0b11 => {
                    let (value, buffer) = buffer.decode::<u64>()?;
                    let value = value & (2u64.pow(62) - 1);
                    (Self(value), buffer)
                }
                _ => unreachable!(),
            })
        }
    }
);

impl AsRef<u64> for VarInt {
    #[inline]
    fn as_ref(&self) -> &u64 {
        &self.0
    }
}

impl Deref for VarInt {
    type Target = u64;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

macro_rules! impl_from_lesser {
    ($ty:ty) => {
        impl From<$ty> for VarInt {
            #[inline]
            fn from(value: $ty) -> Self {
                Self(value.into())
            }
        }
    };
}

impl_from_lesser!(u8);
impl_from_lesser!(u16);
impl_from_lesser!(u32);

impl From<VarInt> for u64 {
    #[inline]
    fn from(v: VarInt) -> u64 {
        v.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntError;

    #[inline]
    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value as u64)
    }
}

impl TryFrom<VarInt> for usize {
    type Error = <usize as TryFrom<u64>>::Error;

    #[inline]
    fn try_from(value: VarInt) -> Result<Self, Self::Error> {
        value.0.try_into()
    }
}

impl core::ops::Add for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: Self) -> Self {
        if cfg!(debug_assertions) {
            self.checked_add(rhs).expect("VarInt overflow occurred")
        } else {
            Self(self.0 + rhs.0)
        }
    }
}

impl core::ops::AddAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub for VarInt {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: Self) -> Self {
        // Bounds check is inherited from u64
        Self(self.0 - rhs.0)
    }
}

impl core::ops::SubAssign<Self> for VarInt {
    #[inline]
    #[track_caller]
    fn sub_assign(&mut self, rhs: Self) {
        // Bounds check is inherited from u64
        self.0 -= rhs.0
    }
}

impl PartialEq<u64> for VarInt {
    #[inline]
    fn eq(&self, other: &u64) -> bool {
        self.0.eq(other)
    }
}

impl PartialOrd<u64> for VarInt {
    #[inline]
    fn partial_cmp(&self, other: &u64) -> Option<core::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use quill_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(value: VarInt) -> (Vec<u8>, VarInt, usize) {
        let bytes = value.encode_to_vec();
        let decoder = DecoderBuffer::new(&bytes);
        let (decoded, remaining) = decoder.decode::<VarInt>().unwrap();
        assert!(remaining.is_empty());
        let len = bytes.len();
        (bytes, decoded, len)
    }

    #[test]
    fn boundary_encodings() {
        macro_rules! example {
            ($value:expr, $encoding:expr) => {{
                let (bytes, decoded, len) = round_trip(VarInt::new($value).unwrap());
                assert_eq!(bytes, $encoding);
                assert_eq!(decoded, $value);
                assert_eq!(len, $encoding.len());
            }};
        }

        example!(0, [0x00]);
        example!(63, [0x3f]);
        example!(64, [0x40, 0x40]);
        example!(16383, [0x7f, 0xff]);
        example!(16384, [0x80, 0x00, 0x40, 0x00]);
        example!(1_073_741_823, [0xbf, 0xff, 0xff, 0xff]);
        example!(
            MAX_VARINT_VALUE,
            [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
        );
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#16
    //= type=test
    //# For example, the eight byte sequence c2 19 7c 5e ff 14 e8 8c (in
    //# hexadecimal) decodes to the decimal value 151288809941952652;
    #[test]
    fn draft_example() {
        let bytes = [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c];
        let (value, _) = DecoderBuffer::new(&bytes).decode::<VarInt>().unwrap();
        assert_eq!(value, 151_288_809_941_952_652u64);
    }

    #[test]
    fn round_trip_property() {
        check!().with_type::<u64>().cloned().for_each(|value| {
            let Ok(value) = VarInt::new(value & MAX_VARINT_VALUE) else {
                return;
            };
            let (_, decoded, len) = round_trip(value);
            assert_eq!(decoded, value);
            assert_eq!(len, value.encoding_len());
        });
    }

    #[test]
    fn short_input_is_rejected() {
        // a two-byte encoding cut to one byte
        let bytes = [0x7f];
        assert!(DecoderBuffer::new(&bytes).decode::<VarInt>().is_err());
    }

    #[test]
    fn checked_arithmetic() {
        assert_eq!(VarInt::MAX.checked_add(VarInt::from_u8(1)), None);
        assert_eq!(VarInt::ZERO.checked_sub(VarInt::from_u8(1)), None);
        assert_eq!(VarInt::MAX.saturating_add(VarInt::MAX), VarInt::MAX);
    }
}
