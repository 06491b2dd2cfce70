// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, NetworkEndian};
use core::{convert::TryInto, fmt, mem::size_of};

/// Result of decoding a value of type `T`: the value and the remaining buffer
pub type DecoderBufferResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderError {
    /// The buffer ended before the requested number of bytes was available
    UnexpectedEof(usize),
    /// The buffer contained bytes after a value that must consume it fully
    UnexpectedBytes(usize),
    /// A length prefix could not be represented in the platform's `usize`
    LengthCapacityExceeded,
    /// The bytes decoded but violated an invariant of the value
    InvariantViolation(&'static str),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEof(len) => write!(f, "unexpected eof: {len}"),
            Self::UnexpectedBytes(len) => write!(f, "unexpected bytes: {len}"),
            Self::LengthCapacityExceeded => {
                write!(f, "length could not be represented in platform's usize type")
            }
            Self::InvariantViolation(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DecoderError {}

/// Returns a `DecoderError::InvariantViolation` unless the expression holds
#[macro_export]
macro_rules! decoder_invariant {
    ($expr:expr, $invariant:expr) => {
        if !($expr) {
            return ::core::result::Result::Err(
                $crate::decoder::DecoderError::InvariantViolation($invariant).into(),
            );
        }
    };
}

/// An immutable view of a byte slice with panic-free cursor operations
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl fmt::Debug for DecoderBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DecoderBuffer(len = {})", self.len())
    }
}

impl<'a> DecoderBuffer<'a> {
    #[inline]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Splits off a sub-buffer of `count` bytes from the front
    #[inline]
    pub fn decode_slice(self, count: usize) -> DecoderBufferResult<'a, DecoderBuffer<'a>> {
        self.ensure_len(count)?;
        let (slice, remaining) = self.bytes.split_at(count);
        Ok((Self::new(slice), Self::new(remaining)))
    }

    /// Decodes a value of type `T`, splitting its bytes from the buffer
    #[inline]
    pub fn decode<T: DecoderValue<'a>>(self) -> DecoderBufferResult<'a, T> {
        T::decode(self)
    }

    /// Decodes a sub-buffer prefixed by a length of type `Length`
    #[inline]
    pub fn decode_slice_with_len_prefix<Length>(self) -> DecoderBufferResult<'a, DecoderBuffer<'a>>
    where
        Length: DecoderValue<'a> + TryInto<usize>,
    {
        let (len, buffer) = self.decode::<Length>()?;
        let len = len
            .try_into()
            .map_err(|_| DecoderError::LengthCapacityExceeded)?;
        buffer.decode_slice(len)
    }

    /// Decodes a value of type `T` prefixed by a length of type `Length`
    ///
    /// The value must consume the entire prefixed region.
    #[inline]
    pub fn decode_with_len_prefix<Length, T>(self) -> DecoderBufferResult<'a, T>
    where
        Length: DecoderValue<'a> + TryInto<usize>,
        T: DecoderValue<'a>,
    {
        let (slice, buffer) = self.decode_slice_with_len_prefix::<Length>()?;
        let (value, slice) = slice.decode::<T>()?;
        slice.ensure_empty()?;
        Ok((value, buffer))
    }

    /// Decodes a value of type `T` whose parse depends on a `parameter`
    #[inline]
    pub fn decode_parameterized<T: DecoderParameterizedValue<'a>>(
        self,
        parameter: T::Parameter,
    ) -> DecoderBufferResult<'a, T> {
        T::decode_parameterized(parameter, self)
    }

    /// Discards `count` bytes from the front
    #[inline]
    pub fn skip(self, count: usize) -> Result<DecoderBuffer<'a>, DecoderError> {
        self.decode_slice(count).map(|(_, buffer)| buffer)
    }

    /// Returns the byte at `index` without consuming anything
    #[inline]
    pub fn peek_byte(&self, index: usize) -> Result<u8, DecoderError> {
        self.bytes
            .get(index)
            .copied()
            .ok_or(DecoderError::UnexpectedEof(index))
    }

    /// Returns a sub-buffer over `range` without consuming anything
    #[inline]
    pub fn peek_range(
        &self,
        range: core::ops::Range<usize>,
    ) -> Result<DecoderBuffer<'a>, DecoderError> {
        let end = range.end;
        self.bytes
            .get(range)
            .map(DecoderBuffer::new)
            .ok_or(DecoderError::UnexpectedEof(end))
    }

    #[inline]
    pub fn ensure_empty(&self) -> Result<(), DecoderError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::UnexpectedBytes(self.len()))
        }
    }

    #[inline]
    pub fn ensure_len(&self, len: usize) -> Result<(), DecoderError> {
        if self.len() < len {
            Err(DecoderError::UnexpectedEof(len))
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrows the underlying slice, discarding the cursor protections
    #[inline]
    pub fn as_less_safe_slice(&self) -> &'a [u8] {
        self.bytes
    }

    /// Consumes the buffer into the underlying slice
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

impl PartialEq<[u8]> for DecoderBuffer<'_> {
    #[inline]
    fn eq(&self, rhs: &[u8]) -> bool {
        self.bytes == rhs
    }
}

/// A value that can be decoded from a `DecoderBuffer`
pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self>;
}

/// A value whose decoding is parameterized, e.g. by a previously-read tag
pub trait DecoderParameterizedValue<'a>: Sized {
    type Parameter;

    fn decode_parameterized(
        parameter: Self::Parameter,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self>;
}

#[macro_export]
macro_rules! decoder_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($buffer:ident: Buffer) -> Result<$ret:ty> $impl:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderValue<$lt> for $ty {
            #[inline]
            fn decode($buffer: $crate::DecoderBuffer<$lt>) -> $crate::DecoderBufferResult<$lt, $ret> $impl
        }
    };
}

#[macro_export]
macro_rules! decoder_parameterized_value {
    (impl<$lt:lifetime $(, $generic:ident)*> $ty:ty {
        fn decode($tag:ident: $tag_ty:ty, $buffer:ident: Buffer) -> Result<$ret:ty> $impl:block
    }) => {
        impl<$lt $(, $generic: $crate::DecoderValue<$lt>)*> $crate::DecoderParameterizedValue<$lt> for $ty {
            type Parameter = $tag_ty;

            #[inline]
            fn decode_parameterized($tag: Self::Parameter, $buffer: $crate::DecoderBuffer<$lt>) -> $crate::DecoderBufferResult<$lt, $ret> $impl
        }
    };
}

decoder_value!(
    impl<'a> u8 {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (value, buffer) = buffer.decode_slice(size_of::<Self>())?;
            Ok((value.as_less_safe_slice()[0], buffer))
        }
    }
);

macro_rules! decoder_value_network_endian {
    ($call:ident, $ty:ty) => {
        decoder_value!(
            impl<'a> $ty {
                fn decode(buffer: Buffer) -> Result<Self> {
                    let (value, buffer) = buffer.decode_slice(size_of::<Self>())?;
                    let value = NetworkEndian::$call(value.as_less_safe_slice());
                    Ok((value, buffer))
                }
            }
        );
    };
}

decoder_value_network_endian!(read_u16, u16);
decoder_value_network_endian!(read_u32, u32);
decoder_value_network_endian!(read_u64, u64);
decoder_value_network_endian!(read_u128, u128);

decoder_value!(
    impl<'a> DecoderBuffer<'a> {
        fn decode(buffer: Buffer) -> Result<Self> {
            let len = buffer.len();
            buffer.decode_slice(len)
        }
    }
);

decoder_value!(
    impl<'a> () {
        fn decode(buffer: Buffer) -> Result<Self> {
            Ok(((), buffer))
        }
    }
);

decoder_value!(
    impl<'a> &'a [u8] {
        fn decode(buffer: Buffer) -> Result<Self> {
            let len = buffer.len();
            let (slice, buffer) = buffer.decode_slice(len)?;
            Ok((slice.into_less_safe_slice(), buffer))
        }
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integers() {
        let data = [0, 1, 2, 3, 4, 5, 6];
        let buffer = DecoderBuffer::new(&data);

        let (value, buffer) = buffer.decode::<u8>().unwrap();
        assert_eq!(value, 0);

        let (value, buffer) = buffer.decode::<u16>().unwrap();
        assert_eq!(value, 258);

        let (value, buffer) = buffer.decode::<u32>().unwrap();
        assert_eq!(value, 50_595_078);

        assert!(buffer.is_empty());
        assert!(buffer.decode::<u8>().is_err());
    }

    #[test]
    fn decode_len_prefix() {
        let data = [2, 0, 1, 2, 3];
        let buffer = DecoderBuffer::new(&data);
        let (value, buffer) = buffer.decode_with_len_prefix::<u8, u16>().unwrap();
        assert_eq!(value, 1);
        assert_eq!(buffer.as_less_safe_slice(), &[2, 3][..]);

        // the value must consume the entire prefixed region
        let data = [3, 0, 1, 2];
        let buffer = DecoderBuffer::new(&data);
        assert!(buffer.decode_with_len_prefix::<u8, u16>().is_err());
    }

    #[test]
    fn peek_does_not_consume() {
        let data = [7, 8, 9];
        let buffer = DecoderBuffer::new(&data);
        assert_eq!(buffer.peek_byte(0).unwrap(), 7);
        assert_eq!(buffer.peek_byte(2).unwrap(), 9);
        assert!(buffer.peek_byte(3).is_err());
        assert_eq!(buffer.len(), 3);
    }
}
