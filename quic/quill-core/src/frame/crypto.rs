// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.6
//# The CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.  It can be sent in all packet types.  The CRYPTO
//# frame offers the cryptographic protocol an in-order stream of bytes.
//#
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

pub const CRYPTO_TAG: u8 = 0x06;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crypto<Data> {
    /// The byte offset in the handshake stream for the data in this frame
    pub offset: VarInt,
    pub data: Data,
}

impl<Data> Crypto<Data> {
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(&self, map: F) -> Crypto<Out>
    where
        Data: Copy,
    {
        Crypto {
            offset: self.offset,
            data: map(self.data),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> Crypto<Data> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (offset, buffer) = buffer.decode()?;
            let (data, buffer) = buffer.decode_with_len_prefix::<VarInt, Data>()?;
            Ok((Crypto { offset, data }, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Crypto<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&CRYPTO_TAG);
        buffer.encode(&self.offset);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}

/// Bytes a CRYPTO frame occupies beyond its data
#[inline]
pub fn frame_overhead(offset: u64, data_len: usize) -> usize {
    let offset = VarInt::new(offset).unwrap_or(VarInt::MAX);
    let len = VarInt::try_from(data_len).unwrap_or(VarInt::MAX);
    1 + offset.encoding_size() + len.encoding_size()
}
