// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.7
//# A server sends a NEW_TOKEN frame (type=0x07) to provide the client
//# with a token to send in the header of an Initial packet for a future
//# connection.

pub const NEW_TOKEN_TAG: u8 = 0x07;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewToken<Data> {
    pub token: Data,
}

impl<Data> NewToken<Data> {
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(&self, map: F) -> NewToken<Out>
    where
        Data: Copy,
    {
        NewToken {
            token: map(self.token),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> NewToken<Data> {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (token, buffer) = buffer.decode_with_len_prefix::<VarInt, Data>()?;
            Ok((NewToken { token }, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for NewToken<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&NEW_TOKEN_TAG);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.token);
    }
}
