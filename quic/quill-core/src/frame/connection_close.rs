// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE with a frame type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

pub const CONNECTION_CLOSE_TAG: u8 = 0x1c;
pub const APPLICATION_CLOSE_TAG: u8 = 0x1d;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClose<Data> {
    pub error_code: u16,
    /// The frame type that triggered the error, transport closes only
    pub frame_type: Option<VarInt>,
    pub reason: Data,
    pub is_application: bool,
}

impl<Data> ConnectionClose<Data> {
    #[inline]
    pub fn tag(&self) -> u8 {
        if self.is_application {
            APPLICATION_CLOSE_TAG
        } else {
            CONNECTION_CLOSE_TAG
        }
    }

    #[inline]
    pub fn map_reason<F: FnOnce(Data) -> Out, Out>(&self, map: F) -> ConnectionClose<Out>
    where
        Data: Copy,
    {
        ConnectionClose {
            error_code: self.error_code,
            frame_type: self.frame_type,
            reason: map(self.reason),
            is_application: self.is_application,
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> ConnectionClose<Data> {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let is_application = tag == APPLICATION_CLOSE_TAG;

            let (error_code, buffer) = buffer.decode::<u16>()?;

            let (frame_type, buffer) = if is_application {
                (None, buffer)
            } else {
                let (frame_type, buffer) = buffer.decode::<VarInt>()?;
                (Some(frame_type), buffer)
            };

            let (reason, buffer) = buffer.decode_with_len_prefix::<VarInt, Data>()?;

            let frame = ConnectionClose {
                error_code,
                frame_type,
                reason,
                is_application,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for ConnectionClose<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.error_code);
        if !self.is_application {
            buffer.encode(&self.frame_type.unwrap_or_default());
        }
        buffer.encode_with_len_prefix::<VarInt, _>(&self.reason);
    }
}
