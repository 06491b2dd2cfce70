// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# STREAM frame takes the form 0b00001XXX (or the set of values from
//# 0x08 to 0x0f).

pub const STREAM_TAG_MIN: u8 = 0x08;
pub const STREAM_TAG_MAX: u8 = 0x0f;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
//# o  The OFF bit (0x04) in the frame type is set to indicate that there
//#    is an Offset field present.

const OFF_BIT: u8 = 0x04;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
//# o  The LEN bit (0x02) in the frame type is set to indicate that there
//#    is a Length field present.  If this bit is set to 0, the Length
//#    field is absent and the Stream Data field extends to the end of
//#    the packet.

const LEN_BIT: u8 = 0x02;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
//# o  The FIN bit (0x01) of the frame type is set only on frames that
//#    contain the final size of the stream.

const FIN_BIT: u8 = 0x01;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream<Data> {
    pub stream_id: VarInt,

    /// The byte offset in the stream for the data in this frame
    pub offset: VarInt,

    /// The bytes from the designated stream to be delivered
    pub data: Data,

    /// True only on the frame carrying the final size of the stream
    pub is_fin: bool,

    /// If true the frame extends to the end of the packet and omits its
    /// Length field
    pub is_last_frame: bool,
}

impl<Data> Stream<Data> {
    #[inline]
    pub fn tag(&self) -> u8 {
        let mut tag = STREAM_TAG_MIN;
        if *self.offset != 0 {
            tag |= OFF_BIT;
        }
        if !self.is_last_frame {
            tag |= LEN_BIT;
        }
        if self.is_fin {
            tag |= FIN_BIT;
        }
        tag
    }

    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(&self, map: F) -> Stream<Out>
    where
        Data: Copy,
    {
        Stream {
            stream_id: self.stream_id,
            offset: self.offset,
            data: map(self.data),
            is_fin: self.is_fin,
            is_last_frame: self.is_last_frame,
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Data> Stream<Data> {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let has_offset = tag & OFF_BIT == OFF_BIT;
            let is_last_frame = tag & LEN_BIT != LEN_BIT;
            let is_fin = tag & FIN_BIT == FIN_BIT;

            let (stream_id, buffer) = buffer.decode()?;

            let (offset, buffer) = if has_offset {
                buffer.decode()?
            } else {
                (Default::default(), buffer)
            };

            let (data, buffer) = if is_last_frame {
                let (data, buffer) = buffer.decode::<Data>()?;
                (data, buffer)
            } else {
                buffer.decode_with_len_prefix::<VarInt, Data>()?
            };

            let frame = Stream {
                stream_id,
                offset,
                data,
                is_fin,
                is_last_frame,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Stream<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.stream_id);

        if *self.offset != 0 {
            buffer.encode(&self.offset);
        }

        if self.is_last_frame {
            buffer.encode(&self.data);
        } else {
            buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}

/// Bytes a STREAM frame occupies beyond its data when carrying an
/// explicit length
#[inline]
pub fn frame_overhead(stream_id: VarInt, offset: u64, data_len: usize) -> usize {
    let mut len = 1 + stream_id.encoding_size();
    if offset != 0 {
        len += VarInt::new(offset).unwrap_or(VarInt::MAX).encoding_size();
    }
    len + VarInt::try_from(data_len).unwrap_or(VarInt::MAX).encoding_size()
}
