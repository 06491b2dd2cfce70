// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{stream::StreamKind, varint::VarInt};
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.14
//# A sender SHOULD send a STREAMS_BLOCKED frame (type=0x16 or 0x17) when
//# it wishes to open a stream, but is unable to due to the maximum
//# stream limit set by its peer.

pub const STREAMS_BLOCKED_BIDI_TAG: u8 = 0x16;
pub const STREAMS_BLOCKED_UNI_TAG: u8 = 0x17;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlocked {
    pub kind: StreamKind,
    /// The stream limit in effect when blocking occurred
    pub stream_limit: VarInt,
}

impl StreamsBlocked {
    #[inline]
    pub fn tag(&self) -> u8 {
        match self.kind {
            StreamKind::Bidirectional => STREAMS_BLOCKED_BIDI_TAG,
            StreamKind::Unidirectional => STREAMS_BLOCKED_UNI_TAG,
        }
    }
}

decoder_parameterized_value!(
    impl<'a> StreamsBlocked {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let kind = if tag == STREAMS_BLOCKED_BIDI_TAG {
                StreamKind::Bidirectional
            } else {
                StreamKind::Unidirectional
            };
            let (stream_limit, buffer) = buffer.decode()?;
            Ok((StreamsBlocked { kind, stream_limit }, buffer))
        }
    }
);

impl EncoderValue for StreamsBlocked {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.stream_limit);
    }
}
