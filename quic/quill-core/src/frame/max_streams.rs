// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{stream::StreamKind, varint::VarInt};
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.11
//# The MAX_STREAMS frames (type=0x12 and 0x13) inform the peer of the
//# cumulative number of streams of a given type it is permitted to open.
//# A MAX_STREAMS frame with a type of 0x12 applies to bidirectional
//# streams, and a MAX_STREAMS frame with a type of 0x13 applies to
//# unidirectional streams.

pub const MAX_STREAMS_BIDI_TAG: u8 = 0x12;
pub const MAX_STREAMS_UNI_TAG: u8 = 0x13;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreams {
    pub kind: StreamKind,
    /// The cumulative count of streams of this kind the peer may open
    pub max_streams: VarInt,
}

impl MaxStreams {
    #[inline]
    pub fn tag(&self) -> u8 {
        match self.kind {
            StreamKind::Bidirectional => MAX_STREAMS_BIDI_TAG,
            StreamKind::Unidirectional => MAX_STREAMS_UNI_TAG,
        }
    }
}

decoder_parameterized_value!(
    impl<'a> MaxStreams {
        fn decode(tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let kind = if tag == MAX_STREAMS_BIDI_TAG {
                StreamKind::Bidirectional
            } else {
                StreamKind::Unidirectional
            };
            let (max_streams, buffer) = buffer.decode()?;
            Ok((MaxStreams { kind, max_streams }, buffer))
        }
    }
);

impl EncoderValue for MaxStreams {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.max_streams);
    }
}
