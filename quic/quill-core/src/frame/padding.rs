// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quill_codec::{decoder_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.1
//# The PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

pub const PADDING_TAG: u8 = 0x00;

/// A run of consecutive PADDING bytes, coalesced into a single frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    #[inline]
    pub fn tag(&self) -> u8 {
        PADDING_TAG
    }
}

decoder_value!(
    impl<'a> Padding {
        fn decode(buffer: Buffer) -> Result<Self> {
            let mut length = 0;
            while length < buffer.len() && buffer.peek_byte(length)? == PADDING_TAG {
                length += 1;
            }
            let buffer = buffer.skip(length)?;
            Ok((Padding { length }, buffer))
        }
    }
);

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.write_repeated(self.length, PADDING_TAG)
    }

    #[inline]
    fn encoding_size(&self) -> usize {
        self.length
    }

    #[inline]
    fn encoding_size_for_encoder<E: Encoder>(&self, _encoder: &E) -> usize {
        self.length
    }
}
