// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::path_challenge::PATH_DATA_LEN;
use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.18
//# The PATH_RESPONSE frame (type=0x1b) is sent in response to a
//# PATH_CHALLENGE frame.  Its format is identical to the PATH_CHALLENGE
//# frame.

pub const PATH_RESPONSE_TAG: u8 = 0x1b;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub data: [u8; PATH_DATA_LEN],
}

decoder_parameterized_value!(
    impl<'a> PathResponse {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (data, buffer) = buffer.decode_slice(PATH_DATA_LEN)?;
            let mut bytes = [0; PATH_DATA_LEN];
            bytes.copy_from_slice(data.as_less_safe_slice());
            Ok((PathResponse { data: bytes }, buffer))
        }
    }
);

impl EncoderValue for PathResponse {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&PATH_RESPONSE_TAG);
        buffer.write_slice(&self.data);
    }
}
