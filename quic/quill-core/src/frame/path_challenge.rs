// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quill_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.17
//# Endpoints can use PATH_CHALLENGE frames (type=0x1a) to check
//# reachability to the peer and for path validation during connection
//# migration.
//#
//# Data:  This 8-byte field contains arbitrary data.

pub const PATH_CHALLENGE_TAG: u8 = 0x1a;

pub const PATH_DATA_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    pub data: [u8; PATH_DATA_LEN],
}

decoder_parameterized_value!(
    impl<'a> PathChallenge {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (data, buffer) = buffer.decode_slice(PATH_DATA_LEN)?;
            let mut bytes = [0; PATH_DATA_LEN];
            bytes.copy_from_slice(data.as_less_safe_slice());
            Ok((PathChallenge { data: bytes }, buffer))
        }
    }
);

impl EncoderValue for PathChallenge {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&PATH_CHALLENGE_TAG);
        buffer.write_slice(&self.data);
    }
}
