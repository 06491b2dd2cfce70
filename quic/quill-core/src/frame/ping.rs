// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quill_codec::{Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.2
//# Endpoints can use PING frames (type=0x01) to verify that their peers
//# are still alive or to check reachability to the peer.

pub const PING_TAG: u8 = 0x01;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ping;

impl EncoderValue for Ping {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&PING_TAG);
    }
}
