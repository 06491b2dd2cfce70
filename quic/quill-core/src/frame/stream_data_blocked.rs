// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.13
//# A sender SHOULD send a STREAM_DATA_BLOCKED frame (type=0x15) when it
//# wishes to send data, but is unable to due to stream-level flow
//# control.

pub const STREAM_DATA_BLOCKED_TAG: u8 = 0x15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamDataBlocked {
    pub stream_id: VarInt,
    /// The stream-level limit at which blocking occurred
    pub stream_data_limit: VarInt,
}

simple_frame_codec!(
    StreamDataBlocked {
        stream_id,
        stream_data_limit
    },
    STREAM_DATA_BLOCKED_TAG
);
