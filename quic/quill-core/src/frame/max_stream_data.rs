// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.10
//# The MAX_STREAM_DATA frame (type=0x11) is used in flow control to
//# inform a peer of the maximum amount of data that can be sent on a
//# stream.

pub const MAX_STREAM_DATA_TAG: u8 = 0x11;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamData {
    pub stream_id: VarInt,
    pub max_stream_data: VarInt,
}

simple_frame_codec!(
    MaxStreamData {
        stream_id,
        max_stream_data
    },
    MAX_STREAM_DATA_TAG
);
