// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.12
//# A sender SHOULD send a DATA_BLOCKED frame (type=0x14) when it wishes
//# to send data, but is unable to due to connection-level flow control.

pub const DATA_BLOCKED_TAG: u8 = 0x14;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataBlocked {
    /// The connection-level limit at which blocking occurred
    pub data_limit: VarInt,
}

simple_frame_codec!(DataBlocked { data_limit }, DATA_BLOCKED_TAG);
