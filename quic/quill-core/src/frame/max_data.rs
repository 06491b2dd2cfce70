// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.9
//# The MAX_DATA frame (type=0x10) is used in flow control to inform the
//# peer of the maximum amount of data that can be sent on the connection
//# as a whole.

pub const MAX_DATA_TAG: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxData {
    pub max_data: VarInt,
}

simple_frame_codec!(MaxData { max_data }, MAX_DATA_TAG);
