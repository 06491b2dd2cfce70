// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.4
//# An endpoint uses a RESET_STREAM frame (type=0x04) to abruptly
//# terminate the sending part of a stream.
//#
//# RESET_STREAM Frame {
//#   Stream ID (i),
//#   Application Error Code (16),
//#   Final Size (i),
//# }

pub const RESET_STREAM_TAG: u8 = 0x04;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetStream {
    pub stream_id: VarInt,
    pub app_error_code: u16,
    /// The size of the stream as fixed by the sender at reset time
    pub final_size: VarInt,
}

simple_frame_codec!(
    ResetStream {
        stream_id,
        app_error_code,
        final_size
    },
    RESET_STREAM_TAG
);
