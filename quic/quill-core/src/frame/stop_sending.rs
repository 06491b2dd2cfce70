// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::VarInt;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.5
//# An endpoint uses a STOP_SENDING frame (type=0x05) to communicate that
//# incoming data is being discarded on receipt at application request.

pub const STOP_SENDING_TAG: u8 = 0x05;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSending {
    pub stream_id: VarInt,
    pub app_error_code: u16,
}

simple_frame_codec!(
    StopSending {
        stream_id,
        app_error_code
    },
    STOP_SENDING_TAG
);
