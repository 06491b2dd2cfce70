// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod header;
pub mod number;
pub mod protection;

pub use header::{
    decode_version_list, verify_reserved_bits, Header, HeaderOffsets, PacketType, Retry,
    FIXED_BIT, KEY_PHASE_BIT, LONG_FORM_BIT, SPIN_BIT,
};
pub use number::{PacketNumber, PacketNumberSpace, TruncatedPacketNumber};
