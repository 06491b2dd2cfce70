// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection settings handed to the engine at construction.
//!
//! These double as the local transport parameters the embedder's TLS stack
//! advertises; the engine itself never encodes them onto the wire.

use crate::{
    connection::StatelessResetToken, varint::VarInt, DEFAULT_MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
use core::time::Duration;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#18.1
//# ack_delay_exponent (0x000a):  An 8-bit unsigned integer value
//#    indicating an exponent used to decode the ACK Delay field in the
//#    ACK frame, see Section 19.3.  If this value is absent, a default
//#    value of 3 is assumed (indicating a multiplier of 8).

pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#18.1
//# max_ack_delay (0x000b):  An 8-bit unsigned integer value indicating
//#    the maximum amount of time in milliseconds by which it will delay
//#    sending of acknowledgments.

pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// A preferred server address communicated out of band of the current path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreferredAddress {
    pub addr: std::net::SocketAddr,
    pub cid: crate::connection::ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

/// The recognized per-connection options
#[derive(Clone, Debug)]
pub struct Settings {
    pub max_stream_data_bidi_local: VarInt,
    pub max_stream_data_bidi_remote: VarInt,
    pub max_stream_data_uni: VarInt,
    pub max_data: VarInt,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    pub idle_timeout: Option<Duration>,
    pub max_packet_size: usize,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub disable_migration: bool,
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_stream_data_bidi_local: VarInt::from_u32(256 * 1024),
            max_stream_data_bidi_remote: VarInt::from_u32(256 * 1024),
            max_stream_data_uni: VarInt::from_u32(256 * 1024),
            max_data: VarInt::from_u32(1024 * 1024),
            max_streams_bidi: 100,
            max_streams_uni: 100,
            idle_timeout: Some(Duration::from_secs(30)),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            ack_delay_exponent: DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: DEFAULT_MAX_ACK_DELAY,
            disable_migration: false,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }
}

impl Settings {
    /// The packet size the engine will actually respect for this connection
    #[inline]
    pub fn effective_max_packet_size(&self) -> usize {
        self.max_packet_size.max(MIN_PACKET_SIZE)
    }

    /// Scales a wire ACK Delay value into a `Duration` using the exponent
    #[inline]
    pub fn decode_ack_delay(&self, raw: VarInt) -> Duration {
        Duration::from_micros(raw.as_u64() << self.ack_delay_exponent)
    }

    /// Scales a `Duration` into the wire ACK Delay representation
    #[inline]
    pub fn encode_ack_delay(&self, delay: Duration) -> VarInt {
        VarInt::new((delay.as_micros() as u64) >> self.ack_delay_exponent)
            .unwrap_or(VarInt::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_delay_scaling() {
        let settings = Settings::default();
        let raw = VarInt::from_u32(1000);
        // default exponent of 3 multiplies by 8
        assert_eq!(settings.decode_ack_delay(raw), Duration::from_micros(8000));
        assert_eq!(
            settings.encode_ack_delay(Duration::from_micros(8000)),
            raw
        );
    }

    #[test]
    fn packet_size_floor() {
        let settings = Settings {
            max_packet_size: 600,
            ..Default::default()
        };
        assert_eq!(settings.effective_max_packet_size(), MIN_PACKET_SIZE);
    }
}
