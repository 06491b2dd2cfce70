// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod congestion;
pub mod rtb;
pub mod rtt;

pub use congestion::NewReno;
pub use rtb::{RetransmitBuffer, RtbEntry, RtbFlags};
pub use rtt::RttEstimator;

use crate::TIMER_GRANULARITY;
use core::time::Duration;

//= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#4.3
//# kTimeReorderingFraction: Maximum reordering in time space before time
//# based loss detection considers a packet lost.  In fraction of an
//# RTT.

/// Time-threshold loss delay: `9/8 * max(smoothed_rtt, latest_rtt)`
#[inline]
pub fn loss_delay(rtt: &RttEstimator) -> Duration {
    let base = rtt.smoothed_rtt().max(rtt.latest_rtt());
    let delay = base + base / 8;
    delay.max(TIMER_GRANULARITY)
}

//= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#4.3
//# kReorderingThreshold: Maximum reordering in packets before packet
//# based loss detection considers a packet lost.

pub const PACKET_THRESHOLD: u64 = 3;

/// The probe timeout for the current RTT estimate, before backoff
#[inline]
pub fn base_pto(rtt: &RttEstimator, max_ack_delay: Duration) -> Duration {
    rtt.smoothed_rtt() + (rtt.rttvar() * 4).max(TIMER_GRANULARITY) + max_ack_delay
}

/// The probe timeout shifted left by the consecutive-timeout count
#[inline]
pub fn pto(rtt: &RttEstimator, max_ack_delay: Duration, pto_count: u32) -> Duration {
    backoff(base_pto(rtt, max_ack_delay), pto_count)
}

#[inline]
pub fn backoff(base: Duration, count: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(count).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pto_backoff_shifts_left() {
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let mad = Duration::from_millis(25);
        let base = base_pto(&rtt, mad);
        assert_eq!(pto(&rtt, mad, 0), base);
        assert_eq!(pto(&rtt, mad, 1), base * 2);
        assert_eq!(pto(&rtt, mad, 3), base * 8);
    }

    #[test]
    fn loss_delay_floor() {
        let rtt = RttEstimator::new(Duration::from_micros(100));
        assert_eq!(loss_delay(&rtt), TIMER_GRANULARITY);
    }
}
