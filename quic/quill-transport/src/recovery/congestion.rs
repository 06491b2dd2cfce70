// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#6
//# QUIC's congestion control is based on TCP NewReno [RFC6582].

/// NewReno-style congestion controller
///
/// Window arithmetic is in bytes. Probe packets bypass the window
/// entirely; the caller simply skips the `cwnd_left` gate for them.
#[derive(Clone, Copy, Debug)]
pub struct NewReno {
    max_packet_size: usize,
    cwnd: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    /// Largest packet number sent when loss was last detected; acks of
    /// later packets exit recovery
    recovery_end_pkt: Option<u64>,
    in_recovery: bool,
}

//= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#6.4
//# kInitialWindow:  Default limit on the initial amount of outstanding
//#    data in bytes... min(10 * kMaxDatagramSize, max(2 * kMaxDatagramSize,
//#    14720))

#[inline]
fn initial_window(max_packet_size: usize) -> usize {
    (10 * max_packet_size).min((2 * max_packet_size).max(14720))
}

impl NewReno {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            cwnd: initial_window(max_packet_size),
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            recovery_end_pkt: None,
            in_recovery: false,
        }
    }

    #[inline]
    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    #[inline]
    pub fn ssthresh(&self) -> usize {
        self.ssthresh
    }

    #[inline]
    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    /// Bytes the window still allows onto the wire
    #[inline]
    pub fn cwnd_left(&self) -> usize {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    /// Credits `bytes` of a newly acknowledged packet `pkt_num`
    pub fn on_packet_acked(&mut self, pkt_num: u64, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);

        if self.in_recovery {
            match self.recovery_end_pkt {
                Some(end) if pkt_num > end => self.in_recovery = false,
                _ => return,
            }
        }

        if self.cwnd < self.ssthresh {
            //= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#6.8
            //# While in slow start, QUIC increases the congestion window by
            //# the number of acknowledged bytes
            self.cwnd += bytes;
        } else {
            // congestion avoidance: one packet per window
            self.cwnd += self.max_packet_size * bytes / self.cwnd;
        }
    }

    /// Removes lost bytes from flight and, outside an existing recovery
    /// episode, halves the window
    ///
    /// `largest_sent` is the newest packet number on the wire when loss was
    /// declared; recovery lasts until something newer is acknowledged.
    pub fn on_packets_lost(&mut self, lost_bytes: usize, largest_sent: u64) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);

        if self.in_recovery {
            return;
        }

        //= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#6.9
        //# The sender MUST reduce its congestion window... by half.
        self.ssthresh = (self.cwnd / 2).max(2 * self.max_packet_size);
        self.cwnd = self.ssthresh;
        self.in_recovery = true;
        self.recovery_end_pkt = Some(largest_sent);
    }

    /// Drops `bytes` from flight without a congestion response (discarded
    /// or abandoned packets)
    pub fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    /// Forgets everything learned about the path (migration)
    pub fn reset(&mut self) {
        *self = Self::new(self.max_packet_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MTU: usize = 1200;

    #[test]
    fn initial_window_rule() {
        assert_eq!(initial_window(1200), 12000);
        assert_eq!(initial_window(8000), 16000);
        assert_eq!(initial_window(500), 5000);
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut cc = NewReno::new(MTU);
        let w0 = cc.cwnd();
        cc.on_packet_sent(1000);
        cc.on_packet_acked(1, 1000);
        assert_eq!(cc.cwnd(), w0 + 1000);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn loss_halves_window_once_per_episode() {
        let mut cc = NewReno::new(MTU);
        let w0 = cc.cwnd();
        cc.on_packet_sent(3000);

        cc.on_packets_lost(1000, 10);
        assert_eq!(cc.cwnd(), w0 / 2);
        assert_eq!(cc.ssthresh(), w0 / 2);

        // further losses within the episode do not halve again
        cc.on_packets_lost(1000, 10);
        assert_eq!(cc.cwnd(), w0 / 2);

        // acks of packets sent before the loss point do not grow the window
        cc.on_packet_acked(9, 1000);
        assert_eq!(cc.cwnd(), w0 / 2);

        // an ack past the loss point exits recovery; the next ack grows
        cc.on_packet_sent(500);
        cc.on_packet_acked(11, 500);
        cc.on_packet_sent(500);
        cc.on_packet_acked(12, 500);
        assert!(cc.cwnd() > w0 / 2);
    }

    #[test]
    fn window_floor_is_two_packets() {
        let mut cc = NewReno::new(MTU);
        for pkt in 0..20 {
            cc.on_packet_sent(100);
            cc.on_packets_lost(100, pkt);
            // restart the episode each round
            cc.on_packet_sent(100);
            cc.on_packet_acked(pkt + 1, 100);
        }
        assert!(cc.cwnd() >= 2 * MTU);
    }

    #[test]
    fn congestion_avoidance_growth_is_linear() {
        let mut cc = NewReno::new(MTU);
        cc.on_packet_sent(2 * MTU);
        cc.on_packets_lost(MTU, 1);
        assert_eq!(cc.cwnd(), cc.ssthresh());
        // the exit ack already grows the window in avoidance mode
        cc.on_packet_acked(2, MTU);
        let w = cc.cwnd();

        // in avoidance now: acking a full window grows by about one packet
        let mut acked = 0;
        let mut pkt = 10;
        while acked < w {
            cc.on_packet_sent(MTU);
            cc.on_packet_acked(pkt, MTU);
            acked += MTU;
            pkt += 1;
        }
        assert!(cc.cwnd() >= w + MTU - 100);
        assert!(cc.cwnd() <= w + MTU + 100);
    }

    #[test]
    fn cwnd_left_gates_sending() {
        let mut cc = NewReno::new(MTU);
        let w = cc.cwnd();
        cc.on_packet_sent(w - 100);
        assert_eq!(cc.cwnd_left(), 100);
        cc.on_packet_sent(100);
        assert_eq!(cc.cwnd_left(), 0);
    }
}
