// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network paths and the PATH_CHALLENGE validation machinery.

use crate::{cid::DcidEntry, DEFAULT_INITIAL_RTT, MAX_PATH_CHALLENGES};
use core::time::Duration;
use quill_core::{frame::path_challenge::PATH_DATA_LEN, time::Timestamp};
use smallvec::SmallVec;
use std::net::SocketAddr;

/// The 4-tuple a datagram travelled
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Path {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Path {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

/// Outcome reported through the `path_validation` capability
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathValidationResult {
    Success,
    Failure,
}

/// Why the validator was started; failure handling differs
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationKind {
    /// The peer moved and traffic already switched; on failure fall back
    /// to the previous path and destination id
    MigrationWithFallback,
    /// Probing a candidate path; on failure just give up
    Probe,
}

/// The exponential backoff base for challenge retransmission
#[inline]
pub fn backoff_interval(loss_count: u32) -> Duration {
    let base = DEFAULT_INITIAL_RTT * 6;
    base.saturating_mul(1u32.checked_shl(loss_count).unwrap_or(u32::MAX))
}

/// An in-progress PATH_CHALLENGE exchange on the (already switched)
/// current path
#[derive(Debug)]
pub struct PathValidator {
    path: Path,
    /// Outstanding challenge payloads, newest last
    challenges: SmallVec<[[u8; PATH_DATA_LEN]; MAX_PATH_CHALLENGES]>,
    /// Consecutive unanswered transmissions
    loss_count: u32,
    /// Next scheduled challenge transmission
    next_tx: Timestamp,
    /// Hard deadline for the whole validation
    deadline: Timestamp,
    kind: ValidationKind,
    /// The path and destination id to return to on failure
    fallback: Option<(Path, DcidEntry)>,
}

impl PathValidator {
    /// Starts a validation with the outer deadline `timeout`
    pub fn new(
        path: Path,
        kind: ValidationKind,
        fallback: Option<(Path, DcidEntry)>,
        timeout: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            path,
            challenges: SmallVec::new(),
            loss_count: 0,
            next_tx: now,
            deadline: now + timeout,
            kind,
            fallback,
        }
    }

    #[inline]
    pub fn path(&self) -> Path {
        self.path
    }

    #[inline]
    pub fn kind(&self) -> ValidationKind {
        self.kind
    }

    pub fn into_parts(self) -> (Path, ValidationKind, Option<(Path, DcidEntry)>) {
        (self.path, self.kind, self.fallback)
    }

    /// True when a new PATH_CHALLENGE should go out now
    pub fn wants_challenge(&self, now: Timestamp) -> bool {
        self.challenges.len() < MAX_PATH_CHALLENGES && self.next_tx.has_elapsed(now)
    }

    /// Registers a transmitted challenge payload and arms the backoff
    pub fn on_challenge_sent(&mut self, data: [u8; PATH_DATA_LEN], now: Timestamp) {
        debug_assert!(self.challenges.len() < MAX_PATH_CHALLENGES);
        self.challenges.push(data);
        self.loss_count += 1;
        self.next_tx = now + backoff_interval(self.loss_count.saturating_sub(1));
    }

    /// Matches a PATH_RESPONSE against any outstanding challenge
    pub fn on_response(&mut self, data: &[u8; PATH_DATA_LEN]) -> bool {
        self.challenges.iter().any(|c| c == data)
    }

    /// True once every attempt is spent or the outer deadline passed
    pub fn is_expired(&self, now: Timestamp) -> bool {
        if self.deadline.has_elapsed(now) {
            return true;
        }
        self.challenges.len() >= MAX_PATH_CHALLENGES && self.next_tx.has_elapsed(now)
    }

    /// The next time the embedder must call back in, if any
    pub fn expiry(&self) -> Timestamp {
        self.next_tx.min(self.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(port: u16) -> Path {
        Path::new(
            "127.0.0.1:4433".parse().unwrap(),
            format!("127.0.0.1:{port}").parse().unwrap(),
        )
    }

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_interval(0), DEFAULT_INITIAL_RTT * 6);
        assert_eq!(backoff_interval(1), DEFAULT_INITIAL_RTT * 12);
        assert_eq!(backoff_interval(2), DEFAULT_INITIAL_RTT * 24);
    }

    #[test]
    fn challenge_schedule_backs_off() {
        let timeout = Duration::from_secs(60);
        let mut v = PathValidator::new(path(1), ValidationKind::Probe, None, timeout, ts(0));

        assert!(v.wants_challenge(ts(0)));
        v.on_challenge_sent([1; 8], ts(0));
        // 6 * 333ms before the next attempt
        assert!(!v.wants_challenge(ts(1900)));
        assert!(v.wants_challenge(ts(2000)));

        v.on_challenge_sent([2; 8], ts(2000));
        assert!(!v.wants_challenge(ts(5900)));
        assert!(v.wants_challenge(ts(6000)));
    }

    #[test]
    fn any_outstanding_challenge_matches() {
        let timeout = Duration::from_secs(60);
        let mut v = PathValidator::new(path(1), ValidationKind::Probe, None, timeout, ts(0));
        v.on_challenge_sent([1; 8], ts(0));
        v.on_challenge_sent([2; 8], ts(2000));

        assert!(v.on_response(&[1; 8]));
        assert!(v.on_response(&[2; 8]));
        assert!(!v.on_response(&[3; 8]));
    }

    #[test]
    fn validation_expires() {
        let timeout = Duration::from_secs(2);
        let v = PathValidator::new(path(1), ValidationKind::Probe, None, timeout, ts(0));
        assert!(!v.is_expired(ts(0)));
        // the outer deadline fires regardless of attempts left
        assert!(v.is_expired(ts(2000)));

        // or: all attempts spent and the last backoff elapsed
        let mut now = ts(0);
        let timeout = Duration::from_secs(3600);
        let mut v = PathValidator::new(path(1), ValidationKind::Probe, None, timeout, now);
        for i in 0..MAX_PATH_CHALLENGES {
            assert!(v.wants_challenge(now));
            v.on_challenge_sent([i as u8; 8], now);
            now = v.expiry();
        }
        assert!(!v.is_expired(now.checked_sub(Duration::from_millis(1)).unwrap()));
        assert!(v.is_expired(now));
    }
}
