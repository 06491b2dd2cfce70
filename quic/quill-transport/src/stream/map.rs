// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The stream table and the round-robin transmit scheduler.

use crate::stream::Stream;
use core::hash::BuildHasherDefault;
use hashbrown::HashMap;
use quill_core::{
    endpoint::Role,
    settings::Settings,
    stream::{StreamId, StreamKind},
    transport::{Error, Result},
    varint::VarInt,
};
use siphasher::sip::SipHasher13;
use std::collections::BinaryHeap;

type StreamTable = HashMap<StreamId, Stream, BuildHasherDefault<SipHasher13>>;

/// Owns every live stream and decides which one transmits next
#[derive(Debug, Default)]
pub struct StreamMap {
    streams: StreamTable,

    /// Round-robin schedule: lowest `(cycle, id)` transmits first
    tx_sched: BinaryHeap<core::cmp::Reverse<(u64, StreamId)>>,
    next_cycle: u64,

    role: RoleState,
}

#[derive(Debug)]
struct RoleState {
    local_role: Role,

    // streams we open, limited by the peer
    next_local_bidi: u64,
    next_local_uni: u64,
    max_local_bidi: u64,
    max_local_uni: u64,

    // streams the peer opens, limited by us
    max_remote_bidi: u64,
    max_remote_uni: u64,
    unsent_max_remote_bidi: u64,
    unsent_max_remote_uni: u64,
    /// Count of remote streams ever seen (highest index + 1)
    remote_bidi_seen: u64,
    remote_uni_seen: u64,
}

impl Default for RoleState {
    fn default() -> Self {
        Self {
            local_role: Role::Client,
            next_local_bidi: 0,
            next_local_uni: 0,
            max_local_bidi: 0,
            max_local_uni: 0,
            max_remote_bidi: 0,
            max_remote_uni: 0,
            unsent_max_remote_bidi: 0,
            unsent_max_remote_uni: 0,
            remote_bidi_seen: 0,
            remote_uni_seen: 0,
        }
    }
}

/// How a stream came into being, for the open callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOrigin {
    Local,
    Remote,
}

impl StreamMap {
    pub fn new(local_role: Role, local_settings: &Settings) -> Self {
        let mut map = Self::default();
        map.role.local_role = local_role;
        map.role.max_remote_bidi = local_settings.max_streams_bidi;
        map.role.max_remote_uni = local_settings.max_streams_uni;
        map.role.unsent_max_remote_bidi = local_settings.max_streams_bidi;
        map.role.unsent_max_remote_uni = local_settings.max_streams_uni;
        map
    }

    /// Applies the peer's transport parameters once they arrive
    pub fn on_remote_settings(&mut self, remote: &Settings) {
        self.role.max_local_bidi = self.role.max_local_bidi.max(remote.max_streams_bidi);
        self.role.max_local_uni = self.role.max_local_uni.max(remote.max_streams_uni);

        // streams opened before the handshake finished learn their windows
        // late; grow-only semantics keep this safe
        for stream in self.streams.values_mut() {
            let limit = remote_tx_limit(self.role.local_role, stream.id(), remote);
            stream.on_max_stream_data(limit);
        }
    }

    #[inline]
    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Opens the next locally-initiated stream of `kind`
    pub fn open_local(
        &mut self,
        kind: StreamKind,
        local: &Settings,
        remote: Option<&Settings>,
    ) -> Result<StreamId> {
        let (next, limit) = match kind {
            StreamKind::Bidirectional => (&mut self.role.next_local_bidi, self.role.max_local_bidi),
            StreamKind::Unidirectional => (&mut self.role.next_local_uni, self.role.max_local_uni),
        };

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#4.5
        //# An endpoint that receives a frame with a stream ID exceeding the
        //# limit it has sent MUST treat this as a ... STREAM_LIMIT_ERROR
        if *next >= limit {
            return Err(Error::StreamIdBlocked);
        }

        let id = StreamId::nth(self.role.local_role, kind, *next)
            .ok_or(Error::PacketNumExhausted)?;
        *next += 1;

        let (max_tx, max_rx) = local_stream_windows(self.role.local_role, id, local, remote);
        self.streams.insert(id, Stream::new(id, max_tx, max_rx));
        Ok(id)
    }

    /// Looks up a stream, lazily creating a remote-initiated one
    ///
    /// Returns the stream plus its origin when freshly created, so the
    /// caller can emit the open event.
    pub fn get_or_create(
        &mut self,
        id: StreamId,
        local: &Settings,
        remote: Option<&Settings>,
    ) -> Result<(&mut Stream, Option<StreamOrigin>)> {
        if self.streams.contains_key(&id) {
            return Ok((
                self.streams.get_mut(&id).expect("key just checked"),
                None,
            ));
        }

        let index = id.stream_index();

        if id.is_local_initiated(self.role.local_role) {
            //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a locally-
            //# initiated stream that has not yet been created
            let opened = match id.kind() {
                StreamKind::Bidirectional => self.role.next_local_bidi,
                StreamKind::Unidirectional => self.role.next_local_uni,
            };
            if index >= opened {
                return Err(Error::StreamState);
            }
            // created earlier, closed since: treat as gone
            return Err(Error::StreamNotFound);
        }

        let (limit, seen) = match id.kind() {
            StreamKind::Bidirectional => {
                (self.role.max_remote_bidi, &mut self.role.remote_bidi_seen)
            }
            StreamKind::Unidirectional => {
                (self.role.max_remote_uni, &mut self.role.remote_uni_seen)
            }
        };

        if index >= limit {
            return Err(Error::StreamLimit);
        }

        if index < *seen {
            // an earlier stream that has already been destroyed
            return Err(Error::StreamNotFound);
        }
        *seen = index + 1;

        let (max_tx, max_rx) = local_stream_windows(self.role.local_role, id, local, remote);
        self.streams.insert(id, Stream::new(id, max_tx, max_rx));
        Ok((
            self.streams.get_mut(&id).expect("key just inserted"),
            Some(StreamOrigin::Remote),
        ))
    }

    /// Destroys a finished stream; remote streams free a MAX_STREAMS slot
    pub fn destroy(&mut self, id: StreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        if !id.is_local_initiated(self.role.local_role) {
            match id.kind() {
                StreamKind::Bidirectional => self.role.unsent_max_remote_bidi += 1,
                StreamKind::Unidirectional => self.role.unsent_max_remote_uni += 1,
            }
        }
        Some(stream)
    }

    // ---- MAX_STREAMS bookkeeping --------------------------------------

    /// A MAX_STREAMS update worth advertising, if any
    pub fn pending_max_streams(&self, kind: StreamKind) -> Option<VarInt> {
        let (unsent, sent) = match kind {
            StreamKind::Bidirectional => (
                self.role.unsent_max_remote_bidi,
                self.role.max_remote_bidi,
            ),
            StreamKind::Unidirectional => {
                (self.role.unsent_max_remote_uni, self.role.max_remote_uni)
            }
        };
        if unsent > sent {
            VarInt::new(unsent).ok()
        } else {
            None
        }
    }

    pub fn commit_max_streams(&mut self, kind: StreamKind, advertised: u64) {
        match kind {
            StreamKind::Bidirectional => {
                self.role.max_remote_bidi = self.role.max_remote_bidi.max(advertised)
            }
            StreamKind::Unidirectional => {
                self.role.max_remote_uni = self.role.max_remote_uni.max(advertised)
            }
        }
    }

    /// The peer raised our open budget
    pub fn on_max_streams(&mut self, kind: StreamKind, max: u64) -> bool {
        match kind {
            StreamKind::Bidirectional => {
                if max > self.role.max_local_bidi {
                    self.role.max_local_bidi = max;
                    return true;
                }
            }
            StreamKind::Unidirectional => {
                if max > self.role.max_local_uni {
                    self.role.max_local_uni = max;
                    return true;
                }
            }
        }
        false
    }

    /// The in-effect limit on streams we may open
    pub fn local_max_streams(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Bidirectional => self.role.max_local_bidi,
            StreamKind::Unidirectional => self.role.max_local_uni,
        }
    }

    pub fn local_streams_left(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Bidirectional => self
                .role
                .max_local_bidi
                .saturating_sub(self.role.next_local_bidi),
            StreamKind::Unidirectional => self
                .role
                .max_local_uni
                .saturating_sub(self.role.next_local_uni),
        }
    }

    // ---- transmit scheduling ------------------------------------------

    /// Enqueues a stream for transmission if it is not already queued
    pub fn schedule(&mut self, id: StreamId) {
        let next_cycle = self.next_cycle;
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.is_scheduled() {
                return;
            }
            stream.set_scheduled(true);
            if stream.cycle() < next_cycle {
                stream.set_cycle(next_cycle);
            }
            self.tx_sched
                .push(core::cmp::Reverse((stream.cycle(), id)));
        }
    }

    /// Pops the round-robin-minimum stream with pending data
    pub fn next_scheduled(&mut self) -> Option<StreamId> {
        while let Some(core::cmp::Reverse((cycle, id))) = self.tx_sched.pop() {
            if let Some(stream) = self.streams.get_mut(&id) {
                if stream.is_scheduled() && stream.cycle() == cycle {
                    stream.set_scheduled(false);
                    return Some(id);
                }
            }
        }
        None
    }

    /// Requeues a stream that still has data, bumping its cycle so its
    /// peers get their turn first
    pub fn reschedule_after_partial_send(&mut self, id: StreamId) {
        self.next_cycle += 1;
        let next_cycle = self.next_cycle;
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.set_cycle(next_cycle);
            stream.set_scheduled(true);
            self.tx_sched.push(core::cmp::Reverse((next_cycle, id)));
        }
    }

    pub fn has_scheduled(&self) -> bool {
        !self.tx_sched.is_empty()
    }
}

/// The (tx, rx) windows a freshly created stream starts with
fn local_stream_windows(
    local_role: Role,
    id: StreamId,
    local: &Settings,
    remote: Option<&Settings>,
) -> (u64, u64) {
    let tx = remote.map_or(0, |remote| remote_tx_limit(local_role, id, remote));

    let rx = if !id.is_bidirectional() {
        if id.is_local_initiated(local_role) {
            0
        } else {
            local.max_stream_data_uni.as_u64()
        }
    } else if id.is_local_initiated(local_role) {
        local.max_stream_data_bidi_local.as_u64()
    } else {
        local.max_stream_data_bidi_remote.as_u64()
    };

    (tx, rx)
}

/// What the peer's settings let us send on `id`
fn remote_tx_limit(local_role: Role, id: StreamId, remote: &Settings) -> u64 {
    if !id.is_bidirectional() {
        return if id.is_local_initiated(local_role) {
            remote.max_stream_data_uni.as_u64()
        } else {
            0
        };
    }
    if id.is_local_initiated(local_role) {
        // our outgoing bidi stream is the peer's "remote" stream
        remote.max_stream_data_bidi_remote.as_u64()
    } else {
        remote.max_stream_data_bidi_local.as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            max_streams_bidi: 2,
            max_streams_uni: 1,
            ..Default::default()
        }
    }

    fn map() -> StreamMap {
        let mut map = StreamMap::new(Role::Client, &settings());
        map.on_remote_settings(&settings());
        map
    }

    #[test]
    fn local_open_respects_peer_limit() {
        let mut map = map();
        let local = settings();
        let remote = settings();

        let a = map
            .open_local(StreamKind::Bidirectional, &local, Some(&remote))
            .unwrap();
        let b = map
            .open_local(StreamKind::Bidirectional, &local, Some(&remote))
            .unwrap();
        assert_eq!(a.as_u64(), 0);
        assert_eq!(b.as_u64(), 4);

        assert_eq!(
            map.open_local(StreamKind::Bidirectional, &local, Some(&remote))
                .unwrap_err(),
            Error::StreamIdBlocked
        );

        map.on_max_streams(StreamKind::Bidirectional, 3);
        map.open_local(StreamKind::Bidirectional, &local, Some(&remote))
            .unwrap();
    }

    #[test]
    fn remote_streams_are_created_lazily() {
        let mut map = map();
        let local = settings();

        // server-initiated bidi stream 1
        let id = StreamId::from_varint(VarInt::from_u8(1));
        let (_, origin) = map.get_or_create(id, &local, None).unwrap();
        assert_eq!(origin, Some(StreamOrigin::Remote));
        let (_, origin) = map.get_or_create(id, &local, None).unwrap();
        assert_eq!(origin, None);
    }

    #[test]
    fn remote_stream_limit_is_enforced() {
        let mut map = map();
        let local = settings();

        // index 2 exceeds max_streams_bidi = 2
        let id = StreamId::from_varint(VarInt::from_u8(9));
        assert_eq!(
            map.get_or_create(id, &local, None).unwrap_err(),
            Error::StreamLimit
        );
    }

    #[test]
    fn unknown_local_stream_is_a_state_error() {
        let mut map = map();
        let local = settings();

        // client-initiated bidi stream 0 was never opened by us
        let id = StreamId::from_varint(VarInt::from_u8(0));
        assert_eq!(
            map.get_or_create(id, &local, None).unwrap_err(),
            Error::StreamState
        );
    }

    #[test]
    fn destroying_remote_streams_frees_slots() {
        let mut map = map();
        let local = settings();

        let id = StreamId::from_varint(VarInt::from_u8(1));
        map.get_or_create(id, &local, None).unwrap();
        assert!(map.pending_max_streams(StreamKind::Bidirectional).is_none());

        map.destroy(id);
        let advertised = map
            .pending_max_streams(StreamKind::Bidirectional)
            .unwrap();
        assert_eq!(advertised, 3u64);
        map.commit_max_streams(StreamKind::Bidirectional, advertised.as_u64());
        assert!(map.pending_max_streams(StreamKind::Bidirectional).is_none());
    }

    #[test]
    fn scheduler_is_round_robin() {
        let mut map = map();
        let local = settings();
        let remote = settings();

        let a = map
            .open_local(StreamKind::Bidirectional, &local, Some(&remote))
            .unwrap();
        let b = map
            .open_local(StreamKind::Bidirectional, &local, Some(&remote))
            .unwrap();

        map.schedule(a);
        map.schedule(b);
        // double-scheduling is a no-op
        map.schedule(a);

        assert_eq!(map.next_scheduled(), Some(a));
        // a still has data: it goes to the back of the rotation
        map.reschedule_after_partial_send(a);
        assert_eq!(map.next_scheduled(), Some(b));
        assert_eq!(map.next_scheduled(), Some(a));
        assert_eq!(map.next_scheduled(), None);
    }
}
