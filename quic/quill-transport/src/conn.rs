// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection state machine binding the packet codec, streams,
//! recovery and identifier machinery together.

mod rx;
mod space;
mod tx;

pub(crate) use space::{CryptoChunk, SpaceCtx};

use crate::{
    cid::{DcidTable, ScidPool},
    handler::{ConnectionHandler, HandshakeOutput},
    path::{Path, PathValidator},
    recovery::{self, NewReno, RttEstimator},
    stream::StreamMap,
    DEFAULT_INITIAL_RTT, MAX_CRYPTO_REORDER, MIN_SCID_POOL,
};
use core::time::Duration;
use quill_core::{
    connection::{ConnectionId, StatelessResetToken},
    crypto::{CryptoKeys, Level},
    endpoint::Role,
    frame::{self, ConnectionClose, Frame, FrameOwned},
    packet::PacketNumberSpace,
    settings::Settings,
    stream::{StreamId, StreamKind},
    time::Timestamp,
    transport::{Error, Result, TransportErrorCode},
    varint::VarInt,
};
use tracing::{debug, trace};

/// Connection lifecycle states
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    ClientInitial,
    ClientWaitHandshake,
    ClientTlsFailed,
    ServerInitial,
    ServerWaitHandshake,
    ServerTlsFailed,
    PostHandshake,
    Closing,
    Draining,
}

impl State {
    #[inline]
    pub fn is_closing_or_draining(self) -> bool {
        matches!(self, Self::Closing | Self::Draining)
    }

    #[inline]
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::ClientInitial
                | Self::ClientWaitHandshake
                | Self::ServerInitial
                | Self::ServerWaitHandshake
        )
    }
}

/// A QUIC connection endpoint
///
/// All I/O flows through `read_pkt` / `write_pkt` and their handshake and
/// stream variants; the embedder owns the socket and the clock.
pub struct Connection<H: ConnectionHandler> {
    pub(crate) handler: H,
    pub(crate) role: Role,
    pub(crate) version: u32,
    pub(crate) state: State,
    pub(crate) local_settings: Settings,
    pub(crate) remote_settings: Option<Settings>,
    pub(crate) path: Path,

    pub(crate) in_space: SpaceCtx,
    pub(crate) hs_space: SpaceCtx,
    pub(crate) app_space: SpaceCtx,

    pub(crate) early_rx_ckm: Option<CryptoKeys>,
    pub(crate) early_tx_ckm: Option<CryptoKeys>,

    // key-update staging
    pub(crate) new_rx_ckm: Option<CryptoKeys>,
    pub(crate) new_tx_ckm: Option<CryptoKeys>,
    pub(crate) old_rx_ckm: Option<CryptoKeys>,
    pub(crate) key_phase: bool,
    /// Set after we rotate; cleared lazily by the first packet decrypted
    /// under the current keys
    pub(crate) key_update_wait_remote: bool,

    pub(crate) scids: ScidPool,
    pub(crate) dcids: DcidTable,
    pub(crate) local_cid_len: usize,
    /// The client's very first destination id, before any Retry
    pub(crate) odcid: Option<ConnectionId>,
    pub(crate) retry_token: Vec<u8>,

    pub(crate) streams: StreamMap,

    // connection-level flow control
    pub(crate) tx_offset: u64,
    pub(crate) max_tx_offset: u64,
    pub(crate) rx_offset: u64,
    pub(crate) max_rx_offset: u64,
    pub(crate) unsent_max_rx_offset: u64,
    pub(crate) rx_window: u64,
    pub(crate) tx_blocked_sent: bool,

    pub(crate) rtt: RttEstimator,
    pub(crate) cc: NewReno,
    pub(crate) crypto_count: u32,
    pub(crate) pto_count: u32,
    pub(crate) probe_pkt_left: u32,
    pub(crate) last_tx_ts: Option<Timestamp>,
    pub(crate) last_hs_tx_ts: Option<Timestamp>,

    pub(crate) last_activity_ts: Option<Timestamp>,
    pub(crate) validator: Option<PathValidator>,
    pub(crate) pending_path_response: Option<(Path, [u8; 8])>,

    pub(crate) close_frame: Option<ConnectionClose<Vec<u8>>>,
    pub(crate) error: Option<Error>,
    /// Set when TLS signalled completion before the peer's transport
    /// parameters arrived (server only)
    pub(crate) tls_complete_pending: bool,

    // receive-rate estimate feeding the proactive MAX_DATA rule
    pub(crate) rx_bytes_total: u64,
    pub(crate) rx_bw_start: Option<Timestamp>,

    pub(crate) rx_npkt: u64,
    pub(crate) tx_npkt: u64,

    pub(crate) scratch: Vec<u8>,
}

impl<H: ConnectionHandler> Connection<H> {
    fn new_inner(
        handler: H,
        role: Role,
        dcid: ConnectionId,
        scid: ConnectionId,
        path: Path,
        version: u32,
        settings: Settings,
    ) -> Self {
        let mut scids = ScidPool::new();
        let token = settings
            .stateless_reset_token
            .unwrap_or(StatelessResetToken::ZEROED);
        scids.insert_initial(scid, token);

        let streams = StreamMap::new(role, &settings);
        let max_rx = settings.max_data.as_u64();
        let max_packet_size = settings
            .effective_max_packet_size()
            .min(crate::DEFAULT_MAX_PKTLEN);

        Self {
            handler,
            role,
            version,
            state: match role {
                Role::Client => State::ClientInitial,
                Role::Server => State::ServerInitial,
            },
            local_settings: settings,
            remote_settings: None,
            path,
            in_space: SpaceCtx::new(PacketNumberSpace::Initial),
            hs_space: SpaceCtx::new(PacketNumberSpace::Handshake),
            app_space: SpaceCtx::new(PacketNumberSpace::ApplicationData),
            early_rx_ckm: None,
            early_tx_ckm: None,
            new_rx_ckm: None,
            new_tx_ckm: None,
            old_rx_ckm: None,
            key_phase: false,
            key_update_wait_remote: false,
            scids,
            dcids: DcidTable::new(dcid),
            local_cid_len: scid.len(),
            odcid: Some(dcid),
            retry_token: Vec::new(),
            streams,
            tx_offset: 0,
            max_tx_offset: 0,
            rx_offset: 0,
            max_rx_offset: max_rx,
            unsent_max_rx_offset: max_rx,
            rx_window: max_rx,
            tx_blocked_sent: false,
            rtt: RttEstimator::new(DEFAULT_INITIAL_RTT),
            cc: NewReno::new(max_packet_size),
            crypto_count: 0,
            pto_count: 0,
            probe_pkt_left: 0,
            last_tx_ts: None,
            last_hs_tx_ts: None,
            last_activity_ts: None,
            validator: None,
            pending_path_response: None,
            close_frame: None,
            error: None,
            tls_complete_pending: false,
            rx_bytes_total: 0,
            rx_bw_start: None,
            rx_npkt: 0,
            tx_npkt: 0,
            scratch: Vec::new(),
        }
    }

    /// Creates the client end of a connection
    pub fn client_new(
        handler: H,
        dcid: ConnectionId,
        scid: ConnectionId,
        path: Path,
        version: u32,
        settings: Settings,
    ) -> Result<Self> {
        if dcid.is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self::new_inner(
            handler,
            Role::Client,
            dcid,
            scid,
            path,
            version,
            settings,
        ))
    }

    /// Creates the server end of a connection from the client's Initial
    pub fn server_new(
        handler: H,
        dcid: ConnectionId,
        scid: ConnectionId,
        path: Path,
        version: u32,
        settings: Settings,
    ) -> Result<Self> {
        Ok(Self::new_inner(
            handler,
            Role::Server,
            dcid,
            scid,
            path,
            version,
            settings,
        ))
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn path(&self) -> Path {
        self.path
    }

    #[inline]
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    #[inline]
    pub fn is_handshake_complete(&self) -> bool {
        matches!(self.state, State::PostHandshake)
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.cc.bytes_in_flight()
    }

    /// Count of packets accepted (authenticated, non-duplicate)
    pub fn rx_packets(&self) -> u64 {
        self.rx_npkt
    }

    /// Count of packets produced
    pub fn tx_packets(&self) -> u64 {
        self.tx_npkt
    }

    /// The destination id the connection was created with, before any
    /// Retry rewrote it; servers echo it in their transport parameters
    pub fn original_dcid(&self) -> Option<&ConnectionId> {
        self.odcid.as_ref()
    }

    /// The peer's transport parameters, delivered by the embedder's TLS
    pub fn set_remote_settings(&mut self, remote: Settings) -> Result<()> {
        if self.remote_settings.is_some() {
            return Err(Error::InvalidState);
        }
        self.max_tx_offset = remote.max_data.as_u64();
        if let Some(token) = remote.stateless_reset_token {
            self.dcids.set_current_token(token);
        }
        self.streams.on_remote_settings(&remote);
        self.remote_settings = Some(remote);

        if self.tls_complete_pending {
            self.tls_complete_pending = false;
            self.on_tls_complete()?;
        }
        Ok(())
    }

    pub(crate) fn space_mut(&mut self, space: PacketNumberSpace) -> &mut SpaceCtx {
        match space {
            PacketNumberSpace::Initial => &mut self.in_space,
            PacketNumberSpace::Handshake => &mut self.hs_space,
            PacketNumberSpace::ApplicationData => &mut self.app_space,
        }
    }

    pub(crate) fn space(&self, space: PacketNumberSpace) -> &SpaceCtx {
        match space {
            PacketNumberSpace::Initial => &self.in_space,
            PacketNumberSpace::Handshake => &self.hs_space,
            PacketNumberSpace::ApplicationData => &self.app_space,
        }
    }

    // ---- key management ----------------------------------------------

    pub fn install_initial_tx_key(&mut self, keys: CryptoKeys) {
        self.in_space.tx_ckm = Some(keys);
    }

    pub fn install_initial_rx_key(&mut self, keys: CryptoKeys) {
        self.in_space.rx_ckm = Some(keys);
    }

    pub fn install_handshake_tx_key(&mut self, keys: CryptoKeys) {
        self.hs_space.tx_ckm = Some(keys);
    }

    pub fn install_handshake_rx_key(&mut self, keys: CryptoKeys) {
        self.hs_space.rx_ckm = Some(keys);
    }

    pub fn install_early_tx_key(&mut self, keys: CryptoKeys) {
        self.early_tx_ckm = Some(keys);
    }

    pub fn install_early_rx_key(&mut self, keys: CryptoKeys) {
        self.early_rx_ckm = Some(keys);
    }

    pub fn install_tx_key(&mut self, keys: CryptoKeys) {
        self.app_space.tx_ckm = Some(keys);
    }

    pub fn install_rx_key(&mut self, keys: CryptoKeys) {
        self.app_space.rx_ckm = Some(keys);
    }

    /// Stages next-generation transmit keys for a key update
    pub fn update_tx_key(&mut self, keys: CryptoKeys) -> Result<()> {
        if self.new_tx_ckm.is_some() {
            return Err(Error::InvalidState);
        }
        self.new_tx_ckm = Some(keys);
        Ok(())
    }

    /// Stages next-generation receive keys for a key update
    pub fn update_rx_key(&mut self, keys: CryptoKeys) -> Result<()> {
        if self.new_rx_ckm.is_some() {
            return Err(Error::InvalidState);
        }
        self.new_rx_ckm = Some(keys);
        Ok(())
    }

    /// Rotates to the next key generation, initiating a key update
    pub fn initiate_key_update(&mut self) -> Result<()> {
        if !self.is_handshake_complete() || self.key_update_wait_remote {
            return Err(Error::InvalidState);
        }
        if !self.app_space.has_tx_keys() || !self.app_space.has_rx_keys() {
            return Err(Error::NoKey);
        }

        // use staged keys if the embedder provided them, else ask for them
        if self.new_rx_ckm.is_none() || self.new_tx_ckm.is_none() {
            let (rx, tx) = cb(self.handler.update_key())?;
            self.new_rx_ckm.get_or_insert(rx);
            self.new_tx_ckm.get_or_insert(tx);
        }

        let new_rx = self.new_rx_ckm.take().expect("staged above");
        let new_tx = self.new_tx_ckm.take().expect("staged above");
        self.old_rx_ckm = self.app_space.rx_ckm.replace(new_rx);
        self.app_space.tx_ckm = Some(new_tx);
        self.key_phase = !self.key_phase;
        self.key_update_wait_remote = true;
        debug!(phase = self.key_phase, "initiated key update");
        Ok(())
    }

    /// Rotation driven by a peer-initiated key update; returns the keys to
    /// probe the packet with
    pub(crate) fn stage_remote_key_update(&mut self) -> Result<CryptoKeys> {
        if self.new_rx_ckm.is_none() || self.new_tx_ckm.is_none() {
            let (rx, tx) = cb(self.handler.update_key())?;
            self.new_rx_ckm.get_or_insert(rx);
            self.new_tx_ckm.get_or_insert(tx);
        }
        Ok(self.new_rx_ckm.clone().expect("staged above"))
    }

    /// Commits a peer-initiated rotation once a new-phase packet verified
    pub(crate) fn commit_remote_key_update(&mut self) {
        let new_rx = self.new_rx_ckm.take().expect("verified under staged keys");
        let new_tx = self.new_tx_ckm.take().expect("verified under staged keys");
        self.old_rx_ckm = self.app_space.rx_ckm.replace(new_rx);
        self.app_space.tx_ckm = Some(new_tx);
        self.key_phase = !self.key_phase;
        self.key_update_wait_remote = false;
        debug!(phase = self.key_phase, "committed peer key update");
    }

    // ---- handshake plumbing ------------------------------------------

    /// Queues outbound handshake bytes at `level`
    pub fn submit_crypto_data(&mut self, level: Level, data: &[u8]) {
        let space = self.space_mut(level.space());
        space.submit_crypto_data(data);
    }

    pub(crate) fn apply_handshake_output(&mut self, output: HandshakeOutput) -> Result<()> {
        for (level, data) in output.crypto_data {
            self.submit_crypto_data(level, &data);
        }
        for (level, keys) in output.rx_keys {
            match level {
                Level::Initial => self.install_initial_rx_key(keys),
                Level::Handshake => self.install_handshake_rx_key(keys),
                Level::Early => self.install_early_rx_key(keys),
                Level::Application => self.install_rx_key(keys),
            }
        }
        for (level, keys) in output.tx_keys {
            match level {
                Level::Initial => self.install_initial_tx_key(keys),
                Level::Handshake => self.install_handshake_tx_key(keys),
                Level::Early => self.install_early_tx_key(keys),
                Level::Application => self.install_tx_key(keys),
            }
        }
        if output.handshake_complete {
            self.on_tls_complete()?;
        }
        Ok(())
    }

    pub(crate) fn on_tls_complete(&mut self) -> Result<()> {
        match self.state {
            State::ClientWaitHandshake | State::ClientInitial => {
                self.state = State::PostHandshake;
            }
            State::ServerInitial | State::ServerWaitHandshake => {
                //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#8.2
                //# A server completes only once the client's transport
                //# parameters are available
                if self.remote_settings.is_none() {
                    self.tls_complete_pending = true;
                    return Ok(());
                }
                self.state = State::PostHandshake;
            }
            State::PostHandshake => return Ok(()),
            _ => return Err(Error::InvalidState),
        }

        debug!(role = ?self.role, "handshake completed");
        cb(self.handler.handshake_completed())?;
        self.replenish_scids()?;

        // a client may migrate to the server's preferred address; the id
        // that comes with it joins the pool either way
        if self.role.is_client() {
            let preferred = self
                .remote_settings
                .as_ref()
                .and_then(|s| s.preferred_address.clone());
            if let Some(preferred) = preferred {
                let frame = frame::NewConnectionId {
                    sequence: VarInt::from_u8(1),
                    cid: preferred.cid,
                    stateless_reset_token: preferred.stateless_reset_token,
                };
                // a duplicate sequence just means the server also sent it
                // as a NEW_CONNECTION_ID; ignore the clash
                let _ = self.dcids.on_new_connection_id(&frame);
                let candidate = Path::new(self.path.local, preferred.addr);
                cb(self.handler.select_preferred_addr(&candidate))?;
            }
        }
        Ok(())
    }

    /// Server only: queues a NEW_TOKEN frame for the client to use on a
    /// future connection attempt
    pub fn submit_new_token(&mut self, token: &[u8]) -> Result<()> {
        if !self.role.is_server() || token.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.app_space
            .tx_frq
            .push_back(Frame::NewToken(frame::NewToken {
                token: token.to_vec(),
            }));
        Ok(())
    }

    /// Client only: the server refused 0-RTT; everything sent early must
    /// be replayed under the full handshake keys
    pub fn early_data_rejected(&mut self) -> Result<()> {
        if !self.role.is_client() {
            return Err(Error::InvalidState);
        }
        self.early_tx_ckm = None;
        self.early_rx_ckm = None;

        let entries = self.app_space.rtb.drain_all();
        for entry in &entries {
            self.cc.on_packet_discarded(entry.size);
        }
        self.resched_entries(PacketNumberSpace::ApplicationData, entries)?;
        Ok(())
    }

    /// Delivers reassembled crypto bytes at `space` to TLS and applies
    /// whatever TLS produced
    pub(crate) fn deliver_crypto(&mut self, space: PacketNumberSpace) -> Result<()> {
        let level = match space {
            PacketNumberSpace::Initial => Level::Initial,
            PacketNumberSpace::Handshake => Level::Handshake,
            PacketNumberSpace::ApplicationData => Level::Application,
        };

        loop {
            let ctx = self.space_mut(space);
            if ctx.crypto_rx.buffered() > MAX_CRYPTO_REORDER {
                return Err(Error::CryptoBufferExceeded);
            }
            let Some((_, data)) = ctx.crypto_rx.pop(usize::MAX) else {
                break;
            };

            let output = match self.handler.recv_crypto_data(level, &data) {
                Ok(output) => output,
                // the TLS-data capability may return these two unchanged
                Err(Error::Crypto) => return Err(Error::Crypto),
                Err(Error::Proto) => return Err(Error::Proto),
                Err(_) => return Err(Error::CallbackFailure),
            };
            self.apply_handshake_output(output)?;
        }
        Ok(())
    }

    /// Tops the source-id pool back up, queueing NEW_CONNECTION_ID frames
    pub(crate) fn replenish_scids(&mut self) -> Result<()> {
        if !self.is_handshake_complete() {
            return Ok(());
        }
        let handler = &mut self.handler;
        let frames = self
            .scids
            .replenish(MIN_SCID_POOL, || cb(handler.get_new_connection_id()))?;
        for frame in frames {
            self.app_space
                .tx_frq
                .push_back(Frame::NewConnectionId(frame));
        }
        Ok(())
    }

    // ---- stream operations -------------------------------------------

    pub fn open_bidi_stream(&mut self) -> Result<StreamId> {
        self.open_stream(StreamKind::Bidirectional)
    }

    pub fn open_uni_stream(&mut self) -> Result<StreamId> {
        self.open_stream(StreamKind::Unidirectional)
    }

    fn open_stream(&mut self, kind: StreamKind) -> Result<StreamId> {
        if self.state.is_closing_or_draining() {
            return Err(self.closed_error());
        }
        let result =
            self.streams
                .open_local(kind, &self.local_settings, self.remote_settings.as_ref());
        if matches!(result, Err(Error::StreamIdBlocked)) {
            // tell the peer we are starved
            let limit = self.streams.local_max_streams(kind);
            self.app_space
                .tx_frq
                .push_back(Frame::StreamsBlocked(frame::StreamsBlocked {
                    kind,
                    stream_limit: VarInt::new(limit).unwrap_or(VarInt::MAX),
                }));
        }
        let id = result?;
        cb(self.handler.stream_open(id))?;
        Ok(id)
    }

    /// Stops reading from `id`: inbound data is discarded and the peer is
    /// asked to stop sending
    pub fn shutdown_stream_read(&mut self, id: StreamId, app_error_code: u16) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound)?;
        if stream.is_shut_rd() {
            return Ok(());
        }
        stream.shutdown_rx(app_error_code);
        self.app_space
            .tx_frq
            .push_back(Frame::StopSending(frame::StopSending {
                stream_id: id.as_varint(),
                app_error_code,
            }));
        Ok(())
    }

    /// Abandons writing on `id` with RESET_STREAM
    pub fn shutdown_stream_write(&mut self, id: StreamId, app_error_code: u16) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound)?;
        let Some(final_size) = stream.reset_tx(app_error_code) else {
            return Ok(());
        };
        self.app_space
            .tx_frq
            .push_back(Frame::ResetStream(frame::ResetStream {
                stream_id: id.as_varint(),
                app_error_code,
                final_size: VarInt::new(final_size).map_err(|_| Error::Internal)?,
            }));
        Ok(())
    }

    pub fn shutdown_stream(&mut self, id: StreamId, app_error_code: u16) -> Result<()> {
        self.shutdown_stream_write(id, app_error_code)?;
        self.shutdown_stream_read(id, app_error_code)
    }

    /// Grows a stream's receive window after the application consumed data
    pub fn extend_max_stream_offset(&mut self, id: StreamId, delta: u64) -> Result<()> {
        let stream = self.streams.get_mut(id).ok_or(Error::StreamNotFound)?;
        stream.extend_max_rx_offset(delta);
        Ok(())
    }

    /// Grows the connection-level receive window
    pub fn extend_max_offset(&mut self, delta: u64) {
        self.unsent_max_rx_offset = self.unsent_max_rx_offset.saturating_add(delta);
    }

    /// Destroys streams that have finished both directions
    pub(crate) fn reap_streams(&mut self) -> Result<()> {
        let done: Vec<StreamId> = self
            .streams
            .iter_mut()
            .filter(|s| s.is_done())
            .map(|s| s.id())
            .collect();
        for id in done {
            if let Some(stream) = self.streams.destroy(id) {
                trace!(stream = %id, "stream closed");
                cb(self
                    .handler
                    .stream_close(id, stream.app_error_code()))?;
            }
        }
        Ok(())
    }

    // ---- flow control -------------------------------------------------

    pub(crate) fn conn_tx_left(&self) -> u64 {
        self.max_tx_offset.saturating_sub(self.tx_offset)
    }

    /// Half-window or bandwidth-delay rule for MAX_DATA: the window is
    /// opened proactively when the receive rate threatens to stall the
    /// peer
    pub(crate) fn wants_max_data(&self, now: Timestamp) -> bool {
        if self.unsent_max_rx_offset - self.max_rx_offset >= self.rx_window / 2 {
            return true;
        }
        let Some(start) = self.rx_bw_start else {
            return false;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed.is_zero() || self.rx_bytes_total == 0 {
            return false;
        }
        let bw = self.rx_bytes_total as f64 / elapsed.as_secs_f64();
        let srtt = self.rtt.smoothed_rtt().as_secs_f64();
        let headroom = (self.max_rx_offset - self.rx_offset) as f64;
        2.0 * bw * srtt >= headroom
    }

    // ---- timers -------------------------------------------------------

    /// The grace before retired connection ids are really forgotten
    pub(crate) fn cid_grace(&self) -> Duration {
        recovery::pto(&self.rtt, self.max_ack_delay(), 0).max(DEFAULT_INITIAL_RTT * 6)
    }

    pub(crate) fn max_ack_delay(&self) -> Duration {
        if self.is_handshake_complete() {
            self.remote_settings
                .as_ref()
                .map_or(quill_core::settings::DEFAULT_MAX_ACK_DELAY, |s| {
                    s.max_ack_delay
                })
        } else {
            quill_core::settings::DEFAULT_MAX_ACK_DELAY
        }
    }

    /// When the loss-detection timer fires
    pub fn loss_detection_expiry(&self) -> Option<Timestamp> {
        // earliest per-space loss time wins
        let loss_time = [
            self.in_space.rtb.loss_time(),
            self.hs_space.rtb.loss_time(),
            self.app_space.rtb.loss_time(),
        ]
        .into_iter()
        .flatten()
        .min();
        if let Some(t) = loss_time {
            return Some(t);
        }

        // handshake retransmission deadline
        if self.has_handshake_inflight() {
            if let Some(last) = self.last_hs_tx_ts {
                let rtt = self.rtt.smoothed_rtt();
                let delay = recovery::backoff(rtt * 2, self.crypto_count)
                    .max(crate::TIMER_GRANULARITY);
                return Some(last + delay);
            }
        }

        // probe timeout
        let last = self.last_eliciting_tx_ts()?;
        Some(last + recovery::pto(&self.rtt, self.max_ack_delay(), self.pto_count))
    }

    fn has_handshake_inflight(&self) -> bool {
        self.in_space.rtb.has_crypto_inflight() || self.hs_space.rtb.has_crypto_inflight()
    }

    fn last_eliciting_tx_ts(&self) -> Option<Timestamp> {
        [
            self.in_space.rtb.last_eliciting_ts(),
            self.hs_space.rtb.last_eliciting_ts(),
            self.app_space.rtb.last_eliciting_ts(),
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// When the delayed-ack timer fires
    pub fn ack_delay_expiry(&self) -> Option<Timestamp> {
        let mad = self.max_ack_delay();
        [
            self.in_space.acktr.ack_delay_expiry(Duration::ZERO),
            self.hs_space.acktr.ack_delay_expiry(Duration::ZERO),
            self.app_space.acktr.ack_delay_expiry(mad),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn idle_expiry(&self) -> Option<Timestamp> {
        let timeout = self.local_settings.idle_timeout?;
        Some(self.last_activity_ts? + timeout)
    }

    /// The next instant the embedder must call back into the connection
    pub fn get_expiry(&self) -> Option<Timestamp> {
        let validator = self.validator.as_ref().map(|v| v.expiry());
        [
            self.loss_detection_expiry(),
            self.ack_delay_expiry(),
            self.idle_expiry(),
            validator,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Drives the loss-detection state at (or after) timer expiry
    pub fn on_loss_detection_timer(&mut self, now: Timestamp) -> Result<()> {
        if self.state.is_closing_or_draining() {
            return Ok(());
        }

        // idle teardown takes priority
        if let Some(idle) = self.idle_expiry() {
            if idle.has_elapsed(now) {
                self.state = State::Draining;
                return Ok(());
            }
        }

        // path validation expiry
        self.drive_path_validation(now)?;

        let loss_spaces: Vec<PacketNumberSpace> = PacketNumberSpace::ALL
            .into_iter()
            .filter(|&space| {
                self.space(space)
                    .rtb
                    .loss_time()
                    .map(|t| t.has_elapsed(now))
                    .unwrap_or(false)
            })
            .collect();

        if !loss_spaces.is_empty() {
            for space in loss_spaces {
                let largest_acked = self
                    .space(space)
                    .largest_acked_tx
                    .map(|pn| pn.as_u64())
                    .unwrap_or(0);
                let delay = recovery::loss_delay(&self.rtt);
                let lost = self
                    .space_mut(space)
                    .rtb
                    .detect_lost(largest_acked, delay, now);
                self.on_entries_lost(space, lost)?;
            }
            return Ok(());
        }

        if self.has_handshake_inflight() {
            //= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#4.8
            //# When crypto packets are in flight, the handshake timer fires
            //# and unacknowledged CRYPTO data is retransmitted
            for space in [PacketNumberSpace::Initial, PacketNumberSpace::Handshake] {
                let entries = self.space_mut(space).rtb.drain_crypto();
                for entry in &entries {
                    self.cc.on_packet_discarded(entry.size);
                }
                self.resched_entries(space, entries)?;
            }
            self.crypto_count += 1;
            return Ok(());
        }

        //= https://tools.ietf.org/id/draft-ietf-quic-recovery-18.txt#4.8
        //# a PTO expiry sends probe packets
        self.probe_pkt_left = 2;
        self.pto_count += 1;
        Ok(())
    }

    /// Any freshly acknowledged packet resets the backoff counters
    pub(crate) fn on_new_ack(&mut self) {
        self.crypto_count = 0;
        self.pto_count = 0;
        self.probe_pkt_left = 0;
    }

    /// Hands a lost packet's frames back to their queues and informs the
    /// congestion controller
    pub(crate) fn on_entries_lost(
        &mut self,
        space: PacketNumberSpace,
        lost: Vec<crate::recovery::RtbEntry>,
    ) -> Result<()> {
        if lost.is_empty() {
            return Ok(());
        }
        let lost_bytes: usize = lost.iter().map(|e| e.size).sum();
        let largest_sent = self
            .space(space)
            .last_tx_pkt_num
            .map(|pn| pn.as_u64())
            .unwrap_or(0);
        self.cc.on_packets_lost(lost_bytes, largest_sent);
        debug!(?space, lost = lost.len(), lost_bytes, "packets lost");
        self.resched_entries(space, lost)
    }

    /// Requeues every frame of the given entries
    pub(crate) fn resched_entries(
        &mut self,
        space: PacketNumberSpace,
        entries: Vec<crate::recovery::RtbEntry>,
    ) -> Result<()> {
        for entry in entries {
            for frame in entry.frames {
                self.resched_frame(space, frame)?;
            }
        }
        Ok(())
    }

    pub(crate) fn resched_frame(
        &mut self,
        space: PacketNumberSpace,
        frame: FrameOwned,
    ) -> Result<()> {
        match frame {
            // regenerated per packet, never retransmitted verbatim
            Frame::Ack(_) | Frame::Padding(_) | Frame::Ping(_) => Ok(()),
            Frame::Crypto(crypto) => {
                let chunk = CryptoChunk {
                    offset: crypto.offset.as_u64(),
                    data: crypto.data,
                };
                self.space_mut(space).requeue_crypto_chunk(chunk);
                Ok(())
            }
            Frame::Stream(stream_frame) => {
                let id = StreamId::from_varint(stream_frame.stream_id);
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.requeue_tx_chunk(crate::stream::StreamChunk {
                        offset: stream_frame.offset.as_u64(),
                        data: stream_frame.data,
                        fin: stream_frame.is_fin,
                    });
                    if stream.has_pending_tx() {
                        self.streams.schedule(id);
                    }
                }
                Ok(())
            }
            Frame::MaxStreamData(f) => {
                // obsolete windows are recomputed at send time
                let id = StreamId::from_varint(f.stream_id);
                if self.streams.get(id).is_some() {
                    self.space_mut(space).tx_frq.push_back(Frame::MaxStreamData(f));
                }
                Ok(())
            }
            Frame::RetireConnectionId(f) => {
                self.dcids.requeue_retire(f.sequence.as_u64());
                Ok(())
            }
            // PATH_CHALLENGE / PATH_RESPONSE are never retransmitted; the
            // validator times out and sends fresh payloads
            Frame::PathChallenge(_) | Frame::PathResponse(_) => Ok(()),
            other => {
                self.space_mut(space).tx_frq.push_back(other);
                Ok(())
            }
        }
    }

    // ---- path validation driver --------------------------------------

    pub(crate) fn drive_path_validation(&mut self, now: Timestamp) -> Result<()> {
        let Some(validator) = self.validator.as_ref() else {
            return Ok(());
        };
        if !validator.is_expired(now) {
            return Ok(());
        }

        let validator = self.validator.take().expect("checked above");
        let (path, _kind, fallback) = validator.into_parts();
        debug!(?path, "path validation failed");
        cb(self
            .handler
            .path_validation(&path, crate::path::PathValidationResult::Failure))?;

        if let Some((fallback_path, fallback_dcid)) = fallback {
            // migrate back: the probed id is spent, the old id returns
            self.path = fallback_path;
            let probed = self.dcids.replace_current(fallback_dcid);
            if let Some(displaced) = self.dcids.retire_entry(probed, now) {
                cb(self.handler.remove_connection_id(&displaced.cid))?;
            }
            self.cc.reset();
            self.rtt.reset(DEFAULT_INITIAL_RTT);
        }
        Ok(())
    }

    // ---- close --------------------------------------------------------

    pub(crate) fn closed_error(&self) -> Error {
        match self.state {
            State::Draining => Error::Draining,
            _ => Error::Closing,
        }
    }

    /// Records a connection-terminating error for the next
    /// `write_connection_close`
    pub(crate) fn set_error(&mut self, error: Error) -> Error {
        if !error.is_fatal() && error != Error::DiscardPacket {
            self.error.get_or_insert(error);
        }
        // a TLS failure mid-handshake is terminal for the handshake states
        if matches!(error, Error::Crypto | Error::TlsDecrypt) && self.state.is_handshaking() {
            self.state = match self.role {
                Role::Client => State::ClientTlsFailed,
                Role::Server => State::ServerTlsFailed,
            };
        }
        error
    }

    #[inline]
    pub(crate) fn is_tls_failed(&self) -> bool {
        matches!(self.state, State::ClientTlsFailed | State::ServerTlsFailed)
    }

    /// The transport error code the stored failure maps to
    pub fn pending_error_code(&self) -> TransportErrorCode {
        self.error
            .map(Error::transport_error_code)
            .unwrap_or(TransportErrorCode::NO_ERROR)
    }

    pub(crate) fn enter_draining(&mut self) {
        if !matches!(self.state, State::Draining) {
            debug!("entering draining state");
            self.state = State::Draining;
        }
    }
}

/// Folds a capability failure into `CallbackFailure` per the callback
/// contract
pub(crate) fn cb<T>(result: Result<T>) -> Result<T> {
    result.map_err(|_| Error::CallbackFailure)
}

/// Delay budget before a pending ACK must go out, per space
pub(crate) fn space_ack_delay(space: PacketNumberSpace, max_ack_delay: Duration) -> Duration {
    if space.is_application_data() {
        max_ack_delay / 8
    } else {
        Duration::ZERO
    }
}
