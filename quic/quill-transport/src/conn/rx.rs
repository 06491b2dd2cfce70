// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Inbound datagram processing: header unprotection, decryption, frame
//! dispatch and the state transitions they drive.

use crate::{
    conn::{cb, Connection, State},
    handler::ConnectionHandler,
    path::{Path, PathValidationResult, PathValidator, ValidationKind},
    recovery,
    stream::map::StreamOrigin,
    NUM_BUFFED_RX_PKTS,
};
use quill_core::{
    connection::StatelessResetToken,
    crypto::CryptoKeys,
    frame::{self, Frame, FrameRef},
    packet::{
        self, protection, Header, PacketNumber, PacketNumberSpace, PacketType, Retry,
        TruncatedPacketNumber,
    },
    stream::{StreamId, StreamKind},
    time::Timestamp,
    transport::{Error, Result},
};
use quill_codec::DecoderBuffer;
use tracing::{debug, trace, warn};

impl<H: ConnectionHandler> Connection<H> {
    /// Processes one received UDP datagram, which may carry several
    /// coalesced packets
    pub fn read_pkt(&mut self, path: Path, pkt: &[u8], now: Timestamp) -> Result<()> {
        if matches!(self.state, State::Draining) {
            return Ok(());
        }
        if pkt.is_empty() {
            return Err(Error::InvalidArgument);
        }
        self.last_activity_ts = Some(now);

        let mut rest = pkt;
        while !rest.is_empty() {
            match self.read_single_pkt(path, rest, now) {
                Ok(0) => break,
                Ok(consumed) => rest = &rest[consumed.min(rest.len())..],
                // a local drop abandons the rest of the datagram
                Err(Error::DiscardPacket) => break,
                Err(err) => return Err(self.set_error(err)),
            }
        }

        self.flush_buffered_rx(path, now)?;
        Ok(())
    }

    /// Alias used while the handshake is still in progress
    pub fn read_handshake(&mut self, path: Path, pkt: &[u8], now: Timestamp) -> Result<()> {
        self.read_pkt(path, pkt, now)
    }

    /// Re-runs packets that were waiting for keys installed meanwhile
    fn flush_buffered_rx(&mut self, path: Path, now: Timestamp) -> Result<()> {
        for space in [PacketNumberSpace::Handshake, PacketNumberSpace::ApplicationData] {
            loop {
                if !self.space(space).has_rx_keys() && !(space.is_application_data()
                    && self.early_rx_ckm.is_some())
                {
                    break;
                }
                let Some(buffered) = self.space_mut(space).buffered_rx.pop_front() else {
                    break;
                };
                match self.read_single_pkt(path, &buffered, now) {
                    Ok(_) | Err(Error::DiscardPacket) => {}
                    Err(err) => return Err(self.set_error(err)),
                }
            }
        }
        Ok(())
    }

    fn read_single_pkt(&mut self, path: Path, pkt: &[u8], now: Timestamp) -> Result<usize> {
        if pkt[0] & packet::LONG_FORM_BIT != 0 {
            self.read_long_pkt(path, pkt, now)
        } else {
            self.read_short_pkt(path, pkt, now)?;
            // a short packet always extends to the end of the datagram
            Ok(pkt.len())
        }
    }

    // ---- long header packets ------------------------------------------

    fn read_long_pkt(&mut self, path: Path, pkt: &[u8], now: Timestamp) -> Result<usize> {
        let (hd, pn_offset) =
            Header::decode_long(pkt).map_err(|_| Error::DiscardPacket)?;

        match hd.ty {
            PacketType::VersionNegotiation => {
                self.on_version_negotiation(&hd, &pkt[pn_offset..])?;
                Ok(pkt.len())
            }
            PacketType::Retry => {
                self.on_retry(pkt)?;
                Ok(pkt.len())
            }
            PacketType::Initial | PacketType::Handshake | PacketType::ZeroRtt => {
                if hd.version != self.version {
                    return Err(Error::DiscardPacket);
                }
                let total = pn_offset
                    .checked_add(hd.payload_len)
                    .filter(|&t| t <= pkt.len())
                    .ok_or(Error::DiscardPacket)?;
                self.read_protected_long(path, &hd, &pkt[..total], pn_offset, now)?;
                Ok(total)
            }
            PacketType::Short => Err(Error::DiscardPacket),
        }
    }

    fn on_version_negotiation(&mut self, hd: &Header<'_>, payload: &[u8]) -> Result<()> {
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#6.2
        //# A client MUST discard a Version Negotiation packet ... if it has
        //# already received and acted on another packet.
        if !self.role.is_client() || !self.state.is_handshaking() {
            return Err(Error::DiscardPacket);
        }
        if self.hs_space.has_rx_keys() {
            return Err(Error::DiscardPacket);
        }

        // the listed ids must mirror what we sent
        if hd.scid != self.dcids.current().cid {
            return Err(Error::DiscardPacket);
        }

        let versions = packet::decode_version_list(payload).map_err(|_| Error::DiscardPacket)?;
        if versions.contains(&self.version) {
            // buggy peer: it does support our version after all
            return Err(Error::DiscardPacket);
        }

        debug!(?versions, "received version negotiation");
        cb(self.handler.recv_version_negotiation(&versions))?;
        self.enter_draining();
        Err(Error::RecvVersionNegotiation)
    }

    fn on_retry(&mut self, pkt: &[u8]) -> Result<()> {
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2.5
        //# A client MUST accept and process at most one Retry packet for
        //# each connection attempt.
        if !self.role.is_client()
            || !matches!(self.state, State::ClientWaitHandshake)
            || !self.retry_token.is_empty()
            || self.hs_space.has_rx_keys()
        {
            return Err(Error::DiscardPacket);
        }

        let retry = Retry::decode(pkt).map_err(|_| Error::DiscardPacket)?;

        // the ODCID must prove the server saw our Initial
        if retry.odcid != self.dcids.current().cid {
            return Err(Error::DiscardPacket);
        }
        if retry.token.is_empty() {
            return Err(Error::DiscardPacket);
        }

        debug!("received retry; restarting handshake");

        // everything in flight is void; the frames go back to their queues
        let entries = self.in_space.rtb.drain_all();
        for entry in &entries {
            self.cc.on_packet_discarded(entry.size);
        }
        self.resched_entries(PacketNumberSpace::Initial, entries)?;

        self.dcids.update_current_cid(retry.scid);
        self.retry_token = retry.token.to_vec();
        self.state = State::ClientInitial;

        cb(self.handler.recv_retry(&retry))?;
        Ok(())
    }

    fn read_protected_long(
        &mut self,
        path: Path,
        hd: &Header<'_>,
        pkt: &[u8],
        pn_offset: usize,
        now: Timestamp,
    ) -> Result<()> {
        let space = match hd.ty {
            PacketType::Initial => PacketNumberSpace::Initial,
            PacketType::Handshake => PacketNumberSpace::Handshake,
            PacketType::ZeroRtt => PacketNumberSpace::ApplicationData,
            _ => unreachable!("caller filtered the type"),
        };

        // the server derives initial-secret keys from the client's DCID
        if hd.ty == PacketType::Initial
            && self.role.is_server()
            && !self.in_space.has_rx_keys()
        {
            let output = cb(self.handler.recv_client_initial(&hd.dcid))?;
            self.apply_handshake_output(output)?;
            // from here on the peer is addressed by its chosen id
            self.dcids.update_current_cid(hd.scid);
        }

        let is_initial_level = hd.ty == PacketType::Initial;
        let keys = match hd.ty {
            PacketType::Initial => self.in_space.rx_ckm.clone(),
            PacketType::Handshake => self.hs_space.rx_ckm.clone(),
            PacketType::ZeroRtt => self.early_rx_ckm.clone(),
            _ => None,
        };
        let Some(keys) = keys else {
            // keys may arrive with a later flight; buffer a bounded few
            let ctx = self.space_mut(space);
            if ctx.buffered_rx.len() < NUM_BUFFED_RX_PKTS {
                ctx.buffered_rx.push_back(pkt.to_vec());
                trace!(?space, "buffered packet awaiting keys");
            }
            return Err(Error::DiscardPacket);
        };

        let Some((pkt_num, plain)) =
            self.unprotect_and_decrypt(pkt, pn_offset, space, &keys, is_initial_level, false)?
        else {
            return Err(Error::DiscardPacket);
        };

        // the client learns the server's chosen id from its first packet
        if self.role.is_client()
            && hd.ty == PacketType::Initial
            && self.in_space.largest_rx_pkt_num.is_none()
        {
            self.dcids.update_current_cid(hd.scid);
        }

        // dispatch
        let eliciting = self.dispatch_frames(space, hd.ty, &plain, path, now)?;

        let ctx = self.space_mut(space);
        ctx.note_rx_pkt_num(pkt_num);
        ctx.acktr.add(pkt_num.as_u64(), eliciting, now);
        self.rx_npkt += 1;

        // handshake progress
        if self.role.is_server()
            && matches!(self.state, State::ServerInitial)
            && hd.ty == PacketType::Initial
        {
            self.state = State::ServerWaitHandshake;
        }
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2.2
        //# A server stops sending and processing Initial packets when it
        //# receives its first Handshake packet.
        if self.role.is_server() && hd.ty == PacketType::Handshake && self.in_space.has_rx_keys()
        {
            self.in_space.discard();
        }

        self.deliver_crypto(space)?;
        Ok(())
    }

    // ---- short header packets -----------------------------------------

    fn read_short_pkt(&mut self, path: Path, pkt: &[u8], now: Timestamp) -> Result<()> {
        let (hd, pn_offset) = Header::decode_short(pkt, self.local_cid_len)
            .map_err(|_| Error::DiscardPacket)?;

        // the packet must address one of our ids
        let known = match self.scids.find(&hd.dcid) {
            Some(entry) => {
                entry.used = true;
                true
            }
            None => false,
        };
        if !known {
            return self.check_stateless_reset(pkt);
        }

        if !self.app_space.has_rx_keys() {
            let ctx = &mut self.app_space;
            if ctx.buffered_rx.len() < NUM_BUFFED_RX_PKTS {
                ctx.buffered_rx.push_back(pkt.to_vec());
            }
            return Err(Error::DiscardPacket);
        }

        let keys = self.app_space.rx_ckm.clone().expect("checked above");
        let space = PacketNumberSpace::ApplicationData;

        let decrypted =
            self.unprotect_and_decrypt(pkt, pn_offset, space, &keys, false, true)?;
        let Some((pkt_num, plain)) = decrypted else {
            return self.check_stateless_reset(pkt);
        };

        let eliciting = self.dispatch_frames(space, PacketType::Short, &plain, path, now)?;

        let ctx = &mut self.app_space;
        ctx.note_rx_pkt_num(pkt_num);
        ctx.acktr.add(pkt_num.as_u64(), eliciting, now);
        self.rx_npkt += 1;
        Ok(())
    }

    /// Detects a stateless reset by its trailing token
    fn check_stateless_reset(&mut self, pkt: &[u8]) -> Result<()> {
        let Some(tail) = pkt.len().checked_sub(16).map(|s| &pkt[s..]) else {
            return Err(Error::DiscardPacket);
        };
        let Some(candidate) = StatelessResetToken::try_from_slice(tail) else {
            return Err(Error::DiscardPacket);
        };
        if !self.dcids.token_matches(&candidate) {
            return Err(Error::DiscardPacket);
        }

        warn!("stateless reset received");
        cb(self.handler.recv_stateless_reset(&candidate))?;
        self.enter_draining();
        Ok(())
    }

    /// Opens the scratch copy of a packet with the given keys
    ///
    /// `self.scratch` holds the unprotected packet; `payload_start` marks
    /// where the ciphertext begins.
    fn open_payload(
        &mut self,
        payload_start: usize,
        keys: &CryptoKeys,
        pkt_num: PacketNumber,
        initial_level: bool,
    ) -> Result<Vec<u8>> {
        let (ad, ciphertext) = self.scratch.split_at(payload_start);
        let nonce = keys.nonce(pkt_num.as_u64());
        let mut plain = vec![0u8; ciphertext.len()];
        let len = if initial_level {
            self.handler
                .in_decrypt(&mut plain, ciphertext, keys, &nonce, ad)?
        } else {
            self.handler
                .decrypt(&mut plain, ciphertext, keys, &nonce, ad)?
        };
        plain.truncate(len);
        Ok(plain)
    }

    /// Removes header protection, recovers the packet number and opens the
    /// AEAD. Returns `None` for silent drops (undecryptable).
    fn unprotect_and_decrypt(
        &mut self,
        pkt: &[u8],
        pn_offset: usize,
        space: PacketNumberSpace,
        keys: &CryptoKeys,
        initial_level: bool,
        allow_key_update: bool,
    ) -> Result<Option<(PacketNumber, Vec<u8>)>> {
        let sample_range = protection::sample_range(pn_offset);
        if pkt.len() < sample_range.end {
            return Ok(None);
        }
        let sample = &pkt[sample_range];

        let mask = if initial_level {
            cb(self.handler.in_hp_mask(keys, sample))?
        } else {
            cb(self.handler.hp_mask(keys, sample))?
        };

        self.scratch.clear();
        self.scratch.extend_from_slice(pkt);

        let pkt_numlen = protection::remove(&mut self.scratch, pn_offset, mask)
            .map_err(|_| Error::DiscardPacket)?;

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2
        //# An endpoint MUST treat receipt of a packet that has a non-zero
        //# value for these bits, after removing ... protection, as a
        //# connection error of type PROTOCOL_VIOLATION.
        packet::verify_reserved_bits(self.scratch[0])?;

        let largest = self.space(space).largest_rx_pkt_num;
        let (truncated, _) = TruncatedPacketNumber::decode(
            DecoderBuffer::new(&self.scratch[pn_offset..pn_offset + pkt_numlen]),
            pkt_numlen,
        )
        .map_err(|_| Error::DiscardPacket)?;
        let pkt_num = truncated.expand(largest);

        if self.space(space).is_duplicate(pkt_num) {
            trace!(?space, %pkt_num, "duplicate packet dropped");
            return Err(Error::DiscardPacket);
        }

        let payload_start = pn_offset + pkt_numlen;
        let key_phase_bit = self.scratch[0] & packet::KEY_PHASE_BIT != 0;

        match self.open_payload(payload_start, keys, pkt_num, initial_level) {
            Ok(plain) => {
                if allow_key_update
                    && key_phase_bit == self.key_phase
                    && self.key_update_wait_remote
                {
                    // the first packet verified under the current keys
                    // clears the update-pending flag; late old-phase
                    // packets stay acceptable while the old key is staged
                    self.key_update_wait_remote = false;
                    self.old_rx_ckm = None;
                }
                Ok(Some((pkt_num, plain)))
            }
            Err(_) if allow_key_update => {
                self.try_key_update_probe(key_phase_bit, pkt_num, largest, payload_start)
            }
            Err(_) => Ok(None),
        }
    }

    /// The key-update probe path: a short packet that fails under the
    /// current keys may be protected under the staged next generation or,
    /// while an update is pending, the previous one
    fn try_key_update_probe(
        &mut self,
        key_phase_bit: bool,
        pkt_num: PacketNumber,
        largest: Option<PacketNumber>,
        payload_start: usize,
    ) -> Result<Option<(PacketNumber, Vec<u8>)>> {
        // reordered packet from before our own rotation
        if key_phase_bit != self.key_phase && self.key_update_wait_remote {
            if let Some(old) = self.old_rx_ckm.clone() {
                if let Ok(plain) = self.open_payload(payload_start, &old, pkt_num, false) {
                    return Ok(Some((pkt_num, plain)));
                }
            }
            return Ok(None);
        }

        // possibly a peer-initiated rotation
        if key_phase_bit == self.key_phase {
            return Ok(None);
        }

        let staged = self.stage_remote_key_update()?;
        match self.open_payload(payload_start, &staged, pkt_num, false) {
            Ok(plain) => {
                //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#6.2
                //# An endpoint commits to the updated keys once it receives
                //# a packet with a higher packet number protected by them
                if largest.map_or(true, |l| pkt_num > l) {
                    self.commit_remote_key_update();
                }
                Ok(Some((pkt_num, plain)))
            }
            Err(_) => Ok(None),
        }
    }

    // ---- frame dispatch -----------------------------------------------

    /// Parses and handles every frame in a decrypted payload; returns
    /// whether any of them was ack-eliciting
    fn dispatch_frames(
        &mut self,
        space: PacketNumberSpace,
        pkt_ty: PacketType,
        payload: &[u8],
        path: Path,
        now: Timestamp,
    ) -> Result<bool> {
        if payload.is_empty() {
            return Err(Error::Proto);
        }

        let mut buffer = DecoderBuffer::new(payload);
        let mut eliciting = false;
        let mut non_probing = false;

        while !buffer.is_empty() {
            let (frame, rest) = FrameRef::decode(buffer).map_err(|_| Error::FrameEncoding)?;
            buffer = rest;

            if !frame_allowed(pkt_ty, &frame) {
                return Err(Error::Proto);
            }

            eliciting |= frame.is_ack_eliciting();
            non_probing |= !frame.is_probing();

            self.handle_frame(space, frame, path, now)?;
        }

        // a non-probing packet on an unknown path starts validation
        if pkt_ty == PacketType::Short
            && non_probing
            && path != self.path
            && self.role.is_server()
            && !self.local_settings.disable_migration
        {
            self.maybe_start_path_validation(path, now)?;
        }

        Ok(eliciting)
    }

    fn handle_frame(
        &mut self,
        space: PacketNumberSpace,
        frame: FrameRef<'_>,
        path: Path,
        now: Timestamp,
    ) -> Result<()> {
        match frame {
            Frame::Padding(_) | Frame::Ping(_) => Ok(()),
            Frame::Ack(ack) => self.on_ack_received(space, &ack, now),
            Frame::Crypto(crypto) => {
                let ctx = self.space_mut(space);
                ctx.crypto_rx.push(crypto.offset.as_u64(), crypto.data);
                Ok(())
            }
            Frame::Stream(stream_frame) => self.on_stream_frame(
                StreamId::from_varint(stream_frame.stream_id),
                stream_frame.offset.as_u64(),
                stream_frame.data,
                stream_frame.is_fin,
                now,
            ),
            Frame::MaxData(f) => {
                if f.max_data.as_u64() > self.max_tx_offset {
                    self.max_tx_offset = f.max_data.as_u64();
                    self.tx_blocked_sent = false;
                }
                Ok(())
            }
            Frame::MaxStreamData(f) => {
                let id = StreamId::from_varint(f.stream_id);
                match self.lookup_or_create_stream(id) {
                    Ok(()) => {}
                    Err(Error::StreamNotFound) => return Ok(()),
                    Err(err) => return Err(err),
                }
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.on_max_stream_data(f.max_stream_data.as_u64());
                    if stream.has_pending_tx() {
                        self.streams.schedule(id);
                    }
                }
                cb(self
                    .handler
                    .extend_max_stream_data(id, f.max_stream_data.as_u64()))?;
                Ok(())
            }
            Frame::MaxStreams(f) => {
                if self.streams.on_max_streams(f.kind, f.max_streams.as_u64()) {
                    match f.kind {
                        StreamKind::Bidirectional => cb(self
                            .handler
                            .extend_max_local_streams_bidi(f.max_streams.as_u64()))?,
                        StreamKind::Unidirectional => cb(self
                            .handler
                            .extend_max_local_streams_uni(f.max_streams.as_u64()))?,
                    }
                }
                Ok(())
            }
            // the peer reporting starvation needs no action beyond what the
            // regular window updates already do
            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) | Frame::StreamsBlocked(_) => {
                Ok(())
            }
            Frame::NewConnectionId(f) => self.dcids.on_new_connection_id(&f),
            Frame::RetireConnectionId(f) => self.scids.retire(f.sequence.as_u64(), now),
            Frame::NewToken(f) => {
                //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.7
                //# A server MUST treat receipt of a NEW_TOKEN frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.role.is_server() {
                    return Err(Error::Proto);
                }
                cb(self.handler.recv_new_token(f.token))
            }
            Frame::PathChallenge(f) => {
                self.pending_path_response = Some((path, f.data));
                Ok(())
            }
            Frame::PathResponse(f) => self.on_path_response(&f.data, now),
            Frame::ResetStream(f) => self.on_reset_stream(&f),
            Frame::StopSending(f) => self.on_stop_sending(&f),
            Frame::ConnectionClose(f) => {
                debug!(
                    code = f.error_code,
                    app = f.is_application,
                    "peer closed the connection"
                );
                self.enter_draining();
                Ok(())
            }
        }
    }

    // ---- ACK processing -----------------------------------------------

    fn on_ack_received(
        &mut self,
        space: PacketNumberSpace,
        ack: &frame::Ack,
        now: Timestamp,
    ) -> Result<()> {
        ack.validate()?;

        let largest_ack = ack.largest_ack.as_u64();
        let last_sent = self.space(space).last_tx_pkt_num;
        if last_sent.map_or(true, |last| largest_ack > last.as_u64()) {
            // acknowledging something never sent
            return Err(Error::Proto);
        }

        // the time threshold uses the estimate as of ack receipt
        let loss_delay = recovery::loss_delay(&self.rtt);

        let mut newly_acked = false;
        let mut largest_entry_info: Option<(Timestamp, bool)> = None;

        for (smallest, largest) in ack.ranges() {
            let entries = self.space_mut(space).rtb.take_range(smallest, largest);
            for entry in entries {
                newly_acked = true;
                self.cc.on_packet_acked(entry.pkt_num, entry.size);
                if entry.pkt_num == largest_ack {
                    largest_entry_info = Some((entry.ts, entry.is_ack_eliciting()));
                }
                if let Some(acked_largest) = entry.ack_largest {
                    self.space_mut(space).acktr.forget(acked_largest);
                }
                self.on_entry_acked(space, entry)?;
            }
        }

        // RTT sample only when the largest acked packet is newly acked
        if let Some((sent_ts, eliciting)) = largest_entry_info {
            if eliciting {
                let latest = now.saturating_duration_since(sent_ts);
                let ack_delay = self
                    .remote_settings
                    .as_ref()
                    .map(|s| s.decode_ack_delay(ack.ack_delay))
                    .unwrap_or_else(|| {
                        quill_core::settings::Settings::default()
                            .decode_ack_delay(ack.ack_delay)
                    });
                self.rtt.update(latest, ack_delay, self.max_ack_delay());
            }
        }

        let ctx = self.space_mut(space);
        ctx.largest_acked_tx = Some(
            ctx.largest_acked_tx
                .map_or(PacketNumber::new(largest_ack).unwrap_or(PacketNumber::MAX), |prev| {
                    prev.max(PacketNumber::new(largest_ack).unwrap_or(PacketNumber::MAX))
                }),
        );

        if newly_acked {
            self.on_new_ack();

            let lost = self
                .space_mut(space)
                .rtb
                .detect_lost(largest_ack, loss_delay, now);
            self.on_entries_lost(space, lost)?;
        }

        self.reap_streams()?;
        Ok(())
    }

    /// Per-frame bookkeeping for an acknowledged packet
    fn on_entry_acked(
        &mut self,
        space: PacketNumberSpace,
        entry: crate::recovery::RtbEntry,
    ) -> Result<()> {
        for frame in entry.frames {
            match frame {
                Frame::Crypto(crypto) => {
                    let len = crypto.data.len();
                    self.space_mut(space)
                        .on_crypto_range_acked(crypto.offset.as_u64(), len);
                }
                Frame::Stream(f) => {
                    let id = StreamId::from_varint(f.stream_id);
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_stream_frame_acked(
                            f.offset.as_u64(),
                            f.data.len(),
                            f.is_fin,
                        );
                    }
                }
                Frame::ResetStream(f) => {
                    let id = StreamId::from_varint(f.stream_id);
                    if let Some(stream) = self.streams.get_mut(id) {
                        stream.on_reset_acked();
                    }
                }
                // window frames resolve on ack; fresher values are
                // recomputed when scheduling the next update
                _ => {}
            }
        }
        Ok(())
    }

    // ---- stream frames ------------------------------------------------

    /// Resolves `id`, lazily creating a remote stream and emitting the
    /// open event
    fn lookup_or_create_stream(&mut self, id: StreamId) -> Result<()> {
        let (_, origin) = self.streams.get_or_create(
            id,
            &self.local_settings,
            self.remote_settings.as_ref(),
        )?;
        if origin == Some(StreamOrigin::Remote) {
            trace!(stream = %id, "remote stream opened");
            cb(self.handler.stream_open(id))?;
        }
        Ok(())
    }

    fn on_stream_frame(
        &mut self,
        id: StreamId,
        offset: u64,
        data: &[u8],
        fin: bool,
        now: Timestamp,
    ) -> Result<()> {
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.8
        //# An endpoint that receives a STREAM frame for a send-only stream
        //# MUST terminate the connection with error STREAM_STATE_ERROR.
        if !id.is_bidirectional() && id.is_local_initiated(self.role) {
            return Err(Error::StreamState);
        }

        match self.lookup_or_create_stream(id) {
            Ok(()) => {}
            // data for an already-destroyed stream is stale, not fatal
            Err(Error::StreamNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        // connection-level flow control previews the stream growth
        let growth = {
            let stream = self.streams.get_mut(id).expect("created above");
            let end = offset + data.len() as u64;
            let growth = end.saturating_sub(stream.rx_largest_offset());
            if self.rx_offset + growth > self.max_rx_offset {
                return Err(Error::FlowControl);
            }
            stream.recv_stream_frame(offset, data, fin)?;
            growth
        };
        self.rx_offset += growth;
        self.rx_bytes_total += data.len() as u64;
        self.rx_bw_start.get_or_insert(now);

        self.deliver_stream_data(id)?;
        self.reap_streams()
    }

    /// Pushes contiguous bytes up to the application and re-opens the
    /// connection window for what was consumed
    pub(crate) fn deliver_stream_data(&mut self, id: StreamId) -> Result<()> {
        loop {
            let Some(stream) = self.streams.get_mut(id) else {
                return Ok(());
            };
            if stream.is_shut_rd() {
                return Ok(());
            }
            let Some((offset, data, _)) = stream.pop_rx() else {
                break;
            };
            let fin = stream.take_fin_signal();
            cb(self.handler.recv_stream_data(id, fin, offset, &data))?;
            // the application consumed the bytes; the connection window
            // re-opens by the same amount
            self.unsent_max_rx_offset = self.unsent_max_rx_offset.saturating_add(data.len() as u64);
        }

        // an empty FIN has no bytes to pop but still completes the stream
        if let Some(stream) = self.streams.get_mut(id) {
            if stream.take_fin_signal() {
                let offset = stream.rx_delivered_offset();
                cb(self.handler.recv_stream_data(id, true, offset, &[]))?;
            }
        }
        Ok(())
    }

    fn on_reset_stream(&mut self, f: &frame::ResetStream) -> Result<()> {
        let id = StreamId::from_varint(f.stream_id);
        if !id.is_bidirectional() && id.is_local_initiated(self.role) {
            return Err(Error::StreamState);
        }

        match self.lookup_or_create_stream(id) {
            Ok(()) => {}
            Err(Error::StreamNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        let final_size = f.final_size.as_u64();
        let growth = {
            let stream = self.streams.get_mut(id).expect("created above");
            let growth = final_size.saturating_sub(stream.rx_largest_offset());
            if self.rx_offset + growth > self.max_rx_offset {
                return Err(Error::FlowControl);
            }
            stream.on_reset_stream(final_size, f.app_error_code)?;
            growth
        };
        self.rx_offset += growth;
        // nothing below the final size will be delivered now; re-open the
        // connection window for all of it
        self.unsent_max_rx_offset = self.unsent_max_rx_offset.saturating_add(growth);

        cb(self
            .handler
            .stream_reset(id, final_size, f.app_error_code))?;
        self.reap_streams()
    }

    fn on_stop_sending(&mut self, f: &frame::StopSending) -> Result<()> {
        let id = StreamId::from_varint(f.stream_id);
        // STOP_SENDING for our receive-only side is meaningless
        if !id.is_bidirectional() && !id.is_local_initiated(self.role) {
            return Err(Error::Proto);
        }

        match self.lookup_or_create_stream(id) {
            Ok(()) => {}
            Err(Error::StreamNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }

        let reset = {
            let stream = self.streams.get_mut(id).expect("created above");
            stream.on_stop_sending(f.app_error_code)
        };
        if let Some(final_size) = reset {
            self.app_space
                .tx_frq
                .push_back(Frame::ResetStream(frame::ResetStream {
                    stream_id: id.as_varint(),
                    app_error_code: f.app_error_code,
                    final_size: quill_core::varint::VarInt::new(final_size)
                        .map_err(|_| Error::Internal)?,
                }));
        }
        Ok(())
    }

    // ---- path handling ------------------------------------------------

    /// The peer moved: switch to the new path under a fresh destination id
    /// and validate it, keeping the old path as the fallback
    fn maybe_start_path_validation(&mut self, path: Path, now: Timestamp) -> Result<()> {
        // one validation at a time; reordered packets from the previous
        // path must not bounce the connection back and forth
        if self.validator.is_some() {
            return Ok(());
        }
        // migrating on a reused id would link the paths for observers
        let Some(next_dcid) = self.dcids.take_unused() else {
            trace!("migration observed but no unused DCID to switch to");
            return Ok(());
        };

        debug!(?path, "peer migrated; validating the new path");

        let old_path = self.path;
        let old_dcid = self.dcids.replace_current(next_dcid);
        self.path = path;

        // congestion state is path-specific and starts over
        self.cc.reset();
        self.rtt.reset(crate::DEFAULT_INITIAL_RTT);

        let timeout = self.cid_grace();
        self.validator = Some(PathValidator::new(
            path,
            ValidationKind::MigrationWithFallback,
            Some((old_path, old_dcid)),
            timeout,
            now,
        ));
        Ok(())
    }

    fn on_path_response(&mut self, data: &[u8; 8], now: Timestamp) -> Result<()> {
        let Some(validator) = self.validator.as_mut() else {
            return Ok(());
        };
        if !validator.on_response(data) {
            return Ok(());
        }

        let validator = self.validator.take().expect("checked above");
        let (new_path, _kind, fallback) = validator.into_parts();
        debug!(?new_path, "path validation succeeded");

        cb(self
            .handler
            .path_validation(&new_path, PathValidationResult::Success))?;

        // the migration sticks; the previous id is no longer needed
        if let Some((_, old_dcid)) = fallback {
            if let Some(displaced) = self.dcids.retire_entry(old_dcid, now) {
                cb(self.handler.remove_connection_id(&displaced.cid))?;
            }
        }
        Ok(())
    }
}

/// Which frames a packet type may carry
fn frame_allowed(pkt_ty: PacketType, frame: &FrameRef<'_>) -> bool {
    match pkt_ty {
        PacketType::Initial | PacketType::Handshake => matches!(
            frame,
            Frame::Padding(_)
                | Frame::Ping(_)
                | Frame::Ack(_)
                | Frame::Crypto(_)
                | Frame::ConnectionClose(_)
        ),
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2.3
        //# A client MUST NOT send ACK frames in 0-RTT packets
        PacketType::ZeroRtt => !matches!(
            frame,
            Frame::Ack(_) | Frame::RetireConnectionId(_) | Frame::PathResponse(_)
        ),
        PacketType::Short => true,
        _ => false,
    }
}
