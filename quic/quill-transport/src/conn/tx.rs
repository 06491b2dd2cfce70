// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Outbound packet composition: the priority-ordered write loop, packet
//! sealing and retransmit bookkeeping.

use crate::{
    conn::{cb, space_ack_delay, Connection, State},
    handler::ConnectionHandler,
    path::Path,
    recovery::{RtbEntry, RtbFlags},
};
use quill_core::{
    connection::ConnectionId,
    crypto::CryptoKeys,
    frame::{self, Frame, FrameOwned},
    packet::{protection, Header, PacketNumberSpace, PacketType},
    stream::{StreamId, StreamKind},
    time::Timestamp,
    transport::{Error, Result, TransportErrorCode},
    varint::VarInt,
    MIN_PACKET_SIZE,
};
use quill_codec::{Encoder, EncoderBuffer, EncoderValue};
use smallvec::SmallVec;
use tracing::trace;

/// Worst-case bytes a CRYPTO frame needs beyond its data
const CRYPTO_FRAME_OVERHEAD: usize = 1 + 8 + 4;
/// Worst-case bytes a STREAM frame needs beyond its data
const STREAM_FRAME_OVERHEAD: usize = 1 + 8 + 8 + 4;

/// What went into a packet while filling it
#[derive(Default)]
struct PktMeta {
    frames: SmallVec<[FrameOwned; 4]>,
    eliciting: bool,
    crypto: bool,
    probe: bool,
    ack_largest: Option<u64>,
    /// Pad the whole packet out to this total size
    pad_to: usize,
}

impl PktMeta {
    fn push(&mut self, frame: FrameOwned) {
        self.eliciting |= frame.is_ack_eliciting();
        if matches!(frame, Frame::Crypto(_)) {
            self.crypto = true;
        }
        self.frames.push(frame);
    }
}

impl<H: ConnectionHandler> Connection<H> {
    /// Produces the next outbound datagram, if anything needs sending
    ///
    /// Returns the datagram length (zero when idle) and the path it must
    /// be sent on.
    pub fn write_pkt(&mut self, buf: &mut [u8], now: Timestamp) -> Result<(usize, Path)> {
        if self.state.is_closing_or_draining() {
            return Err(self.closed_error());
        }
        if self.is_tls_failed() {
            // only write_connection_close makes progress from here
            return Err(Error::InvalidState);
        }
        self.write_inner(buf, now)
    }

    /// Produces handshake-phase datagrams; an alias kept for embedders
    /// that drive the handshake separately
    pub fn write_handshake(&mut self, buf: &mut [u8], now: Timestamp) -> Result<usize> {
        if self.state.is_closing_or_draining() {
            return Err(self.closed_error());
        }
        if self.is_tls_failed() {
            return Err(Error::InvalidState);
        }
        let (len, _) = self.write_inner(buf, now)?;
        Ok(len)
    }

    /// Queues stream data and produces a packet carrying as much of it as
    /// fits. Returns `(datagram_len, path, bytes_accepted)`.
    pub fn write_stream(
        &mut self,
        buf: &mut [u8],
        stream_id: StreamId,
        fin: bool,
        data: &[u8],
        now: Timestamp,
    ) -> Result<(usize, Path, usize)> {
        if self.state.is_closing_or_draining() {
            return Err(self.closed_error());
        }
        if self.is_tls_failed() {
            return Err(Error::InvalidState);
        }

        {
            let stream = self
                .streams
                .get_mut(stream_id)
                .ok_or(Error::StreamNotFound)?;
            stream.write(data, fin)?;
        }
        self.streams.schedule(stream_id);

        let (len, path) = self.write_inner(buf, now)?;
        Ok((len, path, data.len()))
    }

    /// Builds a CONNECTION_CLOSE packet and enters the closing state
    pub fn write_connection_close(
        &mut self,
        buf: &mut [u8],
        code: Option<TransportErrorCode>,
        now: Timestamp,
    ) -> Result<(usize, Path)> {
        if matches!(self.state, State::Draining) {
            return Err(Error::Draining);
        }
        // re-sends in the closing state repeat the original close verbatim
        let close = match (&self.close_frame, code) {
            (Some(stored), None) => stored.clone(),
            _ => {
                let code = code.unwrap_or_else(|| self.pending_error_code());
                frame::ConnectionClose {
                    error_code: code.as_u16(),
                    frame_type: Some(VarInt::ZERO),
                    reason: Vec::new(),
                    is_application: false,
                }
            }
        };
        self.write_close_pkt(buf, close, now)
    }

    /// Builds an application CONNECTION_CLOSE and enters the closing state
    pub fn write_application_close(
        &mut self,
        buf: &mut [u8],
        app_error_code: u16,
        now: Timestamp,
    ) -> Result<(usize, Path)> {
        if matches!(self.state, State::Draining) {
            return Err(Error::Draining);
        }
        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.19
        //# An APPLICATION_CLOSE cannot travel in Initial or Handshake
        //# packets, which the application keys do not cover.
        if !self.app_space.has_tx_keys() {
            return Err(Error::InvalidState);
        }
        let close = frame::ConnectionClose {
            error_code: app_error_code,
            frame_type: None,
            reason: Vec::new(),
            is_application: true,
        };
        self.write_close_pkt(buf, close, now)
    }

    fn write_close_pkt(
        &mut self,
        buf: &mut [u8],
        close: frame::ConnectionClose<Vec<u8>>,
        now: Timestamp,
    ) -> Result<(usize, Path)> {
        // the highest level with keys carries the close
        let ty = if self.app_space.has_tx_keys() {
            PacketType::Short
        } else if self.hs_space.has_tx_keys() {
            PacketType::Handshake
        } else if self.in_space.has_tx_keys() {
            PacketType::Initial
        } else {
            return Err(Error::NoKey);
        };

        let close_for_pkt = close.clone();
        let len = self.build_pkt(buf, ty, now, move |_conn, encoder, _meta| {
            if encoder.remaining_capacity() < close_for_pkt.encoding_size() {
                return Err(Error::NoBuf);
            }
            encoder.encode(&close_for_pkt);
            Ok(())
        })?;

        self.close_frame = Some(close);
        self.state = State::Closing;
        Ok((len, self.path))
    }

    // ---- the priority-ordered write loop ------------------------------

    fn write_inner(&mut self, buf: &mut [u8], now: Timestamp) -> Result<(usize, Path)> {
        if buf.is_empty() {
            return Err(Error::NoBuf);
        }

        // client kick-off: the first write starts TLS
        if matches!(self.state, State::ClientInitial) && !self.in_space.has_tx_keys() {
            let dcid = self.dcids.current().cid;
            let output = cb(self.handler.client_initial(&dcid))?;
            self.apply_handshake_output(output)?;
        }

        // 1. retired-id garbage collection and pool upkeep
        self.cid_gc(now)?;
        self.replenish_scids()?;

        // 2. pending PATH_RESPONSE
        if let Some((path, data)) = self.pending_path_response.take() {
            let result = self.build_pkt(buf, PacketType::Short, now, |_conn, encoder, meta| {
                let response = frame::PathResponse { data };
                if encoder.remaining_capacity() < response.encoding_size() {
                    return Err(Error::NoBuf);
                }
                encoder.encode(&response);
                meta.push(Frame::PathResponse(response));
                Ok(())
            });
            match result {
                Ok(len) if len > 0 => return Ok((len, path)),
                Ok(_) => {}
                // no short keys yet: drop the response, the peer retries
                Err(Error::NoKey) => {}
                Err(err) => return Err(err),
            }
        }

        // 3. an active validation sends its challenge
        if self
            .validator
            .as_ref()
            .is_some_and(|v| v.wants_challenge(now))
            && self.app_space.has_tx_keys()
        {
            let mut data = [0u8; 8];
            cb(self.handler.rand(&mut data))?;
            let probe_path = self
                .validator
                .as_ref()
                .expect("checked above")
                .path();

            let len = self.build_pkt(buf, PacketType::Short, now, |_conn, encoder, meta| {
                let challenge = frame::PathChallenge { data };
                if encoder.remaining_capacity() < challenge.encoding_size() {
                    return Err(Error::NoBuf);
                }
                encoder.encode(&challenge);
                meta.push(Frame::PathChallenge(challenge));
                meta.probe = true;
                Ok(())
            })?;

            if len > 0 {
                if let Some(validator) = self.validator.as_mut() {
                    validator.on_challenge_sent(data, now);
                }
                return Ok((len, probe_path));
            }
        }

        // 5. handshake remnants travel first
        if self.has_handshake_pkts_pending(now) {
            let len = self.write_handshake_pkts(buf, now)?;
            if len > 0 {
                return Ok((len, self.path));
            }
        }

        // 0-RTT: early data may ride behind the first flights while the
        // handshake is still running
        if self.state.is_handshaking()
            && self.early_tx_ckm.is_some()
            && self.streams.has_scheduled()
        {
            let len = self.build_pkt(buf, PacketType::ZeroRtt, now, |conn, encoder, meta| {
                loop {
                    if encoder.remaining_capacity() <= STREAM_FRAME_OVERHEAD {
                        break;
                    }
                    let Some(id) = conn.streams.next_scheduled() else {
                        break;
                    };
                    write_stream_frames(conn, id, encoder, meta)?;
                }
                Ok(())
            })?;
            if len > 0 {
                return Ok((len, self.path));
            }
        }

        // 7. probes bypass the congestion window
        if self.probe_pkt_left > 0 && self.app_space.has_tx_keys() {
            let len = self.write_probe_pkt(buf, now)?;
            if len > 0 {
                self.probe_pkt_left -= 1;
                return Ok((len, self.path));
            }
        }

        if !self.app_space.has_tx_keys() {
            return Ok((0, self.path));
        }

        // 4. the congestion window gates everything ack-eliciting below
        let cwnd_gated = self.cc.cwnd_left() == 0;

        // 8. the regular short-packet mix; 9. silence when idle
        let len = self.write_short_mix(buf, cwnd_gated, now)?;
        Ok((len, self.path))
    }

    fn has_handshake_pkts_pending(&self, now: Timestamp) -> bool {
        for space in [PacketNumberSpace::Initial, PacketNumberSpace::Handshake] {
            let ctx = self.space(space);
            if !ctx.has_tx_keys() {
                continue;
            }
            if ctx.has_pending_crypto() {
                return true;
            }
            if ctx
                .acktr
                .require_active_ack(space_ack_delay(space, self.max_ack_delay()), now)
            {
                return true;
            }
        }
        false
    }

    /// Writes coalesced Initial + Handshake packets
    fn write_handshake_pkts(&mut self, buf: &mut [u8], now: Timestamp) -> Result<usize> {
        let mut total = 0;

        for (space, ty) in [
            (PacketNumberSpace::Initial, PacketType::Initial),
            (PacketNumberSpace::Handshake, PacketType::Handshake),
        ] {
            if total + 64 > buf.len() {
                break;
            }
            let ctx = self.space(space);
            if !ctx.has_tx_keys() {
                continue;
            }
            let want_crypto = ctx.has_pending_crypto();
            let want_ack = ctx
                .acktr
                .require_active_ack(space_ack_delay(space, self.max_ack_delay()), now);
            if !want_crypto && !want_ack {
                continue;
            }

            //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#14
            //# A client MUST expand the payload of all UDP datagrams
            //# carrying Initial packets to at least 1200 bytes
            let pad_to = if ty == PacketType::Initial && self.role.is_client() {
                MIN_PACKET_SIZE
            } else {
                0
            };
            if pad_to > buf.len() - total {
                return Err(Error::NoBuf);
            }

            let len = self.build_pkt(&mut buf[total..], ty, now, |conn, encoder, meta| {
                meta.pad_to = pad_to;
                fill_space_frames(conn, space, encoder, meta, now)
            })?;

            if len > 0 {
                self.last_hs_tx_ts = Some(now);
            }
            total += len;
        }

        // the client moves on once its first flight is out
        if total > 0 && matches!(self.state, State::ClientInitial) {
            self.state = State::ClientWaitHandshake;
        }

        Ok(total)
    }

    fn write_probe_pkt(&mut self, buf: &mut [u8], now: Timestamp) -> Result<usize> {
        // prefer retransmittable stream data; fall back to PING
        let scheduled = self.streams.next_scheduled();

        self.build_pkt(buf, PacketType::Short, now, move |conn, encoder, meta| {
            meta.probe = true;

            if let Some(id) = scheduled {
                write_stream_frames(conn, id, encoder, meta)?;
            }

            if !meta.eliciting && encoder.remaining_capacity() >= 1 {
                let ping = frame::Ping;
                encoder.encode(&ping);
                meta.push(Frame::Ping(ping));
            }
            Ok(())
        })
    }

    /// The step-8 mix: ACK, queued control frames, CRYPTO, window updates
    /// and round-robin stream data
    fn write_short_mix(
        &mut self,
        buf: &mut [u8],
        cwnd_gated: bool,
        now: Timestamp,
    ) -> Result<usize> {
        self.build_pkt(buf, PacketType::Short, now, move |conn, encoder, meta| {
            // ACK when due
            add_ack_if_due(conn, PacketNumberSpace::ApplicationData, encoder, meta, now);

            if cwnd_gated {
                // nothing ack-eliciting may leave; the ACK alone is fine
                return Ok(());
            }

            // queued non-stream frames, skipping obsolete window updates
            while let Some(queued) = conn.app_space.tx_frq.pop_front() {
                let obsolete = match &queued {
                    Frame::MaxStreamData(f) => {
                        let id = StreamId::from_varint(f.stream_id);
                        match conn.streams.get(id) {
                            Some(stream) => {
                                f.max_stream_data.as_u64() < stream.pending_max_rx_offset()
                            }
                            None => true,
                        }
                    }
                    _ => false,
                };
                if obsolete {
                    continue;
                }
                if encoder.remaining_capacity() < queued.encoding_size() {
                    conn.app_space.tx_frq.push_front(queued);
                    break;
                }
                encoder.encode(&queued);
                meta.push(queued);
            }

            // post-handshake CRYPTO (session tickets and the like)
            loop {
                let room = encoder.remaining_capacity();
                let budget = room.saturating_sub(CRYPTO_FRAME_OVERHEAD);
                if budget == 0 {
                    break;
                }
                let Some(chunk) = conn.app_space.next_crypto_chunk(budget) else {
                    break;
                };
                let crypto = frame::Crypto {
                    offset: VarInt::new(chunk.offset).map_err(|_| Error::Internal)?,
                    data: chunk.data,
                };
                encoder.encode(&crypto);
                meta.push(Frame::Crypto(crypto));
            }

            // MAX_STREAMS as remote streams terminate
            for kind in [StreamKind::Bidirectional, StreamKind::Unidirectional] {
                if let Some(max_streams) = conn.streams.pending_max_streams(kind) {
                    let f = frame::MaxStreams { kind, max_streams };
                    if encoder.remaining_capacity() < f.encoding_size() {
                        break;
                    }
                    encoder.encode(&f);
                    conn.streams.commit_max_streams(kind, max_streams.as_u64());
                    match kind {
                        StreamKind::Bidirectional => cb(conn
                            .handler
                            .extend_max_remote_streams_bidi(max_streams.as_u64()))?,
                        StreamKind::Unidirectional => cb(conn
                            .handler
                            .extend_max_remote_streams_uni(max_streams.as_u64()))?,
                    }
                    meta.push(Frame::MaxStreams(f));
                }
            }

            // per-stream window updates
            let update_ids: Vec<StreamId> = conn
                .streams
                .iter_mut()
                .filter(|s| s.wants_max_stream_data())
                .map(|s| s.id())
                .collect();
            for id in update_ids {
                let Some(stream) = conn.streams.get_mut(id) else {
                    continue;
                };
                let advertised = stream.pending_max_rx_offset();
                let f = frame::MaxStreamData {
                    stream_id: id.as_varint(),
                    max_stream_data: VarInt::new(advertised).map_err(|_| Error::Internal)?,
                };
                if encoder.remaining_capacity() < f.encoding_size() {
                    break;
                }
                encoder.encode(&f);
                stream.commit_max_rx_offset(advertised);
                meta.push(Frame::MaxStreamData(f));
            }

            // connection-level window update
            if conn.wants_max_data(now) {
                let advertised = conn.unsent_max_rx_offset;
                let f = frame::MaxData {
                    max_data: VarInt::new(advertised).map_err(|_| Error::Internal)?,
                };
                if encoder.remaining_capacity() >= f.encoding_size() {
                    encoder.encode(&f);
                    conn.max_rx_offset = advertised;
                    meta.push(Frame::MaxData(f));
                }
            }

            // RETIRE_CONNECTION_ID backlog
            for seq in conn.dcids.drain_retire_queue() {
                let f = frame::RetireConnectionId {
                    sequence: VarInt::new(seq).map_err(|_| Error::Internal)?,
                };
                if encoder.remaining_capacity() < f.encoding_size() {
                    conn.dcids.requeue_retire(seq);
                    break;
                }
                encoder.encode(&f);
                meta.push(Frame::RetireConnectionId(f));
            }

            // starvation notice
            if conn.conn_tx_left() == 0 && !conn.tx_blocked_sent {
                let f = frame::DataBlocked {
                    data_limit: VarInt::new(conn.max_tx_offset).map_err(|_| Error::Internal)?,
                };
                if encoder.remaining_capacity() >= f.encoding_size() {
                    encoder.encode(&f);
                    conn.tx_blocked_sent = true;
                    meta.push(Frame::DataBlocked(f));
                }
            }

            // round-robin stream data
            loop {
                if encoder.remaining_capacity() <= STREAM_FRAME_OVERHEAD {
                    break;
                }
                let Some(id) = conn.streams.next_scheduled() else {
                    break;
                };
                write_stream_frames(conn, id, encoder, meta)?;
            }

            Ok(())
        })
    }

    /// Collects retired connection ids whose grace elapsed
    fn cid_gc(&mut self, now: Timestamp) -> Result<()> {
        let grace = self.cid_grace();
        // our own ids just disappear; the peer already retired them
        let _ = self.scids.gc(grace, now);
        for entry in self.dcids.gc(grace, now) {
            cb(self.handler.remove_connection_id(&entry.cid))?;
        }
        Ok(())
    }

    // ---- packet assembly ----------------------------------------------

    fn build_pkt(
        &mut self,
        buf: &mut [u8],
        ty: PacketType,
        now: Timestamp,
        fill: impl FnOnce(&mut Self, &mut EncoderBuffer<'_>, &mut PktMeta) -> Result<()>,
    ) -> Result<usize> {
        let dcid = self.dcids.current().cid;
        self.build_pkt_inner(buf, ty, dcid, now, fill)
    }

    fn build_pkt_inner(
        &mut self,
        buf: &mut [u8],
        ty: PacketType,
        dcid: ConnectionId,
        now: Timestamp,
        fill: impl FnOnce(&mut Self, &mut EncoderBuffer<'_>, &mut PktMeta) -> Result<()>,
    ) -> Result<usize> {
        let space_id = match ty {
            PacketType::Initial => PacketNumberSpace::Initial,
            PacketType::Handshake => PacketNumberSpace::Handshake,
            PacketType::Short | PacketType::ZeroRtt => PacketNumberSpace::ApplicationData,
            _ => return Err(Error::InvalidArgument),
        };
        let initial_level = ty == PacketType::Initial;

        let keys: CryptoKeys = match ty {
            PacketType::ZeroRtt => self.early_tx_ckm.clone().ok_or(Error::NoKey)?,
            _ => self.space(space_id).tx_ckm.clone().ok_or(Error::NoKey)?,
        };
        let overhead = self.handler.aead_overhead();

        let pkt_num = self.space(space_id).next_pkt_num()?;
        let truncated = pkt_num.truncate(self.space(space_id).largest_acked_tx);
        let pkt_numlen = truncated.len();

        let max_pkt = self
            .local_settings
            .effective_max_packet_size()
            .min(crate::DEFAULT_MAX_PKTLEN)
            .min(buf.len());
        if max_pkt < 64 + overhead {
            return Err(Error::NoBuf);
        }

        // the retry token only rides on client Initials
        let token = if ty == PacketType::Initial && self.role.is_client() {
            core::mem::take(&mut self.retry_token)
        } else {
            Vec::new()
        };

        let offsets = {
            let mut header = match ty {
                PacketType::Short => Header::short(dcid, pkt_num, self.key_phase),
                _ => Header::long(ty, self.version, dcid, self.scids.initial_cid(), pkt_num),
            };
            header.token = &token;
            let mut encoder = EncoderBuffer::new(&mut buf[..max_pkt]);
            header.encode(truncated, &mut encoder)?
        };
        if !token.is_empty() {
            self.retry_token = token;
        }

        let payload_start = offsets.pn_offset + pkt_numlen;

        // keep room for the AEAD tag while frames are written
        let frame_limit = max_pkt - overhead;
        if frame_limit <= payload_start {
            return Err(Error::NoBuf);
        }
        let mut frame_encoder = EncoderBuffer::new(&mut buf[..frame_limit]);
        frame_encoder.set_position(payload_start);

        let mut meta = PktMeta::default();
        fill(self, &mut frame_encoder, &mut meta)?;
        let mut plain_len = frame_encoder.len() - payload_start;

        if plain_len == 0 {
            return Ok(0);
        }

        // pad so the header-protection sample exists, and out to any
        // requested datagram floor; PADDING frames are zero bytes
        let min_total = (offsets.pn_offset + 4 + protection::SAMPLE_LEN).max(meta.pad_to);
        let mut total = payload_start + plain_len + overhead;
        if total < min_total {
            let pad = min_total - total;
            if payload_start + plain_len + pad + overhead > buf.len() {
                return Err(Error::NoBuf);
            }
            buf[payload_start + plain_len..payload_start + plain_len + pad].fill(0);
            plain_len += pad;
            total = min_total;
        }
        if total > buf.len() {
            return Err(Error::NoBuf);
        }

        // finalize the long-header length before it becomes the AD
        if offsets.len_offset.is_some() {
            let mut len_encoder = EncoderBuffer::new(&mut buf[..total]);
            len_encoder.set_position(total);
            Header::rewrite_payload_len(&mut len_encoder, offsets, pkt_numlen + plain_len + overhead)?;
        }

        // seal: the plaintext moves through the scratch buffer
        self.scratch.clear();
        self.scratch
            .extend_from_slice(&buf[payload_start..payload_start + plain_len]);

        let nonce = keys.nonce(pkt_num.as_u64());
        let (ad, payload_buf) = buf.split_at_mut(payload_start);
        let sealed_len = if initial_level {
            self.handler.in_encrypt(
                &mut payload_buf[..total - payload_start],
                &self.scratch,
                &keys,
                &nonce,
                ad,
            )
        } else {
            self.handler.encrypt(
                &mut payload_buf[..total - payload_start],
                &self.scratch,
                &keys,
                &nonce,
                ad,
            )
        }
        .map_err(|_| Error::CallbackFailure)?;
        debug_assert_eq!(sealed_len, plain_len + overhead);

        // header protection
        let sample_range = protection::sample_range(offsets.pn_offset);
        let mut sample = [0u8; protection::SAMPLE_LEN];
        sample.copy_from_slice(&buf[sample_range]);
        let mask = if initial_level {
            cb(self.handler.in_hp_mask(&keys, &sample))?
        } else {
            cb(self.handler.hp_mask(&keys, &sample))?
        };
        protection::apply(&mut buf[..total], offsets.pn_offset, pkt_numlen, mask)?;

        // bookkeeping
        {
            let ctx = self.space_mut(space_id);
            ctx.commit_tx_pkt_num(pkt_num);
            if meta.ack_largest.is_some() {
                ctx.acktr.commit_ack();
            }
        }

        if meta.eliciting || meta.crypto {
            let mut flags = RtbFlags::empty();
            if meta.eliciting {
                flags = flags.with(RtbFlags::ACK_ELICITING);
            }
            if meta.crypto {
                flags = flags.with(RtbFlags::CRYPTO_PKT);
            }
            if meta.probe {
                flags = flags.with(RtbFlags::PROBE);
            }
            let entry = RtbEntry {
                pkt_num: pkt_num.as_u64(),
                frames: meta.frames,
                ts: now,
                size: total,
                flags,
                ack_largest: meta.ack_largest,
            };
            self.space_mut(space_id).rtb.add(entry);
            self.cc.on_packet_sent(total);
            self.last_tx_ts = Some(now);
        }

        self.last_activity_ts = Some(now);
        self.tx_npkt += 1;
        trace!(?ty, pkt_num = %pkt_num, len = total, "packet sent");
        Ok(total)
    }
}

/// Adds a pending ACK for `space` when one is due
fn add_ack_if_due<H: ConnectionHandler>(
    conn: &mut Connection<H>,
    space: PacketNumberSpace,
    encoder: &mut EncoderBuffer<'_>,
    meta: &mut PktMeta,
    now: Timestamp,
) {
    let delay = space_ack_delay(space, conn.max_ack_delay());
    let exponent = conn.local_settings.ack_delay_exponent;
    let ctx = conn.space_mut(space);
    if !ctx.acktr.require_active_ack(delay, now) {
        return;
    }
    let Some(ack) = ctx.acktr.generate(now, |d| {
        VarInt::new((d.as_micros() as u64) >> exponent).unwrap_or(VarInt::MAX)
    }) else {
        return;
    };
    if encoder.remaining_capacity() < ack.encoding_size() {
        return;
    }
    meta.ack_largest = Some(ack.largest_ack.as_u64());
    encoder.encode(&ack);
    // ACKs are regenerated rather than retransmitted, so the frame does
    // not join meta.frames
}

/// Frames for one space's handshake packet: ACK then CRYPTO
fn fill_space_frames<H: ConnectionHandler>(
    conn: &mut Connection<H>,
    space: PacketNumberSpace,
    encoder: &mut EncoderBuffer<'_>,
    meta: &mut PktMeta,
    now: Timestamp,
) -> Result<()> {
    add_ack_if_due(conn, space, encoder, meta, now);

    loop {
        let budget = encoder
            .remaining_capacity()
            .saturating_sub(CRYPTO_FRAME_OVERHEAD);
        if budget == 0 {
            break;
        }
        let Some(chunk) = conn.space_mut(space).next_crypto_chunk(budget) else {
            break;
        };
        let crypto = frame::Crypto {
            offset: VarInt::new(chunk.offset).map_err(|_| Error::Internal)?,
            data: chunk.data,
        };
        encoder.encode(&crypto);
        meta.push(Frame::Crypto(crypto));
    }
    Ok(())
}

/// Pops chunks from one stream into STREAM frames until packet or window
/// room runs out
fn write_stream_frames<H: ConnectionHandler>(
    conn: &mut Connection<H>,
    id: StreamId,
    encoder: &mut EncoderBuffer<'_>,
    meta: &mut PktMeta,
) -> Result<()> {
    let mut wrote_any = false;

    loop {
        let budget = encoder
            .remaining_capacity()
            .saturating_sub(STREAM_FRAME_OVERHEAD);
        if budget == 0 {
            break;
        }

        let conn_left = conn.conn_tx_left();
        let Some(stream) = conn.streams.get_mut(id) else {
            return Ok(());
        };

        let Some(mut chunk) = stream.next_tx_chunk(budget) else {
            break;
        };

        // the connection-level window applies to never-sent bytes only
        let end = chunk.offset + chunk.data.len() as u64;
        let fresh = stream.fresh_bytes(end);
        if fresh > conn_left {
            let over = (fresh - conn_left) as usize;
            let keep = chunk.data.len() - over;
            let rest = crate::stream::StreamChunk {
                offset: chunk.offset + keep as u64,
                data: chunk.data[keep..].to_vec(),
                fin: chunk.fin,
            };
            chunk.data.truncate(keep);
            chunk.fin = false;
            stream.requeue_tx_chunk(rest);
            if chunk.data.is_empty() {
                break;
            }
        }

        let end = chunk.offset + chunk.data.len() as u64;
        let fresh = stream.fresh_bytes(end);
        stream.note_sent(end);

        let stream_frame = frame::Stream {
            stream_id: id.as_varint(),
            offset: VarInt::new(chunk.offset).map_err(|_| Error::Internal)?,
            data: chunk.data,
            is_fin: chunk.fin,
            is_last_frame: false,
        };
        encoder.encode(&stream_frame);
        meta.push(Frame::Stream(stream_frame));
        conn.tx_offset += fresh;
        wrote_any = true;
    }

    // fairness: a stream with leftovers goes to the back of the rotation
    let Some(stream) = conn.streams.get_mut(id) else {
        return Ok(());
    };
    if stream.has_pending_tx() {
        if stream.is_tx_blocked() {
            // tell the peer the stream window is the bottleneck
            let f = frame::StreamDataBlocked {
                stream_id: id.as_varint(),
                stream_data_limit: VarInt::new(stream.max_tx_offset())
                    .map_err(|_| Error::Internal)?,
            };
            if encoder.remaining_capacity() >= f.encoding_size() {
                encoder.encode(&f);
                meta.push(Frame::StreamDataBlocked(f));
            }
        } else if wrote_any {
            conn.streams.reschedule_after_partial_send(id);
        } else {
            conn.streams.schedule(id);
        }
    }
    Ok(())
}
