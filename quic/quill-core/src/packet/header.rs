// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    connection::ConnectionId,
    packet::number::{PacketNumber, TruncatedPacketNumber},
    transport::{Error, Result},
    varint::VarInt,
};
use quill_codec::{DecoderBuffer, Encoder, EncoderBuffer, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   DCID Len (4),
//#   SCID Len (4),
//#   ...
//# }

pub const LONG_FORM_BIT: u8 = 0x80;
pub const FIXED_BIT: u8 = 0x40;
pub const SPIN_BIT: u8 = 0x20;
pub const KEY_PHASE_BIT: u8 = 0x04;

const LONG_TYPE_MASK: u8 = 0x30;
pub const LONG_RESERVED_MASK: u8 = 0x0c;
pub const SHORT_RESERVED_MASK: u8 = 0x18;
pub const PKT_NUMLEN_MASK: u8 = 0x03;

/// Bytes of AEAD ciphertext sampled for the header-protection mask
pub const SAMPLE_LEN: usize = 16;

const LONG_TYPE_INITIAL: u8 = 0x0;
const LONG_TYPE_ZERO_RTT: u8 = 0x1;
const LONG_TYPE_HANDSHAKE: u8 = 0x2;
const LONG_TYPE_RETRY: u8 = 0x3;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    Short,
}

impl PacketType {
    #[inline]
    pub fn is_long(self) -> bool {
        !matches!(self, Self::Short)
    }

    fn long_type_bits(self) -> u8 {
        match self {
            Self::Initial => LONG_TYPE_INITIAL,
            Self::ZeroRtt => LONG_TYPE_ZERO_RTT,
            Self::Handshake => LONG_TYPE_HANDSHAKE,
            Self::Retry => LONG_TYPE_RETRY,
            _ => unreachable!("not a long packet type"),
        }
    }
}

/// A parsed packet header
///
/// For protected inbound packets `pkt_num` and `pkt_numlen` only become
/// meaningful after header protection is removed and the truncated number
/// expanded; until then they hold zero.
#[derive(Clone, Copy, Debug)]
pub struct Header<'a> {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    /// Initial packets only
    pub token: &'a [u8],
    pub pkt_num: PacketNumber,
    pub pkt_numlen: usize,
    /// Long headers: value of the Length field (packet number + payload)
    pub payload_len: usize,
    pub key_phase: bool,
    pub spin: bool,
}

/// Byte offsets recorded while encoding a header, needed to finalize and
/// protect the packet
#[derive(Clone, Copy, Debug)]
pub struct HeaderOffsets {
    /// Offset of the 2-byte Length varint, long headers only
    pub len_offset: Option<usize>,
    pub pn_offset: usize,
}

impl<'a> Header<'a> {
    pub fn long(
        ty: PacketType,
        version: u32,
        dcid: ConnectionId,
        scid: ConnectionId,
        pkt_num: PacketNumber,
    ) -> Self {
        debug_assert!(ty.is_long());
        Self {
            ty,
            version,
            dcid,
            scid,
            token: &[],
            pkt_num,
            pkt_numlen: 0,
            payload_len: 0,
            key_phase: false,
            spin: false,
        }
    }

    pub fn short(dcid: ConnectionId, pkt_num: PacketNumber, key_phase: bool) -> Self {
        Self {
            ty: PacketType::Short,
            version: 0,
            dcid,
            scid: ConnectionId::EMPTY,
            token: &[],
            pkt_num,
            pkt_numlen: 0,
            payload_len: 0,
            key_phase,
            spin: false,
        }
    }

    /// Parses a long header up to, but not including, the packet number
    ///
    /// Returns the header and the offset of the packet-number field. For a
    /// Version Negotiation packet the offset marks the start of the
    /// supported-version list instead.
    pub fn decode_long(pkt: &'a [u8]) -> Result<(Header<'a>, usize)> {
        let buffer = DecoderBuffer::new(pkt);
        let (first, buffer) = buffer.decode::<u8>().map_err(|_| Error::InvalidArgument)?;

        if first & LONG_FORM_BIT == 0 {
            return Err(Error::InvalidArgument);
        }

        let (version, buffer) = buffer.decode::<u32>().map_err(|_| Error::InvalidArgument)?;

        //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.4
        //# A Version Negotiation packet is inherently not version-specific.
        //# It will be identified as such by ... the Version field, which is
        //# set to 0x00000000.
        if version == 0 {
            let (dcid, scid, buffer) = decode_cids(buffer)?;
            let pn_offset = pkt.len() - buffer.len();
            let hd = Header {
                ty: PacketType::VersionNegotiation,
                version,
                dcid,
                scid,
                token: &[],
                pkt_num: PacketNumber::ZERO,
                pkt_numlen: 0,
                payload_len: 0,
                key_phase: false,
                spin: false,
            };
            return Ok((hd, pn_offset));
        }

        if first & FIXED_BIT == 0 {
            return Err(Error::InvalidArgument);
        }

        let ty = match (first & LONG_TYPE_MASK) >> 4 {
            LONG_TYPE_INITIAL => PacketType::Initial,
            LONG_TYPE_ZERO_RTT => PacketType::ZeroRtt,
            LONG_TYPE_HANDSHAKE => PacketType::Handshake,
            LONG_TYPE_RETRY => PacketType::Retry,
            _ => return Err(Error::UnknownPacketType),
        };

        let (dcid, scid, buffer) = decode_cids(buffer)?;

        // Retry carries no length, packet number or payload; the caller
        // parses the ODCID and token with `Retry::decode`.
        if ty == PacketType::Retry {
            let pn_offset = pkt.len() - buffer.len();
            let hd = Header {
                ty,
                version,
                dcid,
                scid,
                token: &[],
                pkt_num: PacketNumber::ZERO,
                pkt_numlen: 0,
                payload_len: 0,
                key_phase: false,
                spin: false,
            };
            return Ok((hd, pn_offset));
        }

        let (token, buffer) = if ty == PacketType::Initial {
            let (token, buffer) = buffer
                .decode_slice_with_len_prefix::<VarInt>()
                .map_err(|_| Error::InvalidArgument)?;
            (token.into_less_safe_slice(), buffer)
        } else {
            (&[][..], buffer)
        };

        let (payload_len, buffer) = buffer
            .decode::<VarInt>()
            .map_err(|_| Error::InvalidArgument)?;
        let payload_len: usize = payload_len
            .try_into()
            .map_err(|_| Error::InvalidArgument)?;

        let pn_offset = pkt.len() - buffer.len();

        let hd = Header {
            ty,
            version,
            dcid,
            scid,
            token,
            pkt_num: PacketNumber::ZERO,
            pkt_numlen: 0,
            payload_len,
            key_phase: false,
            spin: false,
        };

        Ok((hd, pn_offset))
    }

    /// Parses a short header; the destination connection id length is known
    /// only to the receiving endpoint
    pub fn decode_short(pkt: &'a [u8], dcid_len: usize) -> Result<(Header<'a>, usize)> {
        let buffer = DecoderBuffer::new(pkt);
        let (first, buffer) = buffer.decode::<u8>().map_err(|_| Error::InvalidArgument)?;

        if first & LONG_FORM_BIT != 0 || first & FIXED_BIT == 0 {
            return Err(Error::InvalidArgument);
        }

        let (dcid, buffer) = buffer
            .decode_slice(dcid_len)
            .map_err(|_| Error::InvalidArgument)?;
        let dcid = ConnectionId::try_from_slice(dcid.as_less_safe_slice())
            .map_err(|_| Error::InvalidArgument)?;

        let pn_offset = pkt.len() - buffer.len();

        let hd = Header {
            ty: PacketType::Short,
            version: 0,
            dcid,
            scid: ConnectionId::EMPTY,
            token: &[],
            pkt_num: PacketNumber::ZERO,
            pkt_numlen: 0,
            payload_len: 0,
            key_phase: first & KEY_PHASE_BIT != 0,
            spin: first & SPIN_BIT != 0,
        };

        Ok((hd, pn_offset))
    }

    /// Encodes the header including the truncated packet number
    ///
    /// Long headers reserve a 2-byte Length varint filled by
    /// [`Header::rewrite_payload_len`] once the payload size is known.
    pub fn encode(
        &self,
        truncated_pn: TruncatedPacketNumber,
        encoder: &mut EncoderBuffer<'_>,
    ) -> Result<HeaderOffsets> {
        let needed = self.encoding_len(truncated_pn.len());
        if encoder.remaining_capacity() < needed {
            return Err(Error::NoBuf);
        }

        let numlen_bits = (truncated_pn.len() - 1) as u8;

        if self.ty.is_long() {
            let first =
                LONG_FORM_BIT | FIXED_BIT | (self.ty.long_type_bits() << 4) | numlen_bits;
            encoder.encode(&first);
            encoder.encode(&self.version);
            encoder.encode(&encode_cil(self.dcid.len(), self.scid.len()));
            encoder.encode(&self.dcid);
            encoder.encode(&self.scid);

            if self.ty == PacketType::Initial {
                let token_len = VarInt::try_from(self.token.len())
                    .map_err(|_| Error::InvalidArgument)?;
                encoder.encode(&token_len);
                encoder.write_slice(self.token);
            }

            let len_offset = encoder.len();
            // placeholder, rewritten once the payload is final
            put_varint14(0, encoder);
            let pn_offset = encoder.len();
            truncated_pn.encode(encoder);

            Ok(HeaderOffsets {
                len_offset: Some(len_offset),
                pn_offset,
            })
        } else {
            let mut first = FIXED_BIT | numlen_bits;
            if self.key_phase {
                first |= KEY_PHASE_BIT;
            }
            if self.spin {
                first |= SPIN_BIT;
            }
            encoder.encode(&first);
            encoder.encode(&self.dcid);
            let pn_offset = encoder.len();
            truncated_pn.encode(encoder);

            Ok(HeaderOffsets {
                len_offset: None,
                pn_offset,
            })
        }
    }

    /// Fills in the Length field of an encoded long header
    ///
    /// `payload_len` counts the packet-number bytes plus the protected
    /// payload, per the wire definition.
    pub fn rewrite_payload_len(
        encoder: &mut EncoderBuffer<'_>,
        offsets: HeaderOffsets,
        payload_len: usize,
    ) -> Result {
        let Some(len_offset) = offsets.len_offset else {
            return Ok(());
        };
        if payload_len > 16383 {
            return Err(Error::NoBuf);
        }
        let end = encoder.len();
        encoder.set_position(len_offset);
        put_varint14(payload_len as u16, encoder);
        encoder.set_position(end);
        Ok(())
    }

    /// The number of bytes `encode` will write
    pub fn encoding_len(&self, pkt_numlen: usize) -> usize {
        if self.ty.is_long() {
            let mut len = 1 + 4 + 1 + self.dcid.len() + self.scid.len();
            if self.ty == PacketType::Initial {
                len += VarInt::try_from(self.token.len())
                    .map(|v| v.encoding_size())
                    .unwrap_or(8);
                len += self.token.len();
            }
            len + 2 + pkt_numlen
        } else {
            1 + self.dcid.len() + pkt_numlen
        }
    }
}

/// Writes a varint in its 2-byte form regardless of the value's magnitude
#[inline]
fn put_varint14<E: Encoder>(value: u16, encoder: &mut E) {
    debug_assert!(value < 1 << 14);
    encoder.encode(&(value | 0x4000));
}

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2
//# DCID Len:  ... the length in bytes of the Destination Connection ID
//#    field ... encoded as an unsigned 4-bit integer, with the length in
//#    bytes of the connection ID being the value of the field plus 3 if
//#    the field value is non-zero.

#[inline]
fn encode_cil(dcid_len: usize, scid_len: usize) -> u8 {
    let dcil: u8 = if dcid_len == 0 { 0 } else { (dcid_len - 3) as u8 };
    let scil: u8 = if scid_len == 0 { 0 } else { (scid_len - 3) as u8 };
    (dcil << 4) | scil
}

fn decode_cids(buffer: DecoderBuffer<'_>) -> Result<(ConnectionId, ConnectionId, DecoderBuffer<'_>)> {
    let (cil, buffer) = buffer.decode::<u8>().map_err(|_| Error::InvalidArgument)?;

    let mut dcil = (cil >> 4) as usize;
    let mut scil = (cil & 0xf) as usize;
    if dcil != 0 {
        dcil += 3;
    }
    if scil != 0 {
        scil += 3;
    }

    let (dcid, buffer) = buffer
        .decode_slice(dcil)
        .map_err(|_| Error::InvalidArgument)?;
    let (scid, buffer) = buffer
        .decode_slice(scil)
        .map_err(|_| Error::InvalidArgument)?;

    let dcid = ConnectionId::try_from_slice(dcid.as_less_safe_slice())
        .map_err(|_| Error::InvalidArgument)?;
    let scid = ConnectionId::try_from_slice(scid.as_less_safe_slice())
        .map_err(|_| Error::InvalidArgument)?;

    Ok((dcid, scid, buffer))
}

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#17.2.5
//# A Retry packet ... carries an ODCID Len in the four type-specific bits
//# of the first byte, the original destination connection ID, and an
//# opaque token extending to the end of the datagram.

#[derive(Clone, Copy, Debug)]
pub struct Retry<'a> {
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub odcid: ConnectionId,
    pub token: &'a [u8],
}

impl<'a> Retry<'a> {
    pub fn decode(pkt: &'a [u8]) -> Result<Self> {
        let (hd, rest_offset) = Header::decode_long(pkt)?;
        if hd.ty != PacketType::Retry {
            return Err(Error::InvalidArgument);
        }

        let mut odcil = (pkt[0] & 0x0f) as usize;
        if odcil != 0 {
            odcil += 3;
        }

        let buffer = DecoderBuffer::new(&pkt[rest_offset..]);
        let (odcid, buffer) = buffer
            .decode_slice(odcil)
            .map_err(|_| Error::InvalidArgument)?;
        let odcid = ConnectionId::try_from_slice(odcid.as_less_safe_slice())
            .map_err(|_| Error::InvalidArgument)?;
        let token = buffer.into_less_safe_slice();

        Ok(Self {
            dcid: hd.dcid,
            scid: hd.scid,
            odcid,
            token,
        })
    }
}

/// Parses the supported-version list of a Version Negotiation packet
pub fn decode_version_list(payload: &[u8]) -> Result<Vec<u32>> {
    if payload.is_empty() || payload.len() % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    let mut versions = Vec::with_capacity(payload.len() / 4);
    let mut buffer = DecoderBuffer::new(payload);
    while !buffer.is_empty() {
        let (version, rest) = buffer.decode::<u32>().map_err(|_| Error::InvalidArgument)?;
        versions.push(version);
        buffer = rest;
    }
    Ok(versions)
}

/// Rejects packets with non-zero reserved header bits, which can only be
/// observed after header protection is removed
#[inline]
pub fn verify_reserved_bits(first: u8) -> Result {
    let mask = if first & LONG_FORM_BIT != 0 {
        LONG_RESERVED_MASK
    } else {
        SHORT_RESERVED_MASK
    };
    if first & mask != 0 {
        return Err(Error::Proto);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QUIC_VERSION;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_slice(bytes).unwrap()
    }

    #[test]
    fn long_header_round_trip() {
        let dcid = cid(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let scid = cid(&[9, 10, 11, 12]);
        let hd = Header::long(
            PacketType::Handshake,
            QUIC_VERSION,
            dcid,
            scid,
            PacketNumber::new(0xbeef).unwrap(),
        );

        let mut buf = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut buf);
        let truncated = TruncatedPacketNumber::new(0xbeef, 2);
        let offsets = hd.encode(truncated, &mut encoder).unwrap();
        Header::rewrite_payload_len(&mut encoder, offsets, 2 + 20).unwrap();
        let written = encoder.len();

        let (decoded, pn_offset) = Header::decode_long(&buf[..written]).unwrap();
        assert_eq!(decoded.ty, PacketType::Handshake);
        assert_eq!(decoded.version, QUIC_VERSION);
        assert_eq!(decoded.dcid, dcid);
        assert_eq!(decoded.scid, scid);
        assert_eq!(decoded.payload_len, 22);
        assert_eq!(pn_offset, offsets.pn_offset);
    }

    #[test]
    fn initial_header_carries_token() {
        let dcid = cid(&[1; 8]);
        let scid = cid(&[2; 8]);
        let mut hd = Header::long(
            PacketType::Initial,
            QUIC_VERSION,
            dcid,
            scid,
            PacketNumber::ZERO,
        );
        let token = [0xaa; 7];
        hd.token = &token;

        let mut buf = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut buf);
        let offsets = hd.encode(TruncatedPacketNumber::new(0, 1), &mut encoder).unwrap();
        Header::rewrite_payload_len(&mut encoder, offsets, 1 + 16).unwrap();
        let written = encoder.len();

        let (decoded, _) = Header::decode_long(&buf[..written]).unwrap();
        assert_eq!(decoded.ty, PacketType::Initial);
        assert_eq!(decoded.token, &token);
    }

    #[test]
    fn short_header_round_trip() {
        let dcid = cid(&[7; 8]);
        let hd = Header::short(dcid, PacketNumber::new(42).unwrap(), true);

        let mut buf = [0u8; 32];
        let mut encoder = EncoderBuffer::new(&mut buf);
        hd.encode(TruncatedPacketNumber::new(42, 1), &mut encoder)
            .unwrap();
        let written = encoder.len();

        let (decoded, pn_offset) = Header::decode_short(&buf[..written], 8).unwrap();
        assert_eq!(decoded.dcid, dcid);
        assert!(decoded.key_phase);
        assert_eq!(pn_offset, 9);
    }

    #[test]
    fn known_handshake_header_vector() {
        use hex_literal::hex;

        let hd = Header::long(
            PacketType::Handshake,
            QUIC_VERSION,
            cid(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]),
            cid(&[0x0b, 0x0c, 0x0d, 0x0e]),
            PacketNumber::new(0x0a).unwrap(),
        );

        let mut buf = [0u8; 32];
        let mut encoder = EncoderBuffer::new(&mut buf);
        let offsets = hd.encode(TruncatedPacketNumber::new(0x0a, 1), &mut encoder).unwrap();
        Header::rewrite_payload_len(&mut encoder, offsets, 0x14).unwrap();
        let written = encoder.len();

        assert_eq!(
            &buf[..written],
            hex!("e0 ff000012 51 0102030405060708 0b0c0d0e 4014 0a")
        );
    }

    #[test]
    fn cil_nibbles() {
        assert_eq!(encode_cil(0, 0), 0x00);
        assert_eq!(encode_cil(8, 4), 0x51);
        assert_eq!(encode_cil(18, 0), 0xf0);
    }

    #[test]
    fn version_negotiation_list() {
        let payload = [0x00, 0x00, 0x00, 0x01, 0xff, 0x00, 0x00, 0x12];
        let versions = decode_version_list(&payload).unwrap();
        assert_eq!(versions, vec![1, 0xff00_0012]);
        assert!(decode_version_list(&payload[..3]).is_err());
    }

    #[test]
    fn reserved_bits_are_rejected() {
        assert!(verify_reserved_bits(LONG_FORM_BIT | FIXED_BIT).is_ok());
        assert!(verify_reserved_bits(LONG_FORM_BIT | FIXED_BIT | 0x04).is_err());
        assert!(verify_reserved_bits(FIXED_BIT).is_ok());
        assert!(verify_reserved_bits(FIXED_BIT | 0x08).is_err());
        // the spin bit is not reserved
        assert!(verify_reserved_bits(FIXED_BIT | SPIN_BIT).is_ok());
    }
}
