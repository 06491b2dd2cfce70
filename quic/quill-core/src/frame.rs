// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quill_codec::{DecoderBuffer, DecoderBufferResult, DecoderError, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#12.4
//# As described in Section 12.4, packets contain one or more frames.
//# This section describes the format and semantics of the core QUIC
//# frame types.

pub(crate) type Tag = u8;

// This implements a codec for a frame that contains simple values that
// don't vary based on the tag
macro_rules! simple_frame_codec {
    ($name:ident {
        $(
            $field:ident
        ),*
    }, $tag:expr) => {
        quill_codec::decoder_parameterized_value!(
            impl<'a> $name {
                fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
                    $(
                        let ($field, buffer) = buffer.decode()?;
                    )*

                    let frame = $name { $($field),* };

                    Ok((frame, buffer))
                }
            }
        );

        impl quill_codec::EncoderValue for $name {
            fn encode<E: quill_codec::Encoder>(&self, buffer: &mut E) {
                buffer.encode(&$tag);
                $(
                    buffer.encode(&self.$field);
                )*
            }
        }
    };
}

pub mod ack;
pub mod connection_close;
pub mod crypto;
pub mod data_blocked;
pub mod max_data;
pub mod max_stream_data;
pub mod max_streams;
pub mod new_connection_id;
pub mod new_token;
pub mod padding;
pub mod path_challenge;
pub mod path_response;
pub mod ping;
pub mod reset_stream;
pub mod retire_connection_id;
pub mod stop_sending;
pub mod stream;
pub mod stream_data_blocked;
pub mod streams_blocked;

pub use ack::{Ack, AckBlock, EcnCounts, MAX_ACK_BLKS};
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use data_blocked::DataBlocked;
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_streams::MaxStreams;
pub use new_connection_id::NewConnectionId;
pub use new_token::NewToken;
pub use padding::Padding;
pub use path_challenge::PathChallenge;
pub use path_response::PathResponse;
pub use ping::Ping;
pub use reset_stream::ResetStream;
pub use retire_connection_id::RetireConnectionId;
pub use stop_sending::StopSending;
pub use stream::Stream;
pub use stream_data_blocked::StreamDataBlocked;
pub use streams_blocked::StreamsBlocked;

/// A decoded or queued frame, generic over its data payload
///
/// `Frame<&[u8]>` borrows from a received packet; `Frame<Vec<u8>>` owns its
/// bytes and is what retransmit queues hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<Data> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<Data>),
    NewToken(NewToken<Data>),
    Stream(Stream<Data>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<Data>),
}

pub type FrameRef<'a> = Frame<&'a [u8]>;
pub type FrameOwned = Frame<Vec<u8>>;

impl<Data> Frame<Data> {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Padding(f) => f.tag(),
            Frame::Ping(_) => ping::PING_TAG,
            Frame::Ack(f) => f.tag(),
            Frame::ResetStream(_) => reset_stream::RESET_STREAM_TAG,
            Frame::StopSending(_) => stop_sending::STOP_SENDING_TAG,
            Frame::Crypto(_) => crypto::CRYPTO_TAG,
            Frame::NewToken(_) => new_token::NEW_TOKEN_TAG,
            Frame::Stream(f) => f.tag(),
            Frame::MaxData(_) => max_data::MAX_DATA_TAG,
            Frame::MaxStreamData(_) => max_stream_data::MAX_STREAM_DATA_TAG,
            Frame::MaxStreams(f) => f.tag(),
            Frame::DataBlocked(_) => data_blocked::DATA_BLOCKED_TAG,
            Frame::StreamDataBlocked(_) => stream_data_blocked::STREAM_DATA_BLOCKED_TAG,
            Frame::StreamsBlocked(f) => f.tag(),
            Frame::NewConnectionId(_) => new_connection_id::NEW_CONNECTION_ID_TAG,
            Frame::RetireConnectionId(_) => retire_connection_id::RETIRE_CONNECTION_ID_TAG,
            Frame::PathChallenge(_) => path_challenge::PATH_CHALLENGE_TAG,
            Frame::PathResponse(_) => path_response::PATH_RESPONSE_TAG,
            Frame::ConnectionClose(f) => f.tag(),
        }
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#13.2
    //# Packets containing only ACK frames are not acknowledged... packets
    //# containing PADDING frames do not elicit acknowledgement.
    /// A frame whose receipt obliges the peer to eventually acknowledge
    /// the carrying packet
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_)
        )
    }

    //= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#9.1
    //# PATH_CHALLENGE, PATH_RESPONSE, NEW_CONNECTION_ID, and PADDING
    //# frames are "probing frames", and all other frames are
    //# "non-probing frames".
    /// A frame allowed on a path that has not been validated
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding(_)
                | Frame::PathChallenge(_)
                | Frame::PathResponse(_)
                | Frame::NewConnectionId(_)
        )
    }
}

impl<'a> FrameRef<'a> {
    /// Converts borrowed payloads into owned ones for queueing
    pub fn to_owned(&self) -> FrameOwned {
        match self {
            Frame::Padding(f) => Frame::Padding(*f),
            Frame::Ping(f) => Frame::Ping(*f),
            Frame::Ack(f) => Frame::Ack(f.clone()),
            Frame::ResetStream(f) => Frame::ResetStream(*f),
            Frame::StopSending(f) => Frame::StopSending(*f),
            Frame::Crypto(f) => Frame::Crypto(f.map_data(|data| data.to_vec())),
            Frame::NewToken(f) => Frame::NewToken(f.map_data(|data| data.to_vec())),
            Frame::Stream(f) => Frame::Stream(f.map_data(|data| data.to_vec())),
            Frame::MaxData(f) => Frame::MaxData(*f),
            Frame::MaxStreamData(f) => Frame::MaxStreamData(*f),
            Frame::MaxStreams(f) => Frame::MaxStreams(*f),
            Frame::DataBlocked(f) => Frame::DataBlocked(*f),
            Frame::StreamDataBlocked(f) => Frame::StreamDataBlocked(*f),
            Frame::StreamsBlocked(f) => Frame::StreamsBlocked(*f),
            Frame::NewConnectionId(f) => Frame::NewConnectionId(*f),
            Frame::RetireConnectionId(f) => Frame::RetireConnectionId(*f),
            Frame::PathChallenge(f) => Frame::PathChallenge(*f),
            Frame::PathResponse(f) => Frame::PathResponse(*f),
            Frame::ConnectionClose(f) => {
                Frame::ConnectionClose(f.map_reason(|reason| reason.to_vec()))
            }
        }
    }

    /// Decodes a single frame, returning it and the remaining buffer
    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let tag = buffer.peek_byte(0)?;
        match tag {
            // frame tags above 0x3f would collide with longer varint
            // encodings; nothing up there is recognized
            0b0100_0000..=0xff => Err(DecoderError::InvariantViolation("invalid frame")),
            padding::PADDING_TAG => {
                let (frame, buffer) = buffer.decode::<Padding>()?;
                Ok((Frame::Padding(frame), buffer))
            }
            ping::PING_TAG => {
                let buffer = buffer.skip(1)?;
                Ok((Frame::Ping(Ping), buffer))
            }
            ack::ACK_TAG | ack::ACK_ECN_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<Ack>(tag)?;
                Ok((Frame::Ack(frame), buffer))
            }
            reset_stream::RESET_STREAM_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<ResetStream>(tag)?;
                Ok((Frame::ResetStream(frame), buffer))
            }
            stop_sending::STOP_SENDING_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<StopSending>(tag)?;
                Ok((Frame::StopSending(frame), buffer))
            }
            crypto::CRYPTO_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<Crypto<&[u8]>>(tag)?;
                Ok((Frame::Crypto(frame), buffer))
            }
            new_token::NEW_TOKEN_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<NewToken<&[u8]>>(tag)?;
                Ok((Frame::NewToken(frame), buffer))
            }
            stream::STREAM_TAG_MIN..=stream::STREAM_TAG_MAX => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<Stream<&[u8]>>(tag)?;
                Ok((Frame::Stream(frame), buffer))
            }
            max_data::MAX_DATA_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<MaxData>(tag)?;
                Ok((Frame::MaxData(frame), buffer))
            }
            max_stream_data::MAX_STREAM_DATA_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<MaxStreamData>(tag)?;
                Ok((Frame::MaxStreamData(frame), buffer))
            }
            max_streams::MAX_STREAMS_BIDI_TAG | max_streams::MAX_STREAMS_UNI_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<MaxStreams>(tag)?;
                Ok((Frame::MaxStreams(frame), buffer))
            }
            data_blocked::DATA_BLOCKED_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<DataBlocked>(tag)?;
                Ok((Frame::DataBlocked(frame), buffer))
            }
            stream_data_blocked::STREAM_DATA_BLOCKED_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<StreamDataBlocked>(tag)?;
                Ok((Frame::StreamDataBlocked(frame), buffer))
            }
            streams_blocked::STREAMS_BLOCKED_BIDI_TAG
            | streams_blocked::STREAMS_BLOCKED_UNI_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<StreamsBlocked>(tag)?;
                Ok((Frame::StreamsBlocked(frame), buffer))
            }
            new_connection_id::NEW_CONNECTION_ID_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<NewConnectionId>(tag)?;
                Ok((Frame::NewConnectionId(frame), buffer))
            }
            retire_connection_id::RETIRE_CONNECTION_ID_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<RetireConnectionId>(tag)?;
                Ok((Frame::RetireConnectionId(frame), buffer))
            }
            path_challenge::PATH_CHALLENGE_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<PathChallenge>(tag)?;
                Ok((Frame::PathChallenge(frame), buffer))
            }
            path_response::PATH_RESPONSE_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<PathResponse>(tag)?;
                Ok((Frame::PathResponse(frame), buffer))
            }
            connection_close::CONNECTION_CLOSE_TAG | connection_close::APPLICATION_CLOSE_TAG => {
                let buffer = buffer.skip(1)?;
                let (frame, buffer) =
                    buffer.decode_parameterized::<ConnectionClose<&[u8]>>(tag)?;
                Ok((Frame::ConnectionClose(frame), buffer))
            }
            _ => Err(DecoderError::InvariantViolation("invalid frame")),
        }
    }
}

impl<Data: EncoderValue> EncoderValue for Frame<Data> {
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        match self {
            Frame::Padding(f) => buffer.encode(f),
            Frame::Ping(f) => buffer.encode(f),
            Frame::Ack(f) => buffer.encode(f),
            Frame::ResetStream(f) => buffer.encode(f),
            Frame::StopSending(f) => buffer.encode(f),
            Frame::Crypto(f) => buffer.encode(f),
            Frame::NewToken(f) => buffer.encode(f),
            Frame::Stream(f) => buffer.encode(f),
            Frame::MaxData(f) => buffer.encode(f),
            Frame::MaxStreamData(f) => buffer.encode(f),
            Frame::MaxStreams(f) => buffer.encode(f),
            Frame::DataBlocked(f) => buffer.encode(f),
            Frame::StreamDataBlocked(f) => buffer.encode(f),
            Frame::StreamsBlocked(f) => buffer.encode(f),
            Frame::NewConnectionId(f) => buffer.encode(f),
            Frame::RetireConnectionId(f) => buffer.encode(f),
            Frame::PathChallenge(f) => buffer.encode(f),
            Frame::PathResponse(f) => buffer.encode(f),
            Frame::ConnectionClose(f) => buffer.encode(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::VarInt;

    fn round_trip(frame: FrameOwned) {
        let bytes = frame.encode_to_vec();
        let (decoded, remaining) = FrameRef::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert!(remaining.is_empty(), "leftover bytes for {frame:?}");
        assert_eq!(decoded.to_owned(), frame);
    }

    #[test]
    fn every_frame_round_trips() {
        use crate::connection::{ConnectionId, StatelessResetToken};
        use crate::stream::StreamKind;

        round_trip(Frame::Padding(Padding { length: 5 }));
        round_trip(Frame::Ping(Ping));
        round_trip(Frame::ResetStream(ResetStream {
            stream_id: VarInt::from_u8(4),
            app_error_code: 7,
            final_size: VarInt::from_u32(100_000),
        }));
        round_trip(Frame::StopSending(StopSending {
            stream_id: VarInt::from_u8(8),
            app_error_code: 1,
        }));
        round_trip(Frame::Crypto(Crypto {
            offset: VarInt::from_u32(1234),
            data: vec![1, 2, 3, 4],
        }));
        round_trip(Frame::NewToken(NewToken {
            token: vec![9; 32],
        }));
        round_trip(Frame::MaxData(MaxData {
            max_data: VarInt::from_u32(1 << 20),
        }));
        round_trip(Frame::MaxStreamData(MaxStreamData {
            stream_id: VarInt::from_u8(0),
            max_stream_data: VarInt::from_u32(65536),
        }));
        round_trip(Frame::MaxStreams(MaxStreams {
            kind: StreamKind::Bidirectional,
            max_streams: VarInt::from_u8(100),
        }));
        round_trip(Frame::MaxStreams(MaxStreams {
            kind: StreamKind::Unidirectional,
            max_streams: VarInt::from_u8(3),
        }));
        round_trip(Frame::DataBlocked(DataBlocked {
            data_limit: VarInt::from_u32(4096),
        }));
        round_trip(Frame::StreamDataBlocked(StreamDataBlocked {
            stream_id: VarInt::from_u8(4),
            stream_data_limit: VarInt::from_u32(2048),
        }));
        round_trip(Frame::StreamsBlocked(StreamsBlocked {
            kind: StreamKind::Unidirectional,
            stream_limit: VarInt::from_u8(16),
        }));
        round_trip(Frame::NewConnectionId(NewConnectionId {
            sequence: VarInt::from_u8(3),
            cid: ConnectionId::try_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap(),
            stateless_reset_token: StatelessResetToken::new([0xab; 16]),
        }));
        round_trip(Frame::RetireConnectionId(RetireConnectionId {
            sequence: VarInt::from_u8(2),
        }));
        round_trip(Frame::PathChallenge(PathChallenge {
            data: [1, 2, 3, 4, 5, 6, 7, 8],
        }));
        round_trip(Frame::PathResponse(PathResponse {
            data: [8, 7, 6, 5, 4, 3, 2, 1],
        }));
        round_trip(Frame::ConnectionClose(ConnectionClose {
            error_code: 0x7,
            frame_type: Some(VarInt::from_u8(0x02)),
            reason: b"go away".to_vec(),
            is_application: false,
        }));
        round_trip(Frame::ConnectionClose(ConnectionClose {
            error_code: 0x30,
            frame_type: None,
            reason: Vec::new(),
            is_application: true,
        }));
    }

    #[test]
    fn stream_frame_variants_round_trip() {
        for offset in [0u32, 77] {
            for is_fin in [false, true] {
                round_trip(Frame::Stream(Stream {
                    stream_id: VarInt::from_u8(4),
                    offset: VarInt::from_u32(offset),
                    data: vec![0xaa; 11],
                    is_fin,
                    is_last_frame: false,
                }));
            }
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        for tag in [0x1eu8, 0x1f, 0x40, 0xff] {
            let bytes = [tag, 0, 0, 0];
            assert!(FrameRef::decode(DecoderBuffer::new(&bytes)).is_err());
        }
    }

    #[test]
    fn elicitation_and_probing() {
        let ping: FrameOwned = Frame::Ping(Ping);
        assert!(ping.is_ack_eliciting());
        assert!(!ping.is_probing());

        let padding: FrameOwned = Frame::Padding(Padding { length: 3 });
        assert!(!padding.is_ack_eliciting());
        assert!(padding.is_probing());

        let challenge: FrameOwned = Frame::PathChallenge(PathChallenge { data: [0; 8] });
        assert!(challenge.is_ack_eliciting());
        assert!(challenge.is_probing());
    }
}
