// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quill_codec::DecoderError;

pub type Result<T = ()> = core::result::Result<T, Error>;

/// Every failure the engine can surface to its caller
///
/// `DiscardPacket` is local: the offending datagram is dropped and the
/// connection continues. Kinds for which [`Error::is_fatal`] returns true
/// are propagated unchanged; the remaining kinds terminate the connection
/// with the transport error code [`Error::transport_error_code`] reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    InvalidArgument,
    UnknownPacketType,
    /// The destination buffer is too small for the requested write
    NoBuf,
    Proto,
    InvalidState,
    /// An ACK frame failed shape validation
    AckFrame,
    StreamIdBlocked,
    StreamInUse,
    StreamDataBlocked,
    FlowControl,
    StreamLimit,
    FinalSize,
    Crypto,
    PacketNumExhausted,
    OutOfMemory,
    RequiredTransportParam,
    MalformedTransportParam,
    FrameEncoding,
    TlsDecrypt,
    StreamShutWr,
    StreamNotFound,
    StreamState,
    NoKey,
    EarlyDataRejected,
    RecvVersionNegotiation,
    Closing,
    Draining,
    TransportParam,
    /// Drop the offending packet without touching connection state
    DiscardPacket,
    PathValidationFailed,
    ConnIdBlocked,
    CallbackFailure,
    Internal,
    CryptoBufferExceeded,
}

impl Error {
    /// Returns true for kinds that must reach the caller unchanged instead
    /// of being folded into a CONNECTION_CLOSE
    #[inline]
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::OutOfMemory | Self::CallbackFailure | Self::Internal
        )
    }

    /// Maps the kind onto the wire-level transport error code carried in a
    /// CONNECTION_CLOSE frame
    #[inline]
    pub fn transport_error_code(self) -> TransportErrorCode {
        match self {
            Self::AckFrame | Self::FrameEncoding => TransportErrorCode::FRAME_ENCODING_ERROR,
            Self::FlowControl => TransportErrorCode::FLOW_CONTROL_ERROR,
            Self::StreamLimit => TransportErrorCode::STREAM_LIMIT_ERROR,
            Self::StreamState | Self::StreamNotFound => TransportErrorCode::STREAM_STATE_ERROR,
            Self::FinalSize => TransportErrorCode::FINAL_SIZE_ERROR,
            Self::RequiredTransportParam
            | Self::MalformedTransportParam
            | Self::TransportParam => TransportErrorCode::TRANSPORT_PARAMETER_ERROR,
            Self::Proto | Self::UnknownPacketType => TransportErrorCode::PROTOCOL_VIOLATION,
            Self::CryptoBufferExceeded => TransportErrorCode::CRYPTO_BUFFER_EXCEEDED,
            Self::Crypto | Self::TlsDecrypt => TransportErrorCode::CRYPTO_ERROR,
            Self::PathValidationFailed => TransportErrorCode::INVALID_MIGRATION,
            _ => TransportErrorCode::INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc = match self {
            Self::InvalidArgument => "invalid argument",
            Self::UnknownPacketType => "unknown packet type",
            Self::NoBuf => "buffer too small",
            Self::Proto => "protocol violation",
            Self::InvalidState => "invalid state",
            Self::AckFrame => "malformed ACK frame",
            Self::StreamIdBlocked => "stream id blocked",
            Self::StreamInUse => "stream in use",
            Self::StreamDataBlocked => "stream data blocked",
            Self::FlowControl => "flow control violated",
            Self::StreamLimit => "stream limit exceeded",
            Self::FinalSize => "final size violated",
            Self::Crypto => "crypto failure",
            Self::PacketNumExhausted => "packet number exhausted",
            Self::OutOfMemory => "out of memory",
            Self::RequiredTransportParam => "required transport parameter missing",
            Self::MalformedTransportParam => "malformed transport parameter",
            Self::FrameEncoding => "frame encoding failure",
            Self::TlsDecrypt => "TLS decrypt failure",
            Self::StreamShutWr => "stream shut for write",
            Self::StreamNotFound => "stream not found",
            Self::StreamState => "stream in wrong state",
            Self::NoKey => "no key available",
            Self::EarlyDataRejected => "early data rejected",
            Self::RecvVersionNegotiation => "version negotiation received",
            Self::Closing => "connection closing",
            Self::Draining => "connection draining",
            Self::TransportParam => "transport parameter failure",
            Self::DiscardPacket => "packet discarded",
            Self::PathValidationFailed => "path validation failed",
            Self::ConnIdBlocked => "connection id blocked",
            Self::CallbackFailure => "callback failure",
            Self::Internal => "internal failure",
            Self::CryptoBufferExceeded => "crypto buffer exceeded",
        };
        f.write_str(desc)
    }
}

impl std::error::Error for Error {}

impl From<DecoderError> for Error {
    #[inline]
    fn from(_: DecoderError) -> Self {
        Self::FrameEncoding
    }
}

/// Wire-level error code carried in a transport CONNECTION_CLOSE frame
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportErrorCode(u16);

impl TransportErrorCode {
    pub const NO_ERROR: Self = Self(0x0);
    pub const INTERNAL_ERROR: Self = Self(0x1);
    pub const SERVER_BUSY: Self = Self(0x2);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const STREAM_LIMIT_ERROR: Self = Self(0x4);
    pub const STREAM_STATE_ERROR: Self = Self(0x5);
    pub const FINAL_SIZE_ERROR: Self = Self(0x6);
    pub const FRAME_ENCODING_ERROR: Self = Self(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: Self = Self(0x8);
    pub const PROTOCOL_VIOLATION: Self = Self(0xa);
    pub const INVALID_MIGRATION: Self = Self(0xc);
    pub const CRYPTO_BUFFER_EXCEEDED: Self = Self(0xd);
    /// Base of the range reserved for TLS alerts
    pub const CRYPTO_ERROR: Self = Self(0x100);

    #[inline]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(Error::OutOfMemory.is_fatal());
        assert!(Error::CallbackFailure.is_fatal());
        assert!(Error::Internal.is_fatal());
        assert!(!Error::Proto.is_fatal());
        assert!(!Error::DiscardPacket.is_fatal());
    }

    #[test]
    fn code_mapping() {
        assert_eq!(
            Error::FrameEncoding.transport_error_code(),
            TransportErrorCode::FRAME_ENCODING_ERROR
        );
        assert_eq!(
            Error::FlowControl.transport_error_code(),
            TransportErrorCode::FLOW_CONTROL_ERROR
        );
        assert_eq!(
            Error::FinalSize.transport_error_code(),
            TransportErrorCode::FINAL_SIZE_ERROR
        );
        assert_eq!(
            Error::Proto.transport_error_code(),
            TransportErrorCode::PROTOCOL_VIOLATION
        );
    }
}
