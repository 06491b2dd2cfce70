// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    connection::{id, ConnectionId, StatelessResetToken},
    varint::VarInt,
};
use quill_codec::{decoder_invariant, decoder_parameterized_value, Encoder, EncoderValue};

//= https://tools.ietf.org/id/draft-ietf-quic-transport-18.txt#19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.
//#
//# NEW_CONNECTION_ID Frame {
//#   Sequence Number (i),
//#   Length (8),
//#   Connection ID (4..18),
//#   Stateless Reset Token (128),
//# }

pub const NEW_CONNECTION_ID_TAG: u8 = 0x18;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    /// The issuer-assigned sequence number of this id
    pub sequence: VarInt,
    pub cid: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

decoder_parameterized_value!(
    impl<'a> NewConnectionId {
        fn decode(_tag: crate::frame::Tag, buffer: Buffer) -> Result<Self> {
            let (sequence, buffer) = buffer.decode::<VarInt>()?;

            let (len, buffer) = buffer.decode::<u8>()?;
            decoder_invariant!(
                (id::MIN_LEN..=id::MAX_LEN).contains(&(len as usize)),
                "invalid connection id length"
            );

            let (cid, buffer) = buffer.decode_slice(len as usize)?;
            let cid = ConnectionId::try_from_slice(cid.as_less_safe_slice())
                .expect("length already validated");

            let (token, buffer) = buffer.decode_slice(id::STATELESS_RESET_TOKEN_LEN)?;
            let stateless_reset_token =
                StatelessResetToken::try_from_slice(token.as_less_safe_slice())
                    .expect("length already validated");

            let frame = NewConnectionId {
                sequence,
                cid,
                stateless_reset_token,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for NewConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&NEW_CONNECTION_ID_TAG);
        buffer.encode(&self.sequence);
        buffer.encode(&(self.cid.len() as u8));
        buffer.encode(&self.cid);
        buffer.encode(&self.stateless_reset_token);
    }
}
