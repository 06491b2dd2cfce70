// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The capability set an embedder provides.
//!
//! The engine owns every piece of connection state; the handler owns the
//! TLS stack, the ciphers and the entropy source. Handler methods must
//! not call back into the connection: anything TLS produces as a result
//! of a call is returned in a [`HandshakeOutput`] and applied by the
//! engine afterwards.

use crate::path::{Path, PathValidationResult};
use quill_core::{
    connection::{ConnectionId, StatelessResetToken},
    crypto::{CryptoKeys, Level},
    packet::Retry,
    stream::StreamId,
    transport::Result,
};

/// Everything TLS emitted while digesting handshake bytes
#[derive(Debug, Default)]
pub struct HandshakeOutput {
    /// New outbound handshake bytes, per encryption level
    pub crypto_data: Vec<(Level, Vec<u8>)>,
    /// Freshly derived receive keys
    pub rx_keys: Vec<(Level, CryptoKeys)>,
    /// Freshly derived transmit keys
    pub tx_keys: Vec<(Level, CryptoKeys)>,
    /// TLS reports the handshake complete
    pub handshake_complete: bool,
}

/// The AEAD expansion the handler's ciphers add to a sealed payload
pub const DEFAULT_AEAD_OVERHEAD: usize = 16;

/// Mask length for header protection
pub const HP_MASK_LEN: usize = 5;

/// The embedder capability set
///
/// Required capabilities have no default body. Optional event methods
/// default to no-ops. A non-accepted error from any capability surfaces
/// as `CallbackFailure`; `recv_crypto_data` may additionally return
/// `Crypto` or `Proto`, which pass through unchanged.
pub trait ConnectionHandler {
    // ---- required: handshake drivers ----------------------------------

    /// Client only: start TLS, returning the first CRYPTO flight and the
    /// initial-secret keys derived from `dcid`
    fn client_initial(&mut self, dcid: &ConnectionId) -> Result<HandshakeOutput>;

    /// Server only: derive initial-secret keys from the client's first
    /// `dcid` before any payload can be opened
    fn recv_client_initial(&mut self, dcid: &ConnectionId) -> Result<HandshakeOutput>;

    /// Feed reassembled CRYPTO bytes into TLS
    fn recv_crypto_data(&mut self, level: Level, data: &[u8]) -> Result<HandshakeOutput>;

    // ---- required: packet protection ----------------------------------

    /// Seal with the initial-secret AEAD; returns the ciphertext length
    fn in_encrypt(
        &mut self,
        dest: &mut [u8],
        plaintext: &[u8],
        keys: &CryptoKeys,
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<usize>;

    /// Open with the initial-secret AEAD; returns the plaintext length
    fn in_decrypt(
        &mut self,
        dest: &mut [u8],
        ciphertext: &[u8],
        keys: &CryptoKeys,
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<usize>;

    /// Header-protection mask from the initial-secret cipher
    fn in_hp_mask(&mut self, keys: &CryptoKeys, sample: &[u8]) -> Result<[u8; HP_MASK_LEN]>;

    /// Seal with the negotiated AEAD
    fn encrypt(
        &mut self,
        dest: &mut [u8],
        plaintext: &[u8],
        keys: &CryptoKeys,
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<usize>;

    /// Open with the negotiated AEAD
    fn decrypt(
        &mut self,
        dest: &mut [u8],
        ciphertext: &[u8],
        keys: &CryptoKeys,
        nonce: &[u8],
        ad: &[u8],
    ) -> Result<usize>;

    /// Header-protection mask from the negotiated cipher
    fn hp_mask(&mut self, keys: &CryptoKeys, sample: &[u8]) -> Result<[u8; HP_MASK_LEN]>;

    /// Bytes the negotiated AEAD adds to a sealed payload
    fn aead_overhead(&self) -> usize {
        DEFAULT_AEAD_OVERHEAD
    }

    // ---- required: identifiers and entropy ----------------------------

    /// Fill `dest` with unpredictable bytes
    fn rand(&mut self, dest: &mut [u8]) -> Result<()>;

    /// Produce a fresh source id and its stateless-reset token; called
    /// again if the id collides with an extant one
    fn get_new_connection_id(&mut self) -> Result<(ConnectionId, StatelessResetToken)>;

    /// Derive the next-generation application keys for a key update
    ///
    /// Returns `(rx, tx)` under the new key phase. Header-protection
    /// material does not rotate: the returned keys must carry the same
    /// `hp` secret as the current generation.
    fn update_key(&mut self) -> Result<(CryptoKeys, CryptoKeys)>;

    // ---- optional: events ---------------------------------------------

    fn handshake_completed(&mut self) -> Result<()> {
        Ok(())
    }

    /// Ordered stream bytes arrived
    fn recv_stream_data(&mut self, id: StreamId, fin: bool, offset: u64, data: &[u8]) -> Result<()> {
        let _ = (id, fin, offset, data);
        Ok(())
    }

    fn stream_open(&mut self, id: StreamId) -> Result<()> {
        let _ = id;
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId, app_error_code: u16) -> Result<()> {
        let _ = (id, app_error_code);
        Ok(())
    }

    /// The peer reset its sending side of `id`
    fn stream_reset(&mut self, id: StreamId, final_size: u64, app_error_code: u16) -> Result<()> {
        let _ = (id, final_size, app_error_code);
        Ok(())
    }

    /// Client only: the server asked for a fresh Initial via Retry
    fn recv_retry(&mut self, retry: &Retry<'_>) -> Result<()> {
        let _ = retry;
        Ok(())
    }

    /// A Version Negotiation packet listed these supported versions
    fn recv_version_negotiation(&mut self, versions: &[u32]) -> Result<()> {
        let _ = versions;
        Ok(())
    }

    /// The peer raised how many streams we may open
    fn extend_max_local_streams_bidi(&mut self, max_streams: u64) -> Result<()> {
        let _ = max_streams;
        Ok(())
    }

    fn extend_max_local_streams_uni(&mut self, max_streams: u64) -> Result<()> {
        let _ = max_streams;
        Ok(())
    }

    /// We raised how many streams the peer may open
    fn extend_max_remote_streams_bidi(&mut self, max_streams: u64) -> Result<()> {
        let _ = max_streams;
        Ok(())
    }

    fn extend_max_remote_streams_uni(&mut self, max_streams: u64) -> Result<()> {
        let _ = max_streams;
        Ok(())
    }

    /// The peer widened a stream's flow-control window
    fn extend_max_stream_data(&mut self, id: StreamId, max_data: u64) -> Result<()> {
        let _ = (id, max_data);
        Ok(())
    }

    /// A peer-issued connection id left the retirement grace and is gone
    fn remove_connection_id(&mut self, cid: &ConnectionId) -> Result<()> {
        let _ = cid;
        Ok(())
    }

    fn path_validation(&mut self, path: &Path, result: PathValidationResult) -> Result<()> {
        let _ = (path, result);
        Ok(())
    }

    /// Server only: a preferred address was configured and the client may
    /// migrate to it
    fn select_preferred_addr(&mut self, path: &Path) -> Result<()> {
        let _ = path;
        Ok(())
    }

    fn recv_stateless_reset(&mut self, token: &StatelessResetToken) -> Result<()> {
        let _ = token;
        Ok(())
    }

    /// A NEW_TOKEN frame arrived; the token is opaque to the engine
    fn recv_new_token(&mut self, token: &[u8]) -> Result<()> {
        let _ = token;
        Ok(())
    }
}
