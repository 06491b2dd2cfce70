// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic handler implementations for exercising connections
//! without a real TLS stack.
//!
//! The null AEAD copies plaintext verbatim and appends a tag derived from
//! the key material, so mismatched keys genuinely fail to open. The fake
//! handshake runs a fixed three-flight script that installs handshake and
//! application keys on both sides.

use crate::{
    handler::{ConnectionHandler, HandshakeOutput},
    path::{Path, PathValidationResult},
};
use quill_core::{
    connection::{ConnectionId, StatelessResetToken},
    crypto::{CryptoKeys, Level},
    endpoint::Role,
    stream::StreamId,
    transport::{Error, Result},
};

pub const TAG_LEN: usize = 16;

/// Events the handler observed, for test assertions
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    HandshakeCompleted,
    StreamOpened(StreamId),
    StreamData {
        id: StreamId,
        offset: u64,
        data: Vec<u8>,
        fin: bool,
    },
    StreamClosed(StreamId, u16),
    StreamReset(StreamId, u64, u16),
    NewToken(Vec<u8>),
    PathValidation(PathValidationResult),
    StatelessReset,
    VersionNegotiation(Vec<u32>),
    RemovedConnectionId(ConnectionId),
}

fn keys_for(label: u8) -> CryptoKeys {
    CryptoKeys::new(&[label; 16], &[label ^ 0xff; 12], &[label ^ 0x3c; 16])
}

pub fn initial_keys() -> CryptoKeys {
    keys_for(0x11)
}

pub fn handshake_keys() -> CryptoKeys {
    keys_for(0x22)
}

pub fn application_keys() -> CryptoKeys {
    keys_for(0x33)
}

/// A scripted TLS stand-in plus null AEAD
pub struct NullHandler {
    role: Role,
    pub events: Vec<Event>,
    rand_state: u8,
    cid_counter: u8,
    key_generation: u8,
}

impl NullHandler {
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    fn new(role: Role) -> Self {
        Self {
            role,
            events: Vec::new(),
            rand_state: 7,
            cid_counter: 0,
            key_generation: 0,
        }
    }

    pub fn stream_data_events(&self) -> impl Iterator<Item = &Event> {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::StreamData { .. }))
    }

    fn seal(dest: &mut [u8], plaintext: &[u8], keys: &CryptoKeys) -> Result<usize> {
        if dest.len() < plaintext.len() + TAG_LEN {
            return Err(Error::NoBuf);
        }
        dest[..plaintext.len()].copy_from_slice(plaintext);
        let tag = [keys.key()[0]; TAG_LEN];
        dest[plaintext.len()..plaintext.len() + TAG_LEN].copy_from_slice(&tag);
        Ok(plaintext.len() + TAG_LEN)
    }

    fn open(dest: &mut [u8], ciphertext: &[u8], keys: &CryptoKeys) -> Result<usize> {
        let plain_len = ciphertext
            .len()
            .checked_sub(TAG_LEN)
            .ok_or(Error::TlsDecrypt)?;
        let expected = [keys.key()[0]; TAG_LEN];
        if ciphertext[plain_len..] != expected[..] {
            return Err(Error::TlsDecrypt);
        }
        dest[..plain_len].copy_from_slice(&ciphertext[..plain_len]);
        Ok(plain_len)
    }

    fn mask(keys: &CryptoKeys) -> [u8; 5] {
        let hp = keys.hp();
        [hp[0], hp[1], hp[2], hp[3], hp[4]]
    }
}

impl ConnectionHandler for NullHandler {
    fn client_initial(&mut self, _dcid: &ConnectionId) -> Result<HandshakeOutput> {
        Ok(HandshakeOutput {
            crypto_data: vec![(Level::Initial, b"client-hello".to_vec())],
            rx_keys: vec![(Level::Initial, initial_keys())],
            tx_keys: vec![(Level::Initial, initial_keys())],
            handshake_complete: false,
        })
    }

    fn recv_client_initial(&mut self, _dcid: &ConnectionId) -> Result<HandshakeOutput> {
        Ok(HandshakeOutput {
            crypto_data: Vec::new(),
            rx_keys: vec![(Level::Initial, initial_keys())],
            tx_keys: vec![(Level::Initial, initial_keys())],
            handshake_complete: false,
        })
    }

    fn recv_crypto_data(&mut self, level: Level, data: &[u8]) -> Result<HandshakeOutput> {
        let mut output = HandshakeOutput::default();
        match (self.role, level, data) {
            // server digests the hello and answers with both flights
            (Role::Server, Level::Initial, b"client-hello") => {
                output
                    .crypto_data
                    .push((Level::Initial, b"server-hello".to_vec()));
                output
                    .crypto_data
                    .push((Level::Handshake, b"server-finished".to_vec()));
                output.rx_keys.push((Level::Handshake, handshake_keys()));
                output.tx_keys.push((Level::Handshake, handshake_keys()));
                output.rx_keys.push((Level::Application, application_keys()));
                output.tx_keys.push((Level::Application, application_keys()));
            }
            (Role::Client, Level::Initial, b"server-hello") => {
                output.rx_keys.push((Level::Handshake, handshake_keys()));
                output.tx_keys.push((Level::Handshake, handshake_keys()));
            }
            (Role::Client, Level::Handshake, b"server-finished") => {
                output
                    .crypto_data
                    .push((Level::Handshake, b"client-finished".to_vec()));
                output.rx_keys.push((Level::Application, application_keys()));
                output.tx_keys.push((Level::Application, application_keys()));
                output.handshake_complete = true;
            }
            (Role::Server, Level::Handshake, b"client-finished") => {
                output.handshake_complete = true;
            }
            // session tickets and the like are ignored
            _ => {}
        }
        Ok(output)
    }

    fn in_encrypt(
        &mut self,
        dest: &mut [u8],
        plaintext: &[u8],
        keys: &CryptoKeys,
        _nonce: &[u8],
        _ad: &[u8],
    ) -> Result<usize> {
        Self::seal(dest, plaintext, keys)
    }

    fn in_decrypt(
        &mut self,
        dest: &mut [u8],
        ciphertext: &[u8],
        keys: &CryptoKeys,
        _nonce: &[u8],
        _ad: &[u8],
    ) -> Result<usize> {
        Self::open(dest, ciphertext, keys)
    }

    fn in_hp_mask(&mut self, keys: &CryptoKeys, _sample: &[u8]) -> Result<[u8; 5]> {
        Ok(Self::mask(keys))
    }

    fn encrypt(
        &mut self,
        dest: &mut [u8],
        plaintext: &[u8],
        keys: &CryptoKeys,
        _nonce: &[u8],
        _ad: &[u8],
    ) -> Result<usize> {
        Self::seal(dest, plaintext, keys)
    }

    fn decrypt(
        &mut self,
        dest: &mut [u8],
        ciphertext: &[u8],
        keys: &CryptoKeys,
        _nonce: &[u8],
        _ad: &[u8],
    ) -> Result<usize> {
        Self::open(dest, ciphertext, keys)
    }

    fn hp_mask(&mut self, keys: &CryptoKeys, _sample: &[u8]) -> Result<[u8; 5]> {
        Ok(Self::mask(keys))
    }

    fn rand(&mut self, dest: &mut [u8]) -> Result<()> {
        for byte in dest {
            self.rand_state = self.rand_state.wrapping_mul(31).wrapping_add(17);
            *byte = self.rand_state;
        }
        Ok(())
    }

    fn get_new_connection_id(&mut self) -> Result<(ConnectionId, StatelessResetToken)> {
        self.cid_counter += 1;
        let cid = ConnectionId::try_from_slice(&[self.cid_counter; 8])
            .expect("valid fixed length");
        let token = StatelessResetToken::new([self.cid_counter ^ 0x5a; 16]);
        Ok((cid, token))
    }

    fn update_key(&mut self) -> Result<(CryptoKeys, CryptoKeys)> {
        self.key_generation += 1;
        // packet-protection material rotates; header protection does not
        let label = 0x33 + self.key_generation;
        let base = application_keys();
        let keys = CryptoKeys::new(&[label; 16], &[label ^ 0xff; 12], base.hp());
        Ok((keys.clone(), keys))
    }

    fn handshake_completed(&mut self) -> Result<()> {
        self.events.push(Event::HandshakeCompleted);
        Ok(())
    }

    fn recv_stream_data(&mut self, id: StreamId, fin: bool, offset: u64, data: &[u8]) -> Result<()> {
        self.events.push(Event::StreamData {
            id,
            offset,
            data: data.to_vec(),
            fin,
        });
        Ok(())
    }

    fn stream_open(&mut self, id: StreamId) -> Result<()> {
        self.events.push(Event::StreamOpened(id));
        Ok(())
    }

    fn stream_close(&mut self, id: StreamId, app_error_code: u16) -> Result<()> {
        self.events.push(Event::StreamClosed(id, app_error_code));
        Ok(())
    }

    fn stream_reset(&mut self, id: StreamId, final_size: u64, app_error_code: u16) -> Result<()> {
        self.events
            .push(Event::StreamReset(id, final_size, app_error_code));
        Ok(())
    }

    fn recv_version_negotiation(&mut self, versions: &[u32]) -> Result<()> {
        self.events.push(Event::VersionNegotiation(versions.to_vec()));
        Ok(())
    }

    fn recv_new_token(&mut self, token: &[u8]) -> Result<()> {
        self.events.push(Event::NewToken(token.to_vec()));
        Ok(())
    }

    fn path_validation(&mut self, _path: &Path, result: PathValidationResult) -> Result<()> {
        self.events.push(Event::PathValidation(result));
        Ok(())
    }

    fn recv_stateless_reset(&mut self, _token: &StatelessResetToken) -> Result<()> {
        self.events.push(Event::StatelessReset);
        Ok(())
    }

    fn remove_connection_id(&mut self, cid: &ConnectionId) -> Result<()> {
        self.events.push(Event::RemovedConnectionId(*cid));
        Ok(())
    }
}
