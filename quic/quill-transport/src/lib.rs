// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The quill QUIC connection engine.
//!
//! A [`conn::Connection`] drives a single connection from the initial
//! handshake through data exchange, migration and closure. The engine is
//! single-threaded and cooperative: it never blocks and never performs
//! I/O; datagrams and clock readings come in through method calls, and
//! datagrams to transmit come back out through caller-provided buffers.
//! TLS, AEAD and entropy are capabilities supplied by the embedder via
//! [`handler::ConnectionHandler`].

pub mod ack;
pub mod buffer;
pub mod cid;
pub mod conn;
pub mod handler;
pub mod path;
pub mod recovery;
pub mod stream;
pub mod testing;

pub use conn::Connection;
pub use handler::ConnectionHandler;

use core::time::Duration;

/// Unused destination ids retained for future migrations
pub(crate) const MAX_DCID_POOL: usize = 8;
/// Retired destination ids awaiting the reordering grace
pub(crate) const MAX_DCID_RETIRED: usize = 2;
/// Unused source ids the pool is replenished to
pub(crate) const MIN_SCID_POOL: usize = 2;
/// Outstanding PATH_CHALLENGE payloads per validation
pub(crate) const MAX_PATH_CHALLENGES: usize = 4;
/// Reordered packets buffered per packet-number space
pub(crate) const NUM_BUFFED_RX_PKTS: usize = 16;
/// Reordered CRYPTO bytes buffered per packet-number space
pub(crate) const MAX_CRYPTO_REORDER: usize = 65536;

pub(crate) const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Conservative per-packet ceiling until path MTU discovery exists
pub(crate) const DEFAULT_MAX_PKTLEN: usize = 1252;
