// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end connection tests over the null-crypto handler: a client and
//! a server exchange real datagrams through in-memory buffers.

use core::time::Duration;
use quill_core::{
    connection::ConnectionId,
    settings::Settings,
    time::Timestamp,
    transport::Error,
    varint::VarInt,
    QUIC_VERSION,
};
use quill_transport::{
    conn::State,
    path::Path,
    testing::{Event, NullHandler},
    Connection,
};

fn ts(ms: u64) -> Timestamp {
    Timestamp::from_duration(Duration::from_millis(ms))
}

fn cid(b: u8) -> ConnectionId {
    ConnectionId::try_from_slice(&[b; 8]).unwrap()
}

fn test_path() -> Path {
    Path::new(
        "10.0.0.1:4433".parse().unwrap(),
        "10.0.0.2:4433".parse().unwrap(),
    )
}

type Conn = Connection<NullHandler>;

fn pair(client_settings: Settings, server_settings: Settings) -> (Conn, Conn) {
    let path = test_path();
    let client_scid = cid(0xc1);
    let server_scid = cid(0x51);
    let original_dcid = cid(0xdd);

    let mut client = Connection::client_new(
        NullHandler::client(),
        original_dcid,
        client_scid,
        path,
        QUIC_VERSION,
        client_settings.clone(),
    )
    .unwrap();
    let mut server = Connection::server_new(
        NullHandler::server(),
        client_scid,
        server_scid,
        path,
        QUIC_VERSION,
        server_settings.clone(),
    )
    .unwrap();

    // in production TLS carries the transport parameters; here the test
    // plays postman
    client.set_remote_settings(server_settings).unwrap();
    server.set_remote_settings(client_settings).unwrap();

    (client, server)
}

/// Drains `from` into `to` until `from` goes idle
fn pump(from: &mut Conn, to: &mut Conn, now: Timestamp) -> usize {
    let mut buf = [0u8; 4096];
    let mut datagrams = 0;
    loop {
        let (len, _path) = match from.write_pkt(&mut buf, now) {
            Ok(result) => result,
            Err(Error::Closing) | Err(Error::Draining) => break,
            Err(err) => panic!("write failed: {err}"),
        };
        if len == 0 {
            break;
        }
        let path = to.path();
        to.read_pkt(path, &buf[..len], now).unwrap();
        datagrams += 1;
    }
    datagrams
}

fn complete_handshake(client: &mut Conn, server: &mut Conn, now: Timestamp) {
    for _ in 0..4 {
        pump(client, server, now);
        pump(server, client, now);
        if client.is_handshake_complete() && server.is_handshake_complete() {
            return;
        }
    }
    panic!(
        "handshake did not complete: client={:?} server={:?}",
        client.state(),
        server.state()
    );
}

#[test]
fn handshake_completes_both_sides() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let now = ts(0);

    complete_handshake(&mut client, &mut server, now);

    assert!(client
        .handler_mut()
        .events
        .contains(&Event::HandshakeCompleted));
    assert!(server
        .handler_mut()
        .events
        .contains(&Event::HandshakeCompleted));
}

#[test]
fn client_initial_is_padded_to_path_mtu() {
    let (mut client, _server) = pair(Settings::default(), Settings::default());
    let mut buf = [0u8; 4096];
    let (len, _) = client.write_pkt(&mut buf, ts(0)).unwrap();
    assert!(len >= 1200, "initial datagram was only {len} bytes");
}

#[test]
fn stream_data_round_trips() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let id = client.open_bidi_stream().unwrap();
    let payload: Vec<u8> = (0..200u8).collect();

    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(10);
    let (len, _path, accepted) = client
        .write_stream(&mut buf, id, true, &payload, now)
        .unwrap();
    assert_eq!(accepted, payload.len());
    assert!(len > 0);

    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();

    let received: Vec<u8> = server
        .handler_mut()
        .events
        .iter()
        .filter_map(|e| match e {
            Event::StreamData { id: got, data, .. } if *got == id => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(received, payload);

    let saw_fin = server.handler_mut().events.iter().any(|e| {
        matches!(e, Event::StreamData { id: got, fin: true, .. } if *got == id)
    });
    assert!(saw_fin);
}

#[test]
fn stream_write_respects_peer_window_until_update() {
    // the server grants remote bidi streams a 100-byte window
    let server_settings = Settings {
        max_stream_data_bidi_remote: VarInt::from_u8(100),
        ..Default::default()
    };
    let (mut client, mut server) = pair(Settings::default(), server_settings);
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let id = client.open_bidi_stream().unwrap();
    let payload = vec![0x42u8; 120];

    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(10);
    let (len, _path, accepted) = client
        .write_stream(&mut buf, id, false, &payload, now)
        .unwrap();
    // everything is queued, but only 100 bytes may travel
    assert_eq!(accepted, 120);
    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();

    let delivered: usize = server
        .handler_mut()
        .stream_data_events()
        .map(|e| match e {
            Event::StreamData { data, .. } => data.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(delivered, 100);

    // nothing more can leave until the window opens
    now = now + Duration::from_millis(1);
    let (len, _) = client.write_pkt(&mut buf, now).unwrap();
    if len > 0 {
        // an ACK or STREAM_DATA_BLOCKED may still flow; no stream bytes do
        server.read_pkt(path, &buf[..len], now).unwrap();
        let delivered: usize = server
            .handler_mut()
            .stream_data_events()
            .map(|e| match e {
                Event::StreamData { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(delivered, 100);
    }

    // the receiving application reads, the window reopens, and the
    // remaining 20 bytes flow without another write call
    server.extend_max_stream_offset(id, 100).unwrap();
    now = now + Duration::from_millis(1);
    pump(&mut server, &mut client, now);
    now = now + Duration::from_millis(1);
    pump(&mut client, &mut server, now);

    let delivered: usize = server
        .handler_mut()
        .stream_data_events()
        .map(|e| match e {
            Event::StreamData { data, .. } => data.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(delivered, 120);
}

#[test]
fn duplicate_packets_are_dropped() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let id = client.open_bidi_stream().unwrap();
    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(10);
    let (len, _path, _) = client
        .write_stream(&mut buf, id, false, b"only once", now)
        .unwrap();

    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();
    let rx_after_first = server.rx_packets();

    // replayed datagram: silently discarded, nothing delivered twice
    server.read_pkt(path, &buf[..len], now).unwrap();
    assert_eq!(server.rx_packets(), rx_after_first);

    let copies = server
        .handler_mut()
        .stream_data_events()
        .filter(|e| matches!(e, Event::StreamData { data, .. } if data == b"only once"))
        .count();
    assert_eq!(copies, 1);
}

#[test]
fn connection_close_reaches_draining() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let mut buf = [0u8; 4096];
    let (len, _path) = client
        .write_application_close(&mut buf, 7, now)
        .unwrap();
    assert!(len > 0);
    assert_eq!(client.state(), State::Closing);
    assert!(matches!(
        client.write_pkt(&mut buf, now),
        Err(Error::Closing)
    ));

    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();
    assert_eq!(server.state(), State::Draining);
    assert!(matches!(
        server.write_pkt(&mut buf, now),
        Err(Error::Draining)
    ));
}

#[test]
fn pto_expiry_sends_probes() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let id = client.open_bidi_stream().unwrap();
    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(10);
    let (_len, _path, _) = client
        .write_stream(&mut buf, id, false, b"probe me", now)
        .unwrap();

    // the datagram is "lost"; the loss-detection timer must be armed
    let expiry = client.get_expiry().expect("eliciting data in flight");
    assert!(expiry > now);

    now = expiry + Duration::from_millis(1);
    client.on_loss_detection_timer(now).unwrap();

    // two probe packets follow
    let (probe1, _) = client.write_pkt(&mut buf, now).unwrap();
    assert!(probe1 > 0);
    let (probe2, _) = client.write_pkt(&mut buf, now).unwrap();
    assert!(probe2 > 0);

    // probes carry the unacknowledged data or a PING; the server accepts
    let path = server.path();
    server.read_pkt(path, &buf[..probe2], now).unwrap();
}

#[test]
fn key_update_stays_transparent() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    // move some data first so both sides are warmed up
    let id = client.open_bidi_stream().unwrap();
    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(5);
    let (len, _p, _) = client
        .write_stream(&mut buf, id, false, b"before", now)
        .unwrap();
    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();

    client.initiate_key_update().unwrap();

    now = now + Duration::from_millis(5);
    let (len, _p, _) = client
        .write_stream(&mut buf, id, false, b"after", now)
        .unwrap();
    server.read_pkt(path, &buf[..len], now).unwrap();

    let received: Vec<u8> = server
        .handler_mut()
        .stream_data_events()
        .map(|e| match e {
            Event::StreamData { data, .. } => data.clone(),
            _ => Vec::new(),
        })
        .flatten()
        .collect();
    assert_eq!(received, b"beforeafter");

    // and the reverse direction rotates too once the server answers
    now = now + Duration::from_millis(5);
    pump(&mut server, &mut client, now);
}

#[test]
fn acks_eventually_clear_the_retransmit_buffer() {
    let (mut client, mut server) = pair(Settings::default(), Settings::default());
    let mut now = ts(0);
    complete_handshake(&mut client, &mut server, now);

    let id = client.open_bidi_stream().unwrap();
    let mut buf = [0u8; 4096];
    now = now + Duration::from_millis(10);
    let (len, _p, _) = client
        .write_stream(&mut buf, id, false, b"ack me", now)
        .unwrap();
    let path = server.path();
    server.read_pkt(path, &buf[..len], now).unwrap();
    assert!(client.bytes_in_flight() > 0);

    // wait past the delayed-ack budget so the server flushes its ACK
    now = now + Duration::from_millis(30);
    pump(&mut server, &mut client, now);

    assert_eq!(client.bytes_in_flight(), 0);
}
