//! Shared helpers for the iLink3 integration tests: a hand-driven raw peer
//! that completes the Negotiate/Establish handshake immediately (no dropped
//! frames), leaving the session ESTABLISHED with `next_sent_seq =
//! next_recv_seq = 1` so each scenario can start from a known point.

#![allow(dead_code)]

use vg_channel::test_support::Network;
use vg_channel::Channel;
use vg_clock::Clock;
use vg_codec::ilink3;
use vg_framer::test_support::TestHarness;
use vg_framer::{AdminReply, AdminRequest, Ilink3Config, ProtocolConfig};

pub const KEEP_ALIVE_MS: u64 = 1_000;

pub fn ilink3_config() -> Ilink3Config {
    Ilink3Config {
        session_id: "SESSION-A".to_owned(),
        firm_id: "FIRM-X".to_owned(),
        keep_alive_interval_ms: KEEP_ALIVE_MS,
    }
}

pub fn read_one(channel: &mut dyn Channel) -> ilink3::Message<'static> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    for _ in 0..50 {
        match channel.try_read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(Some((msg, consumed))) = ilink3::decode(&buf) {
                    assert_eq!(consumed, buf.len(), "exactly one frame expected per read in this helper");
                    return owned(msg);
                }
            }
            Err(_) => break,
        }
    }
    panic!("peer never received a frame");
}

fn owned(msg: ilink3::Message<'_>) -> ilink3::Message<'static> {
    match msg {
        ilink3::Message::Negotiate(m) => ilink3::Message::Negotiate(m),
        ilink3::Message::Establish(m) => ilink3::Message::Establish(m),
        ilink3::Message::RetransmitRequest(m) => ilink3::Message::RetransmitRequest(m),
        ilink3::Message::Terminate(m) => ilink3::Message::Terminate(m),
        other => panic!("unexpected message in this test: {other:?}"),
    }
}

/// Bind a raw peer on `addr`, `initiate` against it, and drive both sides
/// through a clean handshake (no drops, no resends). Returns the Initiate
/// Reply (already COMPLETED) and the raw channel so the test can act as the
/// peer for whatever comes next.
pub fn establish(h: &mut TestHarness, addr: &str) -> (AdminReply, Box<dyn Channel>) {
    let mut peer = h.network.supplier();
    let acceptor = peer.bind(addr).expect("bind always succeeds in-memory");

    let reply = h
        .framer
        .submit(AdminRequest::Initiate {
            protocol: ProtocolConfig::Ilink3(ilink3_config()),
            target: addr.to_owned(),
            timeout_ms: 60_000,
        })
        .expect("reply registry has room");

    vg_framer::test_support::pump(h, 20, 3);
    let mut channel = peer.poll_accept(acceptor).pop().expect("initiator should have connected");

    let ilink3::Message::Negotiate(negotiate) = read_one(channel.as_mut()) else { panic!("expected Negotiate") };
    let response = ilink3::encode_negotiate_response(&ilink3::NegotiateResponse501 {
        uuid: negotiate.uuid,
        request_timestamp: h.clock.now_nanos(),
        previous_uuid: 0,
    });
    channel.try_write(&response).unwrap();
    vg_framer::test_support::pump(h, 20, 3);

    let ilink3::Message::Establish(establish) = read_one(channel.as_mut()) else { panic!("expected Establish") };
    let ack = ilink3::encode_establishment_ack(&ilink3::EstablishmentAck504 {
        uuid: establish.uuid,
        request_timestamp: h.clock.now_nanos(),
        next_seq_no: 1,
        previous_seq_no: 0,
        previous_uuid: 0,
        keep_alive_interval_ms: KEEP_ALIVE_MS as u32,
    });
    channel.try_write(&ack).unwrap();
    vg_framer::test_support::pump(h, 20, 3);

    assert!(reply.poll().is_terminal(), "handshake should have completed");
    (reply, channel)
}
