//! spec §8 scenario 2: "iLink3 handshake resend."
//!
//! A hand-driven peer (a second `InMemorySupplier` bound on the same
//! `Network`, read and written as raw bytes) lets the test choose exactly
//! which frames to answer and which to silently drop, to exercise the
//! Negotiate and Establish resend timers.

use std::time::Duration;

use vg_channel::Channel;
use vg_clock::Clock;
use vg_codec::ilink3;
use vg_framer::test_support::{harness, pump};
use vg_framer::{AdminReplyValue, AdminRequest, FramerConfig, Ilink3Config, ProtocolConfig};
use vg_reply::ReplyState;

const KEEP_ALIVE_MS: u64 = 1_000;

fn ilink3_config() -> Ilink3Config {
    Ilink3Config {
        session_id: "SESSION-A".to_owned(),
        firm_id: "FIRM-X".to_owned(),
        keep_alive_interval_ms: KEEP_ALIVE_MS,
    }
}

fn read_one(channel: &mut dyn Channel) -> ilink3::Message<'static> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    for _ in 0..50 {
        match channel.try_read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if let Ok(Some((msg, consumed))) = ilink3::decode(&buf) {
                    assert_eq!(consumed, buf.len(), "exactly one frame expected per read in this test");
                    return owned(msg);
                }
            }
            Err(_) => break,
        }
    }
    panic!("peer never received a frame");
}

/// `ilink3::Message` borrows application-template bodies from the decode
/// buffer, but every session-layer template (the only ones this test reads)
/// owns its fields outright, so re-wrapping drops the buffer borrow for free.
fn owned(msg: ilink3::Message<'_>) -> ilink3::Message<'static> {
    match msg {
        ilink3::Message::Negotiate(m) => ilink3::Message::Negotiate(m),
        ilink3::Message::Establish(m) => ilink3::Message::Establish(m),
        other => panic!("unexpected message in handshake: {other:?}"),
    }
}

#[test]
fn negotiate_and_establish_are_each_resent_once_before_the_peer_answers() {
    let mut h = harness(FramerConfig::default());
    let mut peer = h.network.supplier();
    let acceptor = peer.bind("ilink3:1").expect("bind always succeeds in-memory");

    let reply = h
        .framer
        .submit(AdminRequest::Initiate {
            protocol: ProtocolConfig::Ilink3(ilink3_config()),
            target: "ilink3:1".to_owned(),
            timeout_ms: 60_000,
        })
        .expect("reply registry has room");

    pump(&mut h, 20, 3);
    let mut channel = peer.poll_accept(acceptor).pop().expect("initiator should have connected");

    let ilink3::Message::Negotiate(first) = read_one(channel.as_mut()) else { panic!("expected Negotiate") };

    h.clock.advance(Duration::from_millis(KEEP_ALIVE_MS));
    pump(&mut h, 20, 3);
    let ilink3::Message::Negotiate(resent) = read_one(channel.as_mut()) else { panic!("expected a resent Negotiate") };
    assert_eq!(resent.uuid, first.uuid);
    assert_eq!(resent.session_id, first.session_id);

    let response = ilink3::encode_negotiate_response(&ilink3::NegotiateResponse501 {
        uuid: resent.uuid,
        request_timestamp: h.clock.now_nanos(),
        previous_uuid: 0,
    });
    channel.try_write(&response).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::Establish(first_establish) = read_one(channel.as_mut()) else { panic!("expected Establish") };

    h.clock.advance(Duration::from_millis(KEEP_ALIVE_MS));
    pump(&mut h, 20, 3);
    let ilink3::Message::Establish(resent_establish) = read_one(channel.as_mut()) else { panic!("expected a resent Establish") };
    assert_eq!(resent_establish.uuid, first_establish.uuid);

    let ack = ilink3::encode_establishment_ack(&ilink3::EstablishmentAck504 {
        uuid: resent_establish.uuid,
        request_timestamp: h.clock.now_nanos(),
        next_seq_no: 1,
        previous_seq_no: 0,
        previous_uuid: 0,
        keep_alive_interval_ms: KEEP_ALIVE_MS as u32,
    });
    channel.try_write(&ack).unwrap();
    pump(&mut h, 20, 3);

    assert!(matches!(reply.poll(), ReplyState::Completed(AdminReplyValue::Initiated(_))), "handshake should complete after the ack: {:?}", reply.poll());
}
