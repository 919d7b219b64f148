//! spec §8 scenario 1: "Connect before server up (FIX)."
//!
//! Disabling the network stands in for the acceptor process not being up
//! yet: every connect attempt stays `Pending` forever, so the Reply's own
//! `timeout_ms` is what resolves it, not a connect failure. Re-enabling the
//! network and starting a real acceptor then lets a third `initiate` reach
//! COMPLETED.

use std::sync::Arc;
use std::time::Duration;

use vg_channel::test_support::Network;
use vg_clock::{SharedClock, TestClock};
use vg_framer::test_support::{harness, pump};
use vg_framer::{AdminReplyValue, AdminRequest, Framer, FramerConfig, FixConfig, ProtocolConfig, TracingErrorConsumer};
use vg_reply::ReplyState;
use vg_sequence_store::SequenceStore;

fn fix_config(sender: &str, target: &str) -> FixConfig {
    FixConfig {
        begin_string: b"FIX.4.4".to_vec(),
        sender_comp_id: sender.to_owned(),
        target_comp_id: target.to_owned(),
        heart_bt_int: 30,
    }
}

#[test]
fn two_timed_out_replies_then_a_completed_connect_once_the_acceptor_is_up() {
    let mut h = harness(FramerConfig::default());
    h.network.disable();

    let reply1 = h
        .framer
        .submit(AdminRequest::Initiate {
            protocol: ProtocolConfig::Fix(fix_config("INITIATOR", "ACCEPTOR")),
            target: "acceptor:1".to_owned(),
            timeout_ms: 200,
        })
        .expect("reply registry has room");
    h.clock.advance(Duration::from_millis(250));
    pump(&mut h, 100, 3);
    assert!(matches!(reply1.poll(), ReplyState::TimedOut), "first attempt should time out while the network is down");

    let reply2 = h
        .framer
        .submit(AdminRequest::Initiate {
            protocol: ProtocolConfig::Fix(fix_config("INITIATOR", "ACCEPTOR")),
            target: "acceptor:1".to_owned(),
            timeout_ms: 200,
        })
        .expect("reply registry has room");
    h.clock.advance(Duration::from_millis(250));
    pump(&mut h, 100, 3);
    assert!(matches!(reply2.poll(), ReplyState::TimedOut), "second attempt should also time out");

    h.network.enable();

    let acceptor_clock: SharedClock = Arc::new(TestClock::new());
    let acceptor_store = SequenceStore::open_in_memory().expect("in-memory sequence store always opens");
    let mut acceptor = Framer::new(
        acceptor_clock,
        Box::new(h.network.supplier()),
        acceptor_store,
        Box::new(TracingErrorConsumer),
        FramerConfig::default(),
    );
    acceptor
        .submit(AdminRequest::Bind {
            protocol: ProtocolConfig::Fix(fix_config("ACCEPTOR", "INITIATOR")),
            addr: "acceptor:1".to_owned(),
        })
        .expect("reply registry has room");
    acceptor.duty_cycle();

    let reply3 = h
        .framer
        .submit(AdminRequest::Initiate {
            protocol: ProtocolConfig::Fix(fix_config("INITIATOR", "ACCEPTOR")),
            target: "acceptor:1".to_owned(),
            timeout_ms: 5_000,
        })
        .expect("reply registry has room");

    for _ in 0..50 {
        h.framer.duty_cycle();
        acceptor.duty_cycle();
        if reply3.poll().is_terminal() {
            break;
        }
    }
    assert!(matches!(reply3.poll(), ReplyState::Completed(AdminReplyValue::Initiated(_))), "third attempt should complete once the acceptor is reachable: {:?}", reply3.poll());

    let lookup = h
        .framer
        .submit(AdminRequest::LookupSessionId { store_key: "FIX:INITIATOR:ACCEPTOR".to_owned() })
        .expect("reply registry has room");
    pump(&mut h, 20, 3);
    let ReplyState::Completed(AdminReplyValue::SessionLookup(Some(snapshot))) = lookup.poll() else {
        panic!("expected a session snapshot, got {:?}", lookup.poll());
    };
    // Logon consumed the first outbound sequence number (1); the next
    // business message the Library sends will be index 0 of the
    // established session's business stream.
    assert_eq!(snapshot.next_sent_seq, 2);
}
