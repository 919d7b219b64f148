//! spec §8 scenario 4: "Retransmit reject."

#[path = "common.rs"]
mod common;

use vg_codec::ilink3;
use vg_framer::test_support::pump;
use vg_framer::FramerConfig;

#[test]
fn both_requests_rejected_still_advances_next_recv_seq_and_stays_established() {
    let mut h = vg_framer::test_support::harness(FramerConfig::default());
    let (reply, mut channel) = common::establish(&mut h, "ilink3:1");

    let jump = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 5000, false, &[]);
    channel.try_write(&jump).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::RetransmitRequest(first) = common::read_one(channel.as_mut()) else { panic!("expected RetransmitRequest") };
    assert_eq!(first.from_seq_no, 1);
    assert_eq!(first.msg_count, 2500);

    let reject1 = ilink3::encode_retransmit_reject(&ilink3::RetransmitReject510 {
        uuid: first.uuid,
        last_uuid: first.uuid,
        request_timestamp: 0,
        from_seq_no: first.from_seq_no,
        reject_reason: 0,
    });
    channel.try_write(&reject1).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::RetransmitRequest(second) = common::read_one(channel.as_mut()) else { panic!("expected a second RetransmitRequest") };
    assert_eq!(second.from_seq_no, 2501);
    assert_eq!(second.msg_count, 2499);

    let reject2 = ilink3::encode_retransmit_reject(&ilink3::RetransmitReject510 {
        uuid: second.uuid,
        last_uuid: second.uuid,
        request_timestamp: 0,
        from_seq_no: second.from_seq_no,
        reject_reason: 0,
    });
    channel.try_write(&reject2).unwrap();
    pump(&mut h, 20, 3);

    // Both requests abandoned: next_recv_seq jumps straight to 5001 and the
    // session stays ESTABLISHED, same observable check as the batching test.
    let next = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 5001, false, &[]);
    channel.try_write(&next).unwrap();
    pump(&mut h, 20, 3);

    let mut buf = [0u8; 64];
    assert!(matches!(channel.try_read(&mut buf), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock), "no Terminate or further RetransmitRequest expected");
    assert!(!h.framer.is_idle(), "session should still be open, not dropped by a protocol violation");
    assert!(reply.poll().is_terminal());
}
