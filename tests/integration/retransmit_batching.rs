//! spec §8 scenario 3: "Retransmit batching."

#[path = "common.rs"]
mod common;

use vg_codec::ilink3;
use vg_framer::test_support::pump;
use vg_framer::FramerConfig;

#[test]
fn a_5000_message_gap_is_requested_in_two_chunks_of_at_most_2500() {
    let mut h = vg_framer::test_support::harness(FramerConfig::default());
    let (_reply, mut channel) = common::establish(&mut h, "ilink3:1");

    let jump = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 5000, false, &[]);
    channel.try_write(&jump).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::RetransmitRequest(first) = common::read_one(channel.as_mut()) else { panic!("expected RetransmitRequest") };
    assert_eq!(first.from_seq_no, 1);
    assert_eq!(first.msg_count, 2500);

    for seq in 1..=2500u64 {
        let fill = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, seq, true, &[]);
        channel.try_write(&fill).unwrap();
    }
    pump(&mut h, 20, 3);

    let ilink3::Message::RetransmitRequest(second) = common::read_one(channel.as_mut()) else { panic!("expected a second RetransmitRequest") };
    assert_eq!(second.from_seq_no, 2501);
    assert_eq!(second.msg_count, 2499);

    for seq in 2501..=4999u64 {
        let fill = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, seq, true, &[]);
        channel.try_write(&fill).unwrap();
    }
    pump(&mut h, 20, 3);

    // No internal state to peek at (the in-flight retransmit accounting is
    // Framer-private), so `next_recv_seq == 5001` is confirmed the same way
    // a real peer would notice it: the next in-order message is accepted
    // with no further RetransmitRequest and no protocol violation.
    let next = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 5001, false, &[]);
    channel.try_write(&next).unwrap();
    pump(&mut h, 20, 3);

    let mut buf = [0u8; 64];
    assert!(matches!(channel.try_read(&mut buf), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock), "no further frames expected once the gap is fully filled and seq 5001 is accepted in order");
}
