//! spec §8 scenario 5: "Low-sequence guard."

#[path = "common.rs"]
mod common;

use vg_codec::ilink3;
use vg_framer::test_support::pump;
use vg_framer::FramerConfig;

#[test]
fn a_repeated_non_retransmit_sequence_number_terminates_the_session() {
    let mut h = vg_framer::test_support::harness(FramerConfig::default());
    let (_reply, mut channel) = common::establish(&mut h, "ilink3:1");

    let first = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 1, false, &[]);
    channel.try_write(&first).unwrap();
    pump(&mut h, 20, 3);

    let replay = ilink3::encode_application(ilink3::template_id::EXECUTION_REPORT_STATUS, 1, false, &[]);
    channel.try_write(&replay).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::Terminate(terminate) = common::read_one(channel.as_mut()) else { panic!("expected a local Terminate") };
    let _ = terminate;

    assert!(h.framer.is_idle(), "session should be dropped after the protocol violation");
    let errors = h.errors.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, "LOW_SEQUENCE");
}
