//! spec §8 scenario 6: "Invalid uuid terminate."

#[path = "common.rs"]
mod common;

use vg_codec::ilink3;
use vg_framer::test_support::pump;
use vg_framer::FramerConfig;

#[test]
fn a_terminate_with_an_unrecognized_uuid_unbinds_with_a_non_fatal_error() {
    let mut h = vg_framer::test_support::harness(FramerConfig::default());
    let (_reply, mut channel) = common::establish(&mut h, "ilink3:1");

    let bogus_terminate = ilink3::encode_terminate(&ilink3::Terminate507 { uuid: 0, request_timestamp: 0, reason: 0 });
    channel.try_write(&bogus_terminate).unwrap();
    pump(&mut h, 20, 3);

    let ilink3::Message::Terminate(local_terminate) = common::read_one(channel.as_mut()) else { panic!("expected a local Terminate in response") };
    let _ = local_terminate;

    assert!(h.framer.is_idle(), "session should be unbound (removed) after the invalid-uuid terminate");
    let errors = h.errors.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].1, "INVALID_UUID");
    assert!(errors[0].3.contains("Invalid uuid=0"), "description should name the offending uuid: {:?}", errors[0].3);
}
