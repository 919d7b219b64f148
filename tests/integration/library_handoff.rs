//! Engine<->Library handoff (spec §4.7/C9): CONNECT, REQUEST_SESSION/
//! RELEASE_SESSION acks, ApplicationHeartbeat, and timeout-triggered eviction.

use std::sync::Arc;
use std::time::Duration;

use engine::config::{EngineConfig, StoreConfig};
use engine::runtime::EngineRuntime;
use library_harness::LibraryClient;
use vg_channel::test_support::Network;
use vg_clock::{SharedClock, TestClock};
use vg_engine_protocol::test_support::pair;
use vg_engine_protocol::{EngineMessage, SessionId};
use vg_framer::TracingErrorConsumer;
use vg_sequence_store::SequenceStore;

fn test_config(library_timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        reply_timeout_ms: 10_000,
        negotiate_resend_max: 2,
        retransmit_batch_max: 2_500,
        max_inflight_replies: 1_024,
        default_library_id: "local".to_owned(),
        log_any_messages: false,
        application_heartbeat_interval_ms: 15_000,
        library_timeout_ms,
        archive_backup_location: None,
        store: StoreConfig { sqlite_path: ":memory:".to_owned() },
        fix_sessions: Vec::new(),
        ilink3_sessions: Vec::new(),
    }
}

#[test]
fn connect_request_release_and_timeout_eviction() {
    let test_clock = Arc::new(TestClock::new());
    let clock: SharedClock = test_clock.clone();
    let store = SequenceStore::open_in_memory().expect("in-memory sequence store always opens");
    let network = Network::new();

    let mut runtime = EngineRuntime::start(
        test_config(5_000),
        clock,
        Box::new(network.supplier()),
        store,
        Box::new(TracingErrorConsumer),
    );

    let (engine_transport, library_transport) = pair();
    runtime.attach_library(Box::new(engine_transport));
    let mut client = LibraryClient::new(library_transport, "harness-1");

    client.connect().expect("fresh pair accepts a send");
    assert!(runtime.duty_cycle(), "connect should register as work");
    assert_eq!(runtime.metrics().libraries_connected, 1);

    client.request_session(SessionId(7)).unwrap();
    assert!(runtime.duty_cycle());
    let messages = client.poll();
    assert_eq!(messages.len(), 1);
    assert!(matches!(&messages[0], EngineMessage::ManageSession { session_id, .. } if *session_id == SessionId(7)));
    assert_eq!(runtime.metrics().sessions_requested, 1);

    client.release_session(SessionId(7)).unwrap();
    assert!(runtime.duty_cycle());
    let messages = client.poll();
    assert_eq!(messages, vec![EngineMessage::ReleaseComplete { session_id: SessionId(7) }]);
    assert_eq!(runtime.metrics().sessions_released, 1);

    client.application_heartbeat().unwrap();
    assert!(runtime.duty_cycle());
    assert_eq!(runtime.library_status_snapshot().len(), 1, "library is still within its timeout window");

    test_clock.advance(Duration::from_millis(5_001));
    runtime.duty_cycle();
    let messages = client.poll();
    assert_eq!(messages, vec![EngineMessage::ControlNotification { libraries: Vec::new() }]);
    assert_eq!(runtime.metrics().libraries_timed_out, 1);
    assert!(runtime.library_status_snapshot().is_empty(), "timed-out library should be evicted from the status snapshot");
}
