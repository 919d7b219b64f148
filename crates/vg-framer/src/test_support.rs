//! Test harness wiring (mirrors `vg_channel::test_support`'s own style):
//! a [`Framer`] built from a [`vg_clock::TestClock`], an in-memory
//! [`vg_channel::test_support::Network`], and an in-memory Sequence Store,
//! so integration tests can drive handshakes, gaps, and retransmits without
//! real sockets or wall-clock timing (spec §8).

use std::sync::Arc;

use vg_channel::test_support::{InMemorySupplier, Network};
use vg_clock::{SharedClock, TestClock};
use vg_sequence_store::SequenceStore;

use crate::{ErrorConsumer, Framer, FramerConfig, NanoTime};

/// Captures every `on_error` call instead of just logging it, so tests can
/// assert on the `(libraryId, errorCode, description)` tuple spec §7 pins.
#[derive(Default, Clone)]
pub struct RecordingErrorConsumer {
    errors: Arc<std::sync::Mutex<Vec<(String, String, NanoTime, String)>>>,
}

impl RecordingErrorConsumer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<(String, String, NanoTime, String)> {
        self.errors.lock().expect("error log mutex poisoned").clone()
    }
}

impl ErrorConsumer for RecordingErrorConsumer {
    fn on_error(&mut self, library_id: &str, error_code: &str, timestamp_nanos: NanoTime, description: &str) {
        self.errors.lock().expect("error log mutex poisoned").push((
            library_id.to_owned(),
            error_code.to_owned(),
            timestamp_nanos,
            description.to_owned(),
        ));
    }
}

/// A [`Framer`] plus the handles a test needs to drive it: the clock (to
/// advance timers), the network (to bind peers / toggle connectivity), and
/// the recording error consumer (to assert on async errors).
pub struct TestHarness {
    pub framer: Framer,
    pub clock: Arc<TestClock>,
    pub network: Network,
    pub errors: RecordingErrorConsumer,
}

/// Build a [`Framer`] over an in-memory network and an in-memory Sequence
/// Store, with a fresh [`RecordingErrorConsumer`] already wired in and
/// reachable via the returned harness's `errors` field.
#[must_use]
pub fn harness(config: FramerConfig) -> TestHarness {
    let errors = RecordingErrorConsumer::new();
    harness_with_errors(config, errors)
}

#[must_use]
pub fn harness_with_errors(config: FramerConfig, errors: RecordingErrorConsumer) -> TestHarness {
    let clock = Arc::new(TestClock::new());
    let shared_clock: SharedClock = clock.clone();
    let network = Network::new();
    let supplier: InMemorySupplier = network.supplier();
    let store = SequenceStore::open_in_memory().expect("in-memory sequence store always opens");

    let framer = Framer::new(shared_clock, Box::new(supplier), store, Box::new(errors.clone()), config);

    TestHarness { framer, clock, network, errors }
}

/// Run `duty_cycle()` until it reports no work for `idle_rounds` consecutive
/// calls, or `max_rounds` is hit (a stuck test should fail loudly rather than
/// hang, since nothing here can block on real I/O readiness).
pub fn pump(harness: &mut TestHarness, max_rounds: usize, idle_rounds: usize) {
    let mut idle = 0;
    for _ in 0..max_rounds {
        if harness.framer.duty_cycle() {
            idle = 0;
        } else {
            idle += 1;
            if idle >= idle_rounds {
                return;
            }
        }
    }
}
