//! `gateway_core`: re-exports the crates that make up the low-latency
//! FIX 4.4 / iLink3 gateway (Session FSM, Framer reactor, wire codecs,
//! Retransmit Engine, Sequence Store, Reply Registry, and the
//! Engine<->Library protocol) under one facade crate, the way the
//! teacher's own workspace root stays a thin umbrella over its services.
//!
//! The binaries (`services/engine`, `services/library-harness`) and the
//! integration test suites under `tests/integration/` depend on the
//! individual `vg-*` crates directly; this crate exists so the workspace
//! root package — declared for the `[[test]]` entries — has a lib target
//! to link against.

pub use vg_channel as channel;
pub use vg_clock as clock;
pub use vg_codec as codec;
pub use vg_engine_protocol as engine_protocol;
pub use vg_framer as framer;
pub use vg_reply as reply;
pub use vg_retransmit as retransmit;
pub use vg_sequence_store as sequence_store;
pub use vg_session as session;
