//! A minimal Library-side client for the Engine<->Library protocol (C9,
//! spec §4.7): wraps any [`LibraryTransport`] and gives callers the literal
//! message names as methods instead of hand-building each variant.
//!
//! Grounded on `emulator::run` (`examples/iwismer-rusty-timer/services/emulator/src/lib.rs`):
//! a small harness process driving a protocol from one side for
//! demonstration and integration testing, not a production peer.

use vg_engine_protocol::{EngineMessage, LibraryMessage, LibraryTransport, SessionId, TransportError};

pub struct LibraryClient<T: LibraryTransport> {
    transport: T,
    library_id: String,
}

impl<T: LibraryTransport> LibraryClient<T> {
    pub fn new(transport: T, library_id: impl Into<String>) -> Self {
        LibraryClient { transport, library_id: library_id.into() }
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.transport.send(&LibraryMessage::Connect { library_id: self.library_id.clone() })
    }

    pub fn application_heartbeat(&mut self) -> Result<(), TransportError> {
        self.transport.send(&LibraryMessage::ApplicationHeartbeat { library_id: self.library_id.clone() })
    }

    pub fn request_session(&mut self, session_id: SessionId) -> Result<(), TransportError> {
        self.transport.send(&LibraryMessage::RequestSession { session_id })
    }

    pub fn release_session(&mut self, session_id: SessionId) -> Result<(), TransportError> {
        self.transport.send(&LibraryMessage::ReleaseSession { session_id })
    }

    /// Drain every Engine message currently queued, in order.
    pub fn poll(&mut self) -> Vec<EngineMessage> {
        let mut messages = Vec::new();
        while let Ok(Some(message)) = self.transport.try_recv() {
            messages.push(message);
        }
        messages
    }
}
