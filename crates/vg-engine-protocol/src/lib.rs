//! Engine<->Library handoff protocol (C9, spec §4.7): message types plus a
//! pluggable [`Transport`] the Engine and Library sides exchange them over.
//!
//! Grounded on `rt-protocol::WsMessage`'s discriminated-by-`kind` enum (same
//! message-naming and `#[serde(tag = "kind")]` shape) for the message catalogue
//! itself; the `Transport` trait and its in-memory test double are new, since
//! `rt-protocol` always communicates over a real WebSocket and has no
//! in-process transport to imitate. The in-memory transport borrows
//! `crossbeam-channel` from the `RephlexZero-strata` workspace, which
//! reaches for that crate for exactly this kind of bounded cross-thread
//! handoff (`rist-bonding-core::runtime`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Locally-assigned session identifier, carried across the process boundary
/// as a bare integer (spec §3 "Session" / §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// A point-in-time view of a session handed to a Library on
/// `MANAGE_SESSION` (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub protocol: ProtocolName,
    pub state: String,
    pub next_sent_seq: u64,
    pub next_recv_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolName {
    Fix,
    Ilink3,
}

/// One entry in a `CONTROL_NOTIFICATION` libraries snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStatus {
    pub library_id: String,
    pub connected: bool,
    pub owned_sessions: Vec<SessionId>,
}

/// Why the Engine is reclaiming a session from a Library (spec §4.7
/// "absence triggers `DISCONNECT` of all its sessions to the unowned pool").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    LibraryTimedOut,
    SessionClosed,
    EngineShuttingDown,
}

/// Library -> Engine messages (spec §4.7's literal list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum LibraryMessage {
    Connect { library_id: String },
    RequestSession { session_id: SessionId },
    ReleaseSession { session_id: SessionId },
    ApplicationHeartbeat { library_id: String },
}

/// Engine -> Library messages (spec §4.7's literal list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum EngineMessage {
    ManageSession { session_id: SessionId, snapshot: SessionSnapshot },
    ReleaseComplete { session_id: SessionId },
    Disconnect { session_id: SessionId, reason: DisconnectReason },
    ControlNotification { libraries: Vec<LibraryStatus> },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer disconnected")]
    Disconnected,
}

/// The Engine side's half of the inter-process transport (spec §6 "reliable
/// ordered byte stream between Engine and Library processes"). The real
/// implementation (a length-prefixed JSON stream over a Unix socket or named
/// pipe) lives outside this crate's scope (spec §1 Non-goals: "the low-level
/// shared-memory transport"); this trait is the seam the Engine and Library
/// binaries program against.
pub trait EngineTransport: Send {
    fn send(&mut self, message: &EngineMessage) -> Result<(), TransportError>;
    fn try_recv(&mut self) -> Result<Option<LibraryMessage>, TransportError>;
}

/// The Library side's half.
pub trait LibraryTransport: Send {
    fn send(&mut self, message: &LibraryMessage) -> Result<(), TransportError>;
    fn try_recv(&mut self) -> Result<Option<EngineMessage>, TransportError>;
}

pub mod test_support {
    //! In-process transport pair for tests and the sample Library harness,
    //! wired with bounded `crossbeam_channel`s instead of a real byte stream.

    use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

    use super::{EngineMessage, EngineTransport, LibraryMessage, LibraryTransport, SessionId, TransportError};

    const CHANNEL_CAPACITY: usize = 256;

    pub struct InMemoryEngineTransport {
        to_library: Sender<EngineMessage>,
        from_library: Receiver<LibraryMessage>,
    }

    pub struct InMemoryLibraryTransport {
        to_engine: Sender<LibraryMessage>,
        from_engine: Receiver<EngineMessage>,
    }

    /// Build a connected pair: the first element is the Engine's end, the
    /// second the Library's.
    #[must_use]
    pub fn pair() -> (InMemoryEngineTransport, InMemoryLibraryTransport) {
        let (to_library, from_engine) = bounded(CHANNEL_CAPACITY);
        let (to_engine, from_library) = bounded(CHANNEL_CAPACITY);
        (
            InMemoryEngineTransport { to_library, from_library },
            InMemoryLibraryTransport { to_engine, from_engine },
        )
    }

    impl EngineTransport for InMemoryEngineTransport {
        fn send(&mut self, message: &EngineMessage) -> Result<(), TransportError> {
            self.to_library.send(message.clone()).map_err(|_| TransportError::Disconnected)
        }

        fn try_recv(&mut self) -> Result<Option<LibraryMessage>, TransportError> {
            match self.from_library.try_recv() {
                Ok(msg) => Ok(Some(msg)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
            }
        }
    }

    impl LibraryTransport for InMemoryLibraryTransport {
        fn send(&mut self, message: &LibraryMessage) -> Result<(), TransportError> {
            self.to_engine.send(message.clone()).map_err(|_| TransportError::Disconnected)
        }

        fn try_recv(&mut self) -> Result<Option<EngineMessage>, TransportError> {
            match self.from_engine.try_recv() {
                Ok(msg) => Ok(Some(msg)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
            }
        }
    }

}
