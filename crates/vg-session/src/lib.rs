//! Session state machine (C5): the shared state union of both protocols
//! plus a pure `transition` function per protocol (spec §4.5).
//!
//! Grounded on `ws_forwarder::handle_forwarder_socket`'s
//! connection lifecycle (hello/handshake timeout, heartbeat interval,
//! command channel, disconnect cleanup) — re-expressed here as a pure
//! state machine instead of an async `tokio::select!` loop, since the
//! Framer (C7) drives these transitions itself from its own duty cycle
//! rather than each session owning a task.

pub mod fix;
pub mod ilink3;

use vg_retransmit::RetransmitEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    SentNegotiate,
    Negotiated,
    SentEstablish,
    Established,
    /// ESTABLISHED with an outstanding `Sequence(Lapsed)` awaiting reply
    /// (spec §4.5 "ESTABLISHED (warn)").
    EstablishedWarn,
    Terminating,
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// Locally-assigned identifier for a session (spec §3 "Session").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Mutable per-session bookkeeping shared by both protocols (spec §3
/// "Session"). The Framer owns one of these per live session; the
/// protocol-specific `transition` functions read and update it directly
/// rather than returning a diff, since there is exactly one writer (the
/// Framer thread).
pub struct SessionData {
    pub session_id: SessionId,
    pub role: Role,
    pub state: SessionState,
    /// iLink3 only: epoch-nanos stamp for this connection's lifetime.
    pub uuid: Option<u64>,
    pub next_sent_seq: u64,
    pub next_recv_seq: u64,
    pub retransmit: RetransmitEngine,
    pub last_sent_nanos: u64,
    pub last_recv_nanos: u64,
    pub negotiate_attempts: u32,
    /// Sequence number of the message that first revealed a gap, held here
    /// until the retransmit engine fills (or the peer rejects) the range in
    /// front of it, at which point the Framer consumes it directly instead
    /// of waiting for the wire to redeliver it (spec §4.3 "non-retransmitted
    /// messages ... otherwise they themselves create a new deferred gap").
    pub buffered_gap_seq: Option<u64>,
}

impl SessionData {
    #[must_use]
    pub fn new(session_id: SessionId, role: Role, batch_max: u64) -> Self {
        SessionData {
            session_id,
            role,
            state: SessionState::Disconnected,
            uuid: None,
            next_sent_seq: 1,
            next_recv_seq: 1,
            retransmit: RetransmitEngine::new(batch_max),
            last_sent_nanos: 0,
            last_recv_nanos: 0,
            negotiate_attempts: 0,
            buffered_gap_seq: None,
        }
    }

    /// spec §4.5 "Low-sequence guard": any post-handshake message whose
    /// sequence is below `next_recv_seq` without `is_retransmit` set
    /// immediately moves the session to TERMINATING.
    #[must_use]
    pub fn low_sequence_guard_triggered(&self, received_seq: u64, is_retransmit: bool) -> bool {
        !is_retransmit && received_seq < self.next_recv_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_sequence_guard_fires_only_without_retransmit_flag() {
        let mut data = SessionData::new(SessionId(1), Role::Initiator, 2500);
        data.next_recv_seq = 2;
        assert!(data.low_sequence_guard_triggered(1, false));
        assert!(!data.low_sequence_guard_triggered(1, true));
        assert!(!data.low_sequence_guard_triggered(2, false));
    }
}
