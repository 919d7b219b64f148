//! iLink3 session-layer transitions (spec §4.5 table, "For iLink3,
//! transitions").

use crate::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Initiate,
    ChannelUp,
    ChannelFail,
    /// Fired every `negotiate_timer` period while SENT_NEGOTIATE.
    NegotiateTimer,
    NegotiateResponse,
    NegotiateReject,
    EstablishAck,
    EstablishReject,
    KeepaliveSendTimer,
    KeepaliveRecvTimer,
    GraceTimer,
    PeerTerminate,
    /// Terminate received carrying a `uuid` the session does not
    /// recognize (spec §4.5 "UUID policy").
    PeerTerminateInvalidUuid { uuid: u64 },
    TerminateRequested,
    TerminateTimer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RequestChannel,
    SendNegotiate,
    StartNegotiateTimer,
    ResendNegotiate,
    ReplyTimedOut,
    CloseChannel,
    ReplyErrored(String),
    SendEstablish,
    StartEstablishTimer,
    ReplyCompleted,
    StartKeepaliveTimers,
    SendSequenceNotLapsed,
    ResetSendTimer,
    SendSequenceLapsed,
    StartGraceTimer,
    SendTerminate,
    SendTerminateReply,
    StartTerminateTimer,
    /// Non-fatal error raised to the error consumer, not a Reply
    /// transition (spec §4.5 UUID policy: `Invalid uuid=<value>`).
    RaiseNonFatalError(String),
}

/// Maximum Negotiate resend attempts before giving up (spec §4.5: "resend
/// Negotiate (up to N=2)").
pub const NEGOTIATE_RESEND_MAX: u32 = 2;

/// Pure transition function: given the current state, an event, and the
/// session's negotiate-attempt counter (mutated in place), returns the new
/// state and the side effects the Framer must carry out.
pub fn transition(state: SessionState, event: Event, negotiate_attempts: &mut u32) -> (SessionState, Vec<Effect>) {
    use SessionState::{Connecting, Disconnected, Established, EstablishedWarn, Negotiated, SentEstablish, SentNegotiate, Terminating, Unbound};

    match (state, event) {
        (Disconnected, Event::Initiate) => {
            *negotiate_attempts = 0;
            (Connecting, vec![Effect::RequestChannel])
        }
        (Connecting, Event::ChannelUp) => {
            (SentNegotiate, vec![Effect::SendNegotiate, Effect::StartNegotiateTimer])
        }
        (Connecting, Event::ChannelFail) => {
            (Disconnected, vec![Effect::ReplyErrored("UNABLE_TO_CONNECT".to_owned())])
        }
        (SentNegotiate, Event::NegotiateTimer) => {
            *negotiate_attempts += 1;
            if *negotiate_attempts >= NEGOTIATE_RESEND_MAX {
                (Disconnected, vec![Effect::ReplyTimedOut, Effect::CloseChannel])
            } else {
                (SentNegotiate, vec![Effect::ResendNegotiate, Effect::StartNegotiateTimer])
            }
        }
        (SentNegotiate, Event::NegotiateResponse) => {
            (Negotiated, vec![Effect::SendEstablish, Effect::StartEstablishTimer])
        }
        (SentNegotiate, Event::NegotiateReject) => {
            (Disconnected, vec![Effect::ReplyErrored("Negotiate rejected".to_owned())])
        }
        (Negotiated | SentEstablish, Event::EstablishAck) => {
            (Established, vec![Effect::ReplyCompleted, Effect::StartKeepaliveTimers])
        }
        (Negotiated | SentEstablish, Event::EstablishReject) => {
            (Disconnected, vec![Effect::ReplyErrored("Establishment rejected".to_owned())])
        }
        (Established, Event::KeepaliveSendTimer) => {
            (Established, vec![Effect::SendSequenceNotLapsed, Effect::ResetSendTimer])
        }
        (Established, Event::KeepaliveRecvTimer) => {
            (EstablishedWarn, vec![Effect::SendSequenceLapsed, Effect::StartGraceTimer])
        }
        (EstablishedWarn, Event::GraceTimer) => (Terminating, vec![Effect::SendTerminate]),
        (Established | EstablishedWarn, Event::PeerTerminate) => {
            (Unbound, vec![Effect::SendTerminateReply, Effect::CloseChannel])
        }
        (Established | EstablishedWarn, Event::TerminateRequested) => {
            (Terminating, vec![Effect::SendTerminate, Effect::StartTerminateTimer])
        }
        (Terminating, Event::PeerTerminate | Event::TerminateTimer) => {
            (Disconnected, vec![Effect::CloseChannel])
        }
        (_, Event::PeerTerminateInvalidUuid { uuid }) => {
            (Unbound, vec![Effect::SendTerminate, Effect::CloseChannel, Effect::RaiseNonFatalError(format!("Invalid uuid={uuid}"))])
        }
        (other, _) => (other, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_happy_path() {
        let mut attempts = 0;
        let (s, fx) = transition(SessionState::Disconnected, Event::Initiate, &mut attempts);
        assert_eq!(s, SessionState::Connecting);
        assert_eq!(fx, vec![Effect::RequestChannel]);

        let (s, fx) = transition(s, Event::ChannelUp, &mut attempts);
        assert_eq!(s, SessionState::SentNegotiate);
        assert_eq!(fx, vec![Effect::SendNegotiate, Effect::StartNegotiateTimer]);

        let (s, _) = transition(s, Event::NegotiateResponse, &mut attempts);
        assert_eq!(s, SessionState::Negotiated);

        let (s, fx) = transition(s, Event::EstablishAck, &mut attempts);
        assert_eq!(s, SessionState::Established);
        assert_eq!(fx, vec![Effect::ReplyCompleted, Effect::StartKeepaliveTimers]);
    }

    #[test]
    fn negotiate_resend_then_timeout() {
        let mut attempts = 0;
        let mut state = SessionState::SentNegotiate;

        let (s, fx) = transition(state, Event::NegotiateTimer, &mut attempts);
        state = s;
        assert_eq!(state, SessionState::SentNegotiate);
        assert_eq!(fx, vec![Effect::ResendNegotiate, Effect::StartNegotiateTimer]);

        let (s, fx) = transition(state, Event::NegotiateTimer, &mut attempts);
        assert_eq!(s, SessionState::Disconnected);
        assert_eq!(fx, vec![Effect::ReplyTimedOut, Effect::CloseChannel]);
    }

    #[test]
    fn keepalive_lapse_then_grace_timeout_terminates() {
        let mut attempts = 0;
        let (s, fx) = transition(SessionState::Established, Event::KeepaliveRecvTimer, &mut attempts);
        assert_eq!(s, SessionState::EstablishedWarn);
        assert_eq!(fx, vec![Effect::SendSequenceLapsed, Effect::StartGraceTimer]);

        let (s, fx) = transition(s, Event::GraceTimer, &mut attempts);
        assert_eq!(s, SessionState::Terminating);
        assert_eq!(fx, vec![Effect::SendTerminate]);
    }

    #[test]
    fn invalid_uuid_terminate_unbinds_with_non_fatal_error() {
        let mut attempts = 0;
        let (s, fx) = transition(SessionState::Established, Event::PeerTerminateInvalidUuid { uuid: 42 }, &mut attempts);
        assert_eq!(s, SessionState::Unbound);
        assert_eq!(fx, vec![Effect::SendTerminate, Effect::CloseChannel, Effect::RaiseNonFatalError("Invalid uuid=42".to_owned())]);
    }
}
