//! FIX 4.4 session-layer transitions (spec §4.5, "each protocol uses a
//! subset" of the shared state union).
//!
//! FIX has a single-phase handshake (`Logon`/`Logon` ack) rather than
//! iLink3's Negotiate/Establish split, so `SENT_NEGOTIATE` moves straight
//! to `ESTABLISHED`; `NEGOTIATED`/`SENT_ESTABLISH` are unused here. There
//! is no `uuid` concept for FIX.

use crate::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Initiate,
    ChannelUp,
    ChannelFail,
    LogonTimer,
    LogonAck,
    LogonReject,
    KeepaliveSendTimer,
    KeepaliveRecvTimer,
    GraceTimer,
    PeerLogout,
    LogoutRequested,
    LogoutTimer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    RequestChannel,
    SendLogon,
    StartLogonTimer,
    ResendLogon,
    ReplyTimedOut,
    CloseChannel,
    ReplyErrored(String),
    ReplyCompleted,
    StartKeepaliveTimers,
    SendHeartbeat,
    ResetSendTimer,
    SendTestRequest,
    StartGraceTimer,
    SendLogout,
    SendLogoutReply,
    StartLogoutTimer,
}

pub const LOGON_RESEND_MAX: u32 = 2;

pub fn transition(state: SessionState, event: Event, logon_attempts: &mut u32) -> (SessionState, Vec<Effect>) {
    use SessionState::{Connecting, Disconnected, Established, EstablishedWarn, SentNegotiate, Terminating};

    match (state, event) {
        (Disconnected, Event::Initiate) => {
            *logon_attempts = 0;
            (Connecting, vec![Effect::RequestChannel])
        }
        (Connecting, Event::ChannelUp) => {
            (SentNegotiate, vec![Effect::SendLogon, Effect::StartLogonTimer])
        }
        (Connecting, Event::ChannelFail) => {
            (Disconnected, vec![Effect::ReplyErrored("UNABLE_TO_CONNECT".to_owned())])
        }
        (SentNegotiate, Event::LogonTimer) => {
            *logon_attempts += 1;
            if *logon_attempts >= LOGON_RESEND_MAX {
                (Disconnected, vec![Effect::ReplyTimedOut, Effect::CloseChannel])
            } else {
                (SentNegotiate, vec![Effect::ResendLogon, Effect::StartLogonTimer])
            }
        }
        (SentNegotiate, Event::LogonAck) => {
            (Established, vec![Effect::ReplyCompleted, Effect::StartKeepaliveTimers])
        }
        (SentNegotiate, Event::LogonReject) => {
            (Disconnected, vec![Effect::ReplyErrored("Logon rejected".to_owned())])
        }
        (Established, Event::KeepaliveSendTimer) => {
            (Established, vec![Effect::SendHeartbeat, Effect::ResetSendTimer])
        }
        (Established, Event::KeepaliveRecvTimer) => {
            (EstablishedWarn, vec![Effect::SendTestRequest, Effect::StartGraceTimer])
        }
        (EstablishedWarn, Event::GraceTimer) => (Terminating, vec![Effect::SendLogout]),
        (Established | EstablishedWarn, Event::PeerLogout) => {
            (Disconnected, vec![Effect::SendLogoutReply, Effect::CloseChannel])
        }
        (Established | EstablishedWarn, Event::LogoutRequested) => {
            (Terminating, vec![Effect::SendLogout, Effect::StartLogoutTimer])
        }
        (Terminating, Event::PeerLogout | Event::LogoutTimer) => {
            (Disconnected, vec![Effect::CloseChannel])
        }
        (other, _) => (other, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logon_handshake_skips_negotiated_and_sent_establish() {
        let mut attempts = 0;
        let (s, _) = transition(SessionState::Disconnected, Event::Initiate, &mut attempts);
        let (s, _) = transition(s, Event::ChannelUp, &mut attempts);
        assert_eq!(s, SessionState::SentNegotiate);

        let (s, fx) = transition(s, Event::LogonAck, &mut attempts);
        assert_eq!(s, SessionState::Established);
        assert_eq!(fx, vec![Effect::ReplyCompleted, Effect::StartKeepaliveTimers]);
    }

    #[test]
    fn logon_timeout_after_resend_max() {
        let mut attempts = 0;
        let (s, _) = transition(SessionState::SentNegotiate, Event::LogonTimer, &mut attempts);
        assert_eq!(s, SessionState::SentNegotiate);
        let (s, fx) = transition(s, Event::LogonTimer, &mut attempts);
        assert_eq!(s, SessionState::Disconnected);
        assert_eq!(fx, vec![Effect::ReplyTimedOut, Effect::CloseChannel]);
    }

    #[test]
    fn peer_logout_while_established_disconnects_cleanly() {
        let mut attempts = 0;
        let (s, fx) = transition(SessionState::Established, Event::PeerLogout, &mut attempts);
        assert_eq!(s, SessionState::Disconnected);
        assert_eq!(fx, vec![Effect::SendLogoutReply, Effect::CloseChannel]);
    }
}
