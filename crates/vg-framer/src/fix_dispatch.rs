//! FIX 4.4 dispatch: builds on [`vg_session::fix::transition`] for the
//! initiator handshake and handles the acceptor's mirror-image Logon
//! exchange and business-message sequencing inline, since spec §4.5's table
//! is written strictly from the initiator's perspective.

use vg_clock::NanoTime;
use vg_codec::fix::{self, msg_type, tag, SessionMessageBuilder};
use vg_session::fix::{self as fix_fsm, Effect, Event};
use vg_session::{SessionId, SessionState};

use crate::{AdminReplyValue, Framer, FixConfig, InboundSeqOutcome, ProtocolConfig, TimerKind};

fn fix_config(protocol: &ProtocolConfig) -> &FixConfig {
    match protocol {
        ProtocolConfig::Fix(c) => c,
        ProtocolConfig::Ilink3(_) => unreachable!("fix_dispatch invoked on a non-FIX session"),
    }
}

impl Framer {
    pub(crate) fn fix_on_channel_up(&mut self, session_id: SessionId, now: NanoTime) {
        let Some(entry) = self.sessions.get_mut(&session_id) else { return };
        let (state, effects) = fix_fsm::transition(entry.data.state, Event::ChannelUp, &mut entry.data.negotiate_attempts);
        entry.data.state = state;
        self.fix_apply_effects(session_id, now, effects);
    }

    pub(crate) fn fix_request_terminate(&mut self, session_id: SessionId, now: NanoTime) {
        let Some(entry) = self.sessions.get_mut(&session_id) else { return };
        let (state, effects) = fix_fsm::transition(entry.data.state, Event::LogoutRequested, &mut entry.data.negotiate_attempts);
        entry.data.state = state;
        self.fix_apply_effects(session_id, now, effects);
    }

    pub(crate) fn fix_send_logout_best_effort(&mut self, session_id: SessionId) {
        self.fix_send(session_id, msg_type::LOGOUT, &[]);
    }

    pub(crate) fn fix_handle_timer(&mut self, session_id: SessionId, now: NanoTime, kind: TimerKind) {
        let Some(entry) = self.sessions.get_mut(&session_id) else { return };
        let event = match kind {
            TimerKind::Handshake => Event::LogonTimer,
            TimerKind::KeepaliveSend => Event::KeepaliveSendTimer,
            TimerKind::KeepaliveRecv => Event::KeepaliveRecvTimer,
            TimerKind::Grace => Event::GraceTimer,
            TimerKind::Terminate => Event::LogoutTimer,
        };
        let (state, effects) = fix_fsm::transition(entry.data.state, event, &mut entry.data.negotiate_attempts);
        entry.data.state = state;
        self.fix_apply_effects(session_id, now, effects);
    }

    fn fix_apply_effects(&mut self, session_id: SessionId, now: NanoTime, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RequestChannel => {}
                Effect::SendLogon | Effect::ResendLogon => {
                    let heart_bt_int = match self.sessions.get(&session_id) {
                        Some(e) => fix_config(&e.protocol).heart_bt_int,
                        None => continue,
                    };
                    self.fix_send(session_id, msg_type::LOGON, &[
                        (tag::ENCRYPT_METHOD, b"0".to_vec()),
                        (tag::HEART_BT_INT, heart_bt_int.to_string().into_bytes()),
                    ]);
                }
                Effect::StartLogonTimer => {
                    let interval_ms = self.sessions.get(&session_id).map(|e| e.protocol.keep_alive_interval_ms()).unwrap_or(30_000);
                    let timer = self.schedule_timer(session_id, now, TimerKind::Handshake, interval_ms);
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.handshake_timer = Some(timer);
                    }
                }
                Effect::ReplyTimedOut => {
                    self.complete_reply_errored(session_id, "TIMED_OUT: Logon did not complete after maximum resends");
                }
                Effect::CloseChannel => {
                    self.drop_session(session_id);
                }
                Effect::ReplyErrored(msg) => {
                    self.complete_reply_errored(session_id, msg);
                }
                Effect::ReplyCompleted => {
                    self.complete_reply_value(session_id, AdminReplyValue::Initiated(session_id));
                }
                Effect::StartKeepaliveTimers => {
                    self.schedule_keepalive_timers(session_id, now);
                }
                Effect::SendHeartbeat => {
                    self.fix_send(session_id, msg_type::HEARTBEAT, &[]);
                }
                Effect::ResetSendTimer => {
                    let interval_ms = self.sessions.get(&session_id).map(|e| e.protocol.keep_alive_interval_ms()).unwrap_or(30_000);
                    let timer = self.schedule_timer(session_id, now, TimerKind::KeepaliveSend, interval_ms);
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.keepalive_send_timer = Some(timer);
                    }
                }
                Effect::SendTestRequest => {
                    self.fix_send(session_id, msg_type::TEST_REQUEST, &[(tag::TEST_REQ_ID, b"TEST".to_vec())]);
                }
                Effect::StartGraceTimer => {
                    let interval_ms = self.sessions.get(&session_id).map(|e| e.protocol.keep_alive_interval_ms()).unwrap_or(30_000);
                    let timer = self.schedule_timer(session_id, now, TimerKind::Grace, interval_ms);
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.grace_timer = Some(timer);
                    }
                }
                Effect::SendLogout | Effect::SendLogoutReply => {
                    self.fix_send(session_id, msg_type::LOGOUT, &[]);
                }
                Effect::StartLogoutTimer => {
                    let interval_ms = self.sessions.get(&session_id).map(|e| e.protocol.keep_alive_interval_ms()).unwrap_or(30_000);
                    let timer = self.schedule_timer(session_id, now, TimerKind::Terminate, interval_ms);
                    if let Some(entry) = self.sessions.get_mut(&session_id) {
                        entry.terminate_timer = Some(timer);
                    }
                }
            }
        }
    }

    /// Build and enqueue a FIX session-layer message using the session's
    /// current `next_sent_seq`, persisting the advance to the Sequence
    /// Store (spec §4.2) before the bytes are queued for write.
    fn fix_send(&mut self, session_id: SessionId, msg_type: &[u8], extra: &[(u32, Vec<u8>)]) {
        let Some(entry) = self.sessions.get_mut(&session_id) else { return };
        let cfg = fix_config(&entry.protocol).clone();
        let seq = entry.data.next_sent_seq;
        let mut builder = SessionMessageBuilder::new(&cfg.begin_string, msg_type, cfg.sender_comp_id.as_bytes(), cfg.target_comp_id.as_bytes(), seq);
        for (tag, value) in extra {
            builder = builder.field(*tag, value.clone());
        }
        let frame = builder.build();
        entry.data.next_sent_seq += 1;

        let store_key = entry.protocol.store_key();
        if let Err(e) = self.store.record_sent(&store_key, seq) {
            tracing::warn!(error = %e, "failed to persist sent sequence number");
        }
        self.enqueue_outbound(session_id, frame);
    }

    /// Emit a `ResendRequest` for a gap opened on the business stream (spec
    /// §4.3, §6). Unlike iLink3's `RetransmitRequest508`, FIX's ResendRequest
    /// is itself a sequenced session message, so it goes through `fix_send`
    /// like any other outbound message rather than bypassing `next_sent_seq`.
    fn fix_send_resend_request(&mut self, session_id: SessionId, req: vg_retransmit::RetransmitRequest) {
        let end_seq_no = req.from + req.count - 1;
        self.fix_send(session_id, msg_type::RESEND_REQUEST, &[
            (tag::BEGIN_SEQ_NO, req.from.to_string().into_bytes()),
            (tag::END_SEQ_NO, end_seq_no.to_string().into_bytes()),
        ]);
    }

    pub(crate) fn fix_dispatch_inbound(&mut self, session_id: SessionId, now: NanoTime, view: &fix::MessageView<'_>) {
        let Some(msg_type_value) = view.msg_type() else { return };
        let seq = view.get_u64(tag::MSG_SEQ_NUM).unwrap_or(0);

        match msg_type_value {
            t if t == msg_type::LOGON => self.fix_on_logon(session_id, now),
            t if t == msg_type::LOGOUT => self.fix_on_logout(session_id, now),
            t if t == msg_type::HEARTBEAT || t == msg_type::TEST_REQUEST => {
                self.fix_reset_recv_timer(session_id, now);
            }
            t if t == msg_type::SEQUENCE_RESET => {
                if view.get(tag::GAP_FILL_FLAG) == Some(b"Y".as_slice()) {
                    if let Some(new_seq) = view.get_u64(tag::NEW_SEQ_NO) {
                        if let Some(entry) = self.sessions.get_mut(&session_id) {
                            entry.data.next_recv_seq = new_seq;
                        }
                    }
                }
                self.fix_reset_recv_timer(session_id, now);
            }
            t if t == msg_type::REJECT => {
                let library_id = self.sessions.get(&session_id).map(|e| e.library_id.clone()).unwrap_or_default();
                let text = view.get(tag::TEXT).map(|v| String::from_utf8_lossy(v).into_owned()).unwrap_or_default();
                self.error_consumer.on_error(&library_id, "SESSION_REJECT", now, &text);
                self.fix_reset_recv_timer(session_id, now);
            }
            t if t == msg_type::RESEND_REQUEST => {
                // Serving a resend requires the external message archive
                // (spec §6: "(externally) the message archive"), out of
                // scope for this crate.
                tracing::warn!(session_id = session_id.0, "ResendRequest received; serving retransmits requires the external archive");
                self.fix_reset_recv_timer(session_id, now);
            }
            _ => {
                let poss_dup = view.get(tag::POSS_DUP_FLAG) == Some(b"Y".as_slice());
                let guard_triggered = self.sessions.get(&session_id).map(|e| e.data.low_sequence_guard_triggered(seq, poss_dup)).unwrap_or(false);
                if guard_triggered {
                    self.on_protocol_violation(session_id, now, "LOW_SEQUENCE", format!("received seq {seq} below expected"));
                    return;
                }

                let outcome = match self.sessions.get_mut(&session_id) {
                    Some(entry) => crate::process_inbound_seq(&mut entry.data, seq, poss_dup),
                    None => return,
                };

                match outcome {
                    InboundSeqOutcome::Accepted => {
                        if let Some(entry) = self.sessions.get(&session_id) {
                            let store_key = entry.protocol.store_key();
                            if let Err(e) = self.store.record_received(&store_key, seq) {
                                tracing::warn!(error = %e, "failed to persist received sequence number");
                            }
                        }
                    }
                    InboundSeqOutcome::GapBuffered | InboundSeqOutcome::RetransmitProgress => {}
                    InboundSeqOutcome::GapOpened(req) => {
                        self.fix_send_resend_request(session_id, req);
                    }
                    InboundSeqOutcome::RetransmitCompleted { next_request } => {
                        if let Some(req) = next_request {
                            self.fix_send_resend_request(session_id, req);
                        }
                    }
                }

                self.fix_reset_recv_timer(session_id, now);
            }
        }
    }

    fn fix_on_logon(&mut self, session_id: SessionId, now: NanoTime) {
        let Some((role, state)) = self.sessions.get(&session_id).map(|e| (e.data.role, e.data.state)) else { return };

        if role == vg_session::Role::Acceptor && state == SessionState::Connecting {
            let heart_bt_int = match self.sessions.get(&session_id) {
                Some(e) => fix_config(&e.protocol).heart_bt_int,
                None => return,
            };
            self.fix_send(session_id, msg_type::LOGON, &[
                (tag::ENCRYPT_METHOD, b"0".to_vec()),
                (tag::HEART_BT_INT, heart_bt_int.to_string().into_bytes()),
            ]);
            if let Some(entry) = self.sessions.get_mut(&session_id) {
                entry.data.state = SessionState::Established;
            }
            self.schedule_keepalive_timers(session_id, now);
        } else {
            let Some(entry) = self.sessions.get_mut(&session_id) else { return };
            let (new_state, effects) = fix_fsm::transition(entry.data.state, Event::LogonAck, &mut entry.data.negotiate_attempts);
            entry.data.state = new_state;
            self.fix_apply_effects(session_id, now, effects);
        }
    }

    fn fix_on_logout(&mut self, session_id: SessionId, now: NanoTime) {
        let Some(entry) = self.sessions.get_mut(&session_id) else { return };
        let (state, effects) = fix_fsm::transition(entry.data.state, Event::PeerLogout, &mut entry.data.negotiate_attempts);
        entry.data.state = state;
        self.fix_apply_effects(session_id, now, effects);
    }

    fn fix_reset_recv_timer(&mut self, session_id: SessionId, now: NanoTime) {
        let interval_ms = match self.sessions.get(&session_id) {
            Some(e) => e.protocol.keep_alive_interval_ms(),
            None => return,
        };
        let timer = self.schedule_timer(session_id, now, TimerKind::KeepaliveRecv, interval_ms);
        if let Some(entry) = self.sessions.get_mut(&session_id) {
            if let Some(old) = entry.keepalive_recv_timer.replace(timer) {
                self.timers.cancel(old);
            }
        }
    }
}

