//! Wires a [`vg_framer::Framer`] to the configured FIX/iLink3 sessions and to
//! whatever Library connections are attached, and drives both on every
//! `duty_cycle()` (spec §4.6/§4.7).
//!
//! Session ownership in `vg_framer::Framer` is not yet split per Library (every
//! session is created under `FramerConfig::default_library_id`); `REQUEST_SESSION`/
//! `RELEASE_SESSION` answer from the Framer's live session table
//! (`Framer::session_snapshot`) rather than by actually reassigning ownership
//! inside the Framer. Documented in `DESIGN.md` as a known simplification,
//! not a silent gap.

use vg_channel::ChannelSupplier;
use vg_clock::{NanoTime, SharedClock};
use vg_engine_protocol::{
    DisconnectReason, EngineMessage, EngineTransport, LibraryMessage, LibraryStatus, ProtocolName,
    SessionId as WireSessionId, SessionSnapshot,
};
use vg_framer::{
    AdminRequest, AdminReplyValue, ErrorConsumer, Framer, FramerConfig, FixConfig, Ilink3Config, ProtocolConfig, ProtocolKind,
};
use vg_reply::ReplyState;
use vg_sequence_store::SequenceStore;
use vg_session::SessionId as InternalSessionId;

use crate::config::{EngineConfig, SessionRole};
use crate::metrics::Counters;

struct LibraryConnection {
    transport: Box<dyn EngineTransport>,
    library_id: Option<String>,
    last_heartbeat_nanos: NanoTime,
    connected: bool,
}

pub struct EngineRuntime {
    framer: Framer,
    clock: SharedClock,
    config: EngineConfig,
    libraries: Vec<LibraryConnection>,
    metrics: Counters,
}

impl EngineRuntime {
    /// Build the Framer from `config`, bind/initiate every configured
    /// session, and return a runtime ready to `duty_cycle()`.
    pub fn start(
        config: EngineConfig,
        clock: SharedClock,
        supplier: Box<dyn ChannelSupplier>,
        store: SequenceStore,
        error_consumer: Box<dyn ErrorConsumer>,
    ) -> Self {
        let framer_config = FramerConfig {
            reply_timeout_ms: config.reply_timeout_ms,
            negotiate_resend_max: config.negotiate_resend_max,
            retransmit_batch_max: config.retransmit_batch_max,
            max_inflight_replies: config.max_inflight_replies,
            default_library_id: config.default_library_id.clone(),
        };
        let mut framer = Framer::new(clock.clone(), supplier, store, error_consumer, framer_config);

        for session in &config.fix_sessions {
            let protocol = ProtocolConfig::Fix(FixConfig {
                begin_string: session.begin_string.clone().into_bytes(),
                sender_comp_id: session.sender_comp_id.clone(),
                target_comp_id: session.target_comp_id.clone(),
                heart_bt_int: session.heart_bt_int,
            });
            submit_session(&mut framer, &session.endpoint.address, session.endpoint.role, protocol, config.reply_timeout_ms);
        }

        for session in &config.ilink3_sessions {
            let protocol = ProtocolConfig::Ilink3(Ilink3Config {
                session_id: session.session_id.clone(),
                firm_id: session.firm_id.clone(),
                keep_alive_interval_ms: session.keep_alive_interval_ms,
            });
            submit_session(&mut framer, &session.endpoint.address, session.endpoint.role, protocol, config.reply_timeout_ms);
        }

        EngineRuntime { framer, clock, config, libraries: Vec::new(), metrics: Counters::new() }
    }

    /// Register a newly-accepted Library connection; it is tracked as
    /// unauthenticated (no `library_id`) until its first `CONNECT`.
    pub fn attach_library(&mut self, transport: Box<dyn EngineTransport>) {
        let now = self.clock.now_nanos();
        self.libraries.push(LibraryConnection { transport, library_id: None, last_heartbeat_nanos: now, connected: false });
    }

    #[must_use]
    pub fn metrics(&self) -> Counters {
        self.metrics
    }

    /// One iteration: drive the Framer, drain every Library transport, and
    /// evict libraries that have gone quiet past `library_timeout_ms` (spec
    /// §4.7: "absence triggers `DISCONNECT` of all its sessions").
    pub fn duty_cycle(&mut self) -> bool {
        let mut work = self.framer.duty_cycle();
        let now = self.clock.now_nanos();
        let timeout_nanos = self.config.library_timeout_ms.saturating_mul(1_000_000);

        for library in &mut self.libraries {
            loop {
                match library.transport.try_recv() {
                    Ok(Some(message)) => {
                        work = true;
                        Self::handle_library_message(library, message, now, &self.framer, &mut self.metrics);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        library.connected = false;
                        break;
                    }
                }
            }

            if library.connected && now.saturating_sub(library.last_heartbeat_nanos) > timeout_nanos {
                tracing::warn!(library_id = library.library_id.as_deref().unwrap_or("?"), "library heartbeat timed out");
                library.connected = false;
                self.metrics.libraries_timed_out += 1;
                let _ = library.transport.send(&EngineMessage::ControlNotification { libraries: Vec::new() });
            }
        }

        self.libraries.retain(|library| library.connected || library.library_id.is_none());
        work
    }

    fn handle_library_message(library: &mut LibraryConnection, message: LibraryMessage, now: NanoTime, framer: &Framer, metrics: &mut Counters) {
        match message {
            LibraryMessage::Connect { library_id } => {
                tracing::info!(library_id, "library connected");
                library.connected = true;
                library.last_heartbeat_nanos = now;
                library.library_id = Some(library_id);
                metrics.libraries_connected += 1;
            }
            LibraryMessage::ApplicationHeartbeat { library_id } => {
                library.last_heartbeat_nanos = now;
                tracing::debug!(library_id, "application heartbeat");
            }
            LibraryMessage::RequestSession { session_id } => {
                metrics.sessions_requested += 1;
                let snapshot = match framer.session_snapshot(InternalSessionId(session_id.0)) {
                    Some(live) => SessionSnapshot {
                        session_id: WireSessionId(live.session_id.0),
                        protocol: match live.protocol {
                            ProtocolKind::Fix => ProtocolName::Fix,
                            ProtocolKind::Ilink3 => ProtocolName::Ilink3,
                        },
                        state: format!("{:?}", live.state),
                        next_sent_seq: live.next_sent_seq,
                        next_recv_seq: live.next_recv_seq,
                    },
                    None => SessionSnapshot {
                        session_id: WireSessionId(session_id.0),
                        protocol: ProtocolName::Fix,
                        state: "UNKNOWN".to_owned(),
                        next_sent_seq: 0,
                        next_recv_seq: 0,
                    },
                };
                let _ = library.transport.send(&EngineMessage::ManageSession { session_id, snapshot });
            }
            LibraryMessage::ReleaseSession { session_id } => {
                metrics.sessions_released += 1;
                let _ = library.transport.send(&EngineMessage::ReleaseComplete { session_id });
            }
        }
    }

    /// Build the `[libraryId]` snapshot for a `CONTROL_NOTIFICATION` push
    /// (spec §4.7); callers decide when to broadcast it (e.g. after a
    /// session transitions).
    #[must_use]
    pub fn library_status_snapshot(&self) -> Vec<LibraryStatus> {
        self.libraries
            .iter()
            .filter_map(|library| {
                library.library_id.clone().map(|library_id| LibraryStatus {
                    library_id,
                    connected: library.connected,
                    owned_sessions: Vec::new(),
                })
            })
            .collect()
    }

    /// Begin graceful shutdown: ask the Framer to log out every session and
    /// tell every connected Library the engine is going away.
    pub fn begin_close(&mut self) {
        self.framer.begin_close();
        for library in &mut self.libraries {
            if library.connected {
                let _ = library.transport.send(&EngineMessage::Disconnect {
                    session_id: WireSessionId(0),
                    reason: DisconnectReason::EngineShuttingDown,
                });
            }
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.framer.is_idle()
    }
}

fn submit_session(framer: &mut Framer, address: &str, role: SessionRole, protocol: ProtocolConfig, reply_timeout_ms: u64) {
    let reply = match role {
        SessionRole::Acceptor => framer.submit(AdminRequest::Bind { protocol, addr: address.to_owned() }),
        SessionRole::Initiator => framer.submit(AdminRequest::Initiate { protocol, target: address.to_owned(), timeout_ms: reply_timeout_ms }),
    };
    match reply {
        Some(reply) => log_session_reply(&reply.poll(), address),
        None => tracing::error!(address, "reply inbox full while starting configured session"),
    }
}

fn log_session_reply(state: &ReplyState<AdminReplyValue>, address: &str) {
    match state {
        ReplyState::Pending => tracing::debug!(address, "session start request submitted"),
        ReplyState::Completed(_) => tracing::info!(address, "session start accepted"),
        ReplyState::Errored(message) => tracing::error!(address, message, "session start failed"),
        ReplyState::TimedOut => tracing::error!(address, "session start request timed out"),
    }
}

