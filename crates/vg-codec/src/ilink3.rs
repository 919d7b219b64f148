//! iLink3-style binary SBE framing (spec §4.1, §6).
//!
//! Header: `{ blockLength: u16, templateId: u16, schemaId: u16, version: u16 }`,
//! little-endian, followed by the body. All fixed-width integer fields in
//! this module are little-endian, decoded by hand with
//! `from_le_bytes`/`to_le_bytes` rather than pulling in a binary-codec crate
//! (`ipico-core` decodes its own fixed-width fields the same way rather than
//! reaching for `byteorder`).
//!
//! One deliberate, documented departure from a byte-exact vendor wire format:
//! every template body carries a leading one-byte flags field (bit 0 =
//! `is_retransmit`, spec §4.3 "Each retransmitted message bears an
//! 'is_retransmit' flag") immediately after the SBE header, since this spec
//! does not pin a specific exchange's literal byte layout — only the header
//! shape and template catalogue (see `DESIGN.md`).

use crate::CodecError;

pub const SCHEMA_ID: u16 = 1;
pub const VERSION: u16 = 1;
const HEADER_LEN: usize = 8;

pub mod template_id {
    pub const NEGOTIATE: u16 = 500;
    pub const NEGOTIATE_RESPONSE: u16 = 501;
    pub const NEGOTIATE_REJECT: u16 = 502;
    pub const ESTABLISH: u16 = 503;
    pub const ESTABLISHMENT_ACK: u16 = 504;
    pub const ESTABLISHMENT_REJECT: u16 = 505;
    pub const SEQUENCE: u16 = 506;
    pub const TERMINATE: u16 = 507;
    pub const RETRANSMIT_REQUEST: u16 = 508;
    pub const RETRANSMIT: u16 = 509;
    pub const RETRANSMIT_REJECT: u16 = 510;
    pub const NOT_APPLIED: u16 = 513;
    pub const NEW_ORDER_SINGLE: u16 = 514;
    pub const EXECUTION_REPORT_STATUS: u16 = 532;
}

/// The 8-byte SBE header common to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub block_length: u16,
    pub template_id: u16,
    pub schema_id: u16,
    pub version: u16,
}

impl Header {
    fn decode(buf: &[u8]) -> Header {
        Header {
            block_length: u16::from_le_bytes([buf[0], buf[1]]),
            template_id: u16::from_le_bytes([buf[2], buf[3]]),
            schema_id: u16::from_le_bytes([buf[4], buf[5]]),
            version: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    fn encode(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.block_length.to_le_bytes());
        out.extend_from_slice(&self.template_id.to_le_bytes());
        out.extend_from_slice(&self.schema_id.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
    }
}

macro_rules! impl_fixed_rw {
    ($ty:ty, $read:ident, $write:ident, $width:expr) => {
        fn $read(buf: &[u8], at: usize) -> $ty {
            let mut b = [0u8; $width];
            b.copy_from_slice(&buf[at..at + $width]);
            <$ty>::from_le_bytes(b)
        }
        fn $write(out: &mut Vec<u8>, v: $ty) {
            out.extend_from_slice(&v.to_le_bytes());
        }
    };
}
impl_fixed_rw!(u64, read_u64, write_u64, 8);
impl_fixed_rw!(u32, read_u32, write_u32, 4);

fn read_u8(buf: &[u8], at: usize) -> u8 {
    buf[at]
}

fn write_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (width - n), 0);
}

fn read_fixed_str(buf: &[u8], at: usize, width: usize) -> String {
    let raw = &buf[at..at + width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

const SESSION_ID_WIDTH: usize = 20;
const FIRM_ID_WIDTH: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiate500 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub session_id: String,
    pub firm_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateResponse501 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub previous_uuid: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateReject502 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub reject_reason: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Establish503 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub session_id: String,
    pub firm_id: String,
    pub keep_alive_interval_ms: u32,
    pub next_seq_no: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentAck504 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub next_seq_no: u64,
    pub previous_seq_no: u64,
    pub previous_uuid: u64,
    pub keep_alive_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishmentReject505 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub next_seq_no: u64,
    pub reject_reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence506 {
    pub uuid: u64,
    pub next_seq_no: u64,
    pub lapsed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminate507 {
    pub uuid: u64,
    pub request_timestamp: u64,
    pub reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest508 {
    pub uuid: u64,
    pub last_uuid: u64,
    pub request_timestamp: u64,
    pub from_seq_no: u64,
    pub msg_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmit509 {
    pub uuid: u64,
    pub last_uuid: u64,
    pub request_timestamp: u64,
    pub from_seq_no: u64,
    pub msg_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitReject510 {
    pub uuid: u64,
    pub last_uuid: u64,
    pub request_timestamp: u64,
    pub from_seq_no: u64,
    pub reject_reason: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotApplied513 {
    pub uuid: u64,
    pub from_seq_no: u64,
    pub msg_count: u32,
}

/// An application-layer (non-session) template, passed through to the
/// Library unparsed (spec §4.1). `seq` is the business-level message
/// sequence number the Retransmit Engine (C6) tracks gaps against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplicationView<'a> {
    pub template_id: u16,
    pub seq: u64,
    pub is_retransmit: bool,
    pub body: &'a [u8],
}

/// A decoded iLink3 frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message<'a> {
    Negotiate(Negotiate500),
    NegotiateResponse(NegotiateResponse501),
    NegotiateReject(NegotiateReject502),
    Establish(Establish503),
    EstablishmentAck(EstablishmentAck504),
    EstablishmentReject(EstablishmentReject505),
    Sequence(Sequence506),
    Terminate(Terminate507),
    RetransmitRequest(RetransmitRequest508),
    Retransmit(Retransmit509),
    RetransmitReject(RetransmitReject510),
    NotApplied(NotApplied513),
    Application(ApplicationView<'a>),
}

impl<'a> Message<'a> {
    /// Whether this frame was tagged as part of a retransmit fill
    /// (spec §4.3). Session-handshake templates are never retransmit fill.
    #[must_use]
    pub fn is_retransmit(&self) -> bool {
        matches!(self, Message::Application(a) if a.is_retransmit)
    }
}

/// Attempt to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed.
pub fn decode(buf: &[u8]) -> Result<Option<(Message<'_>, usize)>, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = Header::decode(buf);
    let total_len = HEADER_LEN + header.block_length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }
    if header.block_length < 1 {
        return Err(CodecError::Malformed("block length too small for flags byte"));
    }
    let body = &buf[HEADER_LEN..total_len];
    let is_retransmit = body[0] & 1 != 0;
    let rest = &body[1..];

    let msg = match header.template_id {
        template_id::NEGOTIATE => {
            expect_len(rest, 8 + 8 + SESSION_ID_WIDTH + FIRM_ID_WIDTH)?;
            Message::Negotiate(Negotiate500 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                session_id: read_fixed_str(rest, 16, SESSION_ID_WIDTH),
                firm_id: read_fixed_str(rest, 16 + SESSION_ID_WIDTH, FIRM_ID_WIDTH),
            })
        }
        template_id::NEGOTIATE_RESPONSE => {
            expect_len(rest, 24)?;
            Message::NegotiateResponse(NegotiateResponse501 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                previous_uuid: read_u64(rest, 16),
            })
        }
        template_id::NEGOTIATE_REJECT => {
            expect_len(rest, 17)?;
            Message::NegotiateReject(NegotiateReject502 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                reject_reason: read_u8(rest, 16),
            })
        }
        template_id::ESTABLISH => {
            expect_len(rest, 8 + 8 + SESSION_ID_WIDTH + FIRM_ID_WIDTH + 4 + 8)?;
            let session_id = read_fixed_str(rest, 16, SESSION_ID_WIDTH);
            let firm_id = read_fixed_str(rest, 16 + SESSION_ID_WIDTH, FIRM_ID_WIDTH);
            let after_ids = 16 + SESSION_ID_WIDTH + FIRM_ID_WIDTH;
            Message::Establish(Establish503 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                session_id,
                firm_id,
                keep_alive_interval_ms: read_u32(rest, after_ids),
                next_seq_no: read_u64(rest, after_ids + 4),
            })
        }
        template_id::ESTABLISHMENT_ACK => {
            expect_len(rest, 44)?;
            Message::EstablishmentAck(EstablishmentAck504 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                next_seq_no: read_u64(rest, 16),
                previous_seq_no: read_u64(rest, 24),
                previous_uuid: read_u64(rest, 32),
                keep_alive_interval_ms: read_u32(rest, 40),
            })
        }
        template_id::ESTABLISHMENT_REJECT => {
            expect_len(rest, 25)?;
            Message::EstablishmentReject(EstablishmentReject505 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                next_seq_no: read_u64(rest, 16),
                reject_reason: read_u8(rest, 24),
            })
        }
        template_id::SEQUENCE => {
            expect_len(rest, 17)?;
            Message::Sequence(Sequence506 {
                uuid: read_u64(rest, 0),
                next_seq_no: read_u64(rest, 8),
                lapsed: read_u8(rest, 16) != 0,
            })
        }
        template_id::TERMINATE => {
            expect_len(rest, 17)?;
            Message::Terminate(Terminate507 {
                uuid: read_u64(rest, 0),
                request_timestamp: read_u64(rest, 8),
                reason: read_u8(rest, 16),
            })
        }
        template_id::RETRANSMIT_REQUEST => {
            expect_len(rest, 36)?;
            Message::RetransmitRequest(RetransmitRequest508 {
                uuid: read_u64(rest, 0),
                last_uuid: read_u64(rest, 8),
                request_timestamp: read_u64(rest, 16),
                from_seq_no: read_u64(rest, 24),
                msg_count: read_u32(rest, 32),
            })
        }
        template_id::RETRANSMIT => {
            expect_len(rest, 36)?;
            Message::Retransmit(Retransmit509 {
                uuid: read_u64(rest, 0),
                last_uuid: read_u64(rest, 8),
                request_timestamp: read_u64(rest, 16),
                from_seq_no: read_u64(rest, 24),
                msg_count: read_u32(rest, 32),
            })
        }
        template_id::RETRANSMIT_REJECT => {
            expect_len(rest, 33)?;
            Message::RetransmitReject(RetransmitReject510 {
                uuid: read_u64(rest, 0),
                last_uuid: read_u64(rest, 8),
                request_timestamp: read_u64(rest, 16),
                from_seq_no: read_u64(rest, 24),
                reject_reason: read_u8(rest, 32),
            })
        }
        template_id::NOT_APPLIED => {
            expect_len(rest, 20)?;
            Message::NotApplied(NotApplied513 {
                uuid: read_u64(rest, 0),
                from_seq_no: read_u64(rest, 8),
                msg_count: read_u32(rest, 16),
            })
        }
        template_id::NEW_ORDER_SINGLE | template_id::EXECUTION_REPORT_STATUS => {
            if rest.len() < 8 {
                return Err(CodecError::Malformed("application body too short for seq"));
            }
            Message::Application(ApplicationView {
                template_id: header.template_id,
                seq: read_u64(rest, 0),
                is_retransmit,
                body: &rest[8..],
            })
        }
        other => return Err(CodecError::UnknownTemplate(other)),
    };

    Ok(Some((msg, total_len)))
}

fn expect_len(rest: &[u8], expected: usize) -> Result<(), CodecError> {
    if rest.len() != expected {
        return Err(CodecError::Malformed("body length does not match template"));
    }
    Ok(())
}

fn frame(template_id: u16, is_retransmit: bool, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut payload = vec![is_retransmit as u8];
    body(&mut payload);
    let header = Header {
        block_length: payload.len() as u16,
        template_id,
        schema_id: SCHEMA_ID,
        version: VERSION,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

pub fn encode_negotiate(msg: &Negotiate500) -> Vec<u8> {
    frame(template_id::NEGOTIATE, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        write_fixed_str(b, &msg.session_id, SESSION_ID_WIDTH);
        write_fixed_str(b, &msg.firm_id, FIRM_ID_WIDTH);
    })
}

pub fn encode_negotiate_response(msg: &NegotiateResponse501) -> Vec<u8> {
    frame(template_id::NEGOTIATE_RESPONSE, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.previous_uuid);
    })
}

pub fn encode_negotiate_reject(msg: &NegotiateReject502) -> Vec<u8> {
    frame(template_id::NEGOTIATE_REJECT, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        b.push(msg.reject_reason);
    })
}

pub fn encode_establish(msg: &Establish503) -> Vec<u8> {
    frame(template_id::ESTABLISH, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        write_fixed_str(b, &msg.session_id, SESSION_ID_WIDTH);
        write_fixed_str(b, &msg.firm_id, FIRM_ID_WIDTH);
        write_u32(b, msg.keep_alive_interval_ms);
        write_u64(b, msg.next_seq_no);
    })
}

pub fn encode_establishment_ack(msg: &EstablishmentAck504) -> Vec<u8> {
    frame(template_id::ESTABLISHMENT_ACK, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.next_seq_no);
        write_u64(b, msg.previous_seq_no);
        write_u64(b, msg.previous_uuid);
        write_u32(b, msg.keep_alive_interval_ms);
    })
}

pub fn encode_establishment_reject(msg: &EstablishmentReject505) -> Vec<u8> {
    frame(template_id::ESTABLISHMENT_REJECT, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.next_seq_no);
        b.push(msg.reject_reason);
    })
}

pub fn encode_sequence(msg: &Sequence506) -> Vec<u8> {
    frame(template_id::SEQUENCE, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.next_seq_no);
        b.push(msg.lapsed as u8);
    })
}

pub fn encode_terminate(msg: &Terminate507) -> Vec<u8> {
    frame(template_id::TERMINATE, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.request_timestamp);
        b.push(msg.reason);
    })
}

pub fn encode_retransmit_request(msg: &RetransmitRequest508) -> Vec<u8> {
    frame(template_id::RETRANSMIT_REQUEST, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.last_uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.from_seq_no);
        write_u32(b, msg.msg_count);
    })
}

pub fn encode_retransmit(msg: &Retransmit509) -> Vec<u8> {
    frame(template_id::RETRANSMIT, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.last_uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.from_seq_no);
        write_u32(b, msg.msg_count);
    })
}

pub fn encode_retransmit_reject(msg: &RetransmitReject510) -> Vec<u8> {
    frame(template_id::RETRANSMIT_REJECT, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.last_uuid);
        write_u64(b, msg.request_timestamp);
        write_u64(b, msg.from_seq_no);
        b.push(msg.reject_reason);
    })
}

pub fn encode_not_applied(msg: &NotApplied513) -> Vec<u8> {
    frame(template_id::NOT_APPLIED, false, |b| {
        write_u64(b, msg.uuid);
        write_u64(b, msg.from_seq_no);
        write_u32(b, msg.msg_count);
    })
}

/// Encode an application-layer frame, e.g. a retransmitted execution report,
/// carrying the message `seq` and the `is_retransmit` flag the retransmit
/// engine relies on.
pub fn encode_application(template_id: u16, seq: u64, is_retransmit: bool, body: &[u8]) -> Vec<u8> {
    frame(template_id, is_retransmit, |b| {
        write_u64(b, seq);
        b.extend_from_slice(body);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_negotiate() {
        let msg = Negotiate500 {
            uuid: 42,
            request_timestamp: 123_456,
            session_id: "SESSION-A".to_owned(),
            firm_id: "FIRM-X".to_owned(),
        };
        let frame = encode_negotiate(&msg);
        let (decoded, consumed) = decode(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, Message::Negotiate(msg));
    }

    #[test]
    fn round_trip_sequence_lapsed() {
        let msg = Sequence506 {
            uuid: 7,
            next_seq_no: 99,
            lapsed: true,
        };
        let frame = encode_sequence(&msg);
        let (decoded, _) = decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, Message::Sequence(msg));
    }

    #[test]
    fn application_frame_carries_seq_and_retransmit_flag() {
        let frame = encode_application(template_id::EXECUTION_REPORT_STATUS, 5000, true, b"payload");
        let (decoded, _) = decode(&frame).unwrap().unwrap();
        match decoded {
            Message::Application(view) => {
                assert!(view.is_retransmit);
                assert_eq!(view.seq, 5000);
                assert_eq!(view.body, b"payload");
            }
            other => panic!("expected Application, got {other:?}"),
        }
    }

    #[test]
    fn unknown_template_id_errors() {
        let header = Header {
            block_length: 1,
            template_id: 9999,
            schema_id: SCHEMA_ID,
            version: VERSION,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        buf.push(0);
        assert_eq!(decode(&buf).unwrap_err(), CodecError::UnknownTemplate(9999));
    }

    #[test]
    fn partial_header_requests_more_bytes() {
        assert_eq!(decode(&[1, 2, 3]).unwrap(), None);
    }
}
