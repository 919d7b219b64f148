//! FIX 4.4 session-layer tag=value framing (spec §4.1, §6).
//!
//! Field separator is byte `0x01` ("SOH"). A frame runs from `8=FIX...` to
//! the checksum field `10=NNN` inclusive. The checksum is the decimal sum of
//! every byte up to and including the SOH that precedes the `10=` field,
//! modulo 256, rendered as three ASCII digits.

use crate::CodecError;

pub const SOH: u8 = 0x01;

/// Standard FIX session message type tags (35=).
pub mod msg_type {
    pub const LOGON: &[u8] = b"A";
    pub const LOGOUT: &[u8] = b"5";
    pub const HEARTBEAT: &[u8] = b"0";
    pub const TEST_REQUEST: &[u8] = b"1";
    pub const RESEND_REQUEST: &[u8] = b"2";
    pub const SEQUENCE_RESET: &[u8] = b"4";
    pub const REJECT: &[u8] = b"3";
}

/// Commonly-used tag numbers.
pub mod tag {
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const MSG_TYPE: u32 = 35;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const SENDING_TIME: u32 = 52;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const END_SEQ_NO: u32 = 16;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const GAP_FILL_FLAG: u32 = 123;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const REF_TAG_ID: u32 = 371;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const TEXT: u32 = 58;
    pub const CHECKSUM: u32 = 10;
}

/// A single decoded `tag=value` pair, borrowing its value from the input
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub tag: u32,
    pub value: &'a [u8],
}

/// A decoded FIX message: an ordered list of fields borrowing `raw`.
///
/// Must not outlive the buffer it was decoded from (spec §4.1).
#[derive(Debug, Clone)]
pub struct MessageView<'a> {
    pub raw: &'a [u8],
    fields: Vec<Field<'a>>,
}

impl<'a> MessageView<'a> {
    #[must_use]
    pub fn get(&self, tag: u32) -> Option<&'a [u8]> {
        self.fields.iter().find(|f| f.tag == tag).map(|f| f.value)
    }

    #[must_use]
    pub fn get_u64(&self, tag: u32) -> Option<u64> {
        self.get(tag).and_then(|v| std::str::from_utf8(v).ok()).and_then(|s| s.parse().ok())
    }

    #[must_use]
    pub fn msg_type(&self) -> Option<&'a [u8]> {
        self.get(tag::MSG_TYPE)
    }

    #[must_use]
    pub fn fields(&self) -> &[Field<'a>] {
        &self.fields
    }
}

/// Attempt to decode one framed message from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet contain a complete frame (the
/// caller should read more bytes and retry), `Ok(Some((view, consumed)))` on
/// success, or `Err` for a framing violation or checksum mismatch.
pub fn decode(buf: &[u8]) -> Result<Option<(MessageView<'_>, usize)>, CodecError> {
    // Need at least "8=x" + SOH to find BeginString.
    let Some(soh1) = find_soh(buf, 0) else {
        return Ok(None);
    };
    if !buf.starts_with(b"8=") {
        return Err(CodecError::Malformed("frame must start with tag 8 (BeginString)"));
    }

    let Some(soh2) = find_soh(buf, soh1 + 1) else {
        return Ok(None);
    };
    let body_length_field = &buf[soh1 + 1..soh2];
    if !body_length_field.starts_with(b"9=") {
        return Err(CodecError::Malformed("tag 9 (BodyLength) must follow tag 8"));
    }
    let body_len_str = std::str::from_utf8(&body_length_field[2..])
        .map_err(|_| CodecError::Malformed("BodyLength is not valid UTF-8"))?;
    let body_len: usize = body_len_str
        .parse()
        .map_err(|_| CodecError::Malformed("BodyLength is not a valid integer"))?;

    let body_start = soh2 + 1;
    let body_end = body_start + body_len;
    // Need enough bytes for the body plus the trailing "10=NNN\x01".
    if buf.len() < body_end + 7 {
        return Ok(None);
    }
    if buf[body_end] != b'1' || buf[body_end + 1] != b'0' || buf[body_end + 2] != b'=' {
        return Err(CodecError::Malformed("body length does not align with checksum field"));
    }
    let checksum_soh = body_end + 6;
    if buf[checksum_soh] != SOH {
        return Err(CodecError::Malformed("checksum field not SOH-terminated"));
    }
    let checksum_digits = &buf[body_end + 3..body_end + 6];
    let expected: u32 = std::str::from_utf8(checksum_digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CodecError::Malformed("checksum is not three ASCII digits"))?;

    let consumed = checksum_soh + 1;
    let computed = checksum_of(&buf[..body_end]);
    if computed != expected {
        return Err(CodecError::ChecksumMismatch { expected, computed });
    }

    let fields = split_fields(&buf[..consumed])?;
    Ok(Some((
        MessageView {
            raw: &buf[..consumed],
            fields,
        },
        consumed,
    )))
}

fn find_soh(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == SOH).map(|p| p + from)
}

/// Decimal sum of all bytes, modulo 256 (spec §6).
fn checksum_of(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc + u32::from(b)) % 256
}

fn split_fields(frame: &[u8]) -> Result<Vec<Field<'_>>, CodecError> {
    let mut fields = Vec::new();
    let mut start = 0;
    while start < frame.len() {
        let Some(soh) = find_soh(frame, start) else {
            return Err(CodecError::Malformed("field not SOH-terminated"));
        };
        let raw_field = &frame[start..soh];
        let eq = raw_field
            .iter()
            .position(|&b| b == b'=')
            .ok_or(CodecError::Malformed("field missing '='"))?;
        let tag: u32 = std::str::from_utf8(&raw_field[..eq])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(CodecError::Malformed("field tag is not numeric"))?;
        fields.push(Field {
            tag,
            value: &raw_field[eq + 1..],
        });
        start = soh + 1;
    }
    Ok(fields)
}

/// Encodes a FIX message body from ordered `(tag, value)` pairs, computing
/// BodyLength and checksum and writing `8=`/`9=`/`10=` around it.
///
/// `begin_string` is written verbatim as the BeginString value (e.g.
/// `b"FIX.4.4"`).
pub fn encode(begin_string: &[u8], body_fields: &[(u32, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (tag, value) in body_fields {
        body.extend_from_slice(tag.to_string().as_bytes());
        body.push(b'=');
        body.extend_from_slice(value);
        body.push(SOH);
    }

    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(b"8=");
    out.extend_from_slice(begin_string);
    out.push(SOH);
    out.extend_from_slice(b"9=");
    out.extend_from_slice(body.len().to_string().as_bytes());
    out.push(SOH);
    out.extend_from_slice(&body);

    let checksum = checksum_of(&out);
    out.extend_from_slice(b"10=");
    out.extend_from_slice(format!("{checksum:03}").as_bytes());
    out.push(SOH);
    out
}

/// Helper builder for a session-layer message with the common header tags
/// filled in, so call sites only specify type-specific fields.
pub struct SessionMessageBuilder<'a> {
    begin_string: &'a [u8],
    msg_type: &'a [u8],
    sender_comp_id: &'a [u8],
    target_comp_id: &'a [u8],
    msg_seq_num: u64,
    extra: Vec<(u32, Vec<u8>)>,
}

impl<'a> SessionMessageBuilder<'a> {
    #[must_use]
    pub fn new(
        begin_string: &'a [u8],
        msg_type: &'a [u8],
        sender_comp_id: &'a [u8],
        target_comp_id: &'a [u8],
        msg_seq_num: u64,
    ) -> Self {
        SessionMessageBuilder {
            begin_string,
            msg_type,
            sender_comp_id,
            target_comp_id,
            msg_seq_num,
            extra: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, tag: u32, value: impl Into<Vec<u8>>) -> Self {
        self.extra.push((tag, value.into()));
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let seq = self.msg_seq_num.to_string();
        let mut fields: Vec<(u32, &[u8])> = vec![
            (tag::MSG_TYPE, self.msg_type),
            (tag::SENDER_COMP_ID, self.sender_comp_id),
            (tag::TARGET_COMP_ID, self.target_comp_id),
            (tag::MSG_SEQ_NUM, seq.as_bytes()),
        ];
        for (t, v) in &self.extra {
            fields.push((*t, v.as_slice()));
        }
        encode(self.begin_string, &fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logon_frame() -> Vec<u8> {
        SessionMessageBuilder::new(b"FIX.4.4", msg_type::LOGON, b"INITIATOR", b"ACCEPTOR", 1)
            .field(tag::ENCRYPT_METHOD, "0")
            .field(tag::HEART_BT_INT, "30")
            .build()
    }

    #[test]
    fn round_trip_logon() {
        let frame = logon_frame();
        let (view, consumed) = decode(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(view.msg_type(), Some(msg_type::LOGON));
        assert_eq!(view.get_u64(tag::MSG_SEQ_NUM), Some(1));
        assert_eq!(view.get(tag::HEART_BT_INT), Some(b"30".as_slice()));
    }

    #[test]
    fn incomplete_frame_requests_more_bytes() {
        let frame = logon_frame();
        let partial = &frame[..frame.len() - 5];
        assert_eq!(decode(partial).unwrap(), None);
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let mut frame = logon_frame();
        let last_digit = frame.len() - 2;
        frame[last_digit] = if frame[last_digit] == b'9' { b'0' } else { b'9' };
        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, CodecError::ChecksumMismatch { .. }));
    }

    #[test]
    fn missing_begin_string_is_malformed() {
        let err = decode(b"35=A\x0110=000\x01").unwrap_err();
        assert_eq!(err, CodecError::Malformed("frame must start with tag 8 (BeginString)"));
    }

    #[test]
    fn two_frames_back_to_back_decode_independently() {
        let mut buf = logon_frame();
        let first_len = buf.len();
        buf.extend_from_slice(&logon_frame());

        let (_, consumed1) = decode(&buf).unwrap().unwrap();
        assert_eq!(consumed1, first_len);
        let (_, consumed2) = decode(&buf[consumed1..]).unwrap().unwrap();
        assert_eq!(consumed2, first_len);
    }
}
