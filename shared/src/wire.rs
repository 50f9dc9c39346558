//! Binary wire format for messages crossing a transport tier boundary.
//!
//! Fixed 152-byte header followed by the payload, all integers in
//! network byte order. Mirrors the teacher's `message_utils` helpers in
//! `core::communication` (which serialized through `serde_json` instead)
//! but now speaks the fixed-layout frame the fabric's non-Rust peers and
//! the mmap/flat-file tiers need.

use crate::ids::MessageId;
use crate::model::{Pattern, Priority};

pub const MAGIC: [u8; 4] = *b"PLAN";
pub const VERSION: u16 = 0x0100;

const FLAG_REQUIRES_ACK: u16 = 1 << 0;
const FLAG_CRITICAL: u16 = 1 << 1;
const FLAG_HMAC_PRESENT: u16 = 1 << 2;
const RESERVED_FLAGS_MASK: u16 = !(FLAG_REQUIRES_ACK | FLAG_CRITICAL | FLAG_HMAC_PRESENT);

const NAME_FIELD_LEN: usize = 16;
const CONTENT_TYPE_FIELD_LEN: usize = 32;
const HMAC_LEN: usize = 32;

pub const HEADER_LEN: usize = 152;

/// Sentinel target-name bytes meaning "every subscriber" (spec.md §6).
pub const BROADCAST_TARGET: [u8; NAME_FIELD_LEN] = [0xFF; NAME_FIELD_LEN];

/// A decoded wire frame. `source_name`/`target_name` are truncated to
/// [`NAME_FIELD_LEN`] bytes on encode; callers with longer names must
/// resolve them to a short alias before putting a message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub requires_ack: bool,
    pub critical: bool,
    pub timestamp_ns: u64,
    pub message_id: MessageId,
    pub correlation_id: Option<MessageId>,
    pub source_name: String,
    /// `None` represents the broadcast sentinel target.
    pub target_name: Option<String>,
    pub pattern: Pattern,
    pub priority: Priority,
    pub content_type: String,
    pub hmac: Option<[u8; HMAC_LEN]>,
    pub payload: Vec<u8>,
}

fn pack_ascii_field(s: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack_ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn pattern_to_u16(pattern: Pattern) -> u16 {
    match pattern {
        Pattern::RequestResponse => 1,
        Pattern::Publish => 2,
        Pattern::WorkQueue => 3,
        Pattern::Broadcast => 4,
        Pattern::Multicast => 5,
    }
}

fn pattern_from_u16(v: u16) -> Result<Pattern, crate::error::CoreError> {
    match v {
        1 => Ok(Pattern::RequestResponse),
        2 => Ok(Pattern::Publish),
        3 => Ok(Pattern::WorkQueue),
        4 => Ok(Pattern::Broadcast),
        5 => Ok(Pattern::Multicast),
        other => Err(crate::error::CoreError::UnknownPattern(other.to_string())),
    }
}

fn priority_to_u16(priority: Priority) -> u16 {
    match priority {
        Priority::Critical => 0,
        Priority::High => 1,
        Priority::Normal => 2,
        Priority::Low => 3,
        Priority::Batch => 4,
    }
}

fn priority_from_u16(v: u16) -> Result<Priority, crate::error::CoreError> {
    match v {
        0 => Ok(Priority::Critical),
        1 => Ok(Priority::High),
        2 => Ok(Priority::Normal),
        3 => Ok(Priority::Low),
        4 => Ok(Priority::Batch),
        other => Err(crate::error::CoreError::MalformedMessage(format!(
            "unknown priority tag {other}"
        ))),
    }
}

/// Encode a frame to its wire representation. The HMAC field is only
/// written (and `hmac_present` only set) when `frame.hmac` is `Some`.
pub fn encode(frame: &WireFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + frame.payload.len());

    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());

    let mut flags = 0u16;
    if frame.requires_ack {
        flags |= FLAG_REQUIRES_ACK;
    }
    if frame.critical {
        flags |= FLAG_CRITICAL;
    }
    if frame.hmac.is_some() {
        flags |= FLAG_HMAC_PRESENT;
    }
    out.extend_from_slice(&flags.to_be_bytes());

    out.extend_from_slice(&frame.timestamp_ns.to_be_bytes());
    out.extend_from_slice(&frame.message_id.to_bytes());
    out.extend_from_slice(&frame.correlation_id.map(|c| c.to_bytes()).unwrap_or([0u8; 16]));
    out.extend_from_slice(&pack_ascii_field(&frame.source_name, NAME_FIELD_LEN));
    match &frame.target_name {
        Some(name) => out.extend_from_slice(&pack_ascii_field(name, NAME_FIELD_LEN)),
        None => out.extend_from_slice(&BROADCAST_TARGET),
    }
    out.extend_from_slice(&pattern_to_u16(frame.pattern).to_be_bytes());
    out.extend_from_slice(&priority_to_u16(frame.priority).to_be_bytes());
    out.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&pack_ascii_field(&frame.content_type, CONTENT_TYPE_FIELD_LEN));
    out.extend_from_slice(&frame.hmac.unwrap_or([0u8; HMAC_LEN]));

    debug_assert_eq!(out.len(), HEADER_LEN);
    out.extend_from_slice(&frame.payload);
    out
}

/// Decode a frame, rejecting bad magic/version/length and nonzero
/// reserved flag bits per spec.md §6.
pub fn decode(bytes: &[u8]) -> Result<WireFrame, crate::error::CoreError> {
    if bytes.len() < HEADER_LEN {
        return Err(crate::error::CoreError::MalformedWire);
    }
    if bytes[0..4] != MAGIC {
        return Err(crate::error::CoreError::MalformedWire);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(crate::error::CoreError::MalformedWire);
    }

    let flags = u16::from_be_bytes([bytes[6], bytes[7]]);
    if flags & RESERVED_FLAGS_MASK != 0 {
        return Err(crate::error::CoreError::MalformedWire);
    }
    let requires_ack = flags & FLAG_REQUIRES_ACK != 0;
    let critical = flags & FLAG_CRITICAL != 0;
    let hmac_present = flags & FLAG_HMAC_PRESENT != 0;

    let timestamp_ns = u64::from_be_bytes(bytes[8..16].try_into().unwrap());

    let message_id = MessageId::from_bytes(bytes[16..32].try_into().unwrap());
    let correlation_bytes: [u8; 16] = bytes[32..48].try_into().unwrap();
    let correlation_id = if correlation_bytes == [0u8; 16] {
        None
    } else {
        Some(MessageId::from_bytes(correlation_bytes))
    };

    let source_name = unpack_ascii_field(&bytes[48..64]);
    let target_field: [u8; 16] = bytes[64..80].try_into().unwrap();
    let target_name = if target_field == BROADCAST_TARGET {
        None
    } else {
        Some(unpack_ascii_field(&target_field))
    };

    let pattern = pattern_from_u16(u16::from_be_bytes([bytes[80], bytes[81]]))?;
    let priority = priority_from_u16(u16::from_be_bytes([bytes[82], bytes[83]]))?;

    let payload_len = u32::from_be_bytes(bytes[84..88].try_into().unwrap()) as usize;
    let content_type = unpack_ascii_field(&bytes[88..120]);

    let hmac = if hmac_present {
        let mut tag = [0u8; HMAC_LEN];
        tag.copy_from_slice(&bytes[120..152]);
        Some(tag)
    } else {
        None
    };

    let payload_start = HEADER_LEN;
    let payload_end = payload_start
        .checked_add(payload_len)
        .ok_or(crate::error::CoreError::MalformedWire)?;
    if payload_end > bytes.len() {
        return Err(crate::error::CoreError::MalformedWire);
    }
    let payload = bytes[payload_start..payload_end].to_vec();

    Ok(WireFrame {
        requires_ack,
        critical,
        timestamp_ns,
        message_id,
        correlation_id,
        source_name,
        target_name,
        pattern,
        priority,
        content_type,
        hmac,
        payload,
    })
}

/// The slice of an encoded frame that integrity tags are computed over:
/// the header with the HMAC field zeroed, followed by the payload.
pub fn signable_bytes(encoded: &[u8]) -> Vec<u8> {
    let mut buf = encoded.to_vec();
    buf[120..152].fill(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;

    fn sample_frame() -> WireFrame {
        WireFrame {
            requires_ack: true,
            critical: false,
            timestamp_ns: 1_700_000_000_000_000_000,
            message_id: MessageId::new(),
            correlation_id: None,
            source_name: "planner".into(),
            target_name: Some("worker-1".into()),
            pattern: Pattern::RequestResponse,
            priority: Priority::High,
            content_type: "application/json".into(),
            hmac: None,
            payload: b"{\"op\":\"ping\"}".to_vec(),
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let frame = sample_frame();
        let encoded = encode(&frame);
        assert_eq!(&encoded[0..4], b"PLAN");
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn broadcast_target_round_trips_to_none() {
        let mut frame = sample_frame();
        frame.target_name = None;
        frame.pattern = Pattern::Broadcast;
        let encoded = encode(&frame);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.target_name, None);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = encode(&sample_frame());
        encoded[0] = b'X';
        assert_eq!(decode(&encoded), Err(crate::error::CoreError::MalformedWire));
    }

    #[test]
    fn rejects_bad_version() {
        let mut encoded = encode(&sample_frame());
        encoded[4..6].copy_from_slice(&0x0200u16.to_be_bytes());
        assert_eq!(decode(&encoded), Err(crate::error::CoreError::MalformedWire));
    }

    #[test]
    fn rejects_truncated_payload() {
        let encoded = encode(&sample_frame());
        let truncated = &encoded[..encoded.len() - 1];
        assert_eq!(decode(truncated), Err(crate::error::CoreError::MalformedWire));
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let mut encoded = encode(&sample_frame());
        let mut flags = u16::from_be_bytes([encoded[6], encoded[7]]);
        flags |= 1 << 15;
        encoded[6..8].copy_from_slice(&flags.to_be_bytes());
        assert_eq!(decode(&encoded), Err(crate::error::CoreError::MalformedWire));
    }

    #[test]
    fn hmac_present_flag_round_trips() {
        let mut frame = sample_frame();
        frame.hmac = Some([7u8; 32]);
        let encoded = encode(&frame);
        let flags = u16::from_be_bytes([encoded[6], encoded[7]]);
        assert_eq!(flags & FLAG_HMAC_PRESENT, FLAG_HMAC_PRESENT);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.hmac, Some([7u8; 32]));
    }

    #[test]
    fn signable_bytes_zero_the_hmac_field() {
        let mut frame = sample_frame();
        frame.hmac = Some([9u8; 32]);
        let encoded = encode(&frame);
        let signable = signable_bytes(&encoded);
        assert!(signable[120..152].iter().all(|&b| b == 0));
        assert_eq!(signable.len(), encoded.len());
    }
}
