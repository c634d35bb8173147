//! On-wire TLV framing for the certifier (spec.md §6 "On-wire format").
//!
//! The executed-set broadcast carries `{PIT_GTID_EXECUTED, length, bytes,
//! PIT_SENT_TIMESTAMP, 8 bytes}`; a `GtidSet` itself encodes as
//! little-endian length-prefixed `(member_uuid, interval_count,
//! intervals[])` blocks. Recovery metadata reuses the same outer framing
//! around a compressed certification-info payload, capped at 10 MiB.

use crate::certifier::gtid::{Gtid, GtidSet};
use crate::error::{CacheError, Result};

/// Cap on a compressed recovery-metadata packet (spec.md §6: "design:
/// 10 MiB").
pub const MAX_RECOVERY_PACKET_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PacketType {
    GtidExecuted = 1,
    RecoveryMetadata = 2,
}

impl PacketType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(PacketType::GtidExecuted),
            2 => Ok(PacketType::RecoveryMetadata),
            other => Err(CacheError::Certifier(format!("unknown packet type tag {other}"))),
        }
    }
}

fn encode_gtid_set(set: &GtidSet) -> Vec<u8> {
    let mut out = Vec::new();
    for (member, intervals) in set.members() {
        out.extend_from_slice(member.as_bytes());
        out.extend_from_slice(&(intervals.len() as u32).to_le_bytes());
        for interval in intervals {
            out.extend_from_slice(&interval.start.to_le_bytes());
            out.extend_from_slice(&interval.end.to_le_bytes());
        }
    }
    out
}

fn decode_gtid_set(mut bytes: &[u8]) -> Result<GtidSet> {
    let mut set = GtidSet::new();
    while !bytes.is_empty() {
        if bytes.len() < 16 + 4 {
            return Err(CacheError::Certifier("truncated gtid set block header".into()));
        }
        let member = uuid::Uuid::from_slice(&bytes[..16]).map_err(|e| CacheError::Certifier(e.to_string()))?;
        let count = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
        bytes = &bytes[20..];
        if bytes.len() < count * 16 {
            return Err(CacheError::Certifier("truncated gtid interval list".into()));
        }
        for _ in 0..count {
            let start = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            let end = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
            bytes = &bytes[16..];
            let mut gno = start;
            while gno <= end {
                set.add(Gtid { member, gno });
                gno += 1;
            }
        }
    }
    Ok(set)
}

/// Encode the periodic executed-set broadcast (spec.md §6).
pub fn encode_executed_set_broadcast(executed: &GtidSet, sent_timestamp_millis: u64) -> Vec<u8> {
    let body = encode_gtid_set(executed);
    let mut out = Vec::with_capacity(1 + 4 + body.len() + 1 + 8);
    out.push(PacketType::GtidExecuted as u8);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out.push(8u8); // PIT_SENT_TIMESTAMP length tag
    out.extend_from_slice(&sent_timestamp_millis.to_le_bytes());
    out
}

/// Decode a broadcast produced by [`encode_executed_set_broadcast`],
/// returning the executed set and the sender's timestamp.
pub fn decode_executed_set_broadcast(bytes: &[u8]) -> Result<(GtidSet, u64)> {
    if bytes.len() < 1 + 4 {
        return Err(CacheError::Certifier("truncated broadcast header".into()));
    }
    if PacketType::from_u8(bytes[0])? != PacketType::GtidExecuted {
        return Err(CacheError::Certifier("not a GTID_EXECUTED packet".into()));
    }
    let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
    let body_start = 5;
    let body_end = body_start + len;
    if bytes.len() < body_end + 1 + 8 {
        return Err(CacheError::Certifier("truncated broadcast body".into()));
    }
    let executed = decode_gtid_set(&bytes[body_start..body_end])?;
    let ts_len = bytes[body_end];
    if ts_len != 8 {
        return Err(CacheError::Certifier("unexpected timestamp tag length".into()));
    }
    let ts_bytes = &bytes[body_end + 1..body_end + 1 + 8];
    let timestamp = u64::from_le_bytes(ts_bytes.try_into().unwrap());
    Ok((executed, timestamp))
}

/// Encode a recovery-metadata packet: the same outer TLV framing around
/// an already-compressed certification-info payload. Rejects payloads
/// above [`MAX_RECOVERY_PACKET_BYTES`].
pub fn encode_recovery_metadata(compressed_payload: &[u8]) -> Result<Vec<u8>> {
    if compressed_payload.len() > MAX_RECOVERY_PACKET_BYTES {
        return Err(CacheError::Certifier(format!(
            "recovery metadata packet of {} bytes exceeds the {} byte cap",
            compressed_payload.len(),
            MAX_RECOVERY_PACKET_BYTES
        )));
    }
    let mut out = Vec::with_capacity(1 + 4 + compressed_payload.len());
    out.push(PacketType::RecoveryMetadata as u8);
    out.extend_from_slice(&(compressed_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(compressed_payload);
    Ok(out)
}

pub fn decode_recovery_metadata(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < 1 + 4 {
        return Err(CacheError::Certifier("truncated recovery metadata header".into()));
    }
    if PacketType::from_u8(bytes[0])? != PacketType::RecoveryMetadata {
        return Err(CacheError::Certifier("not a recovery metadata packet".into()));
    }
    let len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
    let body = &bytes[5..];
    if body.len() < len {
        return Err(CacheError::Certifier("truncated recovery metadata body".into()));
    }
    if len > MAX_RECOVERY_PACKET_BYTES {
        return Err(CacheError::Certifier("recovery metadata body exceeds cap".into()));
    }
    Ok(&body[..len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certifier::gtid::Gtid;
    use uuid::Uuid;

    #[test]
    fn executed_set_broadcast_round_trips() {
        let mut set = GtidSet::new();
        let m = Uuid::from_bytes([9; 16]);
        for g in 1..=10 {
            set.add(Gtid { member: m, gno: g });
        }
        let wire = encode_executed_set_broadcast(&set, 1_700_000_000_000);
        let (decoded, ts) = decode_executed_set_broadcast(&wire).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(ts, 1_700_000_000_000);
    }

    #[test]
    fn recovery_metadata_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_RECOVERY_PACKET_BYTES + 1];
        assert!(encode_recovery_metadata(&payload).is_err());
    }

    #[test]
    fn recovery_metadata_round_trips() {
        let payload = vec![1, 2, 3, 4, 5];
        let wire = encode_recovery_metadata(&payload).unwrap();
        let decoded = decode_recovery_metadata(&wire).unwrap();
        assert_eq!(decoded, payload.as_slice());
    }
}
