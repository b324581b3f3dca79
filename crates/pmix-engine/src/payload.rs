//! Tagging scheme for fence contributions. On the wire it is a plain
//! concatenation, but consumers treat it as an unordered multiset of
//! ⟨taskid, blob⟩ pairs. The blob db still needs task-tagged bytes out
//! of a completed fan-out to populate itself from both the fan-out
//! payload and DMDX responses, so this module picks the simplest tagging
//! that satisfies both: each local contribution is one
//! `(taskid, bloblen, blob)` record, and the aggregate is just their
//! concatenation: associative and commutative, so ordering never
//! matters to a consumer.

use bytes::{BufMut, Bytes, BytesMut};

/// Encode one task's contribution as a self-delimiting record.
pub fn encode_contrib(taskid: u32, blob: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + blob.len());
    out.put_u32(taskid);
    out.put_u32(blob.len() as u32);
    out.put_slice(blob);
    out.freeze()
}

/// Decode a concatenation of contribution records. A truncated trailing
/// record (possible only under a malformed peer) is dropped rather than
/// panicking, isolating the bad peer instead of taking the round down
/// with it.
pub fn decode_contribs(payload: &[u8]) -> Vec<(u32, Bytes)> {
    let mut out = Vec::new();
    let mut rest = payload;
    while rest.len() >= 8 {
        let taskid = u32::from_be_bytes(rest[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(rest[4..8].try_into().unwrap()) as usize;
        if rest.len() < 8 + len {
            break;
        }
        out.push((taskid, Bytes::copy_from_slice(&rest[8..8 + len])));
        rest = &rest[8 + len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_record() {
        let encoded = encode_contrib(7, b"hello");
        assert_eq!(decode_contribs(&encoded), vec![(7, Bytes::from_static(b"hello"))]);
    }

    #[test]
    fn concatenation_of_two_contributions_decodes_to_both() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_contrib(0, b"A"));
        buf.extend_from_slice(&encode_contrib(1, b"B"));
        let decoded = decode_contribs(&buf);
        assert_eq!(decoded, vec![(0, Bytes::from_static(b"A")), (1, Bytes::from_static(b"B"))]);
    }

    #[test]
    fn truncated_trailing_record_is_dropped_not_panicked() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_contrib(0, b"A"));
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"short");
        assert_eq!(decode_contribs(&buf), vec![(0, Bytes::from_static(b"A"))]);
    }
}
