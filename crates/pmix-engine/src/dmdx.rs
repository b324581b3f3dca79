//! Component G, direct modex: request/reply plus per-task deferred
//! queues for requesters that arrived before a fresh blob did. Grounded
//! on `pmix_server.c`'s `pmix_server_dmdx_request`/`_dmdx_reply_to_node`/
//! `_process_dmdx_request`/`dmdx_notify`.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use pmix_core::Db;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DmdxError {
    #[error("task id {0} is not owned by any known node")]
    UnknownTask(u32),
}

/// What the caller must actually send, decided by [`Dmdx::reply_to_node`]:
/// either a reply goes out now, or the requester was queued for later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmdxReply {
    /// Blob was fresh enough; send `DIRECT_RESP { taskid, blob }` to `to`.
    Send { to: u32, taskid: u32, blob: Bytes },
    /// Blob absent or stale; `to` was appended to the task's deferred
    /// queue and will be served by a future `notify`.
    Deferred,
}

/// Per-node deferred-request bookkeeping. Holds no direct reference to
/// the DB generation; freshness is compared against whatever generation
/// the caller currently considers authoritative: the collective's
/// latest completed `seq`.
#[derive(Default)]
pub struct Dmdx {
    deferred: Mutex<HashMap<u32, Vec<u32>>>,
}

impl Dmdx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a DIRECT request payload (`taskid` as 4 bytes, big-endian),
    /// the wire-ready counterpart of `dmdx_request`'s allocation step. The
    /// caller is responsible for resolving the owning node and sending.
    pub fn request_payload(taskid: u32) -> Bytes {
        Bytes::copy_from_slice(&taskid.to_be_bytes())
    }

    pub fn parse_request_payload(payload: &[u8]) -> Option<u32> {
        Some(u32::from_be_bytes(payload.try_into().ok()?))
    }

    /// `_dmdx_reply_to_node`: decide whether `taskid`'s current blob (at
    /// `db`, freshness judged against `current_gen`) can be sent to `to`
    /// now, or must be deferred.
    pub fn reply_to_node(&self, db: &Db, taskid: u32, current_gen: u32, to: u32) -> DmdxReply {
        if db.is_fresh(taskid, current_gen) {
            let (blob, _gen) = db.get_blob(taskid).expect("is_fresh implies a blob exists");
            DmdxReply::Send { to, taskid, blob }
        } else {
            self.deferred.lock().unwrap().entry(taskid).or_default().push(to);
            DmdxReply::Deferred
        }
    }

    /// `dmdx_notify`: a fresh blob just landed for `taskid`; drain every
    /// deferred requester into a batch of replies the caller sends.
    pub fn notify(&self, taskid: u32, blob: Bytes) -> Vec<DmdxReply> {
        let waiters = self.deferred.lock().unwrap().remove(&taskid).unwrap_or_default();
        waiters.into_iter().map(|to| DmdxReply::Send { to, taskid, blob: blob.clone() }).collect()
    }

    #[cfg(test)]
    fn deferred_count(&self, taskid: u32) -> usize {
        self.deferred.lock().unwrap().get(&taskid).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_round_trips() {
        let payload = Dmdx::request_payload(42);
        assert_eq!(Dmdx::parse_request_payload(&payload), Some(42));
    }

    #[test]
    fn s4_dmdx_hit_replies_immediately() {
        let mut db = Db::new();
        db.add_blob(7, Bytes::from_static(b"X"), 2);
        let dmdx = Dmdx::new();
        let reply = dmdx.reply_to_node(&db, 7, 2, 0);
        assert_eq!(reply, DmdxReply::Send { to: 0, taskid: 7, blob: Bytes::from_static(b"X") });
    }

    #[test]
    fn s5_dmdx_defer_then_deliver() {
        let mut db = Db::new();
        db.add_blob(7, Bytes::from_static(b"stale"), 1);
        let dmdx = Dmdx::new();

        let reply = dmdx.reply_to_node(&db, 7, 2, 0);
        assert_eq!(reply, DmdxReply::Deferred);
        assert_eq!(dmdx.deferred_count(7), 1);

        db.add_blob(7, Bytes::from_static(b"Y"), 2);
        let drained = dmdx.notify(7, Bytes::from_static(b"Y"));
        assert_eq!(drained, vec![DmdxReply::Send { to: 0, taskid: 7, blob: Bytes::from_static(b"Y") }]);
        assert_eq!(dmdx.deferred_count(7), 0);
    }

    #[test]
    fn generation_zero_blob_is_deferred_not_sent() {
        // A blob stored before any fence has completed (generation 0) must
        // never be treated as fresh, even when the requester's own current
        // generation is also 0 (§3: "generation zero means no data yet").
        let mut db = Db::new();
        db.add_blob(7, Bytes::from_static(b"too-early"), 0);
        let dmdx = Dmdx::new();
        let reply = dmdx.reply_to_node(&db, 7, 0, 0);
        assert_eq!(reply, DmdxReply::Deferred);
        assert_eq!(dmdx.deferred_count(7), 1);
    }

    #[test]
    fn notify_serves_every_queued_requester_exactly_once() {
        let mut db = Db::new();
        let dmdx = Dmdx::new();
        dmdx.reply_to_node(&db, 7, 2, 0);
        dmdx.reply_to_node(&db, 7, 2, 1);
        dmdx.reply_to_node(&db, 7, 2, 2);
        db.add_blob(7, Bytes::from_static(b"Y"), 2);
        let drained = dmdx.notify(7, Bytes::from_static(b"Y"));
        assert_eq!(drained.len(), 3);
        assert_eq!(dmdx.deferred_count(7), 0);
    }
}
