//! Component C, the distributed key/value blob store. Each node keeps
//! one blob per task id contributed by that task's local fence
//! contribution, tagged with the generation (collective `seq`) it was
//! produced under; grounded on `pmix_db.h`'s `pmix_db_t`.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

#[derive(Debug, Clone)]
struct BlobEntry {
    bytes: Bytes,
    generation: u32,
}

/// Per-node blob store keyed by global task id. `update_init`/
/// `update_verify` bracket a fan-in round the way `pmix_db_update_init`/
/// `pmix_db_update_verify` do in the original: every local task is
/// expected to have contributed exactly once by the time the round closes.
#[derive(Debug, Default)]
pub struct Db {
    blobs: HashMap<u32, BlobEntry>,
    updated: HashSet<u32>,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or replace) `taskid`'s blob for generation `generation`.
    pub fn add_blob(&mut self, taskid: u32, bytes: Bytes, generation: u32) {
        self.blobs.insert(taskid, BlobEntry { bytes, generation });
        self.updated.insert(taskid);
    }

    /// Fetch `taskid`'s current blob and the generation it was stored
    /// under, if one has ever been contributed.
    pub fn get_blob(&self, taskid: u32) -> Option<(Bytes, u32)> {
        self.blobs.get(&taskid).map(|e| (e.bytes.clone(), e.generation))
    }

    /// True once `taskid` has contributed a blob at all.
    pub fn has_blob(&self, taskid: u32) -> bool {
        self.blobs.contains_key(&taskid)
    }

    /// True when `taskid`'s current blob is at least as fresh as
    /// `generation`, the DMDX "is this data fresh enough" check from
    /// Open Question (c) in `SPEC_FULL.md`. Generation zero means "no data
    /// yet" (§3), so a blob stored at generation zero is never fresh,
    /// regardless of what it is compared against.
    pub fn is_fresh(&self, taskid: u32, generation: u32) -> bool {
        self.blobs.get(&taskid).is_some_and(|e| e.generation > 0 && e.generation >= generation)
    }

    /// Clear the per-round contribution tracker. Call once at the start
    /// of each fan-in round before any `add_blob`.
    pub fn update_init(&mut self) {
        self.updated.clear();
    }

    /// Verify every task id in `local_task_ids` contributed during the
    /// round opened by the last `update_init`. Returns the ids that did
    /// not, mirroring `pmix_db_update_verify`'s assertion in the
    /// original but as a non-fatal check the caller can act on.
    pub fn update_verify(&self, local_task_ids: &[u32]) -> Vec<u32> {
        let missing: Vec<u32> = local_task_ids.iter().copied().filter(|id| !self.updated.contains(id)).collect();
        if !missing.is_empty() {
            tracing::error!(?missing, "local task(s) did not contribute before fan-in verify");
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut db = Db::new();
        db.add_blob(3, Bytes::from_static(b"abc"), 1);
        let (bytes, gen) = db.get_blob(3).unwrap();
        assert_eq!(&bytes[..], b"abc");
        assert_eq!(gen, 1);
    }

    #[test]
    fn later_generation_replaces_earlier_one() {
        let mut db = Db::new();
        db.add_blob(3, Bytes::from_static(b"old"), 1);
        db.add_blob(3, Bytes::from_static(b"new"), 2);
        let (bytes, gen) = db.get_blob(3).unwrap();
        assert_eq!(&bytes[..], b"new");
        assert_eq!(gen, 2);
    }

    #[test]
    fn freshness_check_compares_generations() {
        let mut db = Db::new();
        db.add_blob(3, Bytes::from_static(b"v2"), 2);
        assert!(db.is_fresh(3, 2));
        assert!(db.is_fresh(3, 1));
        assert!(!db.is_fresh(3, 3));
        assert!(!db.is_fresh(99, 0));
    }

    #[test]
    fn generation_zero_blob_is_never_fresh() {
        let mut db = Db::new();
        db.add_blob(3, Bytes::from_static(b"early"), 0);
        assert!(!db.is_fresh(3, 0));
    }

    #[test]
    fn update_verify_reports_missing_contributors() {
        let mut db = Db::new();
        db.update_init();
        db.add_blob(1, Bytes::from_static(b"x"), 1);
        let missing = db.update_verify(&[1, 2, 3]);
        assert_eq!(missing, vec![2, 3]);
    }

    #[test]
    fn update_init_resets_the_round_tracker() {
        let mut db = Db::new();
        db.add_blob(1, Bytes::from_static(b"x"), 1);
        db.update_init();
        assert_eq!(db.update_verify(&[1]), vec![1]);
    }
}
