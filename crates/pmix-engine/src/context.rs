//! A step-scoped context replacing module-scope globals (a job-wide DB,
//! client state table, and job info) with one value, built once at step
//! init and threaded through every dispatch entry point.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pmix_core::{Db, JobTopology};
use tokio::sync::mpsc;

use crate::collective::{Collective, CollectiveEvent};
use crate::dmdx::Dmdx;

/// Per-round bookkeeping for this node's own local ranks: which task ids
/// have published so far, and their concatenated contribution records.
/// `Collective::contrib_local` models "the local rank contributes" as a
/// single boolean, so a node hosting more than one local
/// task must aggregate every local rank's contribution before handing the
/// collective engine one combined call.
struct LocalRound {
    contributed: HashSet<u32>,
    buffer: BytesMut,
}

impl LocalRound {
    fn new() -> Self {
        Self { contributed: HashSet::new(), buffer: BytesMut::new() }
    }
}

/// A local client woke up because a modex-get it was waiting on just
/// resolved. Stops short of the actual on-host PMIx library linkage a
/// real completion upcall would target.
#[derive(Debug, Clone)]
pub struct LocalModexEvent {
    pub taskid: u32,
    pub blob: Bytes,
}

/// Bundles the per-step domain state: the read-only topology (H), the
/// blob store (C), the DMDX deferred-queue tracker (G), and the single
/// collective instance (E). Per Open Question (a), this implementation
/// restricts to one collective type (fence) and therefore one instance
/// per step; a second type would add a sibling field, not change this
/// one's shape.
pub struct StepContext {
    pub job: Arc<JobTopology>,
    pub db: Mutex<Db>,
    pub dmdx: Dmdx,
    pub collective: Collective,
    local_modex: mpsc::UnboundedSender<LocalModexEvent>,
    local_round: Mutex<LocalRound>,
}

impl StepContext {
    pub fn new(job: Arc<JobTopology>, timeout: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<CollectiveEvent>, mpsc::UnboundedReceiver<LocalModexEvent>) {
        let (coll_tx, coll_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = mpsc::unbounded_channel();

        let children = job.children().iter().map(|&id| job.hostname_of(id).expect("child id is in range").to_string()).collect();
        let parent_host = job.parent_hostname().map(str::to_string);
        let participants = job.hostlist.clone();

        let collective = Collective::new(children, parent_host, participants, timeout, coll_tx);

        let ctx = Arc::new(Self {
            job,
            db: Mutex::new(Db::new()),
            dmdx: Dmdx::new(),
            collective,
            local_modex: local_tx,
            local_round: Mutex::new(LocalRound::new()),
        });
        (ctx, coll_rx, local_rx)
    }

    pub fn notify_local_modex(&self, taskid: u32, blob: Bytes) {
        let _ = self.local_modex.send(LocalModexEvent { taskid, blob });
    }

    /// Fold `taskid`'s already-tagged contribution record into this
    /// round's local accumulator, and record `blob` in the DB under the
    /// collective's current generation (component C, §4.C's
    /// `pmix_db_update_init`/`add`/`pmix_db_update_verify` bracket).
    /// Returns the combined payload once every local task on this node
    /// has contributed, at which point the round accounting resets for
    /// the next one; returns `None` while still waiting on the remaining
    /// local ranks.
    ///
    /// A local task missing from the DB once every local task has
    /// reported in is a protocol violation, not a recoverable condition
    /// (§7): it means a task id was contributed to the collective without
    /// ever landing a blob, so the round is asserted fatal here rather
    /// than let a caller silently fan out half-populated data.
    pub fn accumulate_local(&self, taskid: u32, blob: Bytes, record: Bytes) -> Option<Bytes> {
        let all_local = self.job.local_task_ids();
        let generation = self.collective.seq();
        let mut round = self.local_round.lock().unwrap();
        if round.contributed.is_empty() {
            self.db.lock().unwrap().update_init();
        }
        round.contributed.insert(taskid);
        round.buffer.extend_from_slice(&record);
        self.db.lock().unwrap().add_blob(taskid, blob, generation);
        if all_local.iter().all(|t| round.contributed.contains(t)) {
            round.contributed.clear();
            let missing = self.db.lock().unwrap().update_verify(&all_local);
            assert!(missing.is_empty(), "fan-in launched with missing local contributor(s): {missing:?}");
            Some(round.buffer.split().freeze())
        } else {
            None
        }
    }
}
