//! Component F, server dispatch: route an inbound framed message by
//! `cmd` to the collective engine, the DMDX handler, or the DB. Grounded
//! on `_process_server_request`'s `switch`, rewritten as an exhaustive
//! match so a `DIRECT_RESP` frame can never silently fall through to the
//! wrong handler the way an un-exhaustive switch would allow.

use bytes::Bytes;
use pmix_wire::{Command, FrameHeader};
use thiserror::Error;

use crate::collective::{CollectiveAction, CollectiveError};
use crate::context::StepContext;
use crate::dmdx::{Dmdx, DmdxReply};
use crate::payload::{decode_contribs, encode_contrib};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    #[error("sender node id {0} is outside this step's topology")]
    UnknownSender(u32),
    #[error("DIRECT payload was not a well-formed 4-byte task id")]
    BadDmdxRequest,
    #[error("DIRECT_RESP payload was too short to contain a task id")]
    BadDmdxResponse,
}

/// A message the caller (the transport layer) must actually send, built
/// outside of any lock. Dispatch only ever returns these, it never
/// calls a transport itself (testable property 8 applies transitively).
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to_host: String,
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Handle one fully-framed inbound message. `sender_node` is the node id
/// carried in the frame header (already validated against the topology
/// by the caller's transport, but re-checked here since dispatch must
/// not trust upstream state).
pub fn handle_frame(ctx: &StepContext, header: FrameHeader, payload: Bytes) -> Result<Vec<Outbound>, DispatchError> {
    match header.cmd {
        Command::Fence => handle_fence(ctx, header, payload),
        Command::FenceResp => handle_fence_resp(ctx, payload),
        Command::Direct => handle_direct(ctx, header, payload),
        Command::DirectResp => handle_direct_resp(ctx, payload),
    }
}

/// This node's local ranks contribute into the current fence round.
/// Called directly by the local-client path, not by `handle_frame`: a
/// local contribution never arrives framed over the wire. Multiple local
/// ranks accumulate in `ctx`'s per-round tracker; the collective engine
/// only sees one `contrib_local` call, once every local task has reported
/// in, matching its single local-contribution boolean.
pub fn contrib_local(ctx: &StepContext, taskid: u32, blob: &[u8]) -> Vec<Outbound> {
    let record = encode_contrib(taskid, blob);
    match ctx.accumulate_local(taskid, Bytes::copy_from_slice(blob), record) {
        Some(aggregate) => action_to_outbound(ctx, ctx.collective.contrib_local(&aggregate)),
        None => Vec::new(),
    }
}

fn handle_fence(ctx: &StepContext, header: FrameHeader, payload: Bytes) -> Result<Vec<Outbound>, DispatchError> {
    let sender_host = ctx.job.hostname_of(header.nodeid).ok_or(DispatchError::UnknownSender(header.nodeid))?;
    // Testable property 5 / scenario S3: a frame from a round this node
    // has already moved past (e.g. after a timeout reset bumped `seq`)
    // is stale and relies on the sender's own retransmission once it
    // catches up to the new `seq`, rather than being applied here.
    if ctx.collective.is_stale(header.gen) {
        tracing::debug!(sender_host, frame_gen = header.gen, seq = ctx.collective.seq(), "dropping stale FENCE frame");
        return Ok(Vec::new());
    }
    let action = ctx.collective.contrib_node(sender_host, &payload)?;
    Ok(action_to_outbound(ctx, action))
}

fn handle_fence_resp(ctx: &StepContext, payload: Bytes) -> Result<Vec<Outbound>, DispatchError> {
    ctx.collective.fan_out_data(payload.clone())?;
    let generation = ctx.collective.seq();
    let mut db = ctx.db.lock().unwrap();
    let mut outbound = Vec::new();
    for (taskid, blob) in decode_contribs(&payload) {
        db.add_blob(taskid, blob.clone(), generation);
        if ctx.job.local_id_of(taskid).is_some() {
            ctx.notify_local_modex(taskid, blob.clone());
        }
        outbound.extend(drain_dmdx_waiters(ctx, &ctx.dmdx, taskid, blob));
    }
    Ok(outbound)
}

fn handle_direct(ctx: &StepContext, header: FrameHeader, payload: Bytes) -> Result<Vec<Outbound>, DispatchError> {
    let taskid = Dmdx::parse_request_payload(&payload).ok_or(DispatchError::BadDmdxRequest)?;
    if ctx.job.local_id_of(taskid).is_none() {
        // Open Question (b): "drop with log" for a task this node does not own.
        tracing::warn!(taskid, requester = header.nodeid, "DIRECT request for a task not owned by this node");
        return Ok(Vec::new());
    }
    let db = ctx.db.lock().unwrap();
    let generation = ctx.collective.seq();
    let reply = ctx.dmdx.reply_to_node(&db, taskid, generation, header.nodeid);
    Ok(reply_to_outbound(ctx, reply))
}

fn handle_direct_resp(ctx: &StepContext, payload: Bytes) -> Result<Vec<Outbound>, DispatchError> {
    if payload.len() < 4 {
        return Err(DispatchError::BadDmdxResponse);
    }
    let taskid = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let blob = payload.slice(4..);
    let generation = ctx.collective.seq();
    ctx.db.lock().unwrap().add_blob(taskid, blob.clone(), generation);
    ctx.notify_local_modex(taskid, blob);
    Ok(Vec::new())
}

fn drain_dmdx_waiters(ctx: &StepContext, dmdx: &Dmdx, taskid: u32, blob: Bytes) -> Vec<Outbound> {
    dmdx.notify(taskid, blob).into_iter().flat_map(|reply| reply_to_outbound(ctx, reply)).collect()
}

fn reply_to_outbound(ctx: &StepContext, reply: DmdxReply) -> Vec<Outbound> {
    match reply {
        DmdxReply::Deferred => Vec::new(),
        DmdxReply::Send { to, taskid, blob } => {
            let Some(host) = ctx.job.hostname_of(to) else { return Vec::new() };
            let mut payload = Vec::with_capacity(4 + blob.len());
            payload.extend_from_slice(&taskid.to_be_bytes());
            payload.extend_from_slice(&blob);
            vec![Outbound {
                to_host: host.to_string(),
                header: FrameHeader::new(ctx.collective.seq(), ctx.job.node_id, payload.len() as u32, Command::DirectResp),
                payload: Bytes::from(payload),
            }]
        }
    }
}

fn action_to_outbound(ctx: &StepContext, action: CollectiveAction) -> Vec<Outbound> {
    match action {
        CollectiveAction::None => Vec::new(),
        CollectiveAction::SendToParent { seq, payload } => {
            let Some(parent) = ctx.job.parent_hostname() else { return Vec::new() };
            vec![Outbound {
                to_host: parent.to_string(),
                header: FrameHeader::new(seq, ctx.job.node_id, payload.len() as u32, Command::Fence),
                payload,
            }]
        }
        CollectiveAction::SendFanOut { seq, payload, targets } => targets
            .into_iter()
            .map(|host| Outbound {
                to_host: host,
                header: FrameHeader::new(seq, ctx.job.node_id, payload.len() as u32, Command::FenceResp),
                payload: payload.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::CollectiveEvent;
    use pmix_core::JobTopology;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    fn two_node_job(node_id_host: &str) -> Arc<JobTopology> {
        unsafe {
            std::env::set_var("PMIX_JOB_NODES", "n0,n1");
            std::env::set_var("PMIX_STEP_NODES", "n0,n1");
            std::env::set_var("PMIX_TASK_MAP", "1,1");
            std::env::set_var("PMIX_SRUN_PORT", "12345");
            std::env::set_var("HOSTNAME", node_id_host);
        }
        Arc::new(JobTopology::from_env(1, 0, Some(2)).unwrap())
    }

    #[test]
    fn s1_fence_round_trip_produces_fan_out_to_both_nodes() {
        let _guard = ENV_LOCK.lock().unwrap();
        let job = two_node_job("n0");
        let (ctx, _coll_rx, _local_rx) = StepContext::new(job, Duration::from_secs(5));

        let local = contrib_local(&ctx, 0, b"A");
        assert!(local.is_empty());

        let peer_payload = encode_contrib(1, b"B");
        let header = FrameHeader::new(0, 1, peer_payload.len() as u32, Command::Fence);
        let out = handle_frame(&ctx, header, peer_payload).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| o.header.cmd == Command::FenceResp));
        for o in &out {
            assert_eq!(&o.payload[..], &encode_contrib_concat());
        }
    }

    fn encode_contrib_concat() -> Vec<u8> {
        let mut v = encode_contrib(0, b"A").to_vec();
        v.extend_from_slice(&encode_contrib(1, b"B"));
        v
    }

    #[test]
    fn fence_resp_populates_db_and_wakes_local_modex_waiters() {
        let _guard = ENV_LOCK.lock().unwrap();
        let job = two_node_job("n1");
        let (ctx, _coll_rx, mut local_rx) = StepContext::new(job, Duration::from_secs(5));

        let aggregate = {
            let mut v = encode_contrib(0, b"A").to_vec();
            v.extend_from_slice(&encode_contrib(1, b"B"));
            v
        };
        let header = FrameHeader::new(0, 0, aggregate.len() as u32, Command::FenceResp);
        let out = handle_frame(&ctx, header, Bytes::from(aggregate)).unwrap();
        assert!(out.is_empty());

        let db = ctx.db.lock().unwrap();
        assert_eq!(db.get_blob(0).unwrap().0, Bytes::from_static(b"A"));
        assert_eq!(db.get_blob(1).unwrap().0, Bytes::from_static(b"B"));
        drop(db);

        let evt = local_rx.try_recv().unwrap();
        assert_eq!(evt.taskid, 1);
        assert_eq!(evt.blob, Bytes::from_static(b"B"));
    }

    #[test]
    fn direct_request_for_unowned_task_is_dropped_per_open_question_b() {
        let _guard = ENV_LOCK.lock().unwrap();
        let job = two_node_job("n0");
        let (ctx, _coll_rx, _local_rx) = StepContext::new(job, Duration::from_secs(5));
        let payload = Dmdx::request_payload(1); // task 1 lives on n1
        let header = FrameHeader::new(0, 1, payload.len() as u32, Command::Direct);
        let out = handle_frame(&ctx, header, payload).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn s3_fence_frame_from_a_stale_round_is_dropped() {
        let _guard = ENV_LOCK.lock().unwrap();
        let job = two_node_job("n0");
        let (ctx, mut coll_rx, _local_rx) = StepContext::new(job, Duration::from_secs(5));

        // n0 times out waiting on n1's contribution; the round resets and
        // seq advances to 1.
        ctx.collective.contrib_local(b"A");
        let future = std::time::Instant::now() + Duration::from_secs(3600);
        assert!(ctx.collective.reset_if_timed_out(future));
        assert!(matches!(coll_rx.try_recv().unwrap(), CollectiveEvent::TimedOut { seq: 0 }));
        assert_eq!(ctx.collective.seq(), 1);

        // n1's retransmission still carries the old gen=0 and is dropped,
        // leaving the freshly-reset round untouched.
        let stale_payload = encode_contrib(1, b"B");
        let stale_header = FrameHeader::new(0, 1, stale_payload.len() as u32, Command::Fence);
        let out = handle_frame(&ctx, stale_header, stale_payload).unwrap();
        assert!(out.is_empty());

        // A fresh contribution carrying gen=1 is accepted and completes
        // the round exactly as S1 describes.
        ctx.collective.contrib_local(b"A");
        let fresh_payload = encode_contrib(1, b"B");
        let fresh_header = FrameHeader::new(1, 1, fresh_payload.len() as u32, Command::Fence);
        let out = handle_frame(&ctx, fresh_header, fresh_payload).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn multi_rank_node_waits_for_every_local_task_before_contributing() {
        let _guard = ENV_LOCK.lock().unwrap();
        // n0 hosts two local tasks (0 and 1); n1 hosts task 2.
        unsafe {
            std::env::set_var("PMIX_JOB_NODES", "n0,n1");
            std::env::set_var("PMIX_STEP_NODES", "n0,n1");
            std::env::set_var("PMIX_TASK_MAP", "2,1");
            std::env::set_var("PMIX_SRUN_PORT", "12345");
            std::env::set_var("HOSTNAME", "n0");
        }
        let job = Arc::new(JobTopology::from_env(1, 0, Some(2)).unwrap());
        let (ctx, _coll_rx, _local_rx) = StepContext::new(job, Duration::from_secs(5));

        // Only the first of n0's two local ranks has published so far;
        // the collective must not see a contribution yet.
        let first = contrib_local(&ctx, 0, b"A0");
        assert!(first.is_empty());

        // The second local rank publishes: now both of n0's ranks have
        // contributed, but n0 is root with child n1, so it still waits
        // on n1's own FAN_IN contribution before fanning out.
        let second = contrib_local(&ctx, 1, b"A1");
        assert!(second.is_empty());

        let peer_payload = encode_contrib(2, b"B");
        let header = FrameHeader::new(0, 1, peer_payload.len() as u32, Command::Fence);
        let out = handle_frame(&ctx, header, peer_payload).unwrap();
        assert_eq!(out.len(), 2);
        let mut expected = encode_contrib(0, b"A0").to_vec();
        expected.extend_from_slice(&encode_contrib(1, b"A1"));
        expected.extend_from_slice(&encode_contrib(2, b"B"));
        for o in &out {
            assert_eq!(&o.payload[..], &expected);
        }
    }
}
