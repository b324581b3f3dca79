//! Local rank IPC over per-rank UNIX sockets. The on-host PMIx library
//! wire format itself is out of scope here; what this module provides
//! is the minimal local protocol needed to drive components D (client
//! session state) and the server's entry points into E (fence) and G
//! (DMDX) end to end:
//!
//! ```text
//! client -> server (once, on connect): local_id: u32 BE
//! server -> client: ack: u8 = 1
//! client -> server (repeatable): op: u8, then op-specific body
//!     op 1 (PUBLISH): bloblen: u32 BE, blob: [u8; bloblen]
//!     op 2 (GET):     taskid: u32 BE
//!     op 3 (FINALIZE): (no body; connection then closes)
//! server -> client (unsolicited, once per op):
//!     PUBLISH reply: the fence's aggregated payload once FAN_OUT completes,
//!         as bloblen: u32 BE, blob: [u8; bloblen], or a single 0xFFFFFFFF
//!         sentinel length on TIMEOUT.
//!     GET reply: taskid: u32 BE, bloblen: u32 BE, blob: [u8; bloblen]
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use pmix_core::{ClientSession, ClientState};
use pmix_engine::{contrib_local, CollectiveEvent, Dmdx, DmdxError, DmdxReply, LocalModexEvent, StepContext};
use pmix_wire::{Command, FrameHeader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

use crate::server::dispatch_outbound;
use crate::transport::TcpTransport;

const OP_PUBLISH: u8 = 1;
const OP_GET: u8 = 2;
const OP_FINALIZE: u8 = 3;

const TIMEOUT_SENTINEL_LEN: u32 = 0xFFFF_FFFF;

/// Local rank sessions keyed by local id, shared between the accept loop
/// and the collective-completion / DMDX-notify fan-out tasks.
pub type ClientTable = Mutex<HashMap<u32, ClientSession>>;

/// Bind one UNIX socket per local rank under `sock_dir` and accept exactly
/// one connection on each, using a deterministic path derived from
/// jobid/stepid plus an `r<local_id>` suffix since one node hosts many
/// local ranks.
pub async fn run_client_listeners(ctx: Arc<StepContext>, clients: Arc<ClientTable>, transport: Arc<TcpTransport>, sock_dir: String, jobid: u32, stepid: u32) -> anyhow::Result<()> {
    for local_id in 0..ctx.job.local_task_count() {
        let path = std::path::Path::new(&sock_dir).join(format!("pmix-cli-{jobid}.{stepid}.r{local_id}.sock"));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        tracing::info!(local_id, path = %path.display(), "client socket bound");

        let ctx = ctx.clone();
        let clients = clients.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let ctx = ctx.clone();
                        let clients = clients.clone();
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_client(stream, local_id, ctx, clients, transport).await {
                                tracing::warn!(local_id, error = %err, "client connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::error!(local_id, error = %err, "client listener accept failed");
                        return;
                    }
                }
            }
        });
    }
    Ok(())
}

async fn serve_client(mut stream: UnixStream, local_id: u32, ctx: Arc<StepContext>, clients: Arc<ClientTable>, transport: Arc<TcpTransport>) -> anyhow::Result<()> {
    let taskid = ctx.job.task_id(local_id);
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Bytes>(8);

    let declared = stream.read_u32().await?;
    if declared != local_id {
        tracing::warn!(local_id, declared, "client sent mismatched local id on this socket, ignoring");
    }

    {
        let mut table = clients.lock().await;
        match table.get(&local_id).map(ClientSession::state) {
            // A fresh or previously-finalized slot: reconnecting rebuilds
            // the session so its outbox points at this new stream.
            None | Some(ClientState::Unconnected) => {
                table.insert(local_id, ClientSession::new(taskid, local_id, outbox_tx.clone()));
            }
            // A duplicate connect on an already-live slot is ignored, not replaced.
            Some(_) => {
                tracing::warn!(local_id, "duplicate client connect ignored");
                return Ok(());
            }
        }
        let session = table.get_mut(&local_id).expect("just inserted");
        session.connecting()?;
        session.connected()?;
    }
    stream.write_u8(1).await?;

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => {
                let Some(bytes) = outgoing else { break };
                stream.write_all(&bytes).await?;
            }
            op = stream.read_u8() => {
                let op = match op {
                    Ok(op) => op,
                    Err(_) => break, // EOF or error: treat as disconnect.
                };
                match op {
                    OP_PUBLISH => handle_publish(&mut stream, &ctx, &clients, &transport, local_id, taskid).await?,
                    OP_GET => handle_get(&mut stream, &ctx, &transport, local_id).await?,
                    OP_FINALIZE => break,
                    other => {
                        tracing::warn!(local_id, op = other, "unknown client op, closing connection");
                        break;
                    }
                }
            }
        }
    }

    let mut table = clients.lock().await;
    if let Some(session) = table.get_mut(&local_id) {
        session.finalize();
    }
    Ok(())
}

async fn handle_publish(stream: &mut UnixStream, ctx: &Arc<StepContext>, clients: &Arc<ClientTable>, transport: &Arc<TcpTransport>, local_id: u32, taskid: u32) -> anyhow::Result<()> {
    let bloblen = stream.read_u32().await? as usize;
    let mut blob = vec![0u8; bloblen];
    stream.read_exact(&mut blob).await?;

    {
        let mut table = clients.lock().await;
        if let Some(session) = table.get_mut(&local_id) {
            session.join_collective()?;
        }
    }

    let outbound = contrib_local(ctx, taskid, &blob);
    dispatch_outbound(ctx, transport, outbound).await;
    Ok(())
}

async fn handle_get(stream: &mut UnixStream, ctx: &Arc<StepContext>, transport: &Arc<TcpTransport>, local_id: u32) -> anyhow::Result<()> {
    let requested = stream.read_u32().await?;

    if ctx.job.local_id_of(requested).is_some() {
        let generation = ctx.collective.seq();
        let reply = {
            let db = ctx.db.lock().unwrap();
            ctx.dmdx.reply_to_node(&db, requested, generation, ctx.job.node_id)
        };
        if let DmdxReply::Send { taskid, blob, .. } = reply {
            write_get_reply(stream, taskid, &blob).await?;
        }
        // Deferred: this node's own notify path wakes it up later via the
        // normal dmdx_notify drain on the next local fan-out/DIRECT_RESP.
        return Ok(());
    }

    let Some(owner_node) = ctx.job.task_node(requested) else {
        tracing::warn!(local_id, requested, "{}", DmdxError::UnknownTask(requested));
        return Ok(());
    };
    let Some(owner_host) = ctx.job.hostname_of(owner_node) else { return Ok(()) };

    let header = FrameHeader::new(ctx.collective.seq(), ctx.job.node_id, 4, Command::Direct);
    let payload = Dmdx::request_payload(requested);
    if let Err(err) = transport.forward_data(owner_host, &header, &payload).await {
        tracing::error!(requested, owner_host, error = %err, "DMDX request send failed");
    }
    Ok(())
}

async fn write_get_reply(stream: &mut UnixStream, taskid: u32, blob: &Bytes) -> anyhow::Result<()> {
    stream.write_u32(taskid).await?;
    stream.write_u32(blob.len() as u32).await?;
    stream.write_all(blob).await?;
    Ok(())
}

/// Drains the per-step [`CollectiveEvent`] channel and, for every local
/// rank currently in COLL, delivers the fan-out payload (or TIMEOUT
/// sentinel) and moves it back to OPERATE.
pub async fn run_collective_completion_relay(clients: Arc<ClientTable>, mut events: mpsc::UnboundedReceiver<CollectiveEvent>) {
    while let Some(event) = events.recv().await {
        let (payload, timed_out) = match event {
            CollectiveEvent::Completed { payload, .. } => (payload, false),
            CollectiveEvent::TimedOut { .. } => (Bytes::new(), true),
        };
        let mut table = clients.lock().await;
        for session in table.values_mut() {
            if session.state() != ClientState::Coll {
                continue;
            }
            let wire = if timed_out {
                TIMEOUT_SENTINEL_LEN.to_be_bytes().to_vec()
            } else {
                let mut out = Vec::with_capacity(4 + payload.len());
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(&payload);
                out
            };
            if session.send(Bytes::from(wire)).await.is_err() {
                tracing::debug!(local_id = session.local_id, "client outbox closed, dropping fan-out delivery");
            }
            let _ = session.task_coll_finish();
        }
    }
}

/// Drains [`LocalModexEvent`]s (a fresh DB blob arrived for a task this
/// node hosts or had requested), currently surfaced only as a log line,
/// since wiring it back to a specific waiting `GET` caller needs the
/// on-host PMIx library linkage this crate stops short of.
pub async fn run_local_modex_relay(mut events: mpsc::UnboundedReceiver<LocalModexEvent>) {
    while let Some(event) = events.recv().await {
        tracing::debug!(taskid = event.taskid, bytes = event.blob.len(), "local modex event");
    }
}
