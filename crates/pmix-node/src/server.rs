//! Component F's transport half: accept inbound node-to-node connections,
//! run each through `pmix_wire::PmixCodec`, and dispatch whole frames.
//! One logical connection per remote sender per step.

use std::sync::Arc;

use bytes::Bytes;
use pmix_engine::{handle_frame, Outbound, StepContext};
use pmix_wire::{FrameHeader, PmixCodec};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use crate::transport::TcpTransport;

/// Bind the inter-node TCP listener and accept connections until the
/// process shuts down. Each accepted peer gets its own `PmixCodec` /
/// `FramedRead` pair and task, the same per-connection I/O engine shape
/// the client session data model uses, generalized to peer nodes.
pub async fn run_accept_loop(bind_addr: String, port: u16, ctx: Arc<StepContext>, transport: Arc<TcpTransport>) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind_addr.as_str(), port)).await?;
    tracing::info!(bind_addr, port, "inter-node listener bound");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let ctx = ctx.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, ctx, transport).await {
                tracing::warn!(%peer_addr, error = %err, "inter-node connection closed with error");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, ctx: Arc<StepContext>, transport: Arc<TcpTransport>) -> anyhow::Result<()> {
    let mut framed = FramedRead::new(stream, PmixCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        match handle_frame(&ctx, frame.header, frame.payload) {
            Ok(outbound) => dispatch_outbound(&ctx, &transport, outbound).await,
            Err(err) => tracing::warn!(error = %err, "dropping malformed/invalid inbound frame"),
        }
    }
    Ok(())
}

/// Send every `Outbound` the dispatcher produced. A target equal to this
/// node's own hostname is looped back through `handle_frame` directly
/// instead of round-tripping over the network, the root's FAN_OUT
/// self-delivery `context.rs` documents (`SendFanOut`'s `targets` include
/// the root itself).
pub async fn dispatch_outbound(ctx: &Arc<StepContext>, transport: &Arc<TcpTransport>, outbound: Vec<Outbound>) {
    for msg in outbound {
        if msg.to_host == ctx.job.hostname() {
            deliver_local(ctx, transport, msg.header, msg.payload).await;
            continue;
        }
        if let Err(err) = transport.forward_data(&msg.to_host, &msg.header, &msg.payload).await {
            tracing::error!(to = msg.to_host, cmd = %msg.header.cmd, error = %err, "forward_data exhausted retries");
        }
    }
}

async fn deliver_local(ctx: &Arc<StepContext>, transport: &Arc<TcpTransport>, header: FrameHeader, payload: Bytes) {
    match handle_frame(ctx, header, payload) {
        Ok(further) => Box::pin(dispatch_outbound(ctx, transport, further)).await,
        Err(err) => tracing::error!(error = %err, "self-delivered frame was rejected by dispatch"),
    }
}
