//! `pmix-node`, the per-node coordination daemon: binds the inter-node
//! listener (launcher role only), dials peers on demand, accepts local
//! rank connections, and runs the periodic collective timeout sweep.
//! Ties together `pmix-core` (H, C, D), `pmix-engine` (E, F, G) and this
//! crate's transport/server/client modules behind one `StepContext`.

mod cli;
mod client;
mod server;
mod shutdown;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pmix_core::JobTopology;
use pmix_engine::StepContext;
use tokio::sync::Mutex;

use crate::cli::{Cli, Role};
use crate::client::{run_client_listeners, run_collective_completion_relay, run_local_modex_relay};
use crate::server::run_accept_loop;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownController, ShutdownEvent};
use crate::transport::TcpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let job = JobTopology::from_env(cli.jobid, cli.stepid, Some(cli.tree_width))
        .map(|j| j.with_timeout(cli.timeout))
        .map_err(|err| anyhow::anyhow!("job topology init failed: {err}"))?;
    let role = cli.role.unwrap_or(if job.node_id == 0 { Role::Launcher } else { Role::Stepd });
    tracing::info!(
        jobid = cli.jobid,
        stepid = cli.stepid,
        node_id = job.node_id,
        nnodes = job.nnodes,
        namespace = %job.namespace,
        role = ?role,
        "pmix-node starting"
    );

    let srun_port = job.srun_port;
    let job = Arc::new(job);
    let (ctx, coll_rx, local_rx) = StepContext::new(job.clone(), cli.timeout);
    let transport = Arc::new(TcpTransport::new(srun_port));
    let clients: Arc<client::ClientTable> = Arc::new(Mutex::new(std::collections::HashMap::new()));

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown.clone(), shutdown_tx);

    if matches!(role, Role::Launcher) {
        let bind_addr = cli.bind_addr.clone();
        let ctx = ctx.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(err) = run_accept_loop(bind_addr, srun_port, ctx, transport).await {
                tracing::error!(error = %err, "inter-node accept loop exited");
            }
        });
    } else {
        // The stepd init path: only local sockets are opened; this node
        // dials its parent/peers lazily through `TcpTransport` as the
        // collective and DMDX layers need them.
        tracing::debug!("stepd role: no inter-node listener bound on this node");
    }

    run_client_listeners(ctx.clone(), clients.clone(), transport.clone(), cli.client_sock_dir.clone(), cli.jobid, cli.stepid).await?;

    tokio::spawn(run_collective_completion_relay(clients.clone(), coll_rx));
    tokio::spawn(run_local_modex_relay(local_rx));

    let sweep_interval = Duration::from_millis(cli.sweep_interval_ms);
    let sweep_ctx = ctx.clone();
    tokio::spawn(run_timeout_sweep(sweep_ctx, sweep_interval));

    match shutdown_rx.recv().await {
        Some(ShutdownEvent::Graceful) => tracing::info!("shutdown requested, exiting"),
        Some(ShutdownEvent::Immediate) => {
            tracing::warn!("immediate shutdown requested");
            std::process::exit(130);
        }
        None => {}
    }

    Ok(())
}

/// Component E's "Timeout" sweep: periodically ask the collective
/// instance whether it has been outside SYNC longer than its configured
/// deadline. Firing produces a `TimedOut` event on the channel
/// `run_collective_completion_relay` already drains; no outbound frame
/// of its own, just resetting the instance and bumping `seq`.
async fn run_timeout_sweep(ctx: Arc<StepContext>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if ctx.collective.reset_if_timed_out(std::time::Instant::now()) {
            tracing::warn!(seq = ctx.collective.seq(), "collective round timed out and was reset");
        }
    }
}
