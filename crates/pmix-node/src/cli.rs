//! CLI surface for the node daemon, layered over the job topology
//! environment variables: a flag wins if given, otherwise the matching
//! env var, otherwise a fatal error for the handful that have no sane
//! default.

use std::time::Duration;

use clap::{Parser, ValueEnum};

fn parse_timeout_secs(raw: &str) -> Result<Duration, String> {
    let secs: u64 = raw.trim().parse().map_err(|_| format!("invalid timeout (seconds): {raw:?}"))?;
    if secs == 0 {
        return Err("timeout must be >= 1 second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

/// Which dual init path this process takes. Defaults to inferring from
/// node id 0 when omitted; `pmixp_srun_init` opens the tree-rendezvous
/// listener, `pmixp_stepd_init` only dials out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Launcher,
    Stepd,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pmix-node", version, about = "PMIx tree-collective / direct-modex coordination node")]
pub struct Cli {
    /// Job id this step belongs to.
    #[arg(long, env = "PMIX_JOBID")]
    pub jobid: u32,

    /// Step id within the job.
    #[arg(long, env = "PMIX_STEPID")]
    pub stepid: u32,

    /// Dual-init role; inferred from node id 0 when omitted.
    #[arg(long, value_enum)]
    pub role: Option<Role>,

    /// Tree fan-out width for the collective engine (component E).
    #[arg(long, default_value_t = 16)]
    pub tree_width: u32,

    /// Collective round timeout, in seconds (component E's `reset_if_to`).
    #[arg(long, value_parser = parse_timeout_secs, default_value = "5")]
    pub timeout: Duration,

    /// Directory the per-rank client UNIX sockets are created in; the
    /// exact template is a deployment decision, fixed here
    /// as `<dir>/pmix-cli-<jobid>.<stepid>.r<local_id>.sock`.
    #[arg(long, env = "PMIX_CLIENT_SOCK_DIR", default_value = "/tmp")]
    pub client_sock_dir: String,

    /// Bind address for the inter-node TCP listener (launcher role only).
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// How often the timeout sweep walks the collective instance, in
    /// milliseconds.
    #[arg(long, default_value_t = 500)]
    pub sweep_interval_ms: u64,
}

impl Cli {
    pub fn client_sock_path(&self, local_id: u32) -> std::path::PathBuf {
        std::path::Path::new(&self.client_sock_dir).join(format!("pmix-cli-{}.{}.r{}.sock", self.jobid, self.stepid, local_id))
    }
}
