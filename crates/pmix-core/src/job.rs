//! Component H, the immutable per-step job topology snapshot. Built once
//! at init from environment variables and consulted read-only by every
//! other component; no synchronization needed.

use std::time::Duration;

use thiserror::Error;

use crate::tree::{reverse_tree_direct_children, reverse_tree_info};

/// Step node list: every node participating in this job step.
pub const STEP_NODES_ENV: &str = "PMIX_STEP_NODES";
/// Job-wide node list (may be a superset of the step's nodes).
pub const JOB_NODES_ENV: &str = "PMIX_JOB_NODES";
/// Comma-separated task count per step node, in step-node order, e.g.
/// `"2,2,1"` for a 3-node step with 5 total tasks.
pub const TASK_MAP_ENV: &str = "PMIX_TASK_MAP";
/// TCP port the launcher node's tree-rendezvous listener is bound to.
pub const SRUN_PORT_ENV: &str = "PMIX_SRUN_PORT";

const DEFAULT_TREE_WIDTH: u32 = 16;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum JobInfoError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("environment variable {0} is set but empty")]
    EmptyEnv(&'static str),
    #[error("{0} contains an invalid task count: {1:?}")]
    BadTaskMap(&'static str, String),
    #[error("this node's hostname was not found in {STEP_NODES_ENV}")]
    HostNotInStepList,
    #[error("{SRUN_PORT_ENV} is not a valid port number")]
    BadSrunPort,
}

/// Immutable per-step topology snapshot. Consulted by the collective
/// engine, the DMDX handler, and server dispatch alike.
#[derive(Debug, Clone)]
pub struct JobTopology {
    pub jobid: u32,
    pub stepid: u32,
    pub node_id: u32,
    pub nnodes: u32,
    pub hostlist: Vec<String>,
    pub task_cnts: Vec<u32>,
    pub ntasks: u32,
    pub namespace: String,
    pub tree_width: u32,
    pub timeout: Duration,
    pub srun_port: u16,
    parent_id: Option<u32>,
    children: Vec<u32>,
    task_offsets: Vec<u32>,
}

impl JobTopology {
    /// Build the snapshot from the process environment; any of the
    /// required variables being missing is a fatal init error, matching
    /// `pmixp_info_resources_set`'s `err_exit` path in the original.
    pub fn from_env(jobid: u32, stepid: u32, tree_width: Option<u32>) -> Result<Self, JobInfoError> {
        let hostlist = read_hostlist(STEP_NODES_ENV)?;
        // The job-wide list is consulted by the original to compute a
        // job-relative node id; we only need the step-relative topology
        // for the collective, so we validate it is present (per §6) and
        // otherwise leave it unused beyond that validation.
        let _job_hostlist = read_hostlist(JOB_NODES_ENV)?;

        let hostname = hostname_or_localhost();
        let node_id = hostlist
            .iter()
            .position(|h| h == &hostname)
            .map(|p| p as u32)
            .ok_or(JobInfoError::HostNotInStepList)?;

        let task_cnts = read_task_map(&hostlist)?;
        let ntasks: u32 = task_cnts.iter().sum();

        let srun_port_raw = std::env::var(SRUN_PORT_ENV).map_err(|_| JobInfoError::MissingEnv(SRUN_PORT_ENV))?;
        let srun_port: u16 = srun_port_raw.trim().parse().map_err(|_| JobInfoError::BadSrunPort)?;

        let tree_width = tree_width.unwrap_or(DEFAULT_TREE_WIDTH).max(1);
        let nnodes = hostlist.len() as u32;
        let info = reverse_tree_info(node_id, nnodes, tree_width);
        let children = reverse_tree_direct_children(node_id, nnodes, tree_width);

        let mut task_offsets = Vec::with_capacity(task_cnts.len());
        let mut acc = 0u32;
        for &c in &task_cnts {
            task_offsets.push(acc);
            acc += c;
        }

        Ok(Self {
            jobid,
            stepid,
            node_id,
            nnodes,
            namespace: format!("pmix.{jobid}.{stepid}"),
            hostlist,
            task_cnts,
            ntasks,
            tree_width,
            timeout: DEFAULT_TIMEOUT,
            srun_port,
            parent_id: info.parent_id,
            children,
            task_offsets,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostlist[self.node_id as usize]
    }

    pub fn parent_id(&self) -> Option<u32> {
        self.parent_id
    }

    pub fn parent_hostname(&self) -> Option<&str> {
        self.parent_id.map(|id| self.hostlist[id as usize].as_str())
    }

    pub fn children(&self) -> &[u32] {
        &self.children
    }

    pub fn hostname_of(&self, node_id: u32) -> Option<&str> {
        self.hostlist.get(node_id as usize).map(String::as_str)
    }

    pub fn node_of_hostname(&self, host: &str) -> Option<u32> {
        self.hostlist.iter().position(|h| h == host).map(|p| p as u32)
    }

    /// Number of local tasks running on this node.
    pub fn local_task_count(&self) -> u32 {
        self.task_cnts[self.node_id as usize]
    }

    /// Global task id for a local rank on this node.
    pub fn task_id(&self, local_id: u32) -> u32 {
        self.task_offsets[self.node_id as usize] + local_id
    }

    /// Local rank for a global task id, if it lives on this node.
    pub fn local_id_of(&self, taskid: u32) -> Option<u32> {
        let base = self.task_offsets[self.node_id as usize];
        let count = self.local_task_count();
        if taskid >= base && taskid < base + count {
            Some(taskid - base)
        } else {
            None
        }
    }

    /// Node owning a global task id.
    pub fn task_node(&self, taskid: u32) -> Option<u32> {
        self.task_offsets
            .iter()
            .zip(self.task_cnts.iter())
            .position(|(&off, &cnt)| taskid >= off && taskid < off + cnt)
            .map(|p| p as u32)
    }

    pub fn local_task_ids(&self) -> Vec<u32> {
        let base = self.task_offsets[self.node_id as usize];
        (0..self.local_task_count()).map(|i| base + i).collect()
    }
}

fn hostname_or_localhost() -> String {
    hostname_from_env().unwrap_or_else(|| "localhost".to_string())
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| std::env::var("PMIX_NODE_HOSTNAME").ok())
}

fn read_hostlist(var: &'static str) -> Result<Vec<String>, JobInfoError> {
    let raw = std::env::var(var).map_err(|_| JobInfoError::MissingEnv(var))?;
    if raw.trim().is_empty() {
        return Err(JobInfoError::EmptyEnv(var));
    }
    Ok(raw.split(',').map(|s| s.trim().to_string()).collect())
}

fn read_task_map(hostlist: &[String]) -> Result<Vec<u32>, JobInfoError> {
    let raw = std::env::var(TASK_MAP_ENV).map_err(|_| JobInfoError::MissingEnv(TASK_MAP_ENV))?;
    if raw.trim().is_empty() {
        return Err(JobInfoError::EmptyEnv(TASK_MAP_ENV));
    }
    let cnts: Result<Vec<u32>, _> = raw.split(',').map(|s| s.trim().parse::<u32>()).collect();
    let cnts = cnts.map_err(|_| JobInfoError::BadTaskMap(TASK_MAP_ENV, raw.clone()))?;
    if cnts.len() != hostlist.len() {
        return Err(JobInfoError::BadTaskMap(TASK_MAP_ENV, raw));
    }
    Ok(cnts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them so they don't trample each other under `cargo test`'s
    // default multithreaded runner.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_env(jobnodes: &str, stepnodes: &str, taskmap: &str, port: &str, hostname: &str) {
        // SAFETY: guarded by ENV_LOCK; no other thread in this process
        // reads/writes these variables concurrently with the test suite.
        unsafe {
            std::env::set_var(JOB_NODES_ENV, jobnodes);
            std::env::set_var(STEP_NODES_ENV, stepnodes);
            std::env::set_var(TASK_MAP_ENV, taskmap);
            std::env::set_var(SRUN_PORT_ENV, port);
            std::env::set_var("HOSTNAME", hostname);
        }
    }

    fn clear_env() {
        unsafe {
            std::env::remove_var(JOB_NODES_ENV);
            std::env::remove_var(STEP_NODES_ENV);
            std::env::remove_var(TASK_MAP_ENV);
            std::env::remove_var(SRUN_PORT_ENV);
            std::env::remove_var("HOSTNAME");
        }
    }

    #[test]
    fn builds_two_node_topology_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_env("n0,n1", "n0,n1", "1,1", "12345", "n1");
        let job = JobTopology::from_env(1, 0, Some(2)).unwrap();
        assert_eq!(job.node_id, 1);
        assert_eq!(job.parent_hostname(), Some("n0"));
        assert!(job.children().is_empty());
        assert_eq!(job.task_id(0), 1);
        assert_eq!(job.task_node(0), Some(0));
        assert_eq!(job.local_id_of(1), Some(0));
        clear_env();
    }

    #[test]
    fn missing_env_var_is_a_fatal_init_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let err = JobTopology::from_env(1, 0, None).unwrap_err();
        assert!(matches!(err, JobInfoError::MissingEnv(STEP_NODES_ENV)));
    }
}
