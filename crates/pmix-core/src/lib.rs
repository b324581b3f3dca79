//! Domain types shared by the collective engine and the node binary:
//! tree math, the blob store, client session state, and the per-step job
//! topology snapshot. No networking runtime lives here.

pub mod client_state;
pub mod db;
pub mod job;
pub mod tree;

pub use client_state::{ClientSession, ClientState, ClientStateError};
pub use db::Db;
pub use job::{JobInfoError, JobTopology};
pub use tree::{reverse_tree_direct_children, reverse_tree_info, TreeInfo};
