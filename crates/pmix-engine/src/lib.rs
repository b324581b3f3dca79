//! Orchestration layer: the tree collective engine (E), server dispatch
//! (F), and the DMDX handler (G), bound together by a [`StepContext`]
//! (D9's "explicit Step Context" recommendation) threaded through every
//! entry point instead of module-scope globals.

pub mod collective;
pub mod context;
pub mod dispatch;
pub mod dmdx;
pub mod payload;

pub use collective::{Collective, CollectiveAction, CollectiveError, CollectiveEvent};
pub use context::{LocalModexEvent, StepContext};
pub use dispatch::{contrib_local, handle_frame, DispatchError, Outbound};
pub use dmdx::{Dmdx, DmdxError, DmdxReply};
