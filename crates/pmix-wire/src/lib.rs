//! Wire-level building blocks for the PMIx inter-node transport: the
//! canonical header (component A) and the incremental frame reader
//! (component B). No networking runtime lives here; callers drive
//! [`codec::PmixCodec`] through `tokio_util::codec::FramedRead` over
//! whatever `AsyncRead` their transport provides.

pub mod codec;
pub mod header;

pub use codec::{pack_for_send, with_recv_prefix, Frame, PmixCodec};
pub use header::{Command, FrameHeader, WireError, HDR_SIZE, MAGIC, RECV_HDR_SIZE};
