//! Component A, the framing codec: pack/unpack of the canonical 17-byte
//! header in a fixed field order, network byte order throughout.

use std::fmt;

/// Sentinel that opens every frame. A receiver that sees anything else
/// closes the connection; see [`WireError::BadMagic`].
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Size of the canonical header on the wire: `magic, gen, nodeid, paysize`
/// (4 bytes each) followed by `cmd` (1 byte).
pub const HDR_SIZE: usize = 4 * 4 + 1;

/// Size of the header as it appears on a server receive path, which has an
/// extra 4-byte total-size field prepended by the transport ahead of the
/// canonical header.
pub const RECV_HDR_SIZE: usize = 4 + HDR_SIZE;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("bad magic: expected {MAGIC:#010x}, got {0:#010x}")]
    BadMagic(u32),
    #[error("short header: need {HDR_SIZE} bytes, got {0}")]
    ShortHeader(usize),
    #[error("transport size field ({declared}) does not match header + payload ({expected})")]
    SizeMismatch { declared: u32, expected: u32 },
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),
}

/// The four inter-node message kinds. A closed, exhaustively-matched enum,
/// so a `DIRECT_RESP` frame can never silently fall through to the wrong
/// handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Fence = 1,
    FenceResp = 2,
    Direct = 3,
    DirectResp = 4,
}

impl Command {
    pub fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            1 => Ok(Command::Fence),
            2 => Ok(Command::FenceResp),
            3 => Ok(Command::Direct),
            4 => Ok(Command::DirectResp),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Fence => "FENCE",
            Command::FenceResp => "FENCE_RESP",
            Command::Direct => "DIRECT",
            Command::DirectResp => "DIRECT_RESP",
        };
        f.write_str(s)
    }
}

/// The canonical 17-byte header: `magic, gen, nodeid, paysize, cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub gen: u32,
    pub nodeid: u32,
    pub paysize: u32,
    pub cmd: Command,
}

impl FrameHeader {
    pub fn new(gen: u32, nodeid: u32, paysize: u32, cmd: Command) -> Self {
        Self { gen, nodeid, paysize, cmd }
    }

    /// Pack the bare header (no transport size prefix). Always exactly
    /// [`HDR_SIZE`] bytes (see testable property 1).
    pub fn pack(&self) -> [u8; HDR_SIZE] {
        let mut out = [0u8; HDR_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&self.gen.to_be_bytes());
        out[8..12].copy_from_slice(&self.nodeid.to_be_bytes());
        out[12..16].copy_from_slice(&self.paysize.to_be_bytes());
        out[16] = self.cmd as u8;
        out
    }

    /// Unpack a bare [`HDR_SIZE`]-byte header, validating only the magic.
    /// The transport size-prefix check belongs to the receive path and is
    /// performed by [`crate::codec::PmixCodec`].
    pub fn unpack(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HDR_SIZE {
            return Err(WireError::ShortHeader(bytes.len()));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let gen = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let nodeid = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let paysize = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
        let cmd = Command::from_u8(bytes[16])?;
        Ok(Self { gen, nodeid, paysize, cmd })
    }
}
