//! Component B, the I/O engine: a two-phase incremental reader that
//! surfaces a whole message atomically and never blocks on a partial read.
//!
//! Implemented as a [`tokio_util::codec::Decoder`] so the contract ("ready"
//! == `Ok(Some(_))`, "yield without consuming more" == `Ok(None)`,
//! "finalized" == the stream the codec is framing returning `None`) is the
//! one `tokio_util::codec::FramedRead` already gives every caller, rather
//! than a bespoke poll loop.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::header::{FrameHeader, WireError, HDR_SIZE, MAGIC, RECV_HDR_SIZE};

/// A whole inter-node message: header plus exactly `header.paysize` bytes
/// of opaque payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Padding,
    Header,
    Payload(FrameHeader),
}

/// Decodes the receive-side wire format: `[size:4][header:17][payload]`.
///
/// `rcvd_padding` models the "sender id" bytes some transports inject
/// ahead of every message; it is consumed and discarded before each
/// header, not just the first.
pub struct PmixCodec {
    rcvd_padding: usize,
    state: State,
}

impl PmixCodec {
    pub fn new() -> Self {
        Self { rcvd_padding: 0, state: State::Header }
    }

    /// Build a codec that skips `padding` bytes before every header.
    pub fn with_rcvd_padding(padding: usize) -> Self {
        let state = if padding > 0 { State::Padding } else { State::Header };
        Self { rcvd_padding: padding, state }
    }
}

impl Default for PmixCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PmixCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            match self.state {
                State::Padding => {
                    if src.len() < self.rcvd_padding {
                        return Ok(None);
                    }
                    src.advance(self.rcvd_padding);
                    self.state = State::Header;
                }
                State::Header => {
                    if src.len() < RECV_HDR_SIZE {
                        return Ok(None);
                    }
                    let size = u32::from_be_bytes(src[0..4].try_into().unwrap());
                    let header = FrameHeader::unpack(&src[4..RECV_HDR_SIZE])?;
                    let expected = HDR_SIZE as u32 + header.paysize;
                    if size != expected {
                        return Err(WireError::SizeMismatch { declared: size, expected });
                    }
                    src.advance(RECV_HDR_SIZE);
                    self.state = State::Payload(header);
                }
                State::Payload(header) => {
                    let paysize = header.paysize as usize;
                    if src.len() < paysize {
                        src.reserve(paysize.saturating_sub(src.len()));
                        return Ok(None);
                    }
                    let payload = src.split_to(paysize).freeze();
                    self.state = if self.rcvd_padding > 0 { State::Padding } else { State::Header };
                    return Ok(Some(Frame { header, payload }));
                }
            }
        }
    }
}

/// Pack a bare header + payload for sending (no transport size prefix;
/// that is the outbound transport's job, asymmetric to `PmixCodec`'s
/// receive path).
pub fn pack_for_send(header: &FrameHeader, payload: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(HDR_SIZE + payload.len());
    buf.extend_from_slice(&header.pack());
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

/// Prefix a packed `header + payload` buffer with the 4-byte transport
/// total-size field a receiving [`PmixCodec`] expects.
pub fn with_recv_prefix(packed: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(4 + packed.len());
    buf.extend_from_slice(&(packed.len() as u32).to_be_bytes());
    buf.extend_from_slice(packed);
    Bytes::from(buf)
}

/// Sanity helper used by tests and by the transport layer to assert the
/// magic before ever touching the network.
pub fn is_canonical_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_be_bytes(bytes[0..4].try_into().unwrap()) == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Command;

    fn wire_frame(gen: u32, nodeid: u32, cmd: Command, payload: &[u8]) -> Bytes {
        let header = FrameHeader::new(gen, nodeid, payload.len() as u32, cmd);
        let packed = pack_for_send(&header, payload);
        with_recv_prefix(&packed)
    }

    #[test]
    fn decodes_a_whole_message_in_one_shot() {
        let mut codec = PmixCodec::new();
        let mut buf = BytesMut::from(&wire_frame(0, 1, Command::Fence, b"AB")[..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame ready");
        assert_eq!(frame.header.nodeid, 1);
        assert_eq!(&frame.payload[..], b"AB");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_reads_yield_without_consuming() {
        let mut codec = PmixCodec::new();
        let whole = wire_frame(0, 1, Command::Fence, b"hello");
        let mut buf = BytesMut::from(&whole[..whole.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&whole[whole.len() - 3..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame ready now");
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn rejects_bad_magic_without_finalizing_other_data() {
        let mut codec = PmixCodec::new();
        let mut good = wire_frame(0, 0, Command::Fence, b"x").to_vec();
        // Corrupt the magic byte inside the header (offset 4 = after the
        // 4-byte transport size prefix).
        good[4] = 0x00;
        let mut buf = BytesMut::from(&good[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut codec = PmixCodec::new();
        let mut bytes = wire_frame(0, 0, Command::Fence, b"xyz").to_vec();
        // Corrupt the transport size prefix so it disagrees with paysize.
        bytes[0..4].copy_from_slice(&999u32.to_be_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(codec.decode(&mut buf), Err(WireError::SizeMismatch { .. })));
    }

    #[test]
    fn rcvd_padding_is_stripped_before_every_message() {
        let mut codec = PmixCodec::with_rcvd_padding(4);
        let mut stream = BytesMut::new();
        stream.extend_from_slice(b"\0\0\0\0");
        stream.extend_from_slice(&wire_frame(0, 1, Command::Fence, b"A"));
        stream.extend_from_slice(b"\0\0\0\0");
        stream.extend_from_slice(&wire_frame(1, 1, Command::Fence, b"B"));

        let first = codec.decode(&mut stream).unwrap().expect("first frame");
        assert_eq!(&first.payload[..], b"A");
        let second = codec.decode(&mut stream).unwrap().expect("second frame");
        assert_eq!(&second.payload[..], b"B");
    }

    #[tokio::test]
    async fn framed_read_over_a_real_async_reader_yields_whole_messages() {
        use tokio_stream::StreamExt as _;
        use tokio_util::codec::FramedRead;

        let whole = wire_frame(0, 2, Command::Fence, b"payload-bytes");
        let reader = tokio::io::BufReader::new(&whole[..]);
        let mut framed = FramedRead::new(reader, PmixCodec::new());
        let frame = framed.next().await.unwrap().unwrap();
        assert_eq!(frame.header.nodeid, 2);
        assert_eq!(&frame.payload[..], b"payload-bytes");
        assert!(framed.next().await.is_none());
    }
}
