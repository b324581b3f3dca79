//! The concrete stand-in for a host-provided `forward_data` primitive:
//! a lazily-dialed, cached TCP connection per destination node, writing
//! frames with the transport size-prefix `pmix-wire`'s receive side
//! expects (the asymmetric header pack/unpack between send and receive
//! paths). Sends get a bounded retry rather than a best-effort fire and
//! forget.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use pmix_wire::{pack_for_send, with_recv_prefix, FrameHeader};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const MAX_SEND_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect { host: String, port: u16, #[source] source: std::io::Error },
    #[error("failed to send to {host} after {attempts} attempts: {source}")]
    SendFailed { host: String, attempts: u32, #[source] source: std::io::Error },
}

/// Every node in the step listens on the same rendezvous port (its bound
/// port is exported by the launcher via `PMIX_SRUN_PORT`); `forward_data`
/// dials `host:port` the first time it needs that peer and reuses the
/// connection afterward.
pub struct TcpTransport {
    port: u16,
    conns: Mutex<HashMap<String, TcpStream>>,
}

impl TcpTransport {
    pub fn new(port: u16) -> Self {
        Self { port, conns: Mutex::new(HashMap::new()) }
    }

    async fn dial(&self, host: &str) -> Result<TcpStream, TransportError> {
        TcpStream::connect((host, self.port))
            .await
            .map_err(|source| TransportError::Connect { host: host.to_string(), port: self.port, source })
    }

    /// `forward_data(host, ..., len, bytes)`: best-effort send, bounded
    /// retry, connection re-dialed on failure; exhausting the retries is
    /// fatal for that collective round, logged and propagated to the
    /// caller rather than silently dropped.
    pub async fn forward_data(&self, host: &str, header: &FrameHeader, payload: &Bytes) -> Result<(), TransportError> {
        let framed = with_recv_prefix(&pack_for_send(header, payload));

        let mut last_err = None;
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            let mut conns = self.conns.lock().await;
            if !conns.contains_key(host) {
                match self.dial(host).await {
                    Ok(stream) => {
                        conns.insert(host.to_string(), stream);
                    }
                    Err(err) => {
                        drop(conns);
                        last_err = Some(err);
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                }
            }
            let stream = conns.get_mut(host).expect("just inserted or already present");
            match stream.write_all(&framed).await {
                Ok(()) => return Ok(()),
                Err(io_err) => {
                    tracing::warn!(host, attempt, error = %io_err, "forward_data write failed, dropping cached connection");
                    conns.remove(host);
                    drop(conns);
                    last_err = Some(TransportError::SendFailed { host: host.to_string(), attempts: attempt, source: io_err });
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
        Err(last_err.expect("loop always sets last_err before exhausting attempts"))
    }
}
