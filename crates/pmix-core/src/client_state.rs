//! Component D, the per-client session state machine: `UNCONNECTED -> ACK ->
//! OPERATE <-> COLL`. Grounded on `pmix_state.h`'s `pmix_cli_state_t` and
//! the `pmix_state_cli_*` transition functions.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A client's position in its local connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Socket accepted, no handshake yet.
    Unconnected,
    /// Handshake acknowledged; task id assigned.
    Ack,
    /// Connected and idle between collectives.
    Operate,
    /// Currently contributing to a collective.
    Coll,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientStateError {
    #[error("invalid transition from {from:?} via {via}")]
    InvalidTransition { from: ClientState, via: &'static str },
}

impl ClientState {
    /// `pmix_state_cli_connecting`: UNCONNECTED -> ACK.
    pub fn connecting(self) -> Result<Self, ClientStateError> {
        match self {
            ClientState::Unconnected => Ok(ClientState::Ack),
            from => Err(ClientStateError::InvalidTransition { from, via: "connecting" }),
        }
    }

    /// `pmix_state_cli_connected`: ACK -> OPERATE.
    pub fn connected(self) -> Result<Self, ClientStateError> {
        match self {
            ClientState::Ack => Ok(ClientState::Operate),
            from => Err(ClientStateError::InvalidTransition { from, via: "connected" }),
        }
    }

    /// A client joins a collective: OPERATE -> COLL.
    pub fn join_collective(self) -> Result<Self, ClientStateError> {
        match self {
            ClientState::Operate => Ok(ClientState::Coll),
            from => Err(ClientStateError::InvalidTransition { from, via: "join_collective" }),
        }
    }

    /// `pmix_state_task_coll_finish`: COLL -> OPERATE.
    pub fn task_coll_finish(self) -> Result<Self, ClientStateError> {
        match self {
            ClientState::Coll => Ok(ClientState::Operate),
            from => Err(ClientStateError::InvalidTransition { from, via: "task_coll_finish" }),
        }
    }

    /// `pmix_state_cli_finalize`: any state -> UNCONNECTED, used when a
    /// client disconnects or is torn down.
    pub fn finalize(self) -> ClientState {
        ClientState::Unconnected
    }
}

/// A live client session: its place in the state machine plus an outbox
/// handle to the task's writer loop. The session owns no socket directly;
/// writes go through `outbox`, matching the actor-style dispatch the
/// engine uses elsewhere for task work.
#[derive(Debug)]
pub struct ClientSession {
    pub taskid: u32,
    pub local_id: u32,
    state: ClientState,
    outbox: mpsc::Sender<Bytes>,
}

impl ClientSession {
    pub fn new(taskid: u32, local_id: u32, outbox: mpsc::Sender<Bytes>) -> Self {
        Self { taskid, local_id, state: ClientState::Unconnected, outbox }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn connecting(&mut self) -> Result<(), ClientStateError> {
        self.state = self.state.connecting()?;
        Ok(())
    }

    pub fn connected(&mut self) -> Result<(), ClientStateError> {
        self.state = self.state.connected()?;
        Ok(())
    }

    pub fn join_collective(&mut self) -> Result<(), ClientStateError> {
        self.state = self.state.join_collective()?;
        Ok(())
    }

    pub fn task_coll_finish(&mut self) -> Result<(), ClientStateError> {
        self.state = self.state.task_coll_finish()?;
        Ok(())
    }

    pub fn finalize(&mut self) {
        self.state = self.state.finalize();
    }

    /// Hand a message to this client's writer task. Fails silently into
    /// an error the caller can log and treat as a disconnect: a full
    /// outbox or a dropped receiver both mean the client is gone.
    pub async fn send(&self, msg: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.outbox.send(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ClientSession, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        (ClientSession::new(3, 0, tx), rx)
    }

    #[test]
    fn happy_path_walks_every_state() {
        let (mut s, _rx) = session();
        assert_eq!(s.state(), ClientState::Unconnected);
        s.connecting().unwrap();
        assert_eq!(s.state(), ClientState::Ack);
        s.connected().unwrap();
        assert_eq!(s.state(), ClientState::Operate);
        s.join_collective().unwrap();
        assert_eq!(s.state(), ClientState::Coll);
        s.task_coll_finish().unwrap();
        assert_eq!(s.state(), ClientState::Operate);
    }

    #[test]
    fn skipping_ack_is_rejected() {
        let (mut s, _rx) = session();
        let err = s.connected().unwrap_err();
        assert_eq!(err, ClientStateError::InvalidTransition { from: ClientState::Unconnected, via: "connected" });
    }

    #[test]
    fn coll_can_be_entered_and_left_repeatedly() {
        let (mut s, _rx) = session();
        s.connecting().unwrap();
        s.connected().unwrap();
        for _ in 0..3 {
            s.join_collective().unwrap();
            s.task_coll_finish().unwrap();
        }
        assert_eq!(s.state(), ClientState::Operate);
    }

    #[test]
    fn finalize_resets_from_any_state() {
        let (mut s, _rx) = session();
        s.connecting().unwrap();
        s.finalize();
        assert_eq!(s.state(), ClientState::Unconnected);
    }

    #[tokio::test]
    async fn send_delivers_through_the_outbox() {
        let (s, mut rx) = session();
        s.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }
}
