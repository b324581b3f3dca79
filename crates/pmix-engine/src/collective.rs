//! Component E, the tree fan-in/fan-out collective engine, one
//! [`Collective`] instance per round-robin collective slot. Grounded on
//! `pmixp_coll.c`'s `pmixp_coll_contrib_local`/`_contrib_node`/
//! `_progress_fan_in`/`pmixp_coll_fan_out_data`/`_reset_coll`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollState {
    Sync,
    FanIn,
    FanOut,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectiveError {
    /// `_is_child_no` found no match, a protocol violation in the
    /// original (`xassert`); here a typed error so a hostile or
    /// misconfigured peer can only ever take down its own connection,
    /// never panic the node.
    #[error("{0} is not a direct child of this node in the current tree")]
    NotAChild(String),
    /// A FAN_OUT frame arrived while the instance was not awaiting one.
    #[error("received fan-out data while in state other than FAN_OUT")]
    NotInFanOut,
}

/// What the caller must do after a state-mutating call returns. Computed
/// under the instance's lock, but always executed after it is released
/// (testable property 8: no send under lock).
#[derive(Debug, Clone)]
pub enum CollectiveAction {
    /// Nothing to send yet; still accumulating contributions.
    None,
    /// Send the aggregated payload to the parent as one FAN_IN message.
    SendToParent { seq: u32, payload: Bytes },
    /// Root only: broadcast the aggregated payload as FAN_OUT to every
    /// participant. `targets` includes this node's own hostname; the
    /// caller delivers to itself by calling [`Collective::fan_out_data`]
    /// directly rather than round-tripping through the transport.
    SendFanOut { seq: u32, payload: Bytes, targets: Vec<String> },
}

/// Delivered once per completed or timed-out round.
#[derive(Debug, Clone)]
pub enum CollectiveEvent {
    Completed { seq: u32, payload: Bytes },
    TimedOut { seq: u32 },
}

struct Inner {
    state: CollState,
    ch_contribs: Vec<bool>,
    contrib_cntr: u32,
    contrib_local: bool,
    payload: BytesMut,
    seq: u32,
    ts: Instant,
}

/// One collective "instance", reused across every round of one logical
/// fence slot; `seq` is bumped at the end of each round instead of
/// allocating a fresh instance.
pub struct Collective {
    children: Vec<String>,
    parent_host: Option<String>,
    participants: Vec<String>,
    timeout: Duration,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<CollectiveEvent>,
}

impl Collective {
    pub fn new(
        children: Vec<String>,
        parent_host: Option<String>,
        participants: Vec<String>,
        timeout: Duration,
        events: mpsc::UnboundedSender<CollectiveEvent>,
    ) -> Self {
        let ch_contribs = vec![false; children.len()];
        Self {
            children,
            parent_host,
            participants,
            timeout,
            inner: Mutex::new(Inner {
                state: CollState::Sync,
                ch_contribs,
                contrib_cntr: 0,
                contrib_local: false,
                payload: BytesMut::new(),
                seq: 0,
                ts: Instant::now(),
            }),
            events,
        }
    }

    pub fn seq(&self) -> u32 {
        self.inner.lock().unwrap().seq
    }

    fn child_slot(&self, sender_host: &str) -> Option<usize> {
        self.children.iter().position(|h| h == sender_host)
    }

    /// `pmixp_coll_contrib_local`: this node's own rank(s) contribute.
    pub fn contrib_local(&self, payload: &[u8]) -> CollectiveAction {
        let mut g = self.inner.lock().unwrap();
        if g.state == CollState::Sync {
            g.state = CollState::FanIn;
            g.ts = Instant::now();
        }
        g.payload.extend_from_slice(payload);
        g.contrib_local = true;
        self.progress_fan_in(&mut g)
    }

    /// `pmixp_coll_contrib_node`: a peer node's FAN_IN contribution
    /// arrives. `Ok(CollectiveAction::None)` covers both the duplicate
    /// and late-arrival drop paths.
    pub fn contrib_node(&self, sender_host: &str, payload: &[u8]) -> Result<CollectiveAction, CollectiveError> {
        let idx = self.child_slot(sender_host).ok_or_else(|| CollectiveError::NotAChild(sender_host.to_string()))?;
        let mut g = self.inner.lock().unwrap();
        if g.ch_contribs[idx] {
            tracing::debug!(sender_host, "duplicate fan-in contribution dropped");
            return Ok(CollectiveAction::None);
        }
        if g.state != CollState::FanIn {
            tracing::warn!(sender_host, state = ?g.state, "late fan-in contribution dropped");
            return Ok(CollectiveAction::None);
        }
        g.payload.extend_from_slice(payload);
        g.ch_contribs[idx] = true;
        g.contrib_cntr += 1;
        Ok(self.progress_fan_in(&mut g))
    }

    /// `_progress_fan_in`: called after every contribution; computes the
    /// next action but never performs it, the caller sends outside the lock.
    fn progress_fan_in(&self, g: &mut Inner) -> CollectiveAction {
        if g.state != CollState::FanIn {
            return CollectiveAction::None;
        }
        if !(g.contrib_local && g.contrib_cntr == self.children.len() as u32) {
            return CollectiveAction::None;
        }
        let payload = g.payload.clone().freeze();
        let seq = g.seq;
        g.state = CollState::FanOut;
        g.payload.clear();
        match &self.parent_host {
            Some(_) => CollectiveAction::SendToParent { seq, payload },
            None => CollectiveAction::SendFanOut { seq, payload, targets: self.participants.clone() },
        }
    }

    /// `pmixp_coll_fan_out_data`: the aggregated payload has arrived back
    /// down the tree (or is this root's own self-delivery). Delivers the
    /// completion event and resets the instance for the next round.
    pub fn fan_out_data(&self, payload: Bytes) -> Result<(), CollectiveError> {
        let mut g = self.inner.lock().unwrap();
        if g.state != CollState::FanOut {
            return Err(CollectiveError::NotInFanOut);
        }
        let seq = g.seq;
        self.reset(&mut g);
        let _ = self.events.send(CollectiveEvent::Completed { seq, payload });
        Ok(())
    }

    /// Periodic sweep target: resets and fires `TimedOut` if the instance
    /// has been outside SYNC for longer than its configured timeout.
    /// Returns `true` iff it fired.
    pub fn reset_if_timed_out(&self, now: Instant) -> bool {
        let mut g = self.inner.lock().unwrap();
        if g.state == CollState::Sync || now.saturating_duration_since(g.ts) <= self.timeout {
            return false;
        }
        let seq = g.seq;
        self.reset(&mut g);
        let _ = self.events.send(CollectiveEvent::TimedOut { seq });
        true
    }

    fn reset(&self, g: &mut Inner) {
        g.state = CollState::Sync;
        g.ch_contribs.iter_mut().for_each(|c| *c = false);
        g.contrib_cntr = 0;
        g.contrib_local = false;
        g.payload.clear();
        g.seq += 1;
        g.ts = Instant::now();
    }

    /// True iff `frame_gen` is stale relative to this instance's current
    /// round (testable property 5).
    pub fn is_stale(&self, frame_gen: u32) -> bool {
        frame_gen < self.inner.lock().unwrap().seq
    }
}
