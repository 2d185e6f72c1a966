//! Per-connection single-token gates.
//!
//! A connection's driver holds the [`FlowGate`] and waits on it before every
//! send; the response path holds the [`FlowGates`] registry and either hands
//! out the next token or retires the gate once the connection's quota of
//! responses has been reached. The response count lives in the same registry
//! slot as the token sender, so the advance-or-retire decision for a response
//! is made under one shard lock.

use crate::transport::SessionId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateSignal {
    /// One request may be sent.
    Proceed,
    /// The gate was retired; no further tokens will ever arrive.
    Stop,
}

/// Consumer half of a connection's gate, owned by its request driver.
#[derive(Debug)]
pub struct FlowGate {
    session_id: SessionId,
    tokens: mpsc::Receiver<()>,
}

impl FlowGate {
    /// Suspends until a token is available or the gate is retired.
    pub async fn wait(&mut self) -> GateSignal {
        if !self.tokens.is_closed()
            && let Some(()) = self.tokens.recv().await
        {
            return GateSignal::Proceed;
        }
        debug!(session = %self.session_id, "gate retired");
        GateSignal::Stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Below quota; one more token was released.
    Advanced { responses: u64 },
    /// Quota reached; the gate was closed and unregistered.
    Completed { responses: u64 },
    /// No live gate for this session.
    Unregistered,
}

#[derive(Debug)]
struct Slot {
    tokens: mpsc::Sender<()>,
    responses: u64,
}

#[derive(Debug, Default)]
pub struct FlowGates {
    slots: DashMap<SessionId, Slot>,
}

pub type SharedGates = Arc<FlowGates>;

impl FlowGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedGates {
        Arc::new(Self::new())
    }

    /// Creates an empty gate for `session_id`. Call [`advance`](Self::advance)
    /// to let the first request through.
    pub fn register(&self, session_id: SessionId) -> FlowGate {
        let (tx, rx) = mpsc::channel(1);
        let slot = Slot {
            tokens: tx,
            responses: 0,
        };
        if self.slots.insert(session_id, slot).is_some() {
            warn!(session = %session_id, "replaced an existing gate registration");
        }
        FlowGate {
            session_id,
            tokens: rx,
        }
    }

    /// Releases one token. Returns false when the session has no live gate
    /// or a token is already pending.
    pub fn advance(&self, session_id: SessionId) -> bool {
        match self.slots.get(&session_id) {
            Some(slot) => release(session_id, &slot.tokens),
            None => {
                debug!(session = %session_id, "advance on retired gate ignored");
                false
            }
        }
    }

    /// Closes the gate and drops its registration in one step. Returns false
    /// if it was already retired.
    pub fn close_and_retire(&self, session_id: SessionId) -> bool {
        // dropping the only sender closes the channel
        self.slots.remove(&session_id).is_some()
    }

    /// Counts one response for `session_id` and either advances the gate or,
    /// once `quota` responses have been seen, retires it.
    pub fn record_response(&self, session_id: SessionId, quota: u64) -> ResponseOutcome {
        match self.slots.entry(session_id) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.responses += 1;
                let responses = slot.responses;

                if responses >= quota {
                    entry.remove();
                    ResponseOutcome::Completed { responses }
                } else {
                    release(session_id, &entry.get().tokens);
                    ResponseOutcome::Advanced { responses }
                }
            }
            Entry::Vacant(_) => ResponseOutcome::Unregistered,
        }
    }

    pub fn responses(&self, session_id: SessionId) -> Option<u64> {
        self.slots.get(&session_id).map(|slot| slot.responses)
    }

    pub fn is_registered(&self, session_id: SessionId) -> bool {
        self.slots.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn release(session_id: SessionId, tokens: &mpsc::Sender<()>) -> bool {
    match tokens.try_send(()) {
        Ok(()) => true,
        Err(TrySendError::Full(())) => {
            warn!(session = %session_id, "token already pending; not releasing another");
            false
        }
        Err(TrySendError::Closed(())) => {
            debug!(session = %session_id, "driver has gone away");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready_eq};

    const SESSION: SessionId = SessionId(7);

    #[tokio::test]
    async fn wait_blocks_until_advanced() {
        let gates = FlowGates::new();
        let mut gate = gates.register(SESSION);

        let mut wait = task::spawn(gate.wait());
        assert_pending!(wait.poll());

        assert!(gates.advance(SESSION));
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), GateSignal::Proceed);
    }

    #[tokio::test]
    async fn retiring_wakes_a_blocked_wait_with_stop() {
        let gates = FlowGates::new();
        let mut gate = gates.register(SESSION);

        let mut wait = task::spawn(gate.wait());
        assert_pending!(wait.poll());

        assert!(gates.close_and_retire(SESSION));
        assert!(wait.is_woken());
        assert_ready_eq!(wait.poll(), GateSignal::Stop);
        drop(wait);

        assert_eq!(gate.wait().await, GateSignal::Stop);
        assert!(!gates.is_registered(SESSION));
    }

    #[tokio::test]
    async fn retired_gate_stops_even_with_a_pending_token() {
        let gates = FlowGates::new();
        let mut gate = gates.register(SESSION);

        assert!(gates.advance(SESSION));
        assert!(gates.close_and_retire(SESSION));
        assert_eq!(gate.wait().await, GateSignal::Stop);
    }

    #[test]
    fn only_one_token_may_be_pending() {
        let gates = FlowGates::new();
        let _gate = gates.register(SESSION);

        assert!(gates.advance(SESSION));
        assert!(!gates.advance(SESSION));
    }

    #[test]
    fn missing_sessions_are_no_ops() {
        let gates = FlowGates::new();

        assert!(!gates.advance(SESSION));
        assert!(!gates.close_and_retire(SESSION));
        assert_eq!(gates.record_response(SESSION, 1), ResponseOutcome::Unregistered);
    }

    #[tokio::test]
    async fn quota_completion_retires_exactly_once() {
        let gates = FlowGates::new();
        let mut gate = gates.register(SESSION);
        assert!(gates.advance(SESSION));

        assert_eq!(gate.wait().await, GateSignal::Proceed);
        assert_eq!(
            gates.record_response(SESSION, 3),
            ResponseOutcome::Advanced { responses: 1 }
        );
        assert_eq!(gate.wait().await, GateSignal::Proceed);
        assert_eq!(
            gates.record_response(SESSION, 3),
            ResponseOutcome::Advanced { responses: 2 }
        );
        assert_eq!(gate.wait().await, GateSignal::Proceed);
        assert_eq!(
            gates.record_response(SESSION, 3),
            ResponseOutcome::Completed { responses: 3 }
        );

        assert_eq!(gate.wait().await, GateSignal::Stop);
        assert_eq!(gates.record_response(SESSION, 3), ResponseOutcome::Unregistered);
        assert!(!gates.advance(SESSION));
        assert!(!gates.close_and_retire(SESSION));
        assert_eq!(gates.responses(SESSION), None);
    }

    #[test]
    fn re_registering_stops_the_previous_gate() {
        let gates = FlowGates::new();
        let mut first = gates.register(SESSION);
        let _second = gates.register(SESSION);

        let mut wait = task::spawn(first.wait());
        assert_ready_eq!(wait.poll(), GateSignal::Stop);
        assert_eq!(gates.len(), 1);
    }

    #[test]
    fn concurrent_responses_never_exceed_quota() {
        let gates = Arc::new(FlowGates::new());
        let _gate = gates.register(SESSION);
        let quota = 50;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gates = gates.clone();
                std::thread::spawn(move || {
                    (0..40)
                        .filter(|_| {
                            matches!(
                                gates.record_response(SESSION, quota),
                                ResponseOutcome::Completed { .. }
                            )
                        })
                        .count()
                })
            })
            .collect();

        let completions: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(completions, 1);
        assert!(gates.is_empty());
    }
}
