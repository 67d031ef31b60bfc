//! Consensus-Update: drive every participant of one channel to unanimously
//! sign a state carrying a target outcome.
//!
//! The protocol rides the existing round-robin turn order, so no participant
//! has to be online at the same time as any other. Each voter in turn either
//! accepts the proposal in flight (decrementing the vote counter carried in
//! the channel's `app_data`) or replaces it with its own proposal, resetting
//! the counter to `n - 1`.

use crate::channel::{ConsensusPayload, Outcome, SignedState, StateVars};
use crate::encode::types::Hash;
use crate::outbox::Outbox;
use crate::protocols::{
    EventKind, Locator, ProcessId, Protocol, ProtocolEvent, ProtocolName, ProtocolViolation,
};
use crate::store::Store;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub target_outcome: Outcome,
    /// Whether the parent has already granted us the right to write to the
    /// channel. A parent serializing several writers grants this to exactly
    /// one child at a time.
    pub cleared_to_send: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusFailure {
    /// Our turn came around again without the channel reaching the target:
    /// a counterparty deviated from the voting protocol.
    ConsensusNotReached,
    Cancelled,
    Error { detail: String },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusStage {
    NotSafeToSend { cleared_to_send: bool },
    StateSent,
    Success,
    Failure(ConsensusFailure),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConsensusUpdate {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub target_outcome: Outcome,
    pub stage: ConsensusStage,
}

/// What `send_if_safe` decided to do, computed against an immutable store
/// borrow before any mutation happens.
enum Decision {
    Wait,
    Finish(ConsensusStage),
    Sign(StateVars),
}

#[derive(Debug, Error)]
enum DecideError {
    #[error("{0}")]
    Store(#[from] crate::store::StoreError),
}

impl ConsensusUpdate {
    pub fn initialize(params: ConsensusParams, store: &mut Store, outbox: &mut Outbox) -> Self {
        let mut update = ConsensusUpdate {
            process_id: params.process_id,
            locator: params.locator,
            channel_id: params.channel_id,
            target_outcome: params.target_outcome,
            stage: ConsensusStage::NotSafeToSend {
                cleared_to_send: params.cleared_to_send,
            },
        };
        update.send_if_safe(store, outbox);
        update
    }

    /// Whether `signed` is the target outcome with a completed vote.
    fn is_target(&self, signed: &SignedState) -> bool {
        if signed.state.vars.outcome != self.target_outcome {
            return false;
        }
        match ConsensusPayload::from_app_data(&signed.state.vars.app_data) {
            Ok(payload) => {
                payload.further_votes_required == 0
                    && payload.proposed_outcome == self.target_outcome
            }
            Err(_) => false,
        }
    }

    fn target_reached(&self, store: &Store) -> bool {
        store
            .channel(&self.channel_id)
            .and_then(|record| record.supported())
            .map(|supported| self.is_target(supported))
            .unwrap_or(false)
    }

    fn decide(&self, store: &Store) -> Result<Decision, DecideError> {
        let record = store.expect_channel(&self.channel_id)?;
        let n = record.participant_count() as u64;
        let me = store.my_index(&self.channel_id)? as u64;

        // Nothing to judge turn order against yet.
        let supported = match record.supported() {
            Some(s) => s,
            None => return Ok(Decision::Wait),
        };

        // Idempotent short-circuit: consensus may already exist, including
        // because our own earlier vote completed it.
        if self.is_target(supported) {
            return Ok(Decision::Finish(ConsensusStage::Success));
        }

        if (supported.turn_num() + 1) % n != me {
            return Ok(Decision::Wait);
        }

        if matches!(self.stage, ConsensusStage::StateSent) {
            return Ok(Decision::Finish(ConsensusStage::Failure(
                ConsensusFailure::ConsensusNotReached,
            )));
        }

        if matches!(
            self.stage,
            ConsensusStage::NotSafeToSend {
                cleared_to_send: false
            }
        ) {
            return Ok(Decision::Wait);
        }

        let latest = match record.latest() {
            Some(l) => l,
            None => return Ok(Decision::Wait),
        };
        let mut vars = latest.state.vars.make_next();
        match ConsensusPayload::from_app_data(&latest.state.vars.app_data) {
            Ok(payload) if payload.proposed_outcome == self.target_outcome => {
                // Accept: one fewer vote outstanding; at zero the proposal
                // becomes the channel's outcome.
                let further_votes_required = payload.further_votes_required.saturating_sub(1);
                if further_votes_required == 0 {
                    vars.outcome = payload.proposed_outcome.clone();
                }
                vars.app_data = ConsensusPayload {
                    proposed_outcome: self.target_outcome.clone(),
                    further_votes_required,
                }
                .to_app_data();
            }
            _ => {
                // Propose: restart the vote with our target. The outcome
                // only changes once everyone has voted.
                vars.app_data = ConsensusPayload {
                    proposed_outcome: self.target_outcome.clone(),
                    further_votes_required: (n - 1) as u32,
                }
                .to_app_data();
            }
        }
        Ok(Decision::Sign(vars))
    }

    /// Re-evaluated after every event: make whatever progress is safe.
    fn send_if_safe(&mut self, store: &mut Store, outbox: &mut Outbox) {
        let decision = match self.decide(store) {
            Ok(d) => d,
            Err(e) => {
                self.stage = ConsensusStage::Failure(ConsensusFailure::Error {
                    detail: e.to_string(),
                });
                return;
            }
        };
        match decision {
            Decision::Wait => {}
            Decision::Finish(stage) => self.stage = stage,
            Decision::Sign(vars) => {
                let sender = store.our_participant_id(&self.channel_id);
                let recipients = store.counterparties(&self.channel_id);
                let signed = sender.and_then(|sender| {
                    let recipients = recipients?;
                    let signed = store.sign_and_insert(self.channel_id, vars)?;
                    outbox.queue_states(&sender, recipients, vec![signed.clone()]);
                    Ok(signed)
                });
                match signed {
                    Ok(_) => {
                        self.stage = ConsensusStage::StateSent;
                        // We may have been the last voter.
                        if self.target_reached(store) {
                            self.stage = ConsensusStage::Success;
                        }
                    }
                    Err(e) => {
                        self.stage = ConsensusStage::Failure(ConsensusFailure::Error {
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }
    }
}

impl Protocol for ConsensusUpdate {
    const NAME: ProtocolName = ProtocolName::ConsensusUpdate;

    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            ConsensusStage::Success | ConsensusStage::Failure(_)
        )
    }

    fn transition(
        mut self,
        store: &mut Store,
        outbox: &mut Outbox,
        event: &ProtocolEvent,
    ) -> Result<Self, ProtocolViolation> {
        if self.is_terminal() {
            debug!(process_id = %self.process_id, "event after terminal consensus state ignored");
            return Ok(self);
        }
        if event.locator != self.locator {
            warn!(
                process_id = %event.process_id,
                event_locator = ?event.locator,
                ours = ?self.locator,
                "consensus-update received misrouted event"
            );
            return Ok(self);
        }

        match &event.kind {
            EventKind::SignedStatesReceived { signed_states } => {
                for signed in signed_states {
                    if let Err(e) = store.push_signed_state(signed.clone()) {
                        warn!(channel = ?self.channel_id, error = %e, "rejected signed state");
                    }
                }
                self.send_if_safe(store, outbox);
            }
            EventKind::ClearedToSend => {
                if let ConsensusStage::NotSafeToSend { cleared_to_send } = &mut self.stage {
                    *cleared_to_send = true;
                }
                self.send_if_safe(store, outbox);
            }
            EventKind::Cancelled => {
                self.stage = ConsensusStage::Failure(ConsensusFailure::Cancelled);
            }
            _ => {
                debug!(process_id = %self.process_id, kind = ?event.kind, "event not applicable to consensus-update");
            }
        }
        Ok(self)
    }
}
