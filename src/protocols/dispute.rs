//! Dispute resolution: the challenger and responder halves of the on-chain
//! challenge/response game.
//!
//! Both halves are timeout-driven state machines around one on-chain
//! primitive (submitting a challenge or response transaction) and one clock
//! primitive (the challenge expiry). The core never reads a clock itself:
//! the expiry arrives from the chain service and is refreshed in place when
//! a later block confirms a different one. When a challenge times out, the
//! channel is finalized on-chain and the machine hands off to [Defunding].

use crate::channel::SignedState;
use crate::encode::types::Hash;
use crate::outbox::{DisplayEvent, Outbox, TransactionRequest};
use crate::protocols::defund::{DefundParams, Defunding, DefundingStage};
use crate::protocols::{
    drop_unhandled, route_to_child, EventKind, Locator, ProcessId, Protocol, ProtocolEvent,
    ProtocolName, ProtocolViolation,
};
use crate::store::Store;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeFailureReason {
    ChannelDoesntExist,
    NotFullyOpen,
    DeclinedByUser,
    /// The latest turn in our store is the counterpart's: they are not
    /// stalling, we are the one due to move.
    AlreadyHaveLatest,
    /// The counterpart's move arrived while the user was still deciding;
    /// abort rather than race it on-chain.
    LatestWhileApproving,
    TransactionFailed,
}

#[derive(Debug, Clone)]
pub struct ChallengerParams {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    /// Ledger channel funding `channel_id`, for the defund handoff.
    pub ledger_channel_id: Hash,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum ChallengerStage {
    ApproveChallenge,
    WaitForTransaction {
        expiry: Option<u64>,
        challenge_turn: u64,
    },
    WaitForResponseOrTimeout {
        expiry: Option<u64>,
        challenge_turn: u64,
    },
    AcknowledgeResponse,
    AcknowledgeTimeout,
    WaitForDefund {
        defunding: Defunding,
    },
    AcknowledgeSuccess,
    AcknowledgeClosedButNotDefunded,
    AcknowledgeFailure {
        reason: ChallengeFailureReason,
    },
    SuccessOpen,
    SuccessClosedAndDefunded,
    SuccessClosedButNotDefunded,
    Failure {
        reason: ChallengeFailureReason,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Challenger {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub ledger_channel_id: Hash,
    pub stage: ChallengerStage,
}

impl Challenger {
    /// Guard preconditions run once, in order, short-circuiting to the
    /// matching failure report. No chain submission happens unless every
    /// guard passes and the user approves.
    pub fn initialize(params: ChallengerParams, store: &mut Store, outbox: &mut Outbox) -> Self {
        outbox.queue_display(DisplayEvent::ShowWallet);
        let stage = 'guards: {
            let Some(record) = store.channel(&params.channel_id) else {
                break 'guards ChallengerStage::AcknowledgeFailure {
                    reason: ChallengeFailureReason::ChannelDoesntExist,
                };
            };
            if !record.is_fully_open() {
                break 'guards ChallengerStage::AcknowledgeFailure {
                    reason: ChallengeFailureReason::NotFullyOpen,
                };
            }
            match record.latest() {
                Some(latest)
                    if record.constants().mover(latest.turn_num()).signing_address
                        == store.our_address() =>
                {
                    ChallengerStage::ApproveChallenge
                }
                _ => ChallengerStage::AcknowledgeFailure {
                    reason: ChallengeFailureReason::AlreadyHaveLatest,
                },
            }
        };
        Challenger {
            process_id: params.process_id,
            locator: params.locator,
            channel_id: params.channel_id,
            ledger_channel_id: params.ledger_channel_id,
            stage,
        }
    }

    fn start_defund(&self, store: &mut Store, outbox: &mut Outbox) -> ChallengerStage {
        let defunding = Defunding::initialize(
            DefundParams {
                process_id: self.process_id.clone(),
                locator: self.locator.child(ProtocolName::Defunding),
                channel_id: self.channel_id,
                ledger_channel_id: self.ledger_channel_id,
                // The expired challenge finalized the channel on-chain.
                closed_on_chain: true,
            },
            store,
            outbox,
        );
        Self::absorb_defund(defunding)
    }

    fn absorb_defund(defunding: Defunding) -> ChallengerStage {
        match defunding.stage {
            DefundingStage::Success => ChallengerStage::AcknowledgeSuccess,
            DefundingStage::Failure(_) => ChallengerStage::AcknowledgeClosedButNotDefunded,
            _ => ChallengerStage::WaitForDefund { defunding },
        }
    }

    /// Whether the latest turn now belongs to a counterpart, i.e. they moved.
    fn counterpart_moved(&self, store: &Store) -> bool {
        store
            .channel(&self.channel_id)
            .and_then(|record| {
                record.latest().map(|latest| {
                    record.constants().mover(latest.turn_num()).signing_address
                        != store.our_address()
                })
            })
            .unwrap_or(false)
    }

    fn push_states(&self, store: &mut Store, signed_states: &[SignedState]) {
        for signed in signed_states {
            if let Err(e) = store.push_signed_state(signed.clone()) {
                warn!(channel = ?self.channel_id, error = %e, "rejected signed state");
            }
        }
    }
}

impl Protocol for Challenger {
    const NAME: ProtocolName = ProtocolName::Challenger;

    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            ChallengerStage::SuccessOpen
                | ChallengerStage::SuccessClosedAndDefunded
                | ChallengerStage::SuccessClosedButNotDefunded
                | ChallengerStage::Failure { .. }
        )
    }

    fn transition(
        mut self,
        store: &mut Store,
        outbox: &mut Outbox,
        event: &ProtocolEvent,
    ) -> Result<Self, ProtocolViolation> {
        if self.is_terminal() {
            debug!(process_id = %self.process_id, "event after terminal challenger state ignored");
            return Ok(self);
        }

        self.stage = match self.stage {
            ChallengerStage::ApproveChallenge => match &event.kind {
                EventKind::ChallengeApproved => {
                    match store
                        .channel(&self.channel_id)
                        .and_then(|record| record.support_proof())
                    {
                        Some(support_proof) => {
                            let challenge_turn =
                                support_proof.last().map(|s| s.turn_num()).unwrap_or(0);
                            outbox.queue_transaction(TransactionRequest::SubmitChallenge {
                                channel_id: self.channel_id,
                                support_proof,
                            });
                            ChallengerStage::WaitForTransaction {
                                expiry: None,
                                challenge_turn,
                            }
                        }
                        None => {
                            warn!(channel = ?self.channel_id, "support proof vanished before challenge submission");
                            ChallengerStage::AcknowledgeFailure {
                                reason: ChallengeFailureReason::TransactionFailed,
                            }
                        }
                    }
                }
                EventKind::ChallengeDenied | EventKind::Cancelled => {
                    ChallengerStage::AcknowledgeFailure {
                        reason: ChallengeFailureReason::DeclinedByUser,
                    }
                }
                EventKind::SignedStatesReceived { signed_states } => {
                    self.push_states(store, signed_states);
                    if self.counterpart_moved(store) {
                        ChallengerStage::AcknowledgeFailure {
                            reason: ChallengeFailureReason::LatestWhileApproving,
                        }
                    } else {
                        ChallengerStage::ApproveChallenge
                    }
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::ApproveChallenge
                }
            },

            ChallengerStage::WaitForTransaction {
                expiry,
                challenge_turn,
            } => match &event.kind {
                EventKind::TransactionConfirmed => ChallengerStage::WaitForResponseOrTimeout {
                    expiry,
                    challenge_turn,
                },
                EventKind::TransactionFailed => ChallengerStage::AcknowledgeFailure {
                    reason: ChallengeFailureReason::TransactionFailed,
                },
                EventKind::ChallengeExpirySet { expiry: fresh } => {
                    ChallengerStage::WaitForTransaction {
                        expiry: Some(*fresh),
                        challenge_turn,
                    }
                }
                EventKind::ChallengeExpired { .. } => ChallengerStage::AcknowledgeTimeout,
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::WaitForTransaction {
                        expiry,
                        challenge_turn,
                    }
                }
            },

            ChallengerStage::WaitForResponseOrTimeout {
                expiry,
                challenge_turn,
            } => match &event.kind {
                EventKind::SignedStatesReceived { signed_states } => {
                    self.push_states(store, signed_states);
                    let responded = store
                        .channel(&self.channel_id)
                        .and_then(|record| record.latest())
                        .map(|latest| latest.turn_num() > challenge_turn)
                        .unwrap_or(false);
                    if responded {
                        ChallengerStage::AcknowledgeResponse
                    } else {
                        ChallengerStage::WaitForResponseOrTimeout {
                            expiry,
                            challenge_turn,
                        }
                    }
                }
                // Refresh in place: a partial response can push the expiry.
                EventKind::ChallengeExpirySet { expiry: fresh } => {
                    ChallengerStage::WaitForResponseOrTimeout {
                        expiry: Some(*fresh),
                        challenge_turn,
                    }
                }
                EventKind::ChallengeExpired { now } => {
                    if expiry.map_or(true, |e| *now >= e) {
                        ChallengerStage::AcknowledgeTimeout
                    } else {
                        ChallengerStage::WaitForResponseOrTimeout {
                            expiry,
                            challenge_turn,
                        }
                    }
                }
                EventKind::BlockMined { time } => {
                    // A past-expiry timestamp must force us out of this
                    // state within the same reducer call.
                    if expiry.map_or(false, |e| *time >= e) {
                        ChallengerStage::AcknowledgeTimeout
                    } else {
                        ChallengerStage::WaitForResponseOrTimeout {
                            expiry,
                            challenge_turn,
                        }
                    }
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::WaitForResponseOrTimeout {
                        expiry,
                        challenge_turn,
                    }
                }
            },

            ChallengerStage::AcknowledgeResponse => match &event.kind {
                EventKind::Acknowledged => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ChallengerStage::SuccessOpen
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::AcknowledgeResponse
                }
            },

            ChallengerStage::AcknowledgeTimeout => match &event.kind {
                EventKind::DefundChosen | EventKind::Acknowledged => {
                    self.start_defund(store, outbox)
                }
                EventKind::DefundedElsewhere => {
                    // TODO: is this the right terminal when the defund raced
                    // the timeout acknowledgement? Revisit once the races
                    // around concurrent defunds are pinned down.
                    ChallengerStage::AcknowledgeClosedButNotDefunded
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::AcknowledgeTimeout
                }
            },

            ChallengerStage::WaitForDefund { defunding } => {
                let (defunding, handled) =
                    route_to_child(defunding, &self.locator, store, outbox, event)?;
                if handled {
                    Self::absorb_defund(defunding)
                } else {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::WaitForDefund { defunding }
                }
            }

            ChallengerStage::AcknowledgeSuccess => match &event.kind {
                EventKind::Acknowledged => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ChallengerStage::SuccessClosedAndDefunded
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::AcknowledgeSuccess
                }
            },

            ChallengerStage::AcknowledgeClosedButNotDefunded => match &event.kind {
                EventKind::Acknowledged => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ChallengerStage::SuccessClosedButNotDefunded
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::AcknowledgeClosedButNotDefunded
                }
            },

            ChallengerStage::AcknowledgeFailure { reason } => match &event.kind {
                EventKind::Acknowledged => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ChallengerStage::Failure { reason }
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ChallengerStage::AcknowledgeFailure { reason }
                }
            },

            terminal => terminal,
        };
        Ok(self)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderFailureReason {
    ChannelDoesntExist,
    DeclinedByUser,
    TransactionFailed,
}

#[derive(Debug, Clone)]
pub struct ResponderParams {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub ledger_channel_id: Hash,
    /// The state the challenger registered on-chain.
    pub challenge_state: SignedState,
    pub expiry: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum ResponderStage {
    WaitForApproval {
        expiry: u64,
        challenge_turn: u64,
    },
    /// Our own latest signed state does not get past the challenge; wait for
    /// the application to route a fresher move to us.
    WaitForResponse {
        expiry: u64,
        challenge_turn: u64,
    },
    WaitForTransaction {
        expiry: u64,
    },
    WaitForAcknowledgement,
    AcknowledgeTimeout,
    WaitForDefund {
        defunding: Defunding,
    },
    Success,
    SuccessClosedAndDefunded,
    SuccessClosedButNotDefunded,
    Failure {
        reason: ResponderFailureReason,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Responder {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub ledger_channel_id: Hash,
    pub stage: ResponderStage,
}

impl Responder {
    pub fn initialize(params: ResponderParams, store: &mut Store, outbox: &mut Outbox) -> Self {
        outbox.queue_display(DisplayEvent::ShowWallet);
        let challenge_turn = params.challenge_state.turn_num();
        // The registered challenge state comes from the chain; usually it is
        // already in our store and this merge is a no-op.
        if let Err(e) = store.push_signed_state(params.challenge_state.clone()) {
            warn!(channel = ?params.channel_id, error = %e, "challenge state rejected by store");
        }

        let stage = if store.channel(&params.channel_id).is_some() {
            ResponderStage::WaitForApproval {
                expiry: params.expiry,
                challenge_turn,
            }
        } else {
            ResponderStage::Failure {
                reason: ResponderFailureReason::ChannelDoesntExist,
            }
        };
        Responder {
            process_id: params.process_id,
            locator: params.locator,
            channel_id: params.channel_id,
            ledger_channel_id: params.ledger_channel_id,
            stage,
        }
    }

    /// Our response, if we already hold a move past the challenge that
    /// carries our signature. A response transaction only the counterpart
    /// signed would be rejected on-chain.
    fn response_candidate(&self, store: &Store, challenge_turn: u64) -> Option<SignedState> {
        let record = store.channel(&self.channel_id)?;
        let latest = record.latest()?;
        if latest.turn_num() > challenge_turn && latest.signed_by(store.our_address()) {
            Some(latest.clone())
        } else {
            None
        }
    }

    fn queue_response(&self, outbox: &mut Outbox, response: SignedState) {
        outbox.queue_transaction(TransactionRequest::RespondWithMove {
            channel_id: self.channel_id,
            response,
        });
    }

    fn start_defund(&self, store: &mut Store, outbox: &mut Outbox) -> ResponderStage {
        let defunding = Defunding::initialize(
            DefundParams {
                process_id: self.process_id.clone(),
                locator: self.locator.child(ProtocolName::Defunding),
                channel_id: self.channel_id,
                ledger_channel_id: self.ledger_channel_id,
                closed_on_chain: true,
            },
            store,
            outbox,
        );
        Self::absorb_defund(defunding, outbox)
    }

    fn absorb_defund(defunding: Defunding, outbox: &mut Outbox) -> ResponderStage {
        match defunding.stage {
            DefundingStage::Success => {
                outbox.queue_display(DisplayEvent::HideWallet);
                ResponderStage::SuccessClosedAndDefunded
            }
            DefundingStage::Failure(_) => {
                outbox.queue_display(DisplayEvent::HideWallet);
                ResponderStage::SuccessClosedButNotDefunded
            }
            _ => ResponderStage::WaitForDefund { defunding },
        }
    }

    fn push_states(&self, store: &mut Store, signed_states: &[SignedState]) {
        for signed in signed_states {
            if let Err(e) = store.push_signed_state(signed.clone()) {
                warn!(channel = ?self.channel_id, error = %e, "rejected signed state");
            }
        }
    }
}

impl Protocol for Responder {
    const NAME: ProtocolName = ProtocolName::Responder;

    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            ResponderStage::Success
                | ResponderStage::SuccessClosedAndDefunded
                | ResponderStage::SuccessClosedButNotDefunded
                | ResponderStage::Failure { .. }
        )
    }

    fn transition(
        mut self,
        store: &mut Store,
        outbox: &mut Outbox,
        event: &ProtocolEvent,
    ) -> Result<Self, ProtocolViolation> {
        if self.is_terminal() {
            debug!(process_id = %self.process_id, "event after terminal responder state ignored");
            return Ok(self);
        }

        self.stage = match self.stage {
            ResponderStage::WaitForApproval {
                expiry,
                challenge_turn,
            } => match &event.kind {
                EventKind::ChallengeApproved => {
                    match self.response_candidate(store, challenge_turn) {
                        Some(response) => {
                            self.queue_response(outbox, response);
                            ResponderStage::WaitForTransaction { expiry }
                        }
                        None => ResponderStage::WaitForResponse {
                            expiry,
                            challenge_turn,
                        },
                    }
                }
                EventKind::ChallengeDenied | EventKind::Cancelled => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ResponderStage::Failure {
                        reason: ResponderFailureReason::DeclinedByUser,
                    }
                }
                EventKind::ChallengeExpirySet { expiry: fresh } => {
                    ResponderStage::WaitForApproval {
                        expiry: *fresh,
                        challenge_turn,
                    }
                }
                EventKind::ChallengeExpired { now } if *now >= expiry => {
                    ResponderStage::AcknowledgeTimeout
                }
                EventKind::BlockMined { time } if *time >= expiry => {
                    ResponderStage::AcknowledgeTimeout
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::WaitForApproval {
                        expiry,
                        challenge_turn,
                    }
                }
            },

            ResponderStage::WaitForResponse {
                expiry,
                challenge_turn,
            } => match &event.kind {
                EventKind::SignedStatesReceived { signed_states } => {
                    self.push_states(store, signed_states);
                    match self.response_candidate(store, challenge_turn) {
                        Some(response) => {
                            self.queue_response(outbox, response);
                            ResponderStage::WaitForTransaction { expiry }
                        }
                        None => ResponderStage::WaitForResponse {
                            expiry,
                            challenge_turn,
                        },
                    }
                }
                EventKind::ChallengeExpirySet { expiry: fresh } => {
                    ResponderStage::WaitForResponse {
                        expiry: *fresh,
                        challenge_turn,
                    }
                }
                // Expired before we could respond: no late response
                // transaction may be queued past this point.
                EventKind::ChallengeExpired { now } if *now >= expiry => {
                    ResponderStage::AcknowledgeTimeout
                }
                EventKind::BlockMined { time } if *time >= expiry => {
                    ResponderStage::AcknowledgeTimeout
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::WaitForResponse {
                        expiry,
                        challenge_turn,
                    }
                }
            },

            ResponderStage::WaitForTransaction { expiry } => match &event.kind {
                EventKind::TransactionConfirmed => ResponderStage::WaitForAcknowledgement,
                EventKind::TransactionFailed => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ResponderStage::Failure {
                        reason: ResponderFailureReason::TransactionFailed,
                    }
                }
                EventKind::ChallengeExpirySet { expiry: fresh } => {
                    ResponderStage::WaitForTransaction { expiry: *fresh }
                }
                EventKind::ChallengeExpired { now } if *now >= expiry => {
                    ResponderStage::AcknowledgeTimeout
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::WaitForTransaction { expiry }
                }
            },

            ResponderStage::WaitForAcknowledgement => match &event.kind {
                EventKind::Acknowledged => {
                    outbox.queue_display(DisplayEvent::HideWallet);
                    ResponderStage::Success
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::WaitForAcknowledgement
                }
            },

            ResponderStage::AcknowledgeTimeout => match &event.kind {
                EventKind::DefundChosen | EventKind::Acknowledged => {
                    self.start_defund(store, outbox)
                }
                _ => {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::AcknowledgeTimeout
                }
            },

            ResponderStage::WaitForDefund { defunding } => {
                let (defunding, handled) =
                    route_to_child(defunding, &self.locator, store, outbox, event)?;
                if handled {
                    Self::absorb_defund(defunding, outbox)
                } else {
                    drop_unhandled(event, &self.locator);
                    ResponderStage::WaitForDefund { defunding }
                }
            }

            terminal => terminal,
        };
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_fixtures::{simple_outcome, two_party_constants};
    use crate::channel::{ChannelConstants, ConsensusPayload, Destination};
    use crate::encode::types::U256;
    use crate::protocols::ledger_queue::defunding_target;
    use crate::sig::Signer;
    use crate::store::test_support::signed_state;

    const KEY_A: [u8; 32] = [0x41; 32];
    const KEY_B: [u8; 32] = [0x42; 32];

    fn signer_a() -> Signer {
        Signer::from_bytes(&KEY_A).unwrap()
    }
    fn signer_b() -> Signer {
        Signer::from_bytes(&KEY_B).unwrap()
    }

    struct Setup {
        store: Store,
        ledger_constants: ChannelConstants,
        ledger_id: Hash,
        channel_constants: ChannelConstants,
        channel_id: Hash,
    }

    /// A's view of a fully open application channel funded by a ledger.
    ///
    /// Application channel states: turn 4 (A), turn 5 (B), turn 6 (A), so A
    /// moved last and is waiting on B. Ledger holds `{A:1, B:3, C:2}`.
    fn setup_challenger() -> Setup {
        let ledger_constants = two_party_constants(&[signer_a(), signer_b()]);
        let a_dest = ledger_constants.participants[0].destination;
        let b_dest = ledger_constants.participants[1].destination;

        let mut channel_constants = ledger_constants.clone();
        channel_constants.channel_nonce = U256::from(700);
        let channel_id = channel_constants.channel_id().unwrap();

        let mut store = Store::new(signer_a());
        let app_outcome = simple_outcome(&[(a_dest, 1), (b_dest, 1)]);
        for (turn, signer) in [(4, signer_a()), (5, signer_b()), (6, signer_a())] {
            store
                .push_signed_state(signed_state(
                    &channel_constants,
                    turn,
                    app_outcome.clone(),
                    vec![],
                    &[&signer],
                ))
                .unwrap();
        }

        let ledger_outcome = simple_outcome(&[
            (a_dest, 1),
            (b_dest, 3),
            (Destination::from(channel_id), 2),
        ]);
        store
            .push_signed_state(signed_state(
                &ledger_constants,
                4,
                ledger_outcome.clone(),
                vec![],
                &[&signer_a()],
            ))
            .unwrap();
        store
            .push_signed_state(signed_state(
                &ledger_constants,
                5,
                ledger_outcome,
                vec![],
                &[&signer_b()],
            ))
            .unwrap();

        Setup {
            ledger_id: ledger_constants.channel_id().unwrap(),
            ledger_constants,
            channel_id,
            channel_constants,
            store,
        }
    }

    fn challenger_params(setup: &Setup) -> ChallengerParams {
        ChallengerParams {
            process_id: "dispute-1".into(),
            locator: Locator::top(ProtocolName::Challenger),
            channel_id: setup.channel_id,
            ledger_channel_id: setup.ledger_id,
        }
    }

    fn event(locator: Locator, kind: EventKind) -> ProtocolEvent {
        ProtocolEvent {
            process_id: "dispute-1".into(),
            locator,
            kind,
        }
    }

    fn ch_event(kind: EventKind) -> ProtocolEvent {
        event(Locator::top(ProtocolName::Challenger), kind)
    }

    fn rs_event(kind: EventKind) -> ProtocolEvent {
        event(Locator::top(ProtocolName::Responder), kind)
    }

    #[test]
    fn challenger_on_unknown_channel_reports_doesnt_exist() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();
        let mut params = challenger_params(&setup);
        params.channel_id = Hash([0xdd; 32]);

        let challenger = Challenger::initialize(params, &mut setup.store, &mut outbox);
        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeFailure {
                reason: ChallengeFailureReason::ChannelDoesntExist
            }
        );
    }

    #[test]
    fn challenger_on_setup_channel_reports_not_fully_open() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        // A channel that only ever saw its prefund round.
        let mut young_constants = setup.ledger_constants.clone();
        young_constants.channel_nonce = U256::from(701);
        let young_id = young_constants.channel_id().unwrap();
        setup
            .store
            .push_signed_state(signed_state(
                &young_constants,
                0,
                simple_outcome(&[(Destination([5; 32]), 1)]),
                vec![],
                &[&signer_a(), &signer_b()],
            ))
            .unwrap();

        let mut params = challenger_params(&setup);
        params.channel_id = young_id;
        let challenger = Challenger::initialize(params, &mut setup.store, &mut outbox);

        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeFailure {
                reason: ChallengeFailureReason::NotFullyOpen
            }
        );
        // Never any chain submission on a failed guard.
        assert!(outbox.transactions.is_empty());
    }

    #[test]
    fn challenger_with_counterparts_latest_has_nothing_to_challenge() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        // B responds at turn 7 before we even start: their move is the
        // latest, so the channel is not stalled on them.
        setup
            .store
            .push_signed_state(signed_state(
                &setup.channel_constants,
                7,
                simple_outcome(&[(Destination([5; 32]), 2)]),
                vec![],
                &[&signer_b()],
            ))
            .unwrap();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeFailure {
                reason: ChallengeFailureReason::AlreadyHaveLatest
            }
        );
    }

    #[test]
    fn challenger_happy_path_ends_open_when_counterpart_responds() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        assert_eq!(challenger.stage, ChallengerStage::ApproveChallenge);
        assert_eq!(outbox.displays, vec![DisplayEvent::ShowWallet]);

        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        assert!(matches!(
            challenger.stage,
            ChallengerStage::WaitForTransaction {
                expiry: None,
                challenge_turn: 6
            }
        ));
        let TransactionRequest::SubmitChallenge { support_proof, .. } = &outbox.transactions[0]
        else {
            panic!("expected a challenge submission");
        };
        assert_eq!(
            support_proof.iter().map(|s| s.turn_num()).collect::<Vec<_>>(),
            vec![5, 6]
        );

        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::TransactionConfirmed),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpirySet { expiry: 1000 }),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::WaitForResponseOrTimeout {
                expiry: Some(1000),
                challenge_turn: 6
            }
        );

        // B's response move lands.
        let response = signed_state(
            &setup.channel_constants,
            7,
            simple_outcome(&[(Destination([5; 32]), 2)]),
            vec![],
            &[&signer_b()],
        );
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::SignedStatesReceived {
                    signed_states: vec![response],
                }),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::AcknowledgeResponse);

        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::Acknowledged),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::SuccessOpen);
        assert!(outbox.displays.contains(&DisplayEvent::HideWallet));
    }

    #[test]
    fn expiry_is_refreshed_in_place() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::TransactionConfirmed),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpirySet { expiry: 500 }),
            )
            .unwrap();
        // A partial response moved the expiry.
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpirySet { expiry: 800 }),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::WaitForResponseOrTimeout {
                expiry: Some(800),
                challenge_turn: 6
            }
        );

        // Not yet expired under the refreshed deadline.
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpired { now: 600 }),
            )
            .unwrap();
        assert!(matches!(
            challenger.stage,
            ChallengerStage::WaitForResponseOrTimeout { .. }
        ));

        // A past-expiry timestamp forces the timeout in the same call.
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::BlockMined { time: 900 }),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::AcknowledgeTimeout);
    }

    #[test]
    fn latest_while_approving_aborts_the_challenge() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        let fresh = signed_state(
            &setup.channel_constants,
            7,
            simple_outcome(&[(Destination([5; 32]), 2)]),
            vec![],
            &[&signer_b()],
        );
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::SignedStatesReceived {
                    signed_states: vec![fresh],
                }),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeFailure {
                reason: ChallengeFailureReason::LatestWhileApproving
            }
        );
        assert!(outbox.transactions.is_empty());
    }

    #[test]
    fn timed_out_challenge_defunds_through_the_ledger() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::TransactionConfirmed),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpirySet { expiry: 1000 }),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpired { now: 1001 }),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::AcknowledgeTimeout);

        // Choosing to defund spins up the embedded Defunding, which proposes
        // the reallocation on the ledger (it is A's ledger turn).
        outbox.drain();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::DefundChosen),
            )
            .unwrap();
        assert!(matches!(
            challenger.stage,
            ChallengerStage::WaitForDefund { .. }
        ));
        let proposal = outbox.drain().messages[0].payload.signed_states[0].clone();
        assert_eq!(proposal.channel_id().unwrap(), setup.ledger_id);

        // Hand-craft B's accepting vote and route it three levels deep:
        // Challenger -> Defunding -> ConsensusUpdate.
        let app_outcome = setup
            .store
            .channel(&setup.channel_id)
            .unwrap()
            .supported()
            .unwrap()
            .state
            .vars
            .outcome
            .clone();
        let ledger_supported = setup
            .store
            .channel(&setup.ledger_id)
            .unwrap()
            .supported()
            .unwrap()
            .state
            .vars
            .outcome
            .clone();
        // The supported ledger outcome still funds C at this point.
        assert!(!ledger_supported
            .allocated_to(ledger_supported.0[0].asset, Destination::from(setup.channel_id))
            .is_zero());
        let target = defunding_target(&ledger_supported, setup.channel_id, &app_outcome);
        let mut accept_vars = proposal.state.vars.make_next();
        accept_vars.outcome = target.clone();
        accept_vars.app_data = ConsensusPayload {
            proposed_outcome: target,
            further_votes_required: 0,
        }
        .to_app_data();
        let accept = crate::store::test_support::signed_state_with(
            &setup.ledger_constants,
            accept_vars,
            &[&signer_b()],
        );

        let deep_locator = Locator::top(ProtocolName::Challenger)
            .child(ProtocolName::Defunding)
            .child(ProtocolName::ConsensusUpdate);
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &event(
                    deep_locator,
                    EventKind::SignedStatesReceived {
                        signed_states: vec![accept],
                    },
                ),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::AcknowledgeSuccess);

        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::Acknowledged),
            )
            .unwrap();
        assert_eq!(challenger.stage, ChallengerStage::SuccessClosedAndDefunded);
    }

    #[test]
    fn defunded_elsewhere_during_timeout_acknowledgement() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::TransactionConfirmed),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeExpired { now: 99 }),
            )
            .unwrap();
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::DefundedElsewhere),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeClosedButNotDefunded
        );
    }

    #[test]
    fn challenge_denial_fails_with_declined_by_user() {
        let mut setup = setup_challenger();
        let mut outbox = Outbox::new();

        let challenger =
            Challenger::initialize(challenger_params(&setup), &mut setup.store, &mut outbox);
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::ChallengeDenied),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::AcknowledgeFailure {
                reason: ChallengeFailureReason::DeclinedByUser
            }
        );
        let challenger = challenger
            .transition(
                &mut setup.store,
                &mut outbox,
                &ch_event(EventKind::Acknowledged),
            )
            .unwrap();
        assert_eq!(
            challenger.stage,
            ChallengerStage::Failure {
                reason: ChallengeFailureReason::DeclinedByUser
            }
        );
        assert!(challenger.is_terminal());
    }

    /// B's view: the challenge state is A's turn-6 move; B has only signed
    /// up to turn 5, so its own latest is stale.
    fn setup_responder() -> (Setup, SignedState) {
        let ledger_constants = two_party_constants(&[signer_a(), signer_b()]);
        let a_dest = ledger_constants.participants[0].destination;
        let b_dest = ledger_constants.participants[1].destination;

        let mut channel_constants = ledger_constants.clone();
        channel_constants.channel_nonce = U256::from(700);
        let channel_id = channel_constants.channel_id().unwrap();

        let mut store = Store::new(signer_b());
        let app_outcome = simple_outcome(&[(a_dest, 1), (b_dest, 1)]);
        for (turn, signer) in [(4, signer_a()), (5, signer_b())] {
            store
                .push_signed_state(signed_state(
                    &channel_constants,
                    turn,
                    app_outcome.clone(),
                    vec![],
                    &[&signer],
                ))
                .unwrap();
        }
        let challenge_state = signed_state(
            &channel_constants,
            6,
            app_outcome.clone(),
            vec![],
            &[&signer_a()],
        );

        let ledger_outcome = simple_outcome(&[
            (a_dest, 1),
            (b_dest, 3),
            (Destination::from(channel_id), 2),
        ]);
        store
            .push_signed_state(signed_state(
                &ledger_constants,
                4,
                ledger_outcome.clone(),
                vec![],
                &[&signer_a()],
            ))
            .unwrap();
        store
            .push_signed_state(signed_state(
                &ledger_constants,
                5,
                ledger_outcome,
                vec![],
                &[&signer_b()],
            ))
            .unwrap();

        (
            Setup {
                ledger_id: ledger_constants.channel_id().unwrap(),
                ledger_constants,
                channel_id,
                channel_constants,
                store,
            },
            challenge_state,
        )
    }

    fn responder_params(setup: &Setup, challenge_state: SignedState) -> ResponderParams {
        ResponderParams {
            process_id: "dispute-1".into(),
            locator: Locator::top(ProtocolName::Responder),
            channel_id: setup.channel_id,
            ledger_channel_id: setup.ledger_id,
            challenge_state,
            expiry: 1000,
        }
    }

    #[test]
    fn responder_with_stale_latest_waits_for_a_fresh_move() {
        let (mut setup, challenge_state) = setup_responder();
        let mut outbox = Outbox::new();

        let responder = Responder::initialize(
            responder_params(&setup, challenge_state),
            &mut setup.store,
            &mut outbox,
        );
        assert_eq!(
            responder.stage,
            ResponderStage::WaitForApproval {
                expiry: 1000,
                challenge_turn: 6
            }
        );

        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        // Our latest signed state (turn 5) does not get past the challenge.
        assert_eq!(
            responder.stage,
            ResponderStage::WaitForResponse {
                expiry: 1000,
                challenge_turn: 6
            }
        );
        assert!(outbox.transactions.is_empty());

        // The application hands us our turn-7 move.
        let our_move = signed_state(
            &setup.channel_constants,
            7,
            simple_outcome(&[(Destination([5; 32]), 2)]),
            vec![],
            &[&signer_b()],
        );
        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::SignedStatesReceived {
                    signed_states: vec![our_move],
                }),
            )
            .unwrap();
        assert_eq!(responder.stage, ResponderStage::WaitForTransaction { expiry: 1000 });
        assert!(matches!(
            outbox.transactions[0],
            TransactionRequest::RespondWithMove { .. }
        ));

        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::TransactionConfirmed),
            )
            .unwrap();
        assert_eq!(responder.stage, ResponderStage::WaitForAcknowledgement);

        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::Acknowledged),
            )
            .unwrap();
        assert_eq!(responder.stage, ResponderStage::Success);
    }

    #[test]
    fn expiry_during_wait_for_response_times_out_without_a_transaction() {
        let (mut setup, challenge_state) = setup_responder();
        let mut outbox = Outbox::new();

        let responder = Responder::initialize(
            responder_params(&setup, challenge_state),
            &mut setup.store,
            &mut outbox,
        );
        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::ChallengeApproved),
            )
            .unwrap();
        assert!(matches!(responder.stage, ResponderStage::WaitForResponse { .. }));

        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::ChallengeExpired { now: 1200 }),
            )
            .unwrap();
        assert_eq!(responder.stage, ResponderStage::AcknowledgeTimeout);
        // No late response transaction may follow the expiry.
        assert!(outbox.transactions.is_empty());
    }

    #[test]
    fn responder_denial_is_a_declined_failure() {
        let (mut setup, challenge_state) = setup_responder();
        let mut outbox = Outbox::new();

        let responder = Responder::initialize(
            responder_params(&setup, challenge_state),
            &mut setup.store,
            &mut outbox,
        );
        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::ChallengeDenied),
            )
            .unwrap();
        assert_eq!(
            responder.stage,
            ResponderStage::Failure {
                reason: ResponderFailureReason::DeclinedByUser
            }
        );
    }

    #[test]
    fn responder_timeout_hands_off_to_defunding() {
        let (mut setup, challenge_state) = setup_responder();
        let mut outbox = Outbox::new();

        let responder = Responder::initialize(
            responder_params(&setup, challenge_state),
            &mut setup.store,
            &mut outbox,
        );
        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::ChallengeExpired { now: 2000 }),
            )
            .unwrap();
        assert_eq!(responder.stage, ResponderStage::AcknowledgeTimeout);

        // B's ledger turn is 7, so its defund consensus has to wait for A's
        // proposal first: the embedded child parks in its gate-open wait
        // state rather than sending anything.
        outbox.drain();
        let responder = responder
            .transition(
                &mut setup.store,
                &mut outbox,
                &rs_event(EventKind::DefundChosen),
            )
            .unwrap();
        assert!(matches!(responder.stage, ResponderStage::WaitForDefund { .. }));
        assert!(outbox.messages.is_empty());
    }
}
