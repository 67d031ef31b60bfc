//! Defunding: give a concluded channel's funds back to the participants of
//! the ledger channel that funded it.
//!
//! Off-chain defunding is just another ledger consensus: the target outcome
//! drops the channel's entry and credits its final allocations back to their
//! destinations. The embedded [ConsensusUpdate] runs with the
//! `cleared_to_send` gate already granted, because defunding is the only
//! writer its parent admits to the ledger channel.

use crate::encode::types::Hash;
use crate::outbox::Outbox;
use crate::protocols::consensus_update::{ConsensusParams, ConsensusStage, ConsensusUpdate};
use crate::protocols::ledger_queue::defunding_target;
use crate::protocols::{
    drop_unhandled, route_to_child, EventKind, Locator, ProcessId, Protocol, ProtocolEvent,
    ProtocolName, ProtocolViolation,
};
use crate::store::Store;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DefundParams {
    pub process_id: ProcessId,
    pub locator: Locator,
    /// The channel being defunded.
    pub channel_id: Hash,
    /// The ledger channel holding its funds.
    pub ledger_channel_id: Hash,
    /// Set by the dispute protocols: an expired challenge finalizes the
    /// channel on-chain without an `is_final` state ever being signed.
    pub closed_on_chain: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum DefundingFailure {
    /// The channel is still live; defunding it would strand its outcome.
    ChannelNotClosed,
    LedgerConsensusFailed,
    Cancelled,
    Error { detail: String },
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum DefundingStage {
    WaitForLedgerDefunding { consensus: ConsensusUpdate },
    Success,
    Failure(DefundingFailure),
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Defunding {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub channel_id: Hash,
    pub ledger_channel_id: Hash,
    pub stage: DefundingStage,
}

impl Defunding {
    pub fn initialize(params: DefundParams, store: &mut Store, outbox: &mut Outbox) -> Self {
        let mut defunding = Defunding {
            process_id: params.process_id,
            locator: params.locator,
            channel_id: params.channel_id,
            ledger_channel_id: params.ledger_channel_id,
            stage: DefundingStage::Failure(DefundingFailure::ChannelNotClosed),
        };

        let channel_outcome = match store
            .channel(&params.channel_id)
            .and_then(|record| record.supported())
        {
            Some(supported) if supported.state.vars.is_final || params.closed_on_chain => {
                supported.state.vars.outcome.clone()
            }
            Some(_) | None => {
                defunding.stage = DefundingStage::Failure(DefundingFailure::ChannelNotClosed);
                return defunding;
            }
        };

        let ledger_outcome = match store
            .channel(&params.ledger_channel_id)
            .and_then(|record| record.supported())
        {
            Some(supported) => supported.state.vars.outcome.clone(),
            None => {
                defunding.stage = DefundingStage::Failure(DefundingFailure::Error {
                    detail: "ledger channel has no supported state".into(),
                });
                return defunding;
            }
        };

        let target = defunding_target(&ledger_outcome, params.channel_id, &channel_outcome);
        let consensus = ConsensusUpdate::initialize(
            ConsensusParams {
                process_id: defunding.process_id.clone(),
                locator: defunding.locator.child(ProtocolName::ConsensusUpdate),
                channel_id: defunding.ledger_channel_id,
                target_outcome: target,
                cleared_to_send: true,
            },
            store,
            outbox,
        );
        defunding.stage = Self::absorb(consensus);
        defunding
    }

    /// Lift the child's state into ours: terminal consensus ends the
    /// defunding, anything else keeps waiting.
    fn absorb(consensus: ConsensusUpdate) -> DefundingStage {
        match consensus.stage {
            ConsensusStage::Success => DefundingStage::Success,
            ConsensusStage::Failure(_) => {
                DefundingStage::Failure(DefundingFailure::LedgerConsensusFailed)
            }
            _ => DefundingStage::WaitForLedgerDefunding { consensus },
        }
    }
}

impl Protocol for Defunding {
    const NAME: ProtocolName = ProtocolName::Defunding;

    fn locator(&self) -> &Locator {
        &self.locator
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.stage,
            DefundingStage::Success | DefundingStage::Failure(_)
        )
    }

    fn transition(
        mut self,
        store: &mut Store,
        outbox: &mut Outbox,
        event: &ProtocolEvent,
    ) -> Result<Self, ProtocolViolation> {
        if self.is_terminal() {
            debug!(process_id = %self.process_id, "event after terminal defunding state ignored");
            return Ok(self);
        }

        self.stage = match self.stage {
            DefundingStage::WaitForLedgerDefunding { consensus } => {
                let (consensus, handled) =
                    route_to_child(consensus, &self.locator, store, outbox, event)?;
                if handled {
                    Self::absorb(consensus)
                } else if event.locator == self.locator
                    && matches!(event.kind, EventKind::Cancelled)
                {
                    DefundingStage::Failure(DefundingFailure::Cancelled)
                } else {
                    drop_unhandled(event, &self.locator);
                    DefundingStage::WaitForLedgerDefunding { consensus }
                }
            }
            terminal => terminal,
        };
        Ok(self)
    }
}
