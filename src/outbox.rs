//! Accumulates the side effects of protocol transitions.
//!
//! Reducers never talk to the network, the chain or the UI directly. They
//! queue everything here and the host drains the outbox to its collaborators
//! after each event. Nested protocols each get their effects merged upward,
//! so nothing a child queued can be lost or overwritten by its parent.

use crate::channel::SignedState;
use crate::encode::types::Hash;
use serde::Serialize;

/// Cross-participant intent carried alongside signed states.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum Objective {
    OpenChannel { channel_id: Hash },
    CloseChannel { channel_id: Hash },
}

/// The relayed message body. Field order is part of the wire contract: a
/// `SignedState` serializes constants, variables and signatures exactly as
/// they are hashed for signing.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePayload {
    pub signed_states: Vec<SignedState>,
    pub objectives: Vec<Objective>,
}

/// An outbound message. The transport only looks at `recipient`; the payload
/// is opaque to it.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub recipient: String,
    pub sender: String,
    pub payload: MessagePayload,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayEvent {
    ShowWallet,
    HideWallet,
}

/// Work for the chain service. Submission, gas handling and retries are its
/// problem; the core only records what should go on-chain.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub enum TransactionRequest {
    SubmitChallenge {
        channel_id: Hash,
        support_proof: Vec<SignedState>,
    },
    RespondWithMove {
        channel_id: Hash,
        response: SignedState,
    },
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Outbox {
    pub messages: Vec<Envelope>,
    pub displays: Vec<DisplayEvent>,
    pub transactions: Vec<TransactionRequest>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append everything from `other`, preserving both orders.
    pub fn merge(&mut self, other: Outbox) {
        self.messages.extend(other.messages);
        self.displays.extend(other.displays);
        self.transactions.extend(other.transactions);
    }

    /// Queue `states` for delivery to each of `recipients`.
    pub fn queue_states<I>(&mut self, sender: &str, recipients: I, states: Vec<SignedState>)
    where
        I: IntoIterator<Item = String>,
    {
        for recipient in recipients {
            self.messages.push(Envelope {
                recipient,
                sender: sender.to_string(),
                payload: MessagePayload {
                    signed_states: states.clone(),
                    objectives: Vec::new(),
                },
            });
        }
    }

    pub fn queue_transaction(&mut self, request: TransactionRequest) {
        self.transactions.push(request);
    }

    pub fn queue_display(&mut self, event: DisplayEvent) {
        self.displays.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.displays.is_empty() && self.transactions.is_empty()
    }

    /// Take all queued effects, leaving the outbox empty. The host calls this
    /// once per handled event.
    pub fn drain(&mut self) -> Outbox {
        core::mem::take(self)
    }
}
