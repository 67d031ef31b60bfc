//! Protocol composition: events, locators and routing.
//!
//! Every protocol is a pure state machine over `(state, store, event)`. A
//! parent embeds children at a path of protocol names (the [Locator]) and
//! forwards an event to a child exactly when its own locator is a strict
//! prefix of the event's and the next segment names that child. Events that
//! reach no live child and mean nothing to the parent are dropped with a
//! warning: relayed transport delivers stale and speculative messages as a
//! matter of course, and dropping them must never be an error.

pub mod consensus_update;
pub mod defund;
pub mod dispute;
pub mod ledger_queue;

use crate::channel::SignedState;
use crate::encode::types::Hash;
use crate::outbox::Outbox;
use crate::store::Store;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Correlates all events of one protocol run across participants.
pub type ProcessId = String;

/// Names of embeddable protocols; the segments a [Locator] is made of.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolName {
    ConsensusUpdate,
    Defunding,
    Challenger,
    Responder,
}

/// Path of embedded-protocol names identifying one nested protocol instance.
///
/// Locators are routing addresses only; they are never used as storage keys.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Locator(Vec<ProtocolName>);

impl Locator {
    /// The locator of a top-level protocol instance.
    pub fn top(name: ProtocolName) -> Self {
        Locator(vec![name])
    }

    /// The locator of a child embedded under `self`.
    pub fn child(&self, name: ProtocolName) -> Locator {
        let mut segments = self.0.clone();
        segments.push(name);
        Locator(segments)
    }

    pub fn segments(&self) -> &[ProtocolName] {
        &self.0
    }

    /// Strict prefix: equal locators do not count, the event would then be
    /// addressed to the parent itself.
    pub fn is_strict_prefix_of(&self, other: &Locator) -> bool {
        self.0.len() < other.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// The first segment of `other` below `self`, if `self` is a strict
    /// prefix. This is the routing key for picking the child.
    pub fn next_segment_in(&self, other: &Locator) -> Option<ProtocolName> {
        if self.is_strict_prefix_of(other) {
            Some(other.0[self.0.len()])
        } else {
            None
        }
    }
}

/// An external event entering the protocol tree.
#[derive(Debug, Clone)]
pub struct ProtocolEvent {
    pub process_id: ProcessId,
    pub locator: Locator,
    pub kind: EventKind,
}

/// Everything the outside world can tell a protocol.
///
/// Reducers are total over this enum: variants that mean nothing in the
/// current state are ignored, not rejected.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// States relayed from counterparties (or replayed from the chain).
    SignedStatesReceived { signed_states: Vec<SignedState> },
    /// The parent grants this instance the right to propose the next write
    /// to its channel.
    ClearedToSend,
    /// The user approved the pending challenge or response.
    ChallengeApproved,
    /// The user declined the pending challenge or response.
    ChallengeDenied,
    /// The user acknowledged the currently reported result.
    Acknowledged,
    /// The user abandoned the protocol run.
    Cancelled,
    /// The chain service confirmed our pending transaction.
    TransactionConfirmed,
    /// The chain service gave up on our pending transaction.
    TransactionFailed,
    /// A block confirmed the challenge expiry. Refreshes any previously
    /// known expiry in place.
    ChallengeExpirySet { expiry: u64 },
    /// The challenge window closed at chain time `now`.
    ChallengeExpired { now: u64 },
    /// The user chose to defund the channel after a timeout.
    DefundChosen,
    /// The channel was defunded through some other protocol run.
    DefundedElsewhere,
    /// Chain time advanced. Carries the block timestamp.
    BlockMined { time: u64 },
}

/// A counterpart's signed data contradicts what was agreed. There is no safe
/// automatic recovery; the host must halt the affected channel.
///
/// This is the only error a reducer lets escape. Everything else becomes a
/// terminal `Failure` state or an ignored event.
#[derive(Debug, Error)]
#[error("protocol violation in channel {channel_id:?}: {detail}")]
pub struct ProtocolViolation {
    pub channel_id: Hash,
    pub detail: String,
}

/// The contract every protocol instance implements.
///
/// `transition` consumes the state and returns its successor, threading the
/// store and outbox by mutable reference: ownership rules make partial
/// writes unobservable to any other instance, which is the aliasing
/// guarantee the composition relies on.
pub trait Protocol: Sized {
    const NAME: ProtocolName;

    fn locator(&self) -> &Locator;

    /// Terminal states absorb every further event.
    fn is_terminal(&self) -> bool;

    fn transition(
        self,
        store: &mut Store,
        outbox: &mut Outbox,
        event: &ProtocolEvent,
    ) -> Result<Self, ProtocolViolation>;
}

/// Forward `event` to `child` if it is addressed at or below the child's
/// position under `parent_locator`.
///
/// Returns the (possibly advanced) child and whether the event was consumed
/// by the child subtree. The child runs against a fresh outbox that is then
/// merged into the parent's, so a parent can never clobber what its child
/// queued.
pub fn route_to_child<C: Protocol>(
    child: C,
    parent_locator: &Locator,
    store: &mut Store,
    outbox: &mut Outbox,
    event: &ProtocolEvent,
) -> Result<(C, bool), ProtocolViolation> {
    match parent_locator.next_segment_in(&event.locator) {
        Some(segment) if segment == C::NAME => {
            let mut child_outbox = Outbox::new();
            let next = child.transition(store, &mut child_outbox, event)?;
            outbox.merge(child_outbox);
            Ok((next, true))
        }
        _ => Ok((child, false)),
    }
}

/// Log-and-drop for events nobody along the path recognized.
pub fn drop_unhandled(event: &ProtocolEvent, at: &Locator) {
    warn!(
        process_id = %event.process_id,
        event_locator = ?event.locator,
        at = ?at,
        kind = ?event.kind,
        "dropping unaddressed protocol event"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_prefix_excludes_equal_locators() {
        let parent = Locator::top(ProtocolName::Challenger);
        let child = parent.child(ProtocolName::Defunding);

        assert!(parent.is_strict_prefix_of(&child));
        assert!(!parent.is_strict_prefix_of(&parent));
        assert!(!child.is_strict_prefix_of(&parent));
    }

    #[test]
    fn next_segment_names_the_child() {
        let parent = Locator::top(ProtocolName::Challenger);
        let grandchild = parent
            .child(ProtocolName::Defunding)
            .child(ProtocolName::ConsensusUpdate);

        assert_eq!(
            parent.next_segment_in(&grandchild),
            Some(ProtocolName::Defunding)
        );
        assert_eq!(parent.next_segment_in(&parent), None);
    }

    #[test]
    fn sibling_instances_are_disambiguated_by_path() {
        let defund = Locator::top(ProtocolName::Defunding);
        let consensus_a = defund.child(ProtocolName::ConsensusUpdate);
        let responder = Locator::top(ProtocolName::Responder);
        let consensus_b = responder.child(ProtocolName::ConsensusUpdate);

        assert!(defund.is_strict_prefix_of(&consensus_a));
        assert!(!defund.is_strict_prefix_of(&consensus_b));
    }
}
