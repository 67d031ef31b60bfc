//! Ledger-queue reallocation: batch pending funding and defunding requests
//! into the next outcome to propose on a ledger channel.
//!
//! These are pure functions over the store; the result feeds a
//! consensus-update run as its target outcome. Capacity comes exclusively
//! from the ledger participants' own entries, drawn down in entry order, and
//! a request that cannot be fully satisfied is skipped whole: partial
//! funding would leave the funded channel unable to pay out its prefund
//! outcome.

use std::collections::BTreeSet;

use crate::channel::{Allocation, AssetOutcome, Destination, Outcome};
use crate::encode::types::{Address, Hash, U256};
use crate::protocols::ProtocolViolation;
use crate::store::{Store, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReallocationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("channel {0:?} has no supported state")]
    NoSupportedState(Hash),
    #[error("channel {0:?} has no recorded states")]
    NoStates(Hash),
}

/// The proposal side of a reallocation pass.
///
/// `outcome` is `None` when the pass changed nothing: everything requested
/// was either impossible or already in place, and no new ledger state needs
/// to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeLedgerState {
    pub channel_id: Hash,
    pub outcome: Option<Outcome>,
    pub channels_not_funded: Vec<Hash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reallocation {
    Propose(ProposeLedgerState),
    /// Some returning channels are already gone from the ledger's supported
    /// outcome; their requests should be retired before anything new is
    /// proposed.
    MarkLedgerFundingRequestsAsComplete { completed: Vec<Hash> },
}

/// Compute the next outcome for `ledger_channel_id` given the queued
/// requests, in FIFO order of `requesting`.
pub fn reallocate(
    store: &Store,
    ledger_channel_id: Hash,
    requesting: &[Hash],
    returning: &[Hash],
) -> Result<Reallocation, ReallocationError> {
    let ledger = store.expect_channel(&ledger_channel_id)?;
    let supported_outcome = ledger
        .supported()
        .ok_or(ReallocationError::NoSupportedState(ledger_channel_id))?
        .state
        .vars
        .outcome
        .clone();

    // Defunds that already went through: the ledger no longer allocates
    // anything to the channel. Reported instead of a proposal so the caller
    // retires those requests first.
    let completed: Vec<Hash> = returning
        .iter()
        .copied()
        .filter(|&channel_id| {
            let dest = Destination::from(channel_id);
            supported_outcome
                .0
                .iter()
                .all(|asset| asset.allocated_to(dest).is_zero())
        })
        .collect();
    if !completed.is_empty() {
        return Ok(Reallocation::MarkLedgerFundingRequestsAsComplete { completed });
    }

    let participant_destinations: BTreeSet<Destination> = ledger
        .constants()
        .participants
        .iter()
        .map(|p| p.destination)
        .collect();

    let mut next = supported_outcome.clone();

    // Fold still-allocated returning channels back into participant entries.
    for &channel_id in returning {
        let record = store.expect_channel(&channel_id)?;
        let channel_outcome = &record
            .supported()
            .ok_or(ReallocationError::NoSupportedState(channel_id))?
            .state
            .vars
            .outcome;
        next = defunding_target(&next, channel_id, channel_outcome);
    }

    let mut channels_not_funded = Vec::new();
    for &channel_id in requesting {
        let record = store.expect_channel(&channel_id)?;
        let prefund_outcome = &record
            .earliest()
            .ok_or(ReallocationError::NoStates(channel_id))?
            .state
            .vars
            .outcome;
        let dest = Destination::from(channel_id);

        // Per-asset shortfall; re-running a pass must not double fund, so
        // anything already allocated to the channel counts against the
        // request.
        let mut needs: Vec<(Address, U256)> = Vec::new();
        let mut fundable = true;
        for asset_outcome in &prefund_outcome.0 {
            let requested = asset_outcome.total();
            let already = next.allocated_to(asset_outcome.asset, dest);
            let need = requested.checked_sub(already).unwrap_or_default();
            if need.is_zero() {
                continue;
            }
            let available = next
                .asset(asset_outcome.asset)
                .map(|a| {
                    a.allocations
                        .iter()
                        .filter(|al| participant_destinations.contains(&al.destination))
                        .fold(U256::zero(), |acc, al| acc + al.amount)
                })
                .unwrap_or_default();
            if available < need {
                fundable = false;
                break;
            }
            needs.push((asset_outcome.asset, need));
        }

        // No partial funding, and a skipped request neither consumes nor
        // frees capacity for the ones behind it.
        if !fundable {
            channels_not_funded.push(channel_id);
            continue;
        }

        for (asset, need) in needs {
            let Some(asset_outcome) = next.0.iter_mut().find(|a| a.asset == asset) else {
                continue;
            };
            let mut remaining = need;
            for allocation in asset_outcome.allocations.iter_mut() {
                if remaining.is_zero() {
                    break;
                }
                if !participant_destinations.contains(&allocation.destination) {
                    continue;
                }
                let take = core::cmp::min(allocation.amount, remaining);
                allocation.amount = allocation.amount - take;
                remaining = remaining - take;
            }
            asset_outcome.allocations.retain(|a| !a.amount.is_zero());
            if let Some(entry) = asset_outcome
                .allocations
                .iter_mut()
                .find(|a| a.destination == dest)
            {
                entry.amount = entry.amount + need;
            } else {
                asset_outcome.allocations.push(Allocation {
                    destination: dest,
                    amount: need,
                });
            }
        }
    }

    let outcome = if next == supported_outcome {
        None
    } else {
        Some(next)
    };
    Ok(Reallocation::Propose(ProposeLedgerState {
        channel_id: ledger_channel_id,
        outcome,
        channels_not_funded,
    }))
}

/// Entry-wise intersection of two proposals: an allocation survives only if
/// both sides agree on its destination and amount.
pub fn intersect_outcomes(a: &Outcome, b: &Outcome) -> Outcome {
    Outcome(
        a.0.iter()
            .filter_map(|asset_a| {
                b.asset(asset_a.asset).map(|asset_b| AssetOutcome {
                    asset: asset_a.asset,
                    allocations: asset_a
                        .allocations
                        .iter()
                        .filter(|al| asset_b.allocations.contains(al))
                        .cloned()
                        .collect(),
                })
            })
            .collect(),
    )
}

/// The responding-proposer path: both sides proposed independently, so the
/// state to sign is the intersection. Returns `None` when the intersection
/// is already the supported outcome and no new state is needed.
pub fn respond_to_proposal(supported: &Outcome, ours: &Outcome, theirs: &Outcome) -> Option<Outcome> {
    let agreed = intersect_outcomes(ours, theirs);
    if &agreed == supported {
        None
    } else {
        Some(agreed)
    }
}

/// The counterpart revealed a signed state; it must match the previously
/// agreed intersection exactly. Anything else is a byzantine or buggy peer
/// and there is no safe automatic recovery.
pub fn check_revealed_state(
    channel_id: Hash,
    agreed: &Outcome,
    revealed: &Outcome,
) -> Result<(), ProtocolViolation> {
    if revealed == agreed {
        Ok(())
    } else {
        Err(ProtocolViolation {
            channel_id,
            detail: format!(
                "revealed outcome {:?} does not match the agreed intersection {:?}",
                revealed, agreed
            ),
        })
    }
}

/// The ledger outcome after defunding `channel_id`: its entry disappears and
/// its own (final) outcome is credited back, per asset, to the destinations
/// it names.
pub fn defunding_target(
    ledger_outcome: &Outcome,
    channel_id: Hash,
    channel_outcome: &Outcome,
) -> Outcome {
    let dest = Destination::from(channel_id);
    let mut next = ledger_outcome.clone();
    for asset_outcome in next.0.iter_mut() {
        asset_outcome.allocations.retain(|a| a.destination != dest);
        if let Some(channel_asset) = channel_outcome.asset(asset_outcome.asset) {
            for allocation in &channel_asset.allocations {
                if let Some(entry) = asset_outcome
                    .allocations
                    .iter_mut()
                    .find(|e| e.destination == allocation.destination)
                {
                    entry.amount = entry.amount + allocation.amount;
                } else {
                    asset_outcome.allocations.push(*allocation);
                }
            }
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_fixtures::{signers, simple_outcome, two_party_constants};
    use crate::channel::ChannelConstants;
    use crate::sig::Signer;
    use crate::store::test_support::signed_state;

    struct Setup {
        store: Store,
        ledger_id: Hash,
        a_dest: Destination,
        b_dest: Destination,
        constants: ChannelConstants,
    }

    /// Two-party ledger with a supported outcome of `{A: a, B: b}` at turns
    /// 4 and 5.
    fn ledger(a: u64, b: u64) -> Setup {
        let sx = signers(2);
        let constants = two_party_constants(&sx);
        let a_dest = constants.participants[0].destination;
        let b_dest = constants.participants[1].destination;
        let outcome = simple_outcome(&[(a_dest, a), (b_dest, b)]);

        let mut store = Store::new(Signer::from_bytes(&[9u8; 32]).unwrap());
        store
            .push_signed_state(signed_state(&constants, 4, outcome.clone(), vec![], &[&sx[0]]))
            .unwrap();
        store
            .push_signed_state(signed_state(&constants, 5, outcome, vec![], &[&sx[1]]))
            .unwrap();

        Setup {
            ledger_id: constants.channel_id().unwrap(),
            store,
            a_dest,
            b_dest,
            constants,
        }
    }

    /// Register an application channel whose prefund outcome requests the
    /// given entries, and return its id.
    fn requesting_channel(setup: &mut Setup, nonce: u64, entries: &[(Destination, u64)]) -> Hash {
        let sx = signers(2);
        let mut constants = setup.constants.clone();
        constants.channel_nonce = U256::from(nonce);
        let channel_id = constants.channel_id().unwrap();
        setup
            .store
            .push_signed_state(signed_state(
                &constants,
                0,
                simple_outcome(entries),
                vec![],
                &[&sx[0]],
            ))
            .unwrap();
        channel_id
    }

    fn total(outcome: &Outcome) -> u64 {
        outcome.0[0]
            .allocations
            .iter()
            .fold(0, |acc, a| acc + a.amount.as_u64())
    }

    #[test]
    fn funds_a_request_by_reducing_the_first_entry() {
        let mut setup = ledger(2, 3);
        let a_dest = setup.a_dest;
        let c = requesting_channel(&mut setup, 100, &[(a_dest, 1)]);

        let result = reallocate(&setup.store, setup.ledger_id, &[c], &[]).unwrap();
        let Reallocation::Propose(proposal) = result else {
            panic!("expected a proposal");
        };
        assert!(proposal.channels_not_funded.is_empty());
        let outcome = proposal.outcome.unwrap();
        assert_eq!(
            outcome,
            simple_outcome(&[
                (setup.a_dest, 1),
                (setup.b_dest, 3),
                (Destination::from(c), 1),
            ])
        );
        // Conservation: capacity neither grows nor shrinks.
        assert_eq!(total(&outcome), 5);
    }

    #[test]
    fn oversized_request_is_reported_not_partially_funded() {
        let mut setup = ledger(10, 10);
        let a_dest = setup.a_dest;
        let b_dest = setup.b_dest;
        let c = requesting_channel(&mut setup, 100, &[(a_dest, 100), (b_dest, 100)]);

        let result = reallocate(&setup.store, setup.ledger_id, &[c], &[]).unwrap();
        let Reallocation::Propose(proposal) = result else {
            panic!("expected a proposal");
        };
        assert_eq!(proposal.outcome, None);
        assert_eq!(proposal.channels_not_funded, vec![c]);
    }

    #[test]
    fn rerunning_a_pass_does_not_double_fund() {
        let mut setup = ledger(2, 3);
        let a_dest = setup.a_dest;
        let c = requesting_channel(&mut setup, 100, &[(a_dest, 1)]);

        let Reallocation::Propose(first) =
            reallocate(&setup.store, setup.ledger_id, &[c], &[]).unwrap()
        else {
            panic!("expected a proposal");
        };
        let funded = first.outcome.unwrap();

        // The proposal became the supported outcome; the request is re-run
        // before being retired.
        let sx = signers(2);
        setup
            .store
            .push_signed_state(signed_state(
                &setup.constants,
                6,
                funded.clone(),
                vec![],
                &[&sx[0]],
            ))
            .unwrap();
        setup
            .store
            .push_signed_state(signed_state(&setup.constants, 7, funded, vec![], &[&sx[1]]))
            .unwrap();

        let Reallocation::Propose(second) =
            reallocate(&setup.store, setup.ledger_id, &[c], &[]).unwrap()
        else {
            panic!("expected a proposal");
        };
        assert_eq!(second.outcome, None);
        assert!(second.channels_not_funded.is_empty());
    }

    #[test]
    fn fifo_order_breaks_capacity_ties() {
        let mut setup = ledger(3, 0);
        let a_dest = setup.a_dest;
        let c = requesting_channel(&mut setup, 100, &[(a_dest, 2)]);
        let d = requesting_channel(&mut setup, 101, &[(a_dest, 2)]);

        let Reallocation::Propose(proposal) =
            reallocate(&setup.store, setup.ledger_id, &[c, d], &[]).unwrap()
        else {
            panic!("expected a proposal");
        };
        // First come, first served: C wins the capacity, D waits.
        assert_eq!(proposal.channels_not_funded, vec![d]);
        let outcome = proposal.outcome.unwrap();
        assert_eq!(outcome.allocated_to(outcome.0[0].asset, Destination::from(c)).as_u64(), 2);
        assert!(outcome
            .allocated_to(outcome.0[0].asset, Destination::from(d))
            .is_zero());

        // Swapping arrival order swaps the winner.
        let Reallocation::Propose(swapped) =
            reallocate(&setup.store, setup.ledger_id, &[d, c], &[]).unwrap()
        else {
            panic!("expected a proposal");
        };
        assert_eq!(swapped.channels_not_funded, vec![c]);
    }

    #[test]
    fn finished_defunds_are_reported_as_complete() {
        let mut setup = ledger(2, 3);
        // C never made it into the current ledger outcome: its defund is done.
        let a_dest = setup.a_dest;
        let c = requesting_channel(&mut setup, 100, &[(a_dest, 1)]);

        let result = reallocate(&setup.store, setup.ledger_id, &[], &[c]).unwrap();
        assert_eq!(
            result,
            Reallocation::MarkLedgerFundingRequestsAsComplete { completed: vec![c] }
        );
    }

    #[test]
    fn returning_channel_folds_back_into_participants() {
        let mut setup = ledger(2, 3);
        let sx = signers(2);

        // Channel C holds 2 units, finally allocated entirely to A.
        let mut c_constants = setup.constants.clone();
        c_constants.channel_nonce = U256::from(200);
        let c = c_constants.channel_id().unwrap();
        setup
            .store
            .push_signed_state(signed_state(
                &c_constants,
                0,
                simple_outcome(&[(setup.a_dest, 2)]),
                vec![],
                &[&sx[0], &sx[1]],
            ))
            .unwrap();

        // Rewrite the ledger so C is funded in the supported outcome.
        let with_c = simple_outcome(&[
            (setup.a_dest, 0),
            (setup.b_dest, 3),
            (Destination::from(c), 2),
        ]);
        setup
            .store
            .push_signed_state(signed_state(&setup.constants, 6, with_c.clone(), vec![], &[&sx[0]]))
            .unwrap();
        setup
            .store
            .push_signed_state(signed_state(&setup.constants, 7, with_c, vec![], &[&sx[1]]))
            .unwrap();

        let Reallocation::Propose(proposal) =
            reallocate(&setup.store, setup.ledger_id, &[], &[c]).unwrap()
        else {
            panic!("expected a proposal");
        };
        let outcome = proposal.outcome.unwrap();
        assert!(outcome
            .allocated_to(outcome.0[0].asset, Destination::from(c))
            .is_zero());
        assert_eq!(
            outcome.allocated_to(outcome.0[0].asset, setup.a_dest).as_u64(),
            2
        );
        assert_eq!(total(&outcome), 5);
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let a_dest = Destination([1; 32]);
        let b_dest = Destination([2; 32]);
        let c_dest = Destination([3; 32]);

        let ours = simple_outcome(&[(a_dest, 1), (b_dest, 3), (c_dest, 1)]);
        let theirs = simple_outcome(&[(a_dest, 1), (b_dest, 2), (c_dest, 1)]);

        let ab = intersect_outcomes(&ours, &theirs);
        let ba = intersect_outcomes(&theirs, &ours);
        assert_eq!(ab, ba);
        assert_eq!(ab, simple_outcome(&[(a_dest, 1), (c_dest, 1)]));

        assert_eq!(intersect_outcomes(&ours, &ours), ours);
    }

    #[test]
    fn matching_intersection_needs_no_new_state() {
        let a_dest = Destination([1; 32]);
        let supported = simple_outcome(&[(a_dest, 5)]);

        assert_eq!(respond_to_proposal(&supported, &supported, &supported), None);

        let fresh = simple_outcome(&[(a_dest, 4), (Destination([2; 32]), 1)]);
        assert_eq!(
            respond_to_proposal(&supported, &fresh, &fresh),
            Some(fresh)
        );
    }

    #[test]
    fn mismatched_reveal_is_a_protocol_violation() {
        let agreed = simple_outcome(&[(Destination([1; 32]), 5)]);
        let revealed = simple_outcome(&[(Destination([1; 32]), 4)]);

        assert!(check_revealed_state(Hash([7; 32]), &agreed, &agreed).is_ok());
        assert!(check_revealed_state(Hash([7; 32]), &agreed, &revealed).is_err());
    }

    #[test]
    fn defunding_target_moves_funds_back() {
        let a_dest = Destination([1; 32]);
        let b_dest = Destination([2; 32]);
        let c = Hash([9; 32]);

        let ledger_outcome = simple_outcome(&[
            (a_dest, 1),
            (b_dest, 3),
            (Destination::from(c), 2),
        ]);
        let channel_outcome = simple_outcome(&[(a_dest, 2)]);

        let target = defunding_target(&ledger_outcome, c, &channel_outcome);
        assert_eq!(target, simple_outcome(&[(a_dest, 3), (b_dest, 3)]));
    }
}
