//! Channel data model: constants, state variables, outcomes and signed
//! states.
//!
//! The split between [ChannelConstants] (immutable, hashed into the channel
//! id) and [StateVars] (changes with every update) mirrors the on-chain
//! adjudication layout. A [State] is the pair of both; its hash is what
//! participants sign.

use crate::encode::{self, to_hash};
use crate::encode::types::{Address, Hash, Signature, U256};
use serde::Serialize;
use thiserror::Error;

/// ID (Index) of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Where funds are paid out: either an external address (left-padded to 32
/// bytes) or the id of another channel.
#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Default, std::hash::Hash)]
pub struct Destination(pub [u8; 32]);

impl core::fmt::Debug for Destination {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("0x")?;
        for b in self.0 {
            f.write_fmt(format_args!("{:02x}", b))?;
        }
        Ok(())
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(bytes)
    }
}

impl From<Hash> for Destination {
    fn from(channel_id: Hash) -> Self {
        Destination(channel_id.0)
    }
}

/// One party of a channel. Identity is the signing address; `destination` is
/// where that party's funds end up.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub signing_address: Address,
    pub destination: Destination,
    pub participant_id: String,
}

/// The immutable part of a channel, fixed at proposal time.
///
/// The channel id is the hash of these constants; it is derived, never
/// assigned, so two channels with equal constants are the same channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ChannelConstants {
    pub chain_id: U256,
    pub channel_nonce: U256,
    pub participants: Vec<Participant>,
    pub app_definition: Address,
    pub challenge_duration: u64,
}

impl ChannelConstants {
    pub fn channel_id(&self) -> Result<Hash, encode::Error> {
        to_hash(self)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn index_of(&self, signing_address: Address) -> Option<PartIdx> {
        self.participants
            .iter()
            .position(|p| p.signing_address == signing_address)
    }

    /// The participant whose slot `turn_num` is.
    pub fn mover(&self, turn_num: u64) -> &Participant {
        &self.participants[(turn_num % self.participants.len() as u64) as usize]
    }
}

/// A single `(destination, amount)` entry of an outcome.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
}

/// The allocations of one asset, in priority order.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AssetOutcome {
    pub asset: Address,
    pub allocations: Vec<Allocation>,
}

impl AssetOutcome {
    pub fn total(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }

    pub fn allocated_to(&self, destination: Destination) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.destination == destination)
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }
}

/// An ordered list of per-asset allocations.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome(pub Vec<AssetOutcome>);

impl Outcome {
    pub fn asset(&self, asset: Address) -> Option<&AssetOutcome> {
        self.0.iter().find(|a| a.asset == asset)
    }

    pub fn allocated_to(&self, asset: Address, destination: Destination) -> U256 {
        self.asset(asset)
            .map(|a| a.allocated_to(destination))
            .unwrap_or_default()
    }
}

/// The mutable part of a channel, replaced by every update.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StateVars {
    pub turn_num: u64,
    pub is_final: bool,
    pub outcome: Outcome,
    pub app_data: Vec<u8>,
}

impl StateVars {
    /// Create the variables for the state that will replace this one.
    ///
    /// Bumping the turn number here instead of at the call sites keeps the
    /// monotonicity rule in one place.
    pub fn make_next(&self) -> StateVars {
        StateVars {
            turn_num: self.turn_num + 1,
            is_final: self.is_final,
            outcome: self.outcome.clone(),
            app_data: self.app_data.clone(),
        }
    }
}

/// A complete channel state: constants plus variables.
///
/// The signing hash covers both parts in this order; reordering any field
/// invalidates every existing signature.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub constants: ChannelConstants,
    pub vars: StateVars,
}

impl State {
    pub fn channel_id(&self) -> Result<Hash, encode::Error> {
        self.constants.channel_id()
    }

    pub fn hash(&self) -> Result<Hash, encode::Error> {
        to_hash(self)
    }
}

/// A signature together with the address it is claimed to recover to.
///
/// The claim is checked by the store before the signature is accepted.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSignature {
    pub signer: Address,
    pub signature: Signature,
}

/// A state plus the signatures observed for it.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub state: State,
    pub signatures: Vec<StateSignature>,
}

impl SignedState {
    pub fn turn_num(&self) -> u64 {
        self.state.vars.turn_num
    }

    pub fn channel_id(&self) -> Result<Hash, encode::Error> {
        self.state.channel_id()
    }

    pub fn signed_by(&self, signing_address: Address) -> bool {
        self.signatures.iter().any(|s| s.signer == signing_address)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("consensus payload ended early")]
    UnexpectedEnd,
    #[error("consensus payload has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// The voting round data a ledger channel carries in its `app_data`.
///
/// `further_votes_required` counts down from `n - 1` as participants accept
/// the `proposed_outcome`; at zero the proposal has unanimous support.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload {
    pub proposed_outcome: Outcome,
    pub further_votes_required: u32,
}

// app_data is opaque bytes on the wire, so the payload has a hand-written
// codec: u32 vote counter, then per asset a u16 entry count and fixed-width
// destination/amount pairs. All integers big-endian.
impl ConsensusPayload {
    pub fn to_app_data(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.further_votes_required.to_be_bytes());
        buf.extend_from_slice(&(self.proposed_outcome.0.len() as u16).to_be_bytes());
        for asset_outcome in &self.proposed_outcome.0 {
            buf.extend_from_slice(&asset_outcome.asset.0);
            buf.extend_from_slice(&(asset_outcome.allocations.len() as u16).to_be_bytes());
            for allocation in &asset_outcome.allocations {
                buf.extend_from_slice(&allocation.destination.0);
                buf.extend_from_slice(&allocation.amount.to_be_bytes());
            }
        }
        buf
    }

    pub fn from_app_data(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut r = Reader(bytes);
        let further_votes_required = u32::from_be_bytes(r.take::<4>()?);
        let asset_count = u16::from_be_bytes(r.take::<2>()?);
        let mut assets = Vec::with_capacity(asset_count as usize);
        for _ in 0..asset_count {
            let asset = Address(r.take::<20>()?);
            let alloc_count = u16::from_be_bytes(r.take::<2>()?);
            let mut allocations = Vec::with_capacity(alloc_count as usize);
            for _ in 0..alloc_count {
                let destination = Destination(r.take::<32>()?);
                let amount = U256::from_big_endian(&r.take::<32>()?);
                allocations.push(Allocation {
                    destination,
                    amount,
                });
            }
            assets.push(AssetOutcome { asset, allocations });
        }
        if !r.0.is_empty() {
            return Err(PayloadError::TrailingBytes(r.0.len()));
        }
        Ok(ConsensusPayload {
            proposed_outcome: Outcome(assets),
            further_votes_required,
        })
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], PayloadError> {
        if self.0.len() < N {
            return Err(PayloadError::UnexpectedEnd);
        }
        let (head, rest) = self.0.split_at(N);
        self.0 = rest;
        Ok(head.try_into().unwrap())
    }
}
