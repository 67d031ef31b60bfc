//! The signed-state store: one append-only [ChannelRecord] per channel.
//!
//! The store is the only shared mutable resource in the core. Protocols
//! receive it by mutable reference for exactly the duration of one
//! transition, so no two protocol instances ever observe each other's
//! partial writes.
//!
//! Incoming states that are stale for every signer are ignored (transport
//! redelivery is expected), invalid signatures are rejected with an error,
//! and nothing is ever removed once inserted.

use std::collections::{BTreeMap, BTreeSet};

use crate::channel::{ChannelConstants, PartIdx, SignedState, State, StateSignature, StateVars};
use crate::encode;
use crate::encode::types::{Address, Hash};
use crate::sig::{self, recover_signer, Signer};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown channel {0:?}")]
    UnknownChannel(Hash),
    #[error("channel must have at least two participants")]
    TooFewParticipants,
    #[error("{signer:?} is not a participant of channel {channel_id:?}")]
    NotAParticipant { channel_id: Hash, signer: Address },
    #[error("signature does not recover to claimed signer {claimed:?} (recovered {recovered:?})")]
    InvalidSignature { claimed: Address, recovered: Address },
    #[error("turn {turn_num} is not our slot in channel {channel_id:?}")]
    NotOurSlot { channel_id: Hash, turn_num: u64 },
    #[error("write at turn {turn_num} was stale")]
    StaleWrite { turn_num: u64 },
    #[error(transparent)]
    Encode(#[from] encode::Error),
    #[error(transparent)]
    Sig(#[from] sig::Error),
}

/// What [Store::push_signed_state] did with the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new state was appended to the record.
    Inserted,
    /// The state was already known; new signatures were merged into it.
    SignaturesMerged,
    /// Nothing new: every signature was stale or already present.
    Stale,
}

/// Everything observed about one channel. Serializable so a host can
/// persist records and replay them into a fresh store after a crash.
#[derive(serde::Serialize, Debug, Clone)]
pub struct ChannelRecord {
    channel_id: Hash,
    constants: ChannelConstants,
    /// Ascending by turn number; never truncated.
    states: Vec<SignedState>,
}

impl ChannelRecord {
    pub fn channel_id(&self) -> Hash {
        self.channel_id
    }

    pub fn constants(&self) -> &ChannelConstants {
        &self.constants
    }

    pub fn participant_count(&self) -> usize {
        self.constants.participant_count()
    }

    pub fn states(&self) -> &[SignedState] {
        &self.states
    }

    /// Highest-turn state seen, regardless of who signed it.
    pub fn latest(&self) -> Option<&SignedState> {
        self.states.last()
    }

    /// Lowest-turn state seen. For a channel observed from the start this is
    /// the prefund state, whose outcome is the funding request.
    pub fn earliest(&self) -> Option<&SignedState> {
        self.states.first()
    }

    pub fn latest_signed_by(&self, signing_address: Address) -> Option<&SignedState> {
        self.states
            .iter()
            .rev()
            .find(|s| s.signed_by(signing_address))
    }

    fn latest_turn_signed_by(&self, signing_address: Address) -> Option<u64> {
        self.latest_signed_by(signing_address).map(|s| s.turn_num())
    }

    /// The range of states proving support for `states[range.1]`, if any
    /// state is supported at all.
    ///
    /// A state is supported when every participant's signature is present,
    /// either directly on the state or accumulated over a contiguous run of
    /// earlier states each signed by its mover (the round-robin single-signer
    /// rule). Content is allowed to differ along the run: voting rounds
    /// change `app_data` at every turn.
    fn support_range(&self) -> Option<(usize, usize)> {
        let participants: BTreeSet<Address> = self
            .constants
            .participants
            .iter()
            .map(|p| p.signing_address)
            .collect();

        for hi in (0..self.states.len()).rev() {
            let candidate = &self.states[hi];
            let mut signed: BTreeSet<Address> = candidate
                .signatures
                .iter()
                .map(|s| s.signer)
                .collect();
            let mut lo = hi;
            let mut expected_turn = candidate.turn_num();

            while !participants.is_subset(&signed) && lo > 0 {
                let prev = &self.states[lo - 1];
                if prev.turn_num() + 1 != expected_turn {
                    break;
                }
                let mover = self.constants.mover(prev.turn_num()).signing_address;
                if !prev.signed_by(mover) {
                    break;
                }
                signed.insert(mover);
                lo -= 1;
                expected_turn = prev.turn_num();
            }

            if participants.is_subset(&signed) {
                return Some((lo, hi));
            }
        }
        None
    }

    /// The highest-turn state every participant has validly co-signed.
    pub fn supported(&self) -> Option<&SignedState> {
        self.support_range().map(|(_, hi)| &self.states[hi])
    }

    /// The contiguous run of states backing [Self::supported], ascending.
    /// This is what goes on-chain with a challenge.
    pub fn support_proof(&self) -> Option<Vec<SignedState>> {
        self.support_range()
            .map(|(lo, hi)| self.states[lo..=hi].to_vec())
    }

    /// Whether setup is complete: the prefund round occupies turns
    /// `0..n-1` and the postfund round `n..2n-1`, so the channel is fully
    /// open once a state at turn `2n - 1` or later is supported.
    pub fn is_fully_open(&self) -> bool {
        let n = self.participant_count() as u64;
        self.supported()
            .map(|s| s.turn_num() >= 2 * n - 1)
            .unwrap_or(false)
    }
}

/// Owns every [ChannelRecord] plus the local signing key.
#[derive(Debug)]
pub struct Store {
    signer: Signer,
    channels: BTreeMap<Hash, ChannelRecord>,
}

impl Store {
    pub fn new(signer: Signer) -> Self {
        Store {
            signer,
            channels: BTreeMap::new(),
        }
    }

    pub fn our_address(&self) -> Address {
        self.signer.address()
    }

    /// Create an empty record for `constants`. Idempotent: registering the
    /// same constants twice is a no-op returning the same id.
    pub fn register_channel(&mut self, constants: ChannelConstants) -> Result<Hash, StoreError> {
        if constants.participant_count() < 2 {
            return Err(StoreError::TooFewParticipants);
        }
        let channel_id = constants.channel_id()?;
        self.channels.entry(channel_id).or_insert(ChannelRecord {
            channel_id,
            constants,
            states: Vec::new(),
        });
        Ok(channel_id)
    }

    pub fn channel(&self, channel_id: &Hash) -> Option<&ChannelRecord> {
        self.channels.get(channel_id)
    }

    /// All records, for persistence. The signing key is not part of the
    /// store's serializable state; it belongs to the signing collaborator.
    pub fn channel_records(&self) -> impl Iterator<Item = &ChannelRecord> {
        self.channels.values()
    }

    pub fn expect_channel(&self, channel_id: &Hash) -> Result<&ChannelRecord, StoreError> {
        self.channels
            .get(channel_id)
            .ok_or(StoreError::UnknownChannel(*channel_id))
    }

    pub fn my_index(&self, channel_id: &Hash) -> Result<PartIdx, StoreError> {
        let record = self.expect_channel(channel_id)?;
        record
            .constants
            .index_of(self.our_address())
            .ok_or(StoreError::NotAParticipant {
                channel_id: *channel_id,
                signer: self.our_address(),
            })
    }

    pub fn latest_signed_by_me(&self, channel_id: &Hash) -> Option<&SignedState> {
        self.channel(channel_id)
            .and_then(|r| r.latest_signed_by(self.our_address()))
    }

    pub fn our_participant_id(&self, channel_id: &Hash) -> Result<String, StoreError> {
        let record = self.expect_channel(channel_id)?;
        let me = self.my_index(channel_id)?;
        Ok(record.constants.participants[me].participant_id.clone())
    }

    /// Participant ids of everyone but us, for addressing envelopes.
    pub fn counterparties(&self, channel_id: &Hash) -> Result<Vec<String>, StoreError> {
        let record = self.expect_channel(channel_id)?;
        let our_address = self.our_address();
        Ok(record
            .constants
            .participants
            .iter()
            .filter(|p| p.signing_address != our_address)
            .map(|p| p.participant_id.clone())
            .collect())
    }

    /// Record an observed signed state.
    ///
    /// Signatures that do not recover to their claimed signer, or recover to
    /// a non-participant, reject the whole state. States carrying no new
    /// information are ignored with a debug log, never an error, because
    /// redelivery and out-of-order arrival are normal for relayed transport.
    pub fn push_signed_state(&mut self, signed: SignedState) -> Result<PushOutcome, StoreError> {
        if signed.state.constants.participant_count() < 2 {
            return Err(StoreError::TooFewParticipants);
        }
        let channel_id = signed.channel_id()?;
        let hash = signed.state.hash()?;

        for s in &signed.signatures {
            let recovered = recover_signer(hash, s.signature)?;
            if recovered != s.signer {
                return Err(StoreError::InvalidSignature {
                    claimed: s.signer,
                    recovered,
                });
            }
            if signed.state.constants.index_of(s.signer).is_none() {
                return Err(StoreError::NotAParticipant {
                    channel_id,
                    signer: s.signer,
                });
            }
        }

        if signed.signatures.is_empty() {
            debug!(channel = ?channel_id, turn = signed.turn_num(), "unsigned state ignored");
            return Ok(PushOutcome::Stale);
        }

        let record = self.channels.entry(channel_id).or_insert(ChannelRecord {
            channel_id,
            constants: signed.state.constants.clone(),
            states: Vec::new(),
        });

        // Same content seen before: accumulate signatures on the existing
        // entry instead of storing a duplicate.
        if let Some(existing) = record
            .states
            .iter_mut()
            .find(|s| s.state.vars == signed.state.vars)
        {
            let mut added = false;
            for s in signed.signatures {
                if !existing.signed_by(s.signer) {
                    existing.signatures.push(s);
                    added = true;
                }
            }
            return Ok(if added {
                PushOutcome::SignaturesMerged
            } else {
                debug!(channel = ?channel_id, "duplicate signed state ignored");
                PushOutcome::Stale
            });
        }

        // Accept only if the turn advances for every signer's slot.
        let fresh = signed.signatures.iter().all(|s| {
            record
                .latest_turn_signed_by(s.signer)
                .map_or(true, |known| signed.turn_num() > known)
        });
        if !fresh {
            debug!(channel = ?channel_id, turn = signed.turn_num(), "stale signed state ignored");
            return Ok(PushOutcome::Stale);
        }

        let pos = record
            .states
            .partition_point(|s| s.turn_num() <= signed.turn_num());
        record.states.insert(pos, signed);
        Ok(PushOutcome::Inserted)
    }

    /// Sign `vars` with the local key and record the result.
    ///
    /// The turn must be our slot (`turn_num mod n == our index`); protocols
    /// only ever write on their own turn and this guard keeps a buggy caller
    /// from breaking the round-robin invariant.
    pub fn sign_and_insert(
        &mut self,
        channel_id: Hash,
        vars: StateVars,
    ) -> Result<SignedState, StoreError> {
        let record = self.expect_channel(&channel_id)?;
        let me = self.my_index(&channel_id)?;
        let n = record.participant_count() as u64;
        if vars.turn_num % n != me as u64 {
            return Err(StoreError::NotOurSlot {
                channel_id,
                turn_num: vars.turn_num,
            });
        }

        let state = State {
            constants: record.constants.clone(),
            vars,
        };
        let turn_num = state.vars.turn_num;
        let hash = state.hash()?;
        let signature = self.signer.sign(hash)?;
        let signed = SignedState {
            state,
            signatures: vec![StateSignature {
                signer: self.our_address(),
                signature,
            }],
        };

        match self.push_signed_state(signed.clone())? {
            PushOutcome::Inserted | PushOutcome::SignaturesMerged => Ok(signed),
            PushOutcome::Stale => Err(StoreError::StaleWrite { turn_num }),
        }
    }
}
