//! Off-chain state-channel protocol engine.
//!
//! Cooperating parties fund, update, top up, defund and dispute payment
//! channels without an on-chain transaction per state change. Everything
//! here is synchronous and event-driven: protocols are pure reducers over a
//! shared signed-state store, side effects accumulate in an outbox, and
//! waiting (for a counterparty, a confirmation, a timeout) is always an
//! explicit state, never suspended control flow. Transport, persistence and
//! chain access are collaborators the host wires up around the core.

mod encode {
    mod error;
    mod hashing;
    mod ser;

    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::to_hash;
    pub use ser::{to_writer, Serializer, Writer};
}
pub mod sig;

pub mod channel;
pub mod outbox;
pub mod protocols;
pub mod store;

pub use encode::types::{Address, Hash, Signature, U256};
pub use encode::{to_hash, to_writer, Error as EncodeError, Writer};
