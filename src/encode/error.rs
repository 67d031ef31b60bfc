//! Error type and Result alias used by the canonical serializer.

use core::fmt::Display;

use serde::ser;
use thiserror::Error;

/// Represents all possible errors that can happen while encoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The value contains a type that has no canonical encoding.
    ///
    /// Floats and maps are rejected on purpose: their encoding would either
    /// lose precision or depend on iteration order, and a hash over them
    /// could not be reproduced by a counterparty.
    #[error("type has no canonical encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// A sequence or byte string was longer than a `u32` length prefix can
    /// describe.
    #[error("length does not fit the u32 length prefix")]
    LengthOverflow,
    /// Error raised by a `Serialize` implementation.
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the serializer.
pub type Result<T> = core::result::Result<T, Error>;
