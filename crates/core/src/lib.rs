//! Domain model for the job board.
//!
//! Everything in this crate is pure: no I/O, no clocks. Callers pass `now`
//! explicitly so the rules stay deterministic under test.

#[macro_use]
mod macros;

pub mod access;
pub mod application;
pub mod pagination;
pub mod search;
pub mod slug;
pub mod template;
pub mod types;

use thiserror::Error;

/// Returned when a stored or submitted string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}
