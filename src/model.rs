//! Core data model for pinner.
//!
//! These types describe what a workflow invokes and how a run went:
//! action identities, parsed references, pin keys, and per-document tallies.

mod action;
mod tally;

pub use action::{ActionIdentity, ActionReference, PinKey, ReferenceError};
pub use tally::Tally;
