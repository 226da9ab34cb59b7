//! Decision Engine: gates collegiate decisions on quorum and approval policy
//!
//! The engine is pure: it evaluates votes that were already fetched from
//! storage and never persists anything. Persisting a terminal decision is the
//! dispatcher's job, and it only does so after the engine has approved it.
//!
//! Counting rules:
//! - a reviewer's latest vote in the round is the one that counts
//! - a latest vote whose `expires_at` has passed does not count
//! - quorum gates every finalizing action
//! - the approval threshold gates APPROVE only

#![deny(unsafe_code)]

mod engine;
mod tally;

pub use engine::{evaluate_finalization, evaluate_finalization_at, DecisionEngine};
pub use tally::VoteTally;
