//! Idempotency Guard
//!
//! Deduplicates mutating calls keyed by a caller-supplied token, scoped to
//! the active tenant. The guard is a thin coordinator: the critical section
//! is the storage layer's atomic insert-or-acquire, so duplicates are caught
//! across processes as well as across tasks.
//!
//! | Existing record          | Behaviour                                        |
//! |--------------------------|--------------------------------------------------|
//! | none / expired           | acquire, run under timeout, store outcome        |
//! | COMPLETED                | return stored result, operation not run          |
//! | PENDING                  | wait for the owner, then return its outcome      |
//! | PENDING, lease expired   | treated as FAILED                                |
//! | FAILED                   | re-acquire and retry                             |
//! | different family         | CONFLICT                                         |

#![deny(unsafe_code)]

mod config;
mod fingerprint;
mod guard;

pub use config::IdempotencyConfig;
pub use fingerprint::fingerprint;
pub use guard::IdempotencyGuard;
