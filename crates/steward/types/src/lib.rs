//! Steward Domain Types
//!
//! This crate defines the vocabulary shared by every layer of the
//! request-execution core: who is acting, in which tenant, under which
//! idempotency key, and against which workflow entity.
//!
//! # Key Concepts
//!
//! - **Tenant Scope**: an explicit value (never ambient state) that every
//!   storage call receives. `TenantScope::None` is fail-closed.
//! - **Idempotency Record**: the dedup ledger entry for one
//!   `(organization, key)` pair.
//! - **Committee Vote / Config**: inputs to quorum and approval-threshold
//!   evaluation.
//! - **Workflow Action**: a closed sum type over everything a caller may ask
//!   the dispatcher to do, each variant carrying its own payload.
//!
//! # Architecture
//!
//! This is a pure types crate with no runtime dependencies. IDs use the
//! newtype pattern and implement `Display`, `generate()`, and `new()`.

#![deny(unsafe_code)]

mod audit;
mod committee;
mod context;
mod errors;
mod ids;
mod idempotency;
mod invocation;
mod request;
mod workflow;

pub use audit::*;
pub use committee::*;
pub use context::*;
pub use errors::*;
pub use ids::*;
pub use idempotency::*;
pub use invocation::*;
pub use request::*;
pub use workflow::*;
