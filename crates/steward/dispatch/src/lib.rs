//! Workflow Dispatcher
//!
//! Single entry point for review-request actions. Each call composes the
//! other layers in a fixed order:
//!
//! ```text
//! dispatch(invocation)
//!   └── with_context(org, actor)                 tenant scope, always cleared
//!         └── guard.execute(key)                 at most once per (org, key)
//!               ├── log_invocation               write-ahead, once the key is owned
//!               ├── state machine check          terminal / illegal → BAD_REQUEST
//!               ├── decision engine              RECORD_DECISION only
//!               ├── transition_status (CAS)      history keyed by idempotency key, plus the vote
//!               └── enqueue_notice               keyed by (org, request, transition)
//! ```
//!
//! Errors never escape [`Dispatcher::dispatch`]; they are folded into the
//! returned [`DispatchResult`] envelope.
//!
//! [`DispatchResult`]: steward_types::DispatchResult

#![deny(unsafe_code)]

pub mod config;
mod dispatcher;
mod recovery;
pub mod state_machine;
pub mod telemetry;

pub use config::{RecoveryConfig, StewardConfig, StorageConfig};
pub use dispatcher::Dispatcher;
pub use recovery::RecoveryReport;
pub use state_machine::ReviewStateMachine;
pub use telemetry::{init_tracing, LogFormat, LoggingConfig};
