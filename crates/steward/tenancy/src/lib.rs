//! Tenant Context Manager
//!
//! Establishes the isolation scope for one unit of work, validates it against
//! the tenant directory, records an audit trail for privileged or reasoned
//! access, and guarantees the scope is cleared on every exit path.
//!
//! The scope is a plain [`TenantScope`] value owned by the caller. Nothing is
//! stored in globals or task-locals, so concurrent units of work can never
//! inherit each other's tenant.
//!
//! ```text
//! with_context(ctx, f)
//!   ├── set_context   validate → audit ACTIVATED → slot = Active(ctx)
//!   ├── f(scope)      business logic sees only this tenant
//!   └── clear_context slot = None → audit RELEASED   (also on error/panic/cancel)
//! ```
//!
//! [`TenantScope`]: steward_types::TenantScope

#![deny(unsafe_code)]

mod config;
mod guard;
mod manager;

pub use config::TenancyConfig;
pub use manager::TenantContextManager;
