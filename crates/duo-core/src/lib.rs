//! Duo Core - Reactive primitives for merged state
//!
//! This crate provides the host reactive environment the state merger runs in:
//! - Identifiers (CellId, SubscriptionId)
//! - Reactive cells with change notification and watchers
//! - Derived (computed) cells recomputed from cell versions
//! - The deferred-flush runtime
//! - Error types

pub mod id;
pub mod error;
pub mod cell;
pub mod computed;
pub mod runtime;

pub use id::*;
pub use error::*;
pub use cell::*;
pub use computed::*;
pub use runtime::*;
