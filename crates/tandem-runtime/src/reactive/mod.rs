#![forbid(unsafe_code)]

//! Pull-or-subscribe state exposure.
//!
//! Every piece of observable runtime state (command state, lock occupancy,
//! history contents) is exposed the same way: a snapshot getter for callers
//! that just want the current value, and a `subscribe_*` method that returns a
//! [`Subscription`] guard for callers that want to hear about changes.
//!
//! [`ValueCell`] is the storage primitive behind it. Derived values (compound
//! command state, history aggregates) are recomputed on demand and subscribe
//! to the cells they derive from.

pub mod cell;

pub use cell::{Subscription, ValueCell};
