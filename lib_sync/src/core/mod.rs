//! Core runtime plumbing: the resource lifecycle registry and the
//! process-signal triggers that drive its teardown.

pub mod registry;
pub mod signals;
