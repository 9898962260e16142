//! Core data model.
//!
//! A queue item is one research topic waiting to be run. It carries its
//! origin (the captured record it came from), priority, retry budget, and
//! lifecycle status.

pub mod origin;
pub mod queue;

pub use origin::*;
pub use queue::*;
