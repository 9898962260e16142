//! # researchq
//!
//! Lease-guarded worker for a persistent research queue.
//!
//! Picks queued research topics one at a time, hands each to an external
//! task runner, validates the artifact it leaves behind, and applies the
//! resulting state transition (completed, requeued, or failed). Items left
//! `running` by a crashed worker are recovered on the next run.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lease;
pub mod model;
pub mod prompt;
pub mod store;
pub mod telemetry;
pub mod validate;
pub mod vcs;
