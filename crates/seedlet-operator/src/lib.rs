//! Seed cluster agent
//!
//! Starts in two phases: bootstrap runnables obtain the garden credential and
//! validate the seed config, then the main runnables register the seed, run
//! the startup maintenance and keep the seed lease alive.

#![deny(missing_docs)]

pub mod garden;
pub mod heartbeat;
pub mod lifecycle;
pub mod maintenance;
pub mod probes;
pub mod reconcilers;
pub mod registration;

pub use lifecycle::{Lifecycle, Phase, Runnable};
