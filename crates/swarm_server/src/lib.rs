//! SWARM.GRID Server
//!
//! Daemon support: configuration loading and the in-process swarm simulator.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod settings;
pub mod sim;

pub use sim::{Behavior, SimConfig, SimNodeReport, SimReport};
