//! Simulation support
//!
//! Ground-truth vehicle and seeded synthetic sensors for closed-loop
//! scenarios and tests.

pub mod config;
pub mod sensors;
pub mod simulator;

pub use config::*;
pub use sensors::*;
pub use simulator::*;
