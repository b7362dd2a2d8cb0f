//! Dynamics models for CrazyFly
//!
//! Rigid-body quadrotor model used by the simulator and to derive the
//! actuator envelope.

pub mod quadrotor;

pub use quadrotor::*;
