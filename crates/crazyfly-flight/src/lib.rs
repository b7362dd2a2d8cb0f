//! # CrazyFly Flight
//!
//! Receding-horizon MPC and the fixed-rate flight loop built on
//! `crazyfly-core`.
//!
//! # Architecture
//!
//! Every tick the arbiter fuses the newly arrived measurements, picks the
//! controller for the current flight mode and sends one clamped command:
//!
//! ```text
//! sensors ──► FusionManager ──► VehicleState ──┬─► PID cascade (+ L1) ─┐
//!                                              └─► MPC (+ L1) ─────────┼─► envelope clamp ──► actuators
//!                       no fix / divergence / escalation ──► safe command ┘
//! ```
//!
//! # Components
//!
//! - [`ocp`]: condensed double-integrator tracking problem
//! - [`solver`]: box-QP solvers (projected gradient, optional OSQP)
//! - [`mpc`]: receding-horizon controller with fallback policy
//! - [`trajectory`]: takeoff, landing, hold and circle references
//! - [`arbiter`]: controller selection, safe command, fixed-rate loop
//! - [`config`]: aggregate TOML configuration
//! - [`session`]: closed-loop simulation of a scripted mission

pub mod ocp;
pub mod solver;
pub mod mpc;
pub mod trajectory;
pub mod arbiter;
pub mod config;
pub mod session;

// Re-exports
pub use arbiter::{
    run, ActuatorSink, ArbiterConfig, ArbiterError, ControlArbiter, DisarmHandle, FlightMode, SafeCommand,
    SafeReason, TelemetrySink, TickReport, Ticker,
};
pub use config::{FlightConfig, FlightConfigError};
pub use mpc::{MpcConfig, MpcController, MpcError, MpcOutput, MpcStatus};
pub use session::{Mission, MissionConfig, Session, SessionError, SessionSummary};
pub use solver::{QpBackend, QpSolver, SolveOptions, SolverError};
pub use trajectory::Trajectory;
