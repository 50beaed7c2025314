//! Closed-loop control.

pub mod pid;

pub use pid::{
    Convergence, ConvergenceConfig, ControllerState, PidConfig, PidController, PidGains,
};
