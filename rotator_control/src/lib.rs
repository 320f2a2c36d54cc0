//! Closed-loop control of a GS-232B azimuth/elevation rotator.
//!
//! [`model::tracking_manager`] keeps the antenna on a satellite computed by
//! `pass_planner`, [`model::calibration`] walks the operator through setting
//! the north/south reference and park position, and [`rotator_handler`] talks
//! to the controller over a serial port or a simulated link.

pub mod config;
pub mod model;
pub mod rotator_handler;

pub use model::{RotatorError, RotatorResult};
