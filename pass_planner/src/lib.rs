//! Pass Planner
//!
//! Satellite pointing pipeline: two-line element sets are propagated with a
//! Keplerian model (or SGP4 for reference), carried through the frame chain down
//! to azimuth/elevation/range at a ground station, and collapsed into visibility
//! windows for pass planning.

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod frames;
pub mod kepler;
pub mod planning;
pub mod time;
pub mod tle;
pub mod visibility;

pub use frames::{Geodetic, LookAngles, StateVector};
pub use kepler::{propagate, solve_kepler, PropagatedElements};
pub use planning::{
    calculate_pointing, state_vector_ecef, subsatellite_point, GroundStation, PointingTarget,
    PropagationModel,
};
pub use time::{generate_time_vector, gmst, julian_date, TimeVector};
pub use tle::{ElementStore, OrbitalElementSet, ParseWarning};
pub use visibility::{SharedVisibilityCache, VisibilityCache, VisibilitySettings, VisibilityWindow};

/// Result type alias for pass planner operations.
pub type PassPlannerResult<T> = Result<T, PassPlannerError>;

/// Error types for pass planner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassPlannerError {
    #[error("InvalidCalendarDate: {0}")]
    InvalidCalendarDate(String),
    #[error("InvalidRange: {0}")]
    InvalidRange(String),
    #[error(
        "KeplerNonConvergence: e={eccentricity}, M={mean_anomaly} rad, residual {residual:e} after {iterations} iterations"
    )]
    KeplerNonConvergence {
        eccentricity: f64,
        mean_anomaly: f64,
        residual: f64,
        iterations: usize,
    },
    #[error("NoDataForRange: {0}")]
    NoDataForRange(String),
    #[error("TLEError: {0}")]
    TLEError(String),
    #[error("ParseError: {0}")]
    ParseError(String),
    #[error("CalculationError: {0}")]
    CalculationError(String),
    #[error("InvalidInput: {0}")]
    InvalidInput(String),
    #[error("IoError: {0}")]
    IoError(String),
}

/// Sample the pointing target of one satellite at every instant of a time vector.
///
/// Samples whose propagation fails are skipped and logged; the rest of the track
/// is still returned.
///
/// # Arguments
/// * `elements` - The satellite's element set
/// * `station` - Ground station the pointing is relative to
/// * `times` - Sample instants
/// * `model` - Propagation model to use
pub fn pointing_track(
    elements: &OrbitalElementSet,
    station: &GroundStation,
    times: &TimeVector,
    model: PropagationModel,
) -> Vec<PointingTarget> {
    times
        .iter()
        .filter_map(
            |t: DateTime<Utc>| match calculate_pointing(elements, station, t, model) {
                Ok(target) => Some(target),
                Err(e) => {
                    log::warn!("{}: skipping sample at {}: {}", elements.name, t, e);
                    None
                }
            },
        )
        .collect()
}
