//! Keplerian propagation.
//!
//! Evolves the mean anomaly of an element set from its epoch, solves Kepler's
//! equation for the eccentric anomaly and derives the true anomaly and
//! semi-major axis. The node and perigee drift with the J2 secular rates.

use crate::frames::Vec3;
use crate::tle::OrbitalElementSet;
use crate::{PassPlannerError, PassPlannerResult};
use chrono::{DateTime, Utc};
use std::f64::consts::TAU;

/// Earth gravitational parameter (m³/s²)
pub const GM_EARTH: f64 = 3.986_004_418e14;
/// Earth equatorial radius used by the J2 model (m)
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
/// Second zonal harmonic
pub const J2: f64 = 1.082_626_68e-3;

/// Residual below which the eccentric anomaly is accepted.
pub const KEPLER_TOLERANCE: f64 = 1e-8;
/// Newton iterations allowed before giving up.
pub const KEPLER_MAX_ITERATIONS: usize = 50;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Orbital state of one element set at one evaluation time.
#[derive(Debug, Clone, Copy)]
pub struct PropagatedElements<'a> {
    pub elements: &'a OrbitalElementSet,
    pub time: DateTime<Utc>,
    /// Seconds since the element epoch
    pub elapsed_s: f64,
    /// Mean motion at `time` (rad/s)
    pub mean_motion: f64,
    /// Radians, [0, 2π)
    pub mean_anomaly: f64,
    /// Radians
    pub eccentric_anomaly: f64,
    /// Radians, [0, 2π)
    pub true_anomaly: f64,
    /// Meters
    pub semi_major_axis: f64,
    /// Right ascension of the ascending node after J2 drift (rad)
    pub raan: f64,
    /// Argument of perigee after J2 drift (rad)
    pub arg_perigee: f64,
    /// Inclination (rad)
    pub inclination: f64,
}

impl PropagatedElements<'_> {
    pub fn eccentricity(&self) -> f64 {
        self.elements.eccentricity
    }

    /// Position (m) and velocity (m/s) in the perifocal frame.
    pub fn perifocal_state(&self) -> (Vec3, Vec3) {
        let e = self.eccentricity();
        let nu = self.true_anomaly;
        let p = self.semi_major_axis * (1.0 - e * e);
        let r = p / (1.0 + e * nu.cos());
        let speed = (GM_EARTH / p).sqrt();

        (
            [r * nu.cos(), r * nu.sin(), 0.0],
            [-speed * nu.sin(), speed * (e + nu.cos()), 0.0],
        )
    }
}

/// Solves Kepler's equation `M = E - e·sin(E)` for the eccentric anomaly.
///
/// Newton–Raphson seeded with `E₀ = M`. The root always lies in
/// `[M - e, M + e]`; a step that leaves that bracket is replaced by bisection,
/// which keeps the iteration from cycling at high eccentricity.
///
/// # Errors
/// Returns `PassPlannerError::KeplerNonConvergence` if the residual is still
/// above [`KEPLER_TOLERANCE`] after [`KEPLER_MAX_ITERATIONS`] iterations, or
/// immediately for an eccentricity outside `[0, 1)`.
pub fn solve_kepler(mean_anomaly: f64, eccentricity: f64) -> PassPlannerResult<f64> {
    let e = eccentricity;
    let m = mean_anomaly;
    if !(0.0..1.0).contains(&e) || !m.is_finite() {
        return Err(PassPlannerError::KeplerNonConvergence {
            eccentricity: e,
            mean_anomaly: m,
            residual: f64::NAN,
            iterations: 0,
        });
    }

    let mut ecc_anomaly = m;
    let mut low = m - e;
    let mut high = m + e;
    let mut residual = m - (ecc_anomaly - e * ecc_anomaly.sin());

    for _ in 0..KEPLER_MAX_ITERATIONS {
        if residual.abs() < KEPLER_TOLERANCE {
            return Ok(ecc_anomaly);
        }
        if residual > 0.0 {
            low = ecc_anomaly;
        } else {
            high = ecc_anomaly;
        }

        let slope = 1.0 - e * ecc_anomaly.cos();
        let newton = ecc_anomaly + residual / slope;
        ecc_anomaly = if newton > low && newton < high {
            newton
        } else {
            0.5 * (low + high)
        };
        residual = m - (ecc_anomaly - e * ecc_anomaly.sin());
    }

    if residual.abs() < KEPLER_TOLERANCE {
        return Ok(ecc_anomaly);
    }
    Err(PassPlannerError::KeplerNonConvergence {
        eccentricity: e,
        mean_anomaly: m,
        residual,
        iterations: KEPLER_MAX_ITERATIONS,
    })
}

/// True anomaly from the eccentric anomaly (half-angle relation), in [0, 2π).
pub fn true_anomaly(eccentric_anomaly: f64, eccentricity: f64) -> f64 {
    let half = eccentric_anomaly / 2.0;
    let nu = 2.0
        * ((1.0 + eccentricity).sqrt() * half.sin())
            .atan2((1.0 - eccentricity).sqrt() * half.cos());
    nu.rem_euclid(TAU)
}

/// Semi-major axis (m) from mean motion (rad/s) by Kepler's third law.
pub fn semi_major_axis(mean_motion: f64) -> f64 {
    (GM_EARTH / (mean_motion * mean_motion)).cbrt()
}

/// Secular J2 rates of the node and of the perigee (rad/s).
pub fn j2_secular_rates(semi_major_axis: f64, eccentricity: f64, inclination: f64) -> (f64, f64) {
    let one_minus_e2 = 1.0 - eccentricity * eccentricity;
    let factor = J2 * GM_EARTH.sqrt() * EARTH_RADIUS_M * EARTH_RADIUS_M
        / (semi_major_axis.powf(3.5) * one_minus_e2 * one_minus_e2);
    let cos_i = inclination.cos();

    let raan_rate = -1.5 * factor * cos_i;
    let arg_perigee_rate = 0.75 * factor * (5.0 * cos_i * cos_i - 1.0);
    (raan_rate, arg_perigee_rate)
}

/// Propagates an element set to time `t`.
///
/// The mean anomaly advances as `M₀ + n·Δt + (ṅ/2)·Δt²`; with no drag term
/// this is the plain Keplerian `M₀ + n·Δt`.
///
/// # Errors
/// Returns `PassPlannerError::KeplerNonConvergence` if Kepler's equation cannot
/// be solved, and `PassPlannerError::CalculationError` if drag has decayed the
/// mean motion to zero at `t`.
pub fn propagate(elements: &OrbitalElementSet, t: DateTime<Utc>) -> PassPlannerResult<PropagatedElements<'_>> {
    let elapsed_s = (t - elements.epoch)
        .num_microseconds()
        .map(|us| us as f64 * 1e-6)
        .unwrap_or_else(|| (t - elements.epoch).num_milliseconds() as f64 * 1e-3);

    let n0 = elements.mean_motion_rev_per_day * TAU / SECONDS_PER_DAY;
    let half_ndot = elements.mean_motion_dot * TAU / (SECONDS_PER_DAY * SECONDS_PER_DAY);
    let mean_motion = n0 + 2.0 * half_ndot * elapsed_s;
    if mean_motion <= 0.0 {
        return Err(PassPlannerError::CalculationError(format!(
            "{}: mean motion decayed to {mean_motion} rad/s at {t}",
            elements.name
        )));
    }

    let mean_anomaly = (elements.mean_anomaly_deg.to_radians()
        + n0 * elapsed_s
        + half_ndot * elapsed_s * elapsed_s)
        .rem_euclid(TAU);
    let e = elements.eccentricity;
    let eccentric_anomaly = solve_kepler(mean_anomaly, e)?;
    let true_anomaly = true_anomaly(eccentric_anomaly, e);
    let semi_major_axis = semi_major_axis(mean_motion);

    let inclination = elements.inclination_deg.to_radians();
    let (raan_rate, arg_perigee_rate) = j2_secular_rates(semi_major_axis, e, inclination);
    let raan = (elements.raan_deg.to_radians() + raan_rate * elapsed_s).rem_euclid(TAU);
    let arg_perigee =
        (elements.arg_perigee_deg.to_radians() + arg_perigee_rate * elapsed_s).rem_euclid(TAU);

    Ok(PropagatedElements {
        elements,
        time: t,
        elapsed_s,
        mean_motion,
        mean_anomaly,
        eccentric_anomaly,
        true_anomaly,
        semi_major_axis,
        raan,
        arg_perigee,
        inclination,
    })
}
