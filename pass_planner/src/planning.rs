//! Pointing computation.
//!
//! Carries an element set through propagation and the frame chain to the
//! azimuth, elevation and range seen from a ground station, and searches for
//! rise, set and culmination instants.

use crate::frames::{self, Geodetic, LookAngles, StateVector, Vec3};
use crate::kepler;
use crate::time::{gmst, julian_date_from_datetime};
use crate::tle::OrbitalElementSet;
use crate::{PassPlannerError, PassPlannerResult};
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

/// Observer location on Earth.
///
/// The ECEF position is computed once at construction and reused for every
/// look-angle calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundStation {
    location: Geodetic,
    ecef: Vec3,
}

impl GroundStation {
    /// Creates a ground station.
    ///
    /// # Arguments
    /// * `latitude_deg` - Latitude in degrees (-90 to 90)
    /// * `longitude_deg` - Longitude in degrees (-180 to 180)
    /// * `altitude_m` - Altitude in meters above the WGS84 ellipsoid
    ///
    /// # Errors
    /// Returns `PassPlannerError::InvalidInput` if a coordinate is out of range
    /// or not finite.
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> PassPlannerResult<Self> {
        if !(-90.0..=90.0).contains(&latitude_deg) {
            return Err(PassPlannerError::InvalidInput(format!(
                "latitude {latitude_deg} outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude_deg) {
            return Err(PassPlannerError::InvalidInput(format!(
                "longitude {longitude_deg} outside [-180, 180]"
            )));
        }
        if !altitude_m.is_finite() {
            return Err(PassPlannerError::InvalidInput(format!(
                "altitude {altitude_m} is not finite"
            )));
        }

        let location = Geodetic {
            latitude_deg,
            longitude_deg,
            altitude_m,
        };
        Ok(Self {
            location,
            ecef: frames::geodetic_to_ecef(&location),
        })
    }

    pub fn location(&self) -> Geodetic {
        self.location
    }

    pub fn latitude_deg(&self) -> f64 {
        self.location.latitude_deg
    }

    pub fn longitude_deg(&self) -> f64 {
        self.location.longitude_deg
    }

    pub fn altitude_m(&self) -> f64 {
        self.location.altitude_m
    }

    pub fn ecef(&self) -> Vec3 {
        self.ecef
    }

    /// Look angles of an ECEF position from this station.
    pub fn look_at(&self, target_ecef: Vec3) -> LookAngles {
        frames::look_angles(&self.location, self.ecef, target_ecef)
    }
}

/// Where to point the antenna at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointingTarget {
    pub timestamp: DateTime<Utc>,
    /// Degrees clockwise from north, [0, 360)
    pub azimuth_deg: f64,
    /// Degrees, negative below the horizon
    pub elevation_deg: f64,
    pub range_m: f64,
}

impl PointingTarget {
    pub fn is_above_horizon(&self) -> bool {
        self.elevation_deg >= 0.0
    }

    pub fn is_above(&self, mask_deg: f64) -> bool {
        self.elevation_deg >= mask_deg
    }
}

/// Orbit propagator used for a pointing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropagationModel {
    /// Two-body propagation with J2 secular drift and the ṅ/2 drag term
    #[default]
    Keplerian,
    /// SGP4, for comparison against the Keplerian model
    Sgp4,
}

impl fmt::Display for PropagationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropagationModel::Keplerian => write!(f, "keplerian"),
            PropagationModel::Sgp4 => write!(f, "sgp4"),
        }
    }
}

impl FromStr for PropagationModel {
    type Err = PassPlannerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keplerian" | "kepler" => Ok(PropagationModel::Keplerian),
            "sgp4" => Ok(PropagationModel::Sgp4),
            other => Err(PassPlannerError::InvalidInput(format!(
                "unknown propagation model '{other}'"
            ))),
        }
    }
}

/// Earth-fixed state of a satellite at time `t`.
///
/// # Errors
/// Returns `PassPlannerError::KeplerNonConvergence` or
/// `PassPlannerError::CalculationError` from the Keplerian model, and
/// `PassPlannerError::TLEError` / `PassPlannerError::CalculationError` from SGP4.
pub fn state_vector_ecef(
    elements: &OrbitalElementSet,
    t: DateTime<Utc>,
    model: PropagationModel,
) -> PassPlannerResult<StateVector> {
    let eci = match model {
        PropagationModel::Keplerian => {
            let propagated = kepler::propagate(elements, t)?;
            frames::perifocal_to_eci(&propagated)
        }
        PropagationModel::Sgp4 => sgp4_state(elements, t)?,
    };
    Ok(frames::eci_to_ecef(&eci, gmst(julian_date_from_datetime(t))))
}

/// SGP4 state in the TEME frame, treated as ECI, in meters.
fn sgp4_state(elements: &OrbitalElementSet, t: DateTime<Utc>) -> PassPlannerResult<StateVector> {
    let sgp4_elements = elements
        .sgp4_elements()
        .map_err(|e| PassPlannerError::TLEError(format!("Failed to parse TLE: {e}")))?;

    let constants = sgp4::Constants::from_elements(&sgp4_elements).map_err(|e| {
        PassPlannerError::CalculationError(format!("Failed to create constants: {e}"))
    })?;

    let since_epoch = t.signed_duration_since(sgp4_elements.datetime.and_utc());
    let minutes_since_epoch = since_epoch
        .num_microseconds()
        .map(|us| us as f64 / 60e6)
        .unwrap_or_else(|| since_epoch.num_seconds() as f64 / 60.0);

    let prediction = constants
        .propagate(minutes_since_epoch)
        .map_err(|e| PassPlannerError::CalculationError(format!("Propagation failed: {e}")))?;

    let km = |v: [f64; 3]| [v[0] * 1000.0, v[1] * 1000.0, v[2] * 1000.0];
    Ok(StateVector {
        position: km(prediction.position),
        velocity: km(prediction.velocity),
    })
}

/// Sub-satellite point at time `t`.
pub fn subsatellite_point(
    elements: &OrbitalElementSet,
    t: DateTime<Utc>,
    model: PropagationModel,
) -> PassPlannerResult<Geodetic> {
    let state = state_vector_ecef(elements, t, model)?;
    Ok(frames::ecef_to_geodetic(state.position))
}

/// Calculates where a satellite appears from a ground station at a given time.
///
/// # Arguments
/// * `elements` - The satellite's element set
/// * `station` - Observer location
/// * `t` - UTC timestamp for the calculation
/// * `model` - Propagation model
///
/// # Returns
/// A `PointingTarget` with azimuth in [0, 360) and signed elevation. A satellite
/// below the horizon is a normal result, not an error.
///
/// # Errors
/// Returns the propagation error of the selected model.
pub fn calculate_pointing(
    elements: &OrbitalElementSet,
    station: &GroundStation,
    t: DateTime<Utc>,
    model: PropagationModel,
) -> PassPlannerResult<PointingTarget> {
    let state = state_vector_ecef(elements, t, model)?;
    let look = station.look_at(state.position);

    Ok(PointingTarget {
        timestamp: t,
        azimuth_deg: look.azimuth_deg,
        elevation_deg: look.elevation_deg,
        range_m: look.range_m,
    })
}

/// Everything needed to evaluate one satellite's elevation repeatedly.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PassGeometry<'a> {
    pub elements: &'a OrbitalElementSet,
    pub station: &'a GroundStation,
    pub model: PropagationModel,
    pub mask_deg: f64,
}

impl PassGeometry<'_> {
    pub fn elevation(&self, t: DateTime<Utc>) -> PassPlannerResult<f64> {
        Ok(calculate_pointing(self.elements, self.station, t, self.model)?.elevation_deg)
    }

    pub fn is_visible(&self, t: DateTime<Utc>) -> PassPlannerResult<bool> {
        Ok(self.elevation(t)? >= self.mask_deg)
    }
}

/// Finds the first visible instant between an invisible and a visible sample
/// by binary search.
pub(crate) fn find_rise_time(
    geometry: &PassGeometry<'_>,
    time_before: DateTime<Utc>,
    time_after: DateTime<Utc>,
    tolerance: Duration,
) -> PassPlannerResult<DateTime<Utc>> {
    let mut low = time_before;
    let mut high = time_after;

    while high - low > tolerance {
        let mid = low + (high - low) / 2;
        if geometry.is_visible(mid)? {
            high = mid;
        } else {
            low = mid;
        }
    }

    Ok(high)
}

/// Finds the last visible instant between a visible and an invisible sample
/// by binary search.
pub(crate) fn find_set_time(
    geometry: &PassGeometry<'_>,
    time_before: DateTime<Utc>,
    time_after: DateTime<Utc>,
    tolerance: Duration,
) -> PassPlannerResult<DateTime<Utc>> {
    let mut low = time_before;
    let mut high = time_after;

    while high - low > tolerance {
        let mid = low + (high - low) / 2;
        if geometry.is_visible(mid)? {
            low = mid;
        } else {
            high = mid;
        }
    }

    Ok(low)
}

/// Peak elevation inside `[start, end]` by golden section search around the
/// highest sampled instant.
pub(crate) fn find_max_elevation(
    geometry: &PassGeometry<'_>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
    tolerance: Duration,
) -> PassPlannerResult<(DateTime<Utc>, f64)> {
    let mut best_time = start;
    let mut best = geometry.elevation(start)?;
    let mut t = start;
    while t < end {
        t = (t + step).min(end);
        let elevation = geometry.elevation(t)?;
        if elevation > best {
            best = elevation;
            best_time = t;
        }
    }

    let inv_phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut a = (best_time - step).max(start);
    let mut b = (best_time + step).min(end);
    let at = |base: DateTime<Utc>, span: Duration, fraction: f64| {
        base + Duration::microseconds((span.num_microseconds().unwrap_or(0) as f64 * fraction) as i64)
    };

    let mut c = at(a, b - a, 1.0 - inv_phi);
    let mut d = at(a, b - a, inv_phi);
    let mut el_c = geometry.elevation(c)?;
    let mut el_d = geometry.elevation(d)?;
    while b - a > tolerance {
        if el_c > el_d {
            b = d;
            d = c;
            el_d = el_c;
            c = at(a, b - a, 1.0 - inv_phi);
            el_c = geometry.elevation(c)?;
        } else {
            a = c;
            c = d;
            el_c = el_d;
            d = at(a, b - a, inv_phi);
            el_d = geometry.elevation(d)?;
        }
    }

    let (peak_time, peak) = if el_c > el_d { (c, el_c) } else { (d, el_d) };
    if peak > best {
        Ok((peak_time, peak))
    } else {
        Ok((best_time, best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ISS_TLE;
    use crate::tle::ElementStore;
    use chrono::TimeZone;

    fn iss() -> OrbitalElementSet {
        ElementStore::parse(ISS_TLE)
            .get("ISS (ZARYA)")
            .cloned()
            .expect("ISS parsed")
    }

    #[test]
    fn test_ground_station_validation() {
        assert!(GroundStation::new(91.0, 0.0, 0.0).is_err());
        assert!(GroundStation::new(0.0, -181.0, 0.0).is_err());
        assert!(GroundStation::new(0.0, 0.0, f64::NAN).is_err());
        let station = GroundStation::new(45.0, 7.0, 300.0).unwrap();
        assert_eq!(station.latitude_deg(), 45.0);
        assert_eq!(station.ecef(), frames::geodetic_to_ecef(&station.location()));
    }

    #[test]
    fn test_satellite_altitude_is_leo() {
        let iss = iss();
        let point = subsatellite_point(&iss, iss.epoch, PropagationModel::Keplerian).unwrap();
        assert!(point.latitude_deg.abs() <= 52.0);
        assert!((300_000.0..420_000.0).contains(&point.altitude_m), "{}", point.altitude_m);
    }

    #[test]
    fn test_keplerian_tracks_sgp4_near_epoch() {
        let iss = iss();
        let station = GroundStation::new(38.8892, -77.1664, 0.0).unwrap();
        let kepler = state_vector_ecef(&iss, iss.epoch, PropagationModel::Keplerian).unwrap();
        let sgp4 = state_vector_ecef(&iss, iss.epoch, PropagationModel::Sgp4).unwrap();

        let diff = frames::norm([
            kepler.position[0] - sgp4.position[0],
            kepler.position[1] - sgp4.position[1],
            kepler.position[2] - sgp4.position[2],
        ]);
        // Osculating versus mean elements differ by some tens of kilometers
        assert!(diff < 100_000.0, "models differ by {diff} m");

        let a = calculate_pointing(&iss, &station, iss.epoch, PropagationModel::Keplerian).unwrap();
        let b = calculate_pointing(&iss, &station, iss.epoch, PropagationModel::Sgp4).unwrap();
        assert!((a.range_m - b.range_m).abs() < 100_000.0);
    }

    #[test]
    fn test_ecef_velocity_is_orbital_speed() {
        let iss = iss();
        let state = state_vector_ecef(&iss, iss.epoch, PropagationModel::Keplerian).unwrap();
        let speed = frames::norm(state.velocity);
        // Inertial ~7.7 km/s less up to ~0.5 km/s of Earth rotation
        assert!((7_000.0..8_000.0).contains(&speed), "{speed}");
    }

    #[test]
    fn test_rise_and_set_searches_bracket_the_horizon() {
        let iss = iss();
        let station = GroundStation::new(38.8892, -77.1664, 0.0).unwrap();
        let geometry = PassGeometry {
            elements: &iss,
            station: &station,
            model: PropagationModel::Keplerian,
            mask_deg: 0.0,
        };

        // Scan a day for the first invisible -> visible transition
        let start = Utc.with_ymd_and_hms(2008, 9, 20, 12, 0, 0).unwrap();
        let step = Duration::seconds(30);
        let mut t = start;
        let mut was_visible = geometry.is_visible(t).unwrap();
        let mut rise_bracket = None;
        while t < start + Duration::days(1) {
            let next = t + step;
            let visible = geometry.is_visible(next).unwrap();
            if visible && !was_visible {
                rise_bracket = Some((t, next));
                break;
            }
            was_visible = visible;
            t = next;
        }
        let (before, after) = rise_bracket.expect("ISS rises within a day");

        let rise = find_rise_time(&geometry, before, after, Duration::seconds(1)).unwrap();
        assert!(rise > before && rise <= after);
        assert!(geometry.elevation(rise).unwrap() >= 0.0);
        assert!(geometry.elevation(rise - Duration::seconds(1)).unwrap() < 0.5);

        let set = find_set_time(&geometry, rise, rise + Duration::minutes(20), Duration::seconds(1));
        let set = set.unwrap();
        assert!(set > rise);
        assert!(geometry.elevation(set).unwrap() >= 0.0);

        let (peak_time, peak) =
            find_max_elevation(&geometry, rise, set, step, Duration::seconds(1)).unwrap();
        assert!(peak_time >= rise && peak_time <= set);
        assert!(peak > 0.0 && peak <= 90.0);
    }

    #[test]
    fn test_propagation_model_parsing() {
        assert_eq!("SGP4".parse::<PropagationModel>().unwrap(), PropagationModel::Sgp4);
        assert_eq!(
            "keplerian".parse::<PropagationModel>().unwrap(),
            PropagationModel::Keplerian
        );
        assert!("numerical".parse::<PropagationModel>().is_err());
        assert_eq!(PropagationModel::default(), PropagationModel::Keplerian);
    }
}
