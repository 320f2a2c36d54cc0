//! Frame transform chain.
//!
//! Perifocal → ECI → ECEF → geodetic, plus the topocentric (ENU) look angles of
//! a target seen from a point on the WGS84 ellipsoid.

use crate::kepler::PropagatedElements;

pub type Vec3 = [f64; 3];

/// WGS84 semi-major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 first eccentricity squared
pub const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);
/// WGS84 semi-minor axis (m)
pub const WGS84_B: f64 = WGS84_A * (1.0 - WGS84_F);
/// Earth rotation rate (rad/s)
pub const EARTH_ROTATION_RATE: f64 = 7.292_115_146_7e-5;

const GEODETIC_ITERATIONS: usize = 5;

/// Position (m) and velocity (m/s) in one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateVector {
    pub position: Vec3,
    pub velocity: Vec3,
}

/// A point on or above the WGS84 ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geodetic {
    /// Degrees, [-90, 90]
    pub latitude_deg: f64,
    /// Degrees, [-180, 180)
    pub longitude_deg: f64,
    /// Meters above the ellipsoid
    pub altitude_m: f64,
}

/// Azimuth, elevation and range of a target from an observer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAngles {
    /// Degrees clockwise from true north, [0, 360)
    pub azimuth_deg: f64,
    /// Degrees above the local horizontal plane, negative below it
    pub elevation_deg: f64,
    /// Meters
    pub range_m: f64,
}

pub fn norm(v: Vec3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Rotates a perifocal vector into ECI with the 3-1-3 sequence
/// `R3(-Ω)·R1(-i)·R3(-ω)`.
pub fn perifocal_to_eci_vector(v: Vec3, raan: f64, inclination: f64, arg_perigee: f64) -> Vec3 {
    let (sin_o, cos_o) = raan.sin_cos();
    let (sin_i, cos_i) = inclination.sin_cos();
    let (sin_w, cos_w) = arg_perigee.sin_cos();

    let r11 = cos_o * cos_w - sin_o * sin_w * cos_i;
    let r12 = -cos_o * sin_w - sin_o * cos_w * cos_i;
    let r21 = sin_o * cos_w + cos_o * sin_w * cos_i;
    let r22 = -sin_o * sin_w + cos_o * cos_w * cos_i;
    let r31 = sin_w * sin_i;
    let r32 = cos_w * sin_i;

    // Perifocal vectors are in-plane but the z term is kept for generality
    let r13 = sin_o * sin_i;
    let r23 = -cos_o * sin_i;
    let r33 = cos_i;

    [
        r11 * v[0] + r12 * v[1] + r13 * v[2],
        r21 * v[0] + r22 * v[1] + r23 * v[2],
        r31 * v[0] + r32 * v[1] + r33 * v[2],
    ]
}

/// ECI state of a propagated element set.
pub fn perifocal_to_eci(state: &PropagatedElements<'_>) -> StateVector {
    let (r, v) = state.perifocal_state();
    StateVector {
        position: perifocal_to_eci_vector(r, state.raan, state.inclination, state.arg_perigee),
        velocity: perifocal_to_eci_vector(v, state.raan, state.inclination, state.arg_perigee),
    }
}

/// Rotates an inertial state into the Earth-fixed frame about the pole by
/// `-gmst`. The velocity picks up the `-ω × r` term of the rotating frame.
pub fn eci_to_ecef(state: &StateVector, gmst: f64) -> StateVector {
    let (s, c) = gmst.sin_cos();
    let rotate = |v: Vec3| [c * v[0] + s * v[1], -s * v[0] + c * v[1], v[2]];

    let position = rotate(state.position);
    let rotated_velocity = rotate(state.velocity);
    let velocity = [
        rotated_velocity[0] + EARTH_ROTATION_RATE * position[1],
        rotated_velocity[1] - EARTH_ROTATION_RATE * position[0],
        rotated_velocity[2],
    ];

    StateVector { position, velocity }
}

/// Geodetic coordinates of an ECEF position (Bowring's method).
pub fn ecef_to_geodetic(position: Vec3) -> Geodetic {
    let [x, y, z] = position;
    let p = x.hypot(y);
    let ep2 = WGS84_E2 / (1.0 - WGS84_E2);

    let mut reduced = ((1.0 - WGS84_F) * z).atan2(p);
    let mut latitude = 0.0;
    for _ in 0..GEODETIC_ITERATIONS {
        let (sin_b, cos_b) = reduced.sin_cos();
        latitude = (z + ep2 * WGS84_B * sin_b.powi(3)).atan2(p - WGS84_E2 * WGS84_A * cos_b.powi(3));
        reduced = ((1.0 - WGS84_F) * latitude.sin()).atan2(latitude.cos());
    }

    let (sin_lat, cos_lat) = latitude.sin_cos();
    let altitude_m =
        p * cos_lat + z * sin_lat - WGS84_A * (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    let mut longitude_deg = y.atan2(x).to_degrees();
    if longitude_deg >= 180.0 {
        longitude_deg -= 360.0;
    }

    Geodetic {
        latitude_deg: latitude.to_degrees(),
        longitude_deg,
        altitude_m,
    }
}

/// ECEF position of a geodetic point.
pub fn geodetic_to_ecef(point: &Geodetic) -> Vec3 {
    let (sin_lat, cos_lat) = point.latitude_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = point.longitude_deg.to_radians().sin_cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    [
        (n + point.altitude_m) * cos_lat * cos_lon,
        (n + point.altitude_m) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + point.altitude_m) * sin_lat,
    ]
}

/// Look angles of `target` (ECEF) from `observer`, whose ECEF position is
/// `observer_ecef`.
pub fn look_angles(observer: &Geodetic, observer_ecef: Vec3, target: Vec3) -> LookAngles {
    let (sin_lat, cos_lat) = observer.latitude_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = observer.longitude_deg.to_radians().sin_cos();
    let [dx, dy, dz] = sub(target, observer_ecef);

    let east = -sin_lon * dx + cos_lon * dy;
    let north = -sin_lat * cos_lon * dx - sin_lat * sin_lon * dy + cos_lat * dz;
    let up = cos_lat * cos_lon * dx + cos_lat * sin_lon * dy + sin_lat * dz;
    let range_m = (east * east + north * north + up * up).sqrt();

    let mut azimuth_deg = east.atan2(north).to_degrees().rem_euclid(360.0);
    // rem_euclid can round a tiny negative angle up to exactly 360
    if azimuth_deg >= 360.0 {
        azimuth_deg = 0.0;
    }
    let elevation_deg = if range_m > 0.0 {
        (up / range_m).clamp(-1.0, 1.0).asin().to_degrees()
    } else {
        90.0
    };

    LookAngles {
        azimuth_deg,
        elevation_deg,
        range_m,
    }
}
