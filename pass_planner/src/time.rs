//! Time utilities.
//!
//! Julian Date and Greenwich Mean Sidereal Time from calendar UTC, and evenly
//! spaced sample vectors for propagation.

use crate::{PassPlannerError, PassPlannerResult};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::f64::consts::TAU;

/// Julian Date of the J2000.0 epoch (2000-01-01 12:00 TT).
pub const J2000_JD: f64 = 2_451_545.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

const JULIAN_DATE_YEARS: std::ops::RangeInclusive<i32> = 1900..=2100;

/// Converts a UTC calendar date and time to a Julian Date.
///
/// The formula drops the Gregorian century correction, so it is only exact
/// for the years 1900 through 2100, which covers every two-line element epoch.
///
/// # Errors
/// Returns `PassPlannerError::InvalidCalendarDate` if the year is outside
/// 1900..=2100 or the month, day, hour, minute or second is out of range.
pub fn julian_date(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: f64,
) -> PassPlannerResult<f64> {
    if !JULIAN_DATE_YEARS.contains(&year) {
        return Err(PassPlannerError::InvalidCalendarDate(format!(
            "year {year} outside {}..={}",
            JULIAN_DATE_YEARS.start(),
            JULIAN_DATE_YEARS.end()
        )));
    }
    if NaiveDate::from_ymd_opt(year, month, day).is_none() {
        return Err(PassPlannerError::InvalidCalendarDate(format!(
            "{year:04}-{month:02}-{day:02} is not a calendar date"
        )));
    }
    if hour > 23 || minute > 59 || !(0.0..61.0).contains(&second) {
        return Err(PassPlannerError::InvalidCalendarDate(format!(
            "{hour:02}:{minute:02}:{second} is not a time of day"
        )));
    }

    let (y, m) = (year as f64, month as f64);
    let jd = 367.0 * y - (7.0 * (y + ((m + 9.0) / 12.0).floor()) * 0.25).floor()
        + (275.0 * m / 9.0).floor()
        + day as f64
        + 1_721_013.5;
    let day_fraction = (second + minute as f64 * 60.0 + hour as f64 * 3600.0) / SECONDS_PER_DAY;

    Ok(jd + day_fraction)
}

/// Julian Date of a UTC instant.
pub fn julian_date_from_datetime(timestamp: DateTime<Utc>) -> f64 {
    let unix = timestamp.timestamp() as f64;
    let sub = timestamp.timestamp_subsec_nanos() as f64 * 1e-9;
    2_440_587.5 + (unix + sub) / SECONDS_PER_DAY
}

/// Greenwich Mean Sidereal Time (IAU-82) in radians, normalized to [0, 2π).
pub fn gmst(jd: f64) -> f64 {
    let t = (jd - J2000_JD) / 36_525.0;
    let seconds = 67_310.548_41 + (876_600.0 * 3600.0 + 8_640_184.812_866) * t
        + 0.093_104 * t * t
        - 6.2e-6 * t * t * t;
    let angle = seconds.rem_euclid(SECONDS_PER_DAY) * (TAU / SECONDS_PER_DAY);
    let angle = angle.rem_euclid(TAU);
    if angle >= TAU {
        0.0
    } else {
        angle
    }
}

/// Evenly spaced sample instants between two times, both endpoints included.
///
/// The vector is a description, not a buffer: every call to [`TimeVector::iter`]
/// restarts the sequence from the first sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeVector {
    start: DateTime<Utc>,
    span_us: i64,
    step_count: usize,
}

impl TimeVector {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::microseconds(self.span_us)
    }

    pub fn len(&self) -> usize {
        self.step_count
    }

    pub fn is_empty(&self) -> bool {
        self.step_count == 0
    }

    /// Spacing between consecutive samples.
    pub fn step(&self) -> Duration {
        if self.step_count < 2 {
            return Duration::zero();
        }
        Duration::microseconds(self.span_us / (self.step_count as i64 - 1))
    }

    /// Instant of the `index`-th sample.
    pub fn at(&self, index: usize) -> Option<DateTime<Utc>> {
        if index >= self.step_count {
            return None;
        }
        if self.step_count == 1 {
            return Some(self.start);
        }
        // Scale in i128 so long spans with many samples cannot overflow
        let offset = self.span_us as i128 * index as i128 / (self.step_count as i128 - 1);
        Some(self.start + Duration::microseconds(offset as i64))
    }

    pub fn iter(&self) -> TimeVectorIter {
        TimeVectorIter {
            vector: *self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a TimeVector {
    type Item = DateTime<Utc>;
    type IntoIter = TimeVectorIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the samples of a [`TimeVector`].
#[derive(Debug, Clone)]
pub struct TimeVectorIter {
    vector: TimeVector,
    next: usize,
}

impl Iterator for TimeVectorIter {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.vector.at(self.next)?;
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vector.step_count.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TimeVectorIter {}

/// Generates `step_count` evenly spaced instants from `start` to `end`.
///
/// # Errors
/// Returns `PassPlannerError::InvalidRange` if `end <= start` or `step_count`
/// is zero.
pub fn generate_time_vector(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step_count: usize,
) -> PassPlannerResult<TimeVector> {
    if end <= start {
        return Err(PassPlannerError::InvalidRange(format!(
            "end {end} is not after start {start}"
        )));
    }
    if step_count == 0 {
        return Err(PassPlannerError::InvalidRange(
            "a time vector needs at least one sample".to_string(),
        ));
    }
    let span_us = (end - start).num_microseconds().ok_or_else(|| {
        PassPlannerError::InvalidRange(format!("span from {start} to {end} is too long"))
    })?;

    Ok(TimeVector {
        start,
        span_us,
        step_count,
    })
}
