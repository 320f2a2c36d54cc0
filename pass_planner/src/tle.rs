//! TLE (Two-Line Element) handling module.
//!
//! Parses element-set text into an [`ElementStore`] keyed by satellite name.
//! Records may carry a name line (three-line form) or be bare two-line pairs.
//! A malformed record never aborts the parse: it is skipped and described by a
//! [`ParseWarning`], and every well-formed record is still returned.

use crate::{PassPlannerError, PassPlannerResult};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::BTreeMap;
use std::path::Path;

/// Length of an element line without its checksum column.
const LINE_BODY_LEN: usize = 68;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Orbital elements of one satellite at its reference epoch.
///
/// Angles are in degrees and mean motion in revolutions per day, as written in
/// the element set.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitalElementSet {
    pub name: String,
    pub catalog_number: u32,
    /// Full four-digit epoch year
    pub epoch_year: i32,
    /// Fractional day of the year, 1.0 being January 1st at 00:00 UTC
    pub epoch_day: f64,
    pub epoch: DateTime<Utc>,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub eccentricity: f64,
    pub arg_perigee_deg: f64,
    pub mean_anomaly_deg: f64,
    pub mean_motion_rev_per_day: f64,
    /// First derivative of mean motion divided by two (rev/day²)
    pub mean_motion_dot: f64,
    /// B* drag term (1/earth radii)
    pub bstar: f64,
    pub line1: String,
    pub line2: String,
}

/// A record that was skipped while parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseWarning {
    /// 1-based line number where the record starts
    pub line: usize,
    /// Satellite name, when the record had one
    pub name: Option<String>,
    pub reason: String,
}

impl std::fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "line {} ({}): {}", self.line, name, self.reason),
            None => write!(f, "line {}: {}", self.line, self.reason),
        }
    }
}

/// Parsed element sets keyed by satellite name.
#[derive(Debug, Clone, Default)]
pub struct ElementStore {
    sets: BTreeMap<String, OrbitalElementSet>,
    warnings: Vec<ParseWarning>,
}

impl ElementStore {
    /// Parses element-set text. Never fails; see [`ElementStore::warnings`].
    pub fn parse(text: &str) -> Self {
        let mut store = ElementStore::default();
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end()))
            .filter(|(_, l)| !l.trim().is_empty())
            .collect();

        let mut pending_name: Option<(usize, String)> = None;
        let mut i = 0;
        while i < lines.len() {
            let (line_no, line) = lines[i];

            if line.starts_with("1 ") {
                let (start_line, name) = match pending_name.take() {
                    Some((n, name)) => (n, Some(name)),
                    None => (line_no, None),
                };
                match lines.get(i + 1) {
                    Some((_, line2)) if line2.starts_with("2 ") => {
                        match parse_record(name.as_deref(), line, line2) {
                            Ok(set) => store.insert(set),
                            Err(reason) => store.warn(start_line, name, reason),
                        }
                        i += 2;
                    }
                    _ => {
                        store.warn(start_line, name, "line 1 is not followed by line 2".to_string());
                        i += 1;
                    }
                }
                continue;
            }

            if line.starts_with("2 ") {
                let name = pending_name.take().map(|(_, name)| name);
                store.warn(line_no, name, "line 2 without a preceding line 1".to_string());
            } else if let Some((n, name)) = pending_name.replace((line_no, line.trim().to_string())) {
                store.warn(n, Some(name), "name line without element lines".to_string());
            }
            i += 1;
        }

        if let Some((n, name)) = pending_name {
            store.warn(n, Some(name), "name line without element lines".to_string());
        }

        log::debug!(
            "parsed {} element sets with {} warnings",
            store.sets.len(),
            store.warnings.len()
        );
        store
    }

    /// Reads and parses a local element-set file.
    pub fn from_file(path: impl AsRef<Path>) -> PassPlannerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PassPlannerError::IoError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&text))
    }

    pub(crate) fn insert(&mut self, set: OrbitalElementSet) {
        if self.sets.contains_key(&set.name) {
            log::debug!("{}: replacing earlier element set", set.name);
        }
        self.sets.insert(set.name.clone(), set);
    }

    fn warn(&mut self, line: usize, name: Option<String>, reason: String) {
        let warning = ParseWarning { line, name, reason };
        log::warn!("skipping element set at {warning}");
        self.warnings.push(warning);
    }

    /// Looks a satellite up by name, ignoring case and repeated whitespace.
    pub fn get(&self, name: &str) -> Option<&OrbitalElementSet> {
        if let Some(set) = self.sets.get(name) {
            return Some(set);
        }
        let wanted = normalize_name(name);
        self.sets
            .values()
            .find(|set| normalize_name(&set.name) == wanted)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OrbitalElementSet> {
        self.sets.values()
    }

    pub fn warnings(&self) -> &[ParseWarning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Standard modulo-10 checksum: digits count their value, minus signs count one.
pub fn checksum(line: &str) -> u32 {
    line.chars()
        .take(LINE_BODY_LEN)
        .map(|c| match c {
            '0'..='9' => c as u32 - '0' as u32,
            '-' => 1,
            _ => 0,
        })
        .sum::<u32>()
        % 10
}

impl OrbitalElementSet {
    /// Elements in the form the SGP4 propagator consumes.
    ///
    /// The stored lines were normalized and accepted by the same parser when
    /// the set was loaded, so this only fails on sets edited after parsing.
    pub fn sgp4_elements(&self) -> Result<sgp4::Elements, sgp4::Error> {
        sgp4::Elements::from_tle(
            Some(self.name.clone()),
            self.line1.as_bytes(),
            self.line2.as_bytes(),
        )
    }
}

/// Returns the line with its checksum column, computing it when absent.
fn normalize_line(line: &str, number: char) -> Result<String, String> {
    if !line.is_ascii() {
        return Err(format!("line {number} contains non-ASCII characters"));
    }
    match line.len() {
        LINE_BODY_LEN => Ok(format!("{line}{}", checksum(line))),
        len if len == LINE_BODY_LEN + 1 => Ok(line.to_string()),
        len => Err(format!(
            "line {number} has {len} columns, expected {LINE_BODY_LEN} or {}",
            LINE_BODY_LEN + 1
        )),
    }
}

fn parse_record(name: Option<&str>, line1: &str, line2: &str) -> Result<OrbitalElementSet, String> {
    let line1 = normalize_line(line1, '1')?;
    let line2 = normalize_line(line2, '2')?;

    let elements = sgp4::Elements::from_tle(
        name.map(str::to_string),
        line1.as_bytes(),
        line2.as_bytes(),
    )
    .map_err(|e| e.to_string())?;

    if !(0.0..1.0).contains(&elements.eccentricity) {
        return Err(format!("eccentricity {} outside [0, 1)", elements.eccentricity));
    }
    if elements.mean_motion <= 0.0 || !elements.mean_motion.is_finite() {
        return Err(format!("mean motion {} is not positive", elements.mean_motion));
    }
    let catalog_number = u32::try_from(elements.norad_id)
        .map_err(|_| format!("catalog number {} is out of range", elements.norad_id))?;

    let epoch = elements.datetime.and_utc();
    let seconds_of_day = epoch.num_seconds_from_midnight() as f64
        + epoch.timestamp_subsec_nanos() as f64 * 1e-9;
    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| catalog_number.to_string());

    Ok(OrbitalElementSet {
        name,
        catalog_number,
        epoch_year: epoch.year(),
        epoch_day: epoch.ordinal() as f64 + seconds_of_day / SECONDS_PER_DAY,
        epoch,
        inclination_deg: elements.inclination,
        raan_deg: elements.right_ascension,
        eccentricity: elements.eccentricity,
        arg_perigee_deg: elements.argument_of_perigee,
        mean_anomaly_deg: elements.mean_anomaly,
        mean_motion_rev_per_day: elements.mean_motion,
        mean_motion_dot: elements.mean_motion_dot,
        bstar: elements.drag_term,
        line1,
        line2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::ISS_TLE;

    const ISS_LINE1: &str =
        "1 25544U 98067A   08264.51782528 -.00002182  00000-0 -11606-4 0  2927";
    const ISS_LINE2: &str =
        "2 25544  51.6416 247.4627 0006703 130.5360 325.0288 15.72125391563537";

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(ISS_LINE1), 7);
        assert_eq!(checksum(ISS_LINE2), 7);
    }

    #[test]
    fn test_parse_three_line_record() {
        let store = ElementStore::parse(ISS_TLE);
        assert!(store.warnings().is_empty());
        assert_eq!(store.len(), 1);

        let iss = store.get("ISS (ZARYA)").unwrap();
        assert_eq!(iss.catalog_number, 25544);
        assert_eq!(iss.epoch_year, 2008);
        assert!((iss.epoch_day - 264.51782528).abs() < 1e-9);
        assert!((iss.inclination_deg - 51.6416).abs() < 1e-9);
        assert!((iss.raan_deg - 247.4627).abs() < 1e-9);
        assert!((iss.eccentricity - 0.0006703).abs() < 1e-12);
        assert!((iss.arg_perigee_deg - 130.5360).abs() < 1e-9);
        assert!((iss.mean_anomaly_deg - 325.0288).abs() < 1e-9);
        assert!((iss.mean_motion_rev_per_day - 15.72125391).abs() < 1e-9);
        assert!((iss.mean_motion_dot + 0.00002182).abs() < 1e-12);
        assert!((iss.bstar + 0.11606e-4).abs() < 1e-12);
    }

    #[test]
    fn test_parse_two_line_record_uses_catalog_number() {
        let text = format!("{ISS_LINE1}\n{ISS_LINE2}\n");
        let store = ElementStore::parse(&text);
        assert_eq!(store.len(), 1);
        assert!(store.get("25544").is_some());
    }

    #[test]
    fn test_corrupted_checksum_is_skipped_with_warning() {
        // Same record twice, the second with its line 2 checksum digit altered
        let corrupted = format!("{}8", &ISS_LINE2[..68]);
        let text = format!("ISS (ZARYA)\n{ISS_LINE1}\n{ISS_LINE2}\nBROKEN SAT\n{ISS_LINE1}\n{corrupted}\n");
        let store = ElementStore::parse(&text);

        assert_eq!(store.len(), 1);
        assert!(store.get("ISS (ZARYA)").is_some());
        assert!(store.get("BROKEN SAT").is_none());
        assert_eq!(store.warnings().len(), 1);
        let warning = &store.warnings()[0];
        assert_eq!(warning.line, 4);
        assert_eq!(warning.name.as_deref(), Some("BROKEN SAT"));
        assert!(warning.reason.contains("checksum"));
    }

    #[test]
    fn test_missing_checksum_column_is_accepted() {
        let text = format!("ISS (ZARYA)\n{}\n{}\n", &ISS_LINE1[..68], &ISS_LINE2[..68]);
        let store = ElementStore::parse(&text);
        assert_eq!(store.len(), 1);
        assert!(store.warnings().is_empty());
    }

    #[test]
    fn test_truncated_line_is_a_field_count_warning() {
        let text = format!("SHORT\n{}\n{ISS_LINE2}\n", &ISS_LINE1[..40]);
        let store = ElementStore::parse(&text);
        assert!(store.is_empty());
        assert_eq!(store.warnings().len(), 1);
        assert!(store.warnings()[0].reason.contains("columns"));
    }

    #[test]
    fn test_duplicate_names_keep_latest() {
        let later_line1 = "1 25544U 98067A   08265.51782528 -.00002182  00000-0 -11606-4 0  2927";
        let later_line1 = format!("{}{}", &later_line1[..68], checksum(later_line1));
        let text = format!("ISS (ZARYA)\n{ISS_LINE1}\n{ISS_LINE2}\nISS (ZARYA)\n{later_line1}\n{ISS_LINE2}\n");
        let store = ElementStore::parse(&text);
        assert_eq!(store.len(), 1);
        assert!((store.get("ISS (ZARYA)").unwrap().epoch_day - 265.51782528).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_ignores_case_and_spacing() {
        let store = ElementStore::parse(ISS_TLE);
        assert!(store.get("iss  (zarya)").is_some());
        assert!(store.get("ISS").is_none());
    }

    #[test]
    fn test_orphan_lines_are_reported() {
        let text = format!("LONELY NAME\nOTHER\n{ISS_LINE1}\n{ISS_LINE2}\n{ISS_LINE2}\n");
        let store = ElementStore::parse(&text);
        assert_eq!(store.len(), 1);
        assert!(store.get("OTHER").is_some());
        assert_eq!(store.warnings().len(), 2);
        assert_eq!(store.warnings()[0].name.as_deref(), Some("LONELY NAME"));
        assert!(store.warnings()[1].reason.contains("line 2 without"));
    }

    #[test]
    fn test_checksum_less_record_propagates_with_sgp4() {
        use crate::planning::{calculate_pointing, GroundStation, PropagationModel};

        let text = format!("ISS (ZARYA)\n{}\n{}\n", &ISS_LINE1[..68], &ISS_LINE2[..68]);
        let store = ElementStore::parse(&text);
        let iss = store.get("ISS (ZARYA)").unwrap();
        assert_eq!(iss.line1, ISS_LINE1);
        assert_eq!(iss.line2, ISS_LINE2);
        assert!(iss.sgp4_elements().is_ok());

        let station = GroundStation::new(40.0, -105.0, 1600.0).unwrap();
        let t = iss.epoch + chrono::Duration::minutes(30);
        let keplerian = calculate_pointing(iss, &station, t, PropagationModel::Keplerian);
        let sgp4 = calculate_pointing(iss, &station, t, PropagationModel::Sgp4);
        assert!(keplerian.is_ok());
        assert!(sgp4.is_ok());
    }

    #[test]
    fn test_bad_spacing_is_rejected_by_element_parser() {
        let shifted = format!("1  25544U{}", &ISS_LINE1[9..]);
        let text = format!("SHIFTED\n{shifted}\n{ISS_LINE2}\n");
        let store = ElementStore::parse(&text);
        assert!(store.is_empty());
        assert_eq!(store.warnings().len(), 1);
        assert_eq!(store.warnings()[0].name.as_deref(), Some("SHIFTED"));
    }
}
