//! Visibility cache.
//!
//! Samples every satellite's elevation over a prefetch window, merges runs of
//! visible samples into [`VisibilityWindow`]s and refines each edge by
//! bisection. A cache is immutable once built; [`SharedVisibilityCache`]
//! replaces it wholesale when a rebuild completes.

use crate::planning::{find_max_elevation, find_rise_time, find_set_time, PassGeometry};
use crate::time::generate_time_vector;
use crate::tle::{ElementStore, OrbitalElementSet};
use crate::{GroundStation, PassPlannerError, PassPlannerResult, PropagationModel};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// One pass of one satellite above the elevation mask.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityWindow {
    pub satellite: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub culmination: DateTime<Utc>,
    pub max_elevation_deg: f64,
}

impl VisibilityWindow {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilitySettings {
    /// How far ahead of the build start windows are computed
    pub prefetch: Duration,
    /// Sampling cadence
    pub cadence: Duration,
    /// Minimum elevation counted as visible (degrees)
    pub min_elevation_deg: f64,
    /// Edge refinement tolerance
    pub refine_tolerance: Duration,
    pub model: PropagationModel,
}

impl Default for VisibilitySettings {
    fn default() -> Self {
        Self {
            prefetch: Duration::hours(24),
            cadence: Duration::seconds(30),
            min_elevation_deg: 0.0,
            refine_tolerance: Duration::seconds(1),
            model: PropagationModel::Keplerian,
        }
    }
}

/// Visibility windows of every satellite in an element store over one
/// prefetch window.
#[derive(Debug, Clone)]
pub struct VisibilityCache {
    station: GroundStation,
    settings: VisibilitySettings,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    windows: BTreeMap<String, Vec<VisibilityWindow>>,
    /// Satellites whose propagation failed, with the reason
    not_computed: BTreeMap<String, String>,
}

impl VisibilityCache {
    /// Computes the visibility windows of every satellite in `store` from
    /// `start` to `start + settings.prefetch`.
    ///
    /// A satellite whose propagation fails is logged and left out; queries
    /// about it return `NoDataForRange`.
    ///
    /// # Errors
    /// Returns `PassPlannerError::InvalidRange` if the prefetch or cadence is
    /// not positive.
    pub fn build(
        store: &ElementStore,
        station: &GroundStation,
        start: DateTime<Utc>,
        settings: VisibilitySettings,
    ) -> PassPlannerResult<Self> {
        let prefetch_us = settings.prefetch.num_microseconds().unwrap_or(i64::MAX);
        let cadence_us = settings.cadence.num_microseconds().unwrap_or(0);
        if cadence_us <= 0 || prefetch_us <= 0 {
            return Err(PassPlannerError::InvalidRange(format!(
                "cadence {} and prefetch {} must be positive",
                settings.cadence, settings.prefetch
            )));
        }
        let end = start + settings.prefetch;
        let step_count = (prefetch_us.saturating_add(cadence_us - 1) / cadence_us) as usize + 1;
        let times = generate_time_vector(start, end, step_count)?;

        let mut windows = BTreeMap::new();
        let mut not_computed = BTreeMap::new();
        for elements in store.iter() {
            let geometry = PassGeometry {
                elements,
                station,
                model: settings.model,
                mask_deg: settings.min_elevation_deg,
            };
            match satellite_windows(&geometry, times.iter(), &settings) {
                Ok(found) => {
                    log::debug!("{}: {} visibility windows", elements.name, found.len());
                    windows.insert(elements.name.clone(), found);
                }
                Err(e) => {
                    log::warn!("{}: visibility not computed: {}", elements.name, e);
                    not_computed.insert(elements.name.clone(), e.to_string());
                }
            }
        }

        log::info!(
            "visibility cache built for {} satellites ({} failed) from {} to {}",
            windows.len(),
            not_computed.len(),
            start,
            end
        );

        Ok(Self {
            station: *station,
            settings,
            start,
            end,
            windows,
            not_computed,
        })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn station(&self) -> &GroundStation {
        &self.station
    }

    pub fn settings(&self) -> &VisibilitySettings {
        &self.settings
    }

    /// Names of satellites with computed windows.
    pub fn satellites(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Satellites whose windows could not be computed, with the reason.
    pub fn not_computed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.not_computed.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn satellite(&self, satellite: &str) -> PassPlannerResult<&[VisibilityWindow]> {
        match self.windows.get(satellite) {
            Some(found) => Ok(found),
            None => match self.not_computed.get(satellite) {
                Some(reason) => Err(PassPlannerError::NoDataForRange(format!(
                    "{satellite}: not computed ({reason})"
                ))),
                None => Err(PassPlannerError::NoDataForRange(format!(
                    "{satellite}: not in the visibility cache"
                ))),
            },
        }
    }

    fn check_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> PassPlannerResult<()> {
        if from > to || from < self.start || to > self.end {
            return Err(PassPlannerError::NoDataForRange(format!(
                "{from} to {to} is outside the cached range {} to {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Windows of `satellite` that overlap `[from, to]`, in time order.
    ///
    /// # Errors
    /// Returns `PassPlannerError::NoDataForRange` if the satellite was not
    /// computed or the range leaves the prefetch window.
    pub fn windows(
        &self,
        satellite: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> PassPlannerResult<Vec<&VisibilityWindow>> {
        let windows = self.satellite(satellite)?;
        self.check_range(from, to)?;
        Ok(windows
            .iter()
            .filter(|w| w.end >= from && w.start <= to)
            .collect())
    }

    /// Every window of every satellite, ordered by start time.
    pub fn all_windows(&self) -> Vec<&VisibilityWindow> {
        let mut all: Vec<_> = self.windows.values().flatten().collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.satellite.cmp(&b.satellite)));
        all
    }

    /// The pass in progress at `now`, or else the next one. `None` means no
    /// further pass inside the prefetch window.
    pub fn next_pass(
        &self,
        satellite: &str,
        now: DateTime<Utc>,
    ) -> PassPlannerResult<Option<&VisibilityWindow>> {
        let windows = self.satellite(satellite)?;
        self.check_range(now, now)?;
        Ok(windows.iter().find(|w| w.end >= now))
    }

    /// Whether `satellite` is above the mask at `t`.
    pub fn is_visible(&self, satellite: &str, t: DateTime<Utc>) -> PassPlannerResult<bool> {
        let windows = self.satellite(satellite)?;
        self.check_range(t, t)?;
        Ok(windows.iter().any(|w| w.contains(t)))
    }
}

/// Run-length merges visible samples into windows with refined edges.
fn satellite_windows(
    geometry: &PassGeometry<'_>,
    times: impl Iterator<Item = DateTime<Utc>>,
    settings: &VisibilitySettings,
) -> PassPlannerResult<Vec<VisibilityWindow>> {
    let tolerance = settings.refine_tolerance;
    let mut found = Vec::new();
    let mut previous: Option<(DateTime<Utc>, bool)> = None;
    let mut open: Option<DateTime<Utc>> = None;

    for t in times {
        let visible = geometry.is_visible(t)?;
        match (previous, visible) {
            (None, true) => open = Some(t),
            (Some((before, false)), true) => {
                open = Some(find_rise_time(geometry, before, t, tolerance)?);
            }
            (Some((before, true)), false) => {
                if let Some(start) = open.take() {
                    let end = find_set_time(geometry, before, t, tolerance)?;
                    push_window(&mut found, geometry, start, end, settings)?;
                }
            }
            _ => {}
        }
        previous = Some((t, visible));
    }

    // Still visible at the end of the prefetch window
    if let (Some(start), Some((last, true))) = (open, previous) {
        push_window(&mut found, geometry, start, last, settings)?;
    }

    Ok(found)
}

fn push_window(
    found: &mut Vec<VisibilityWindow>,
    geometry: &PassGeometry<'_>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    settings: &VisibilitySettings,
) -> PassPlannerResult<()> {
    if start >= end {
        log::debug!(
            "{}: dropping degenerate window at {}",
            geometry.elements.name,
            start
        );
        return Ok(());
    }
    let (culmination, max_elevation_deg) =
        find_max_elevation(geometry, start, end, settings.cadence, settings.refine_tolerance)?;
    found.push(VisibilityWindow {
        satellite: geometry.elements.name.clone(),
        start,
        end,
        culmination,
        max_elevation_deg,
    });
    Ok(())
}

/// A visibility cache that is replaced atomically.
///
/// Readers take an `Arc` snapshot and keep using it while a rebuild runs; the
/// rebuilt cache becomes visible to later snapshots in a single swap.
#[derive(Debug, Clone, Default)]
pub struct SharedVisibilityCache {
    current: Arc<RwLock<Option<Arc<VisibilityCache>>>>,
}

impl SharedVisibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest published cache, if any build has completed.
    pub fn snapshot(&self) -> Option<Arc<VisibilityCache>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn publish(&self, cache: VisibilityCache) -> Arc<VisibilityCache> {
        let cache = Arc::new(cache);
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(cache.clone());
        cache
    }

    /// Builds a new cache on the blocking pool and publishes it.
    ///
    /// The previous cache stays visible until the build succeeds; a failed
    /// build leaves it in place.
    pub async fn rebuild(
        &self,
        store: Arc<ElementStore>,
        station: GroundStation,
        start: DateTime<Utc>,
        settings: VisibilitySettings,
    ) -> PassPlannerResult<Arc<VisibilityCache>> {
        let built = tokio::task::spawn_blocking(move || {
            VisibilityCache::build(&store, &station, start, settings)
        })
        .await
        .map_err(|e| PassPlannerError::CalculationError(format!("Visibility rebuild failed: {e}")))??;

        Ok(self.publish(built))
    }

    /// Starts a rebuild in the background.
    pub fn spawn_rebuild(
        &self,
        store: Arc<ElementStore>,
        station: GroundStation,
        start: DateTime<Utc>,
        settings: VisibilitySettings,
    ) -> tokio::task::JoinHandle<PassPlannerResult<Arc<VisibilityCache>>> {
        let shared = self.clone();
        tokio::spawn(async move { shared.rebuild(store, station, start, settings).await })
    }
}

/// Elevation of `elements` at `t`, for callers holding a cache snapshot.
pub fn elevation_at(
    elements: &OrbitalElementSet,
    cache: &VisibilityCache,
    t: DateTime<Utc>,
) -> PassPlannerResult<f64> {
    let geometry = PassGeometry {
        elements,
        station: cache.station(),
        model: cache.settings().model,
        mask_deg: cache.settings().min_elevation_deg,
    };
    geometry.elevation(t)
}
