//! Lift/run segmentation of a synchronized altitude trace.
//!
//! A four-phase state machine walks the trace forward, each phase running a
//! causal windowed search: a candidate index is confirmed by tests looking
//! `within` seconds back, and the point is reported at the start of that
//! confirming window.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::signal::{self, Range};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "test", content = "threshold")]
pub enum GeoTest {
    /// Rise over the confirming span larger than the threshold.
    IncreasingSlopeGt(f64),
    /// Rise over the confirming span, but smaller than the threshold.
    IncreasingSlopeLt(f64),
    DecreasingSlopeGt(f64),
    DecreasingSlopeLt(f64),
    /// The span start is the maximum of the window.
    MaxAtBeginningOfPeriod,
    MinAtBeginningOfPeriod,
    /// Peak-to-peak over the window larger than the threshold.
    SlopeRangeGt(f64),
    /// The candidate is at least as high as everything in the window.
    CurrentMaxWithinPeriod,
    CurrentMinWithinPeriod,
}

impl GeoTest {
    pub fn label(&self) -> &'static str {
        match self {
            GeoTest::IncreasingSlopeGt(_) => "increasing slope above threshold",
            GeoTest::IncreasingSlopeLt(_) => "increasing slope below threshold",
            GeoTest::DecreasingSlopeGt(_) => "decreasing slope above threshold",
            GeoTest::DecreasingSlopeLt(_) => "decreasing slope below threshold",
            GeoTest::MaxAtBeginningOfPeriod => "maximum at beginning of period",
            GeoTest::MinAtBeginningOfPeriod => "minimum at beginning of period",
            GeoTest::SlopeRangeGt(_) => "slope range above threshold",
            GeoTest::CurrentMaxWithinPeriod => "current maximum within period",
            GeoTest::CurrentMinWithinPeriod => "current minimum within period",
        }
    }

    /// Evaluate at candidate `i`; the caller guarantees `i >= within` and
    /// `i >= window`.
    pub fn evaluate(&self, x: &[f64], i: usize, within: usize, window: usize) -> bool {
        let start = x[i - within];
        let current = x[i];
        let span = &x[i - window..i];
        let hi = || signal::max_value(span).unwrap_or(current);
        let lo = || signal::min_value(span).unwrap_or(current);
        match *self {
            GeoTest::IncreasingSlopeGt(th) => current - start > th,
            GeoTest::IncreasingSlopeLt(th) => {
                let rise = current - start;
                rise > 0.0 && rise < th
            }
            GeoTest::DecreasingSlopeGt(th) => start - current > th,
            GeoTest::DecreasingSlopeLt(th) => {
                let drop = start - current;
                drop > 0.0 && drop < th
            }
            GeoTest::MaxAtBeginningOfPeriod => start == hi(),
            GeoTest::MinAtBeginningOfPeriod => start == lo(),
            GeoTest::SlopeRangeGt(th) => hi() - lo() > th,
            GeoTest::CurrentMaxWithinPeriod => current >= hi(),
            GeoTest::CurrentMinWithinPeriod => current <= lo(),
        }
    }
}

/// One phase of the state machine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhaseSearch {
    /// Step between candidates, in samples.
    pub stride: usize,
    pub within_s: f64,
    pub window_s: f64,
    pub tests: Vec<GeoTest>,
}

impl PhaseSearch {
    pub fn lift_bottom() -> Self {
        Self {
            stride: 20,
            within_s: 60.0,
            window_s: 60.0,
            tests: vec![GeoTest::IncreasingSlopeGt(20.0), GeoTest::MinAtBeginningOfPeriod],
        }
    }

    pub fn lift_peak() -> Self {
        Self {
            stride: 1,
            within_s: 60.0,
            window_s: 180.0,
            tests: vec![GeoTest::DecreasingSlopeGt(5.0), GeoTest::MaxAtBeginningOfPeriod],
        }
    }

    pub fn run_peak() -> Self {
        Self {
            stride: 10,
            within_s: 10.0,
            window_s: 10.0,
            tests: vec![GeoTest::DecreasingSlopeGt(10.0)],
        }
    }

    pub fn run_bottom() -> Self {
        Self {
            stride: 10,
            within_s: 10.0,
            window_s: 30.0,
            tests: vec![GeoTest::DecreasingSlopeLt(3.0), GeoTest::SlopeRangeGt(30.0)],
        }
    }

    /// First point at or after `min_idx` confirmed by all tests, or `None`
    /// when the data runs out.
    pub fn search(&self, x: &[f64], min_idx: usize, fs: f64) -> Option<usize> {
        if min_idx >= x.len() || self.stride == 0 {
            return None;
        }
        let within = signal::seconds_to_samples(self.within_s, fs);
        let window = signal::seconds_to_samples(self.window_s, fs);
        let lead = within.max(window);
        let steps = (x.len() - min_idx) / self.stride;
        (lead.div_ceil(self.stride)..steps)
            .map(|k| min_idx + k * self.stride)
            .find(|&i| self.tests.iter().all(|t| t.evaluate(x, i, within, window)))
            .map(|i| i - within)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeographyParams {
    pub lift_bottom: PhaseSearch,
    pub lift_peak: PhaseSearch,
    pub run_peak: PhaseSearch,
    pub run_bottom: PhaseSearch,
}

impl Default for GeographyParams {
    fn default() -> Self {
        Self {
            lift_bottom: PhaseSearch::lift_bottom(),
            lift_peak: PhaseSearch::lift_peak(),
            run_peak: PhaseSearch::run_peak(),
            run_bottom: PhaseSearch::run_bottom(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PointKind {
    LiftBottom,
    LiftPeak,
    RunPeak,
    RunBottom,
}

impl PointKind {
    pub fn next(self) -> PointKind {
        match self {
            PointKind::LiftBottom => PointKind::LiftPeak,
            PointKind::LiftPeak => PointKind::RunPeak,
            PointKind::RunPeak => PointKind::RunBottom,
            PointKind::RunBottom => PointKind::LiftBottom,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PointKind::LiftBottom => "lift bottom",
            PointKind::LiftPeak => "lift peak",
            PointKind::RunPeak => "run peak",
            PointKind::RunBottom => "run bottom",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeographicalPoint {
    pub kind: PointKind,
    pub timestamp: f64,
    pub idx: usize,
    pub altitude: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Geography {
    pub points: Vec<GeographicalPoint>,
}

impl Geography {
    /// Segment `alt_lpf` into lift and run phases. Pure: the same inputs
    /// always give the same points.
    pub fn identify(time: &[f64], alt_lpf: &[f64], fs: f64, params: &GeographyParams) -> Self {
        let phases = [
            (PointKind::LiftBottom, &params.lift_bottom),
            (PointKind::LiftPeak, &params.lift_peak),
            (PointKind::RunPeak, &params.run_peak),
            (PointKind::RunBottom, &params.run_bottom),
        ];
        let mut points = Vec::new();
        let mut last = 0usize;
        'cycles: loop {
            let cycle_start = last;
            for (kind, phase) in phases {
                let Some(idx) = phase.search(alt_lpf, last, fs) else {
                    debug!("No {} after sample {last}, segmentation stops", kind.label());
                    break 'cycles;
                };
                points.push(GeographicalPoint {
                    kind,
                    timestamp: time.get(idx).copied().unwrap_or(f64::NAN),
                    idx,
                    altitude: alt_lpf[idx],
                });
                last = idx;
            }
            if last <= cycle_start {
                warn!("Segmentation made no progress at sample {last}, stopping");
                break;
            }
        }

        let points = repair_fragments(&points);
        let geography = Geography { points };
        info!(
            "Geography: {} lifts, {} runs",
            geography.lift_ranges().len(),
            geography.downhill_ranges().len()
        );
        geography
    }

    pub fn points_of(&self, kind: PointKind) -> Vec<&GeographicalPoint> {
        self.points.iter().filter(|p| p.kind == kind).collect()
    }

    fn pair_ranges(&self, from: PointKind, to: PointKind) -> Vec<Range> {
        self.points_of(from)
            .into_iter()
            .zip(self.points_of(to))
            .map(|(a, b)| Range::new(a.idx, b.idx))
            .collect()
    }

    /// Run peak to run bottom.
    pub fn downhill_ranges(&self) -> Vec<Range> {
        self.pair_ranges(PointKind::RunPeak, PointKind::RunBottom)
    }

    /// Lift bottom to lift peak.
    pub fn lift_ranges(&self) -> Vec<Range> {
        self.pair_ranges(PointKind::LiftBottom, PointKind::LiftPeak)
    }

    /// Lift peak to run peak: the stop at the top where the boot is still.
    pub fn peak_ranges(&self) -> Vec<Range> {
        self.pair_ranges(PointKind::LiftPeak, PointKind::RunPeak)
    }
}

fn balanced(points: &[GeographicalPoint]) -> bool {
    let count = |k| points.iter().filter(|p| p.kind == k).count();
    count(PointKind::LiftBottom) == count(PointKind::LiftPeak)
        && count(PointKind::RunPeak) == count(PointKind::RunBottom)
}

/// Single pass over adjacent pairs removing (lift peak, lift bottom) and
/// (run bottom, run peak) fragments, then dropping an unpaired trailing lift
/// bottom or run peak left by a truncated final cycle. Runs only when the
/// point counts are unbalanced.
pub fn repair_fragments(points: &[GeographicalPoint]) -> Vec<GeographicalPoint> {
    if balanced(points) {
        return points.to_vec();
    }
    let mut drop = vec![false; points.len()];
    let mut i = 0;
    while i + 1 < points.len() {
        let pair = (points[i].kind, points[i + 1].kind);
        if matches!(
            pair,
            (PointKind::LiftPeak, PointKind::LiftBottom) | (PointKind::RunBottom, PointKind::RunPeak)
        ) {
            debug!(
                "Removing fragment {} at {} / {} at {}",
                pair.0.label(),
                points[i].idx,
                pair.1.label(),
                points[i + 1].idx
            );
            drop[i] = true;
            drop[i + 1] = true;
            i += 2;
        } else {
            i += 1;
        }
    }
    let mut kept: Vec<GeographicalPoint> = points
        .iter()
        .zip(&drop)
        .filter(|&(_, &d)| !d)
        .map(|(p, _)| *p)
        .collect();
    if matches!(
        kept.last().map(|p| p.kind),
        Some(PointKind::LiftBottom) | Some(PointKind::RunPeak)
    ) {
        kept.pop();
    }
    if !balanced(&kept) {
        warn!("Geographical points still unbalanced after fragment repair");
    }
    kept
}
