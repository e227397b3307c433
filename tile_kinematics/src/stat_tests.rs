//! Boolean predicates over signal windows used to score detected events.
//!
//! Every test fails closed: an empty window or a missing reference window
//! yields a failed outcome rather than an error, so a malformed candidate
//! only lowers its confidence.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signal::{self, Range};

const DEFAULT_MAGNITUDE_K: f64 = 3.0;
const DEFAULT_TIMING_SAMPLES: usize = 20;
const DEFAULT_MIN_SAMPLES: usize = 50;
const DEFAULT_TREND_TOLERANCE: f64 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub label: String,
    pub passed: bool,
    pub detail: String,
}

impl TestOutcome {
    fn new(label: &str, passed: bool, detail: String) -> Self {
        Self {
            label: label.to_string(),
            passed,
            detail,
        }
    }

    fn degenerate(label: &str) -> Self {
        Self::new(label, false, "degenerate window".to_string())
    }

    /// Replace the generic label with the event-specific one.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

/// What a window statistic is compared against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    /// The whole signal.
    Population,
    Window(Range),
}

impl Reference {
    fn values<'a>(&self, x: &'a [f64]) -> &'a [f64] {
        match self {
            Reference::Population => x,
            Reference::Window(r) => r.slice(x),
        }
    }
}

/// Decreasing trend: no step inside the window rises by more than
/// `tolerance` (default 1).
pub fn decreasing_trend(x: &[f64], r: Range, tolerance: Option<f64>) -> TestOutcome {
    const LABEL: &str = "decreasing trend";
    let w = r.slice(x);
    if w.is_empty() {
        return TestOutcome::degenerate(LABEL);
    }
    let tol = tolerance.unwrap_or(DEFAULT_TREND_TOLERANCE);
    let worst = w
        .windows(2)
        .map(|p| p[1] - p[0])
        .fold(f64::NEG_INFINITY, f64::max);
    TestOutcome::new(
        LABEL,
        worst <= tol,
        format!("largest rise {worst:.3} vs tolerance {tol:.3}"),
    )
}

/// The interior maximum exceeds both endpoint samples.
pub fn contains_local_peak(x: &[f64], r: Range) -> TestOutcome {
    const LABEL: &str = "contains local peak";
    let w = r.slice(x);
    let (Some(&head), Some(&tail)) = (x.get(r.start), x.get(r.end)) else {
        return TestOutcome::degenerate(LABEL);
    };
    let Some(peak) = signal::max_value(w) else {
        return TestOutcome::degenerate(LABEL);
    };
    TestOutcome::new(
        LABEL,
        head < peak && peak > tail,
        format!("head {head:.3}, peak {peak:.3}, tail {tail:.3}"),
    )
}

pub fn min_sample_count(r: Range, min_count: Option<usize>) -> TestOutcome {
    let min = min_count.unwrap_or(DEFAULT_MIN_SAMPLES);
    TestOutcome::new(
        "minimum sample count",
        r.len() >= min,
        format!("{} samples vs minimum {min}", r.len()),
    )
}

fn compare(
    label: &str,
    x: &[f64],
    r: Range,
    reference: Reference,
    stat: fn(&[f64]) -> f64,
    lower: bool,
) -> TestOutcome {
    let w = r.slice(x);
    let reference_values = reference.values(x);
    if w.is_empty() || reference_values.is_empty() {
        return TestOutcome::degenerate(label);
    }
    let (a, b) = (stat(w), stat(reference_values));
    let passed = if lower { a < b } else { a > b };
    TestOutcome::new(label, passed, format!("window {a:.3} vs reference {b:.3}"))
}

pub fn lower_std(x: &[f64], r: Range, reference: Reference) -> TestOutcome {
    compare("lower std dev", x, r, reference, signal::std, true)
}

pub fn larger_std(x: &[f64], r: Range, reference: Reference) -> TestOutcome {
    compare("larger std dev", x, r, reference, signal::std, false)
}

pub fn lower_mean(x: &[f64], r: Range, reference: Reference) -> TestOutcome {
    compare("lower mean", x, r, reference, signal::mean, true)
}

pub fn larger_mean(x: &[f64], r: Range, reference: Reference) -> TestOutcome {
    compare("larger mean", x, r, reference, signal::mean, false)
}

/// The window maximum (or `impulse` when given) exceeds `th`, which defaults
/// to three standard deviations of the window.
pub fn largest_magnitude(
    x: &[f64],
    r: Range,
    impulse: Option<f64>,
    th: Option<f64>,
) -> TestOutcome {
    const LABEL: &str = "largest magnitude";
    let w = r.slice(x);
    let Some(max) = signal::max_value(w) else {
        return TestOutcome::degenerate(LABEL);
    };
    let impulse = impulse.unwrap_or(max);
    let baseline = th.unwrap_or_else(|| DEFAULT_MAGNITUDE_K * signal::std(w));
    TestOutcome::new(
        LABEL,
        impulse > baseline,
        format!("impulse {impulse:.3} vs baseline {baseline:.3}"),
    )
}

/// The window minimum is below `th`, which defaults to a third of the
/// window's standard deviation.
pub fn smallest_magnitude(x: &[f64], r: Range, th: Option<f64>) -> TestOutcome {
    const LABEL: &str = "smallest magnitude";
    let w = r.slice(x);
    let Some(min) = signal::min_value(w) else {
        return TestOutcome::degenerate(LABEL);
    };
    let baseline = th.unwrap_or_else(|| signal::std(w) / DEFAULT_MAGNITUDE_K);
    TestOutcome::new(
        LABEL,
        min < baseline,
        format!("minimum {min:.3} vs baseline {baseline:.3}"),
    )
}

fn window_argmax(x: &[f64], r: Range) -> Option<(usize, usize)> {
    let w = r.slice(x);
    let idx = signal::max_index(w, Range::full(w.len()))?;
    Some((idx, w.len()))
}

/// The window maximum occurs within the first `th` samples (default 20).
pub fn timing_of_magnitude(x: &[f64], r: Range, th: Option<usize>) -> TestOutcome {
    const LABEL: &str = "timing of magnitude";
    let Some((idx, _)) = window_argmax(x, r) else {
        return TestOutcome::degenerate(LABEL);
    };
    let limit = th.unwrap_or(DEFAULT_TIMING_SAMPLES);
    TestOutcome::new(
        LABEL,
        idx + 1 < limit,
        format!("maximum at sample {idx} vs limit {limit}"),
    )
}

/// The window maximum occurs within the last `th` samples (default 20).
pub fn recent_max(x: &[f64], r: Range, th: Option<usize>) -> TestOutcome {
    const LABEL: &str = "recent max";
    let Some((idx, len)) = window_argmax(x, r) else {
        return TestOutcome::degenerate(LABEL);
    };
    let limit = th.unwrap_or(DEFAULT_TIMING_SAMPLES);
    let from_end = len - (idx + 1);
    TestOutcome::new(
        LABEL,
        from_end < limit,
        format!("maximum {from_end} samples before the end vs limit {limit}"),
    )
}

/// Aggregated outcomes of an event's test battery; all tests weigh the same.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    pub outcomes: Vec<TestOutcome>,
}

impl Scorecard {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed).count()
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Share of passed tests, in percent.
    pub fn confidence(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.passed() as f64 / self.total() as f64 * 100.0
    }

    pub fn log(&self, event: &str) {
        for o in &self.outcomes {
            debug!(
                "{event}: {} {} ({})",
                o.label,
                if o.passed { "passed" } else { "failed" },
                o.detail
            );
        }
        debug!(
            "{event}: {}/{} tests passed, confidence {:.1}%",
            self.passed(),
            self.total(),
            self.confidence()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decreasing_trend() {
        let x = [10.0, 9.0, 9.5, 7.0, 3.0];
        assert!(decreasing_trend(&x, Range::full(5), None).passed);
        assert!(!decreasing_trend(&x, Range::full(5), Some(0.1)).passed);
        assert!(!decreasing_trend(&x, Range::new(2, 2), None).passed);
    }

    #[test]
    fn test_contains_local_peak() {
        let x = [1.0, 3.0, 8.0, 4.0, 2.0];
        assert!(contains_local_peak(&x, Range::new(0, 4)).passed);
        assert!(!contains_local_peak(&x, Range::new(2, 4)).passed);
        assert!(!contains_local_peak(&x, Range::new(0, 9)).passed);
    }

    #[test]
    fn test_min_sample_count() {
        assert!(min_sample_count(Range::new(10, 60), None).passed);
        assert!(!min_sample_count(Range::new(10, 59), None).passed);
        assert!(min_sample_count(Range::new(10, 40), Some(30)).passed);
    }

    #[test]
    fn test_dispersion_and_mean_against_population() {
        let mut x = vec![1000.0; 100];
        for (i, v) in x.iter_mut().enumerate().skip(60) {
            *v = if i % 2 == 0 { 1800.0 } else { 600.0 };
        }
        let quiet = Range::new(0, 50);
        let noisy = Range::new(60, 100);
        assert!(lower_std(&x, quiet, Reference::Population).passed);
        assert!(larger_std(&x, noisy, Reference::Population).passed);
        assert!(lower_std(&x, quiet, Reference::Window(noisy)).passed);
        assert!(!larger_std(&x, quiet, Reference::Window(noisy)).passed);
        assert!(lower_mean(&x, Range::new(61, 62), Reference::Population).passed);
        assert!(larger_mean(&x, Range::new(60, 61), Reference::Population).passed);
    }

    #[test]
    fn test_comparisons_fail_closed() {
        let x = [1.0, 2.0, 3.0];
        assert!(!lower_std(&x, Range::new(1, 1), Reference::Population).passed);
        assert!(!lower_mean(&x, Range::new(0, 2), Reference::Window(Range::new(5, 9))).passed);
        assert!(!larger_mean(&[], Range::new(0, 0), Reference::Population).passed);
    }

    #[test]
    fn test_largest_magnitude() {
        // 3 * std of [1, 1, 1, 1, 10] is 10.8
        let x = [1.0, 1.0, 1.0, 1.0, 10.0];
        assert!(!largest_magnitude(&x, Range::full(5), None, None).passed);
        assert!(largest_magnitude(&x, Range::full(5), None, Some(5.0)).passed);
        assert!(largest_magnitude(&x, Range::new(0, 4), None, None).passed);
        assert!(largest_magnitude(&x, Range::full(5), Some(20.0), None).passed);

        let flat = [1.0; 5];
        let outcome = largest_magnitude(&flat, Range::full(5), None, Some(1.0));
        assert!(!outcome.passed);
        assert!(largest_magnitude(&flat, Range::full(5), None, Some(0.0)).passed);
        assert!(!largest_magnitude(&flat, Range::new(3, 3), None, Some(0.0)).passed);
    }

    #[test]
    fn test_largest_magnitude_strict_boundaries() {
        // population std of the spiky window is 3.6, so the baseline is 10.8
        let spiky = [1.0, 1.0, 1.0, 1.0, 10.0];
        let outcome = largest_magnitude(&spiky, Range::full(5), None, None);
        assert!(!outcome.passed);
        assert_eq!(outcome.detail, "impulse 10.000 vs baseline 10.800");

        let flat = [1.0; 5];
        let outcome = largest_magnitude(&flat, Range::full(5), None, Some(0.0));
        assert!(outcome.passed);
        assert_eq!(outcome.detail, "impulse 1.000 vs baseline 0.000");

        // zero std with the default baseline: 1 > 0
        assert!(largest_magnitude(&flat, Range::full(5), None, None).passed);
        // equal to the baseline is not larger
        assert!(!largest_magnitude(&flat, Range::full(5), Some(0.0), Some(0.0)).passed);
    }

    #[test]
    fn test_smallest_magnitude() {
        let x = [0.0, 5.0, 10.0, 5.0];
        assert!(smallest_magnitude(&x, Range::full(4), None).passed);
        assert!(!smallest_magnitude(&x, Range::new(1, 4), None).passed);
        assert!(smallest_magnitude(&x, Range::new(1, 4), Some(6.0)).passed);
    }

    #[test]
    fn test_timing_tests() {
        let mut x = vec![0.0; 60];
        x[5] = 9.0;
        assert!(timing_of_magnitude(&x, Range::full(60), None).passed);
        assert!(!recent_max(&x, Range::full(60), None).passed);
        x[5] = 0.0;
        x[50] = 9.0;
        assert!(!timing_of_magnitude(&x, Range::full(60), None).passed);
        assert!(recent_max(&x, Range::full(60), None).passed);
        assert!(timing_of_magnitude(&x, Range::new(45, 60), None).passed);
        assert!(!recent_max(&x, Range::new(0, 0), None).passed);
    }

    #[test]
    fn test_scorecard_confidence() {
        let card = Scorecard::new(vec![
            min_sample_count(Range::new(0, 100), None),
            min_sample_count(Range::new(0, 10), None),
            min_sample_count(Range::new(0, 60), None),
            min_sample_count(Range::new(0, 1), None),
        ]);
        assert_eq!(card.passed(), 2);
        assert_eq!(card.total(), 4);
        assert!((card.confidence() - 50.0).abs() < 1e-12);
        assert_eq!(Scorecard::default().confidence(), 0.0);
    }
}
