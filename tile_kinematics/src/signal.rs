//! Elementary operations over fixed-rate sample sequences.

use std::f64::consts::{PI, SQRT_2};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::KinError;

pub type Vec3 = [f64; 3];

/// Samples two (or fewer) apart still belong to the same below-threshold run.
const RANGE_GAP: usize = 2;

/// Odd-extension length used by the zero-phase filter (3 * (2 * sections + 1)).
const FILTFILT_PADLEN: usize = 9;

/// Index range into a sample stream. `slice` is half open; `window` treats a
/// degenerate range (`start == end`) as the single sample at `start`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: usize,
    pub end: usize,
}

impl Range {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn full(len: usize) -> Self {
        Self { start: 0, end: len }
    }

    /// Zero for an inverted range built through the public fields.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_degenerate(&self) -> bool {
        self.start >= self.end
    }

    /// True when `other` lies strictly between this range's bounds.
    pub fn strictly_contains(&self, other: &Range) -> bool {
        other.start > self.start && other.end < self.end
    }

    pub fn contains_index(&self, idx: usize) -> bool {
        idx > self.start && idx < self.end
    }

    pub fn slice<'a, T>(&self, x: &'a [T]) -> &'a [T] {
        let end = self.end.min(x.len());
        let start = self.start.min(end);
        &x[start..end]
    }

    pub fn window<'a, T>(&self, x: &'a [T]) -> &'a [T] {
        if self.is_degenerate() {
            Range::new(self.start, self.start + 1).slice(x)
        } else {
            self.slice(x)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilterKind {
    /// Causal one-pole filter seeded with the first sample.
    Iir1,
    /// 2nd-order Butterworth run forward and backward (zero phase).
    Butter2,
}

pub fn magnitude(v: &[Vec3]) -> Vec<f64> {
    v.iter()
        .map(|[x, y, z]| (x * x + y * y + z * z).sqrt())
        .collect()
}

/// Low-pass `x`. For `Iir1`, `wn` is the smoothing factor; for `Butter2` it
/// is the cutoff as a fraction of Nyquist.
pub fn lowpass(x: &[f64], wn: f64, kind: FilterKind) -> Vec<f64> {
    match kind {
        FilterKind::Iir1 => iir1(x, wn),
        FilterKind::Butter2 => Biquad::butterworth(wn).filtfilt(x),
    }
}

fn iir1(x: &[f64], wn: f64) -> Vec<f64> {
    let Some(&first) = x.first() else {
        return Vec::new();
    };
    let mut state = first;
    x.iter()
        .map(|&xi| {
            state += wn * (xi - state);
            state
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
struct Biquad {
    b: [f64; 3],
    a: [f64; 2],
}

impl Biquad {
    /// Bilinear-transform low-pass with Q = 1/sqrt(2).
    fn butterworth(wn: f64) -> Self {
        let wc = (PI * wn / 2.0).tan();
        let wc2 = wc * wc;
        let k = 1.0 + SQRT_2 * wc + wc2;
        Self {
            b: [wc2 / k, 2.0 * wc2 / k, wc2 / k],
            a: [2.0 * (wc2 - 1.0) / k, (1.0 - SQRT_2 * wc + wc2) / k],
        }
    }

    /// Transposed direct form II, state primed for a step at `x[0]`.
    fn filter(&self, x: &[f64]) -> Vec<f64> {
        let [b0, b1, b2] = self.b;
        let [a1, a2] = self.a;
        let x0 = x.first().copied().unwrap_or(0.0);
        let mut z2 = (b2 - a2) * x0;
        let mut z1 = (b1 - a1) * x0 + z2;
        x.iter()
            .map(|&xi| {
                let y = b0 * xi + z1;
                z1 = b1 * xi - a1 * y + z2;
                z2 = b2 * xi - a2 * y;
                y
            })
            .collect()
    }

    fn filtfilt(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        if n < 2 {
            return x.to_vec();
        }
        let pad = FILTFILT_PADLEN.min(n - 1);
        let mut ext = Vec::with_capacity(n + 2 * pad);
        ext.extend((1..=pad).rev().map(|i| 2.0 * x[0] - x[i]));
        ext.extend_from_slice(x);
        ext.extend((1..=pad).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));

        let mut y = self.filter(&ext);
        y.reverse();
        let mut y = self.filter(&y);
        y.reverse();
        y[pad..pad + n].to_vec()
    }
}

/// Five-point central difference. The two samples at each edge are zero.
/// With `cutoff`, the result is Butterworth-smoothed since the stencil
/// amplifies noise.
pub fn derivative5pt(x: &[f64], dt: f64, cutoff: Option<f64>) -> Result<Vec<f64>, KinError> {
    if x.len() < 5 {
        return Err(KinError::SignalTooShort {
            needed: 5,
            found: x.len(),
        });
    }
    if !(dt > 0.0) {
        return Err(KinError::InvalidParameter(format!(
            "derivative step must be positive, got {dt}"
        )));
    }
    let scale = 12.0 * dt;
    let mut y = vec![0.0; x.len()];
    for i in 2..x.len() - 2 {
        y[i] = (x[i - 2] - 8.0 * x[i - 1] + 8.0 * x[i + 1] - x[i + 2]) / scale;
    }
    Ok(match cutoff {
        Some(wn) => lowpass(&y, wn, FilterKind::Butter2),
        None => y,
    })
}

/// Group sorted indices into runs; a run breaks where consecutive indices are
/// more than `gap` apart. Each run is reported as `[first, last]`.
pub fn group_close_indices(idxs: &[usize], gap: usize) -> Vec<Range> {
    let mut out = Vec::new();
    let Some(&first) = idxs.first() else {
        return out;
    };
    let mut start = first;
    let mut prev = first;
    for &idx in &idxs[1..] {
        if idx - prev > gap {
            out.push(Range::new(start, prev));
            start = idx;
        }
        prev = idx;
    }
    out.push(Range::new(start, prev));
    out
}

pub fn ranges_below_threshold(x: &[f64], th: f64) -> Vec<Range> {
    let idxs: Vec<usize> = x
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v < th)
        .map(|(i, _)| i)
        .collect();
    group_close_indices(&idxs, RANGE_GAP)
}

/// Keep the candidates lying strictly inside at least one allowed range.
pub fn only_inside_ranges(candidates: &[Range], allowed: &[Range]) -> Vec<Range> {
    candidates
        .iter()
        .filter(|c| allowed.iter().any(|a| a.strictly_contains(c)))
        .copied()
        .collect()
}

fn extremum_index(x: &[f64], r: Range, pick: fn(&[f64]) -> Option<f64>) -> Option<usize> {
    if x.is_empty() {
        return None;
    }
    if r.is_degenerate() {
        return Some(r.start);
    }
    let window = r.slice(x);
    let target = pick(window)?;
    window.iter().position(|&v| v == target).map(|p| r.start + p)
}

/// Index of the smallest sample in `r`; the first one on ties.
pub fn min_index(x: &[f64], r: Range) -> Option<usize> {
    extremum_index(x, r, min_value)
}

/// Index of the largest sample in `r`; the first one on ties.
pub fn max_index(x: &[f64], r: Range) -> Option<usize> {
    extremum_index(x, r, max_value)
}

pub fn mean(x: &[f64]) -> f64 {
    x.iter().sum::<f64>() / x.len().max(1) as f64
}

/// Population variance.
pub fn variance(x: &[f64]) -> f64 {
    let m = mean(x);
    x.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / x.len().max(1) as f64
}

pub fn std(x: &[f64]) -> f64 {
    variance(x).sqrt()
}

pub fn max_value(x: &[f64]) -> Option<f64> {
    x.iter().copied().max_by_key(|v| OrderedFloat(*v))
}

pub fn min_value(x: &[f64]) -> Option<f64> {
    x.iter().copied().min_by_key(|v| OrderedFloat(*v))
}

fn sign(v: f64) -> i8 {
    if v > 0.0 {
        1
    } else if v < 0.0 {
        -1
    } else {
        0
    }
}

/// Indices `i` where the sign of `x[i]` differs from the sign of `x[i - 1]`.
pub fn zero_crossing_indices(x: &[f64]) -> Vec<usize> {
    (1..x.len())
        .filter(|&i| sign(x[i]) != sign(x[i - 1]))
        .collect()
}

/// Latest zero crossing inside `x[..before - 1]`.
pub fn last_zero_crossing_before(x: &[f64], before: usize) -> Option<usize> {
    let end = before.saturating_sub(1).min(x.len());
    (1..end).rev().find(|&i| sign(x[i]) != sign(x[i - 1]))
}

/// Zero crossings followed by a drop larger than `th` to the next sample.
pub fn zero_crossings_above_threshold(x: &[f64], th: f64) -> Vec<usize> {
    zero_crossing_indices(x)
        .into_iter()
        .filter(|&i| i + 1 < x.len() && x[i] - x[i + 1] > th)
        .collect()
}

pub fn zero_crossings_above_threshold_inside_ranges(
    x: &[f64],
    th: f64,
    allowed: &[Range],
) -> Vec<usize> {
    zero_crossings_above_threshold(x, th)
        .into_iter()
        .filter(|&i| allowed.iter().any(|r| r.contains_index(i)))
        .collect()
}

/// Undo wrap-around of an angular signal: every step of at least half of
/// `full_scale` shifts all later samples by one full scale the other way.
/// Returns the continuous signal and the indices where a correction began.
pub fn unclamp(x: &[f64], full_scale: f64) -> (Vec<f64>, Vec<usize>) {
    let threshold = 0.5 * full_scale;
    let mut out = Vec::with_capacity(x.len());
    let mut skips = Vec::new();
    let mut offset = 0.0;
    for (i, &v) in x.iter().enumerate() {
        if i > 0 {
            let step = v - x[i - 1];
            if step >= threshold {
                offset -= full_scale;
                skips.push(i);
            } else if step <= -threshold {
                offset += full_scale;
                skips.push(i);
            }
        }
        out.push(v + offset);
    }
    (out, skips)
}

/// Cumulative trapezoidal integral, same length as `x`, starting at zero.
pub fn cumtrapz(x: &[f64], dt: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(x.len());
    let mut acc = 0.0;
    for (i, &v) in x.iter().enumerate() {
        if i > 0 {
            acc += 0.5 * (x[i - 1] + v) * dt;
        }
        out.push(acc);
    }
    out
}

pub fn mae(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f64>() / n.max(1) as f64
}

pub fn mse(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>() / n.max(1) as f64
}

pub fn seconds_to_samples(seconds: f64, fs: f64) -> usize {
    (seconds * fs).round().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnitude() {
        let m = magnitude(&[[3.0, 4.0, 0.0], [0.0, 0.0, -2.0]]);
        assert_eq!(m, vec![5.0, 2.0]);
    }

    #[test]
    fn test_iir1_constant_is_fixed_point() {
        let x = vec![7.5; 50];
        assert_eq!(lowpass(&x, 0.03, FilterKind::Iir1), x);
    }

    #[test]
    fn test_butter2_constant_is_fixed_point() {
        let x = vec![1013.0; 200];
        for y in lowpass(&x, 0.01, FilterKind::Butter2) {
            assert!((y - 1013.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_butter2_attenuates_high_frequency() {
        let x: Vec<f64> = (0..2000)
            .map(|i| 10.0 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let y = lowpass(&x, 0.03, FilterKind::Butter2);
        for v in &y[100..1900] {
            assert!((v - 10.0).abs() < 0.01);
        }
    }

    #[test]
    fn test_butter2_is_zero_phase() {
        let x: Vec<f64> = (0..1000)
            .map(|i| (2.0 * PI * i as f64 / 400.0).sin())
            .collect();
        let y = lowpass(&x, 0.05, FilterKind::Butter2);
        let peak_x = max_index(&x, Range::new(200, 600)).unwrap();
        let peak_y = max_index(&y, Range::new(200, 600)).unwrap();
        assert!((peak_x as i64 - peak_y as i64).abs() <= 1);
    }

    #[test]
    fn test_derivative_of_line() {
        let x: Vec<f64> = (0..20).map(|i| 3.0 * i as f64 * 0.01).collect();
        let d = derivative5pt(&x, 0.01, None).unwrap();
        assert_eq!(d[0], 0.0);
        assert_eq!(d[19], 0.0);
        for v in &d[2..18] {
            assert!((v - 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_derivative_too_short() {
        assert!(matches!(
            derivative5pt(&[1.0, 2.0, 3.0, 4.0], 0.01, None),
            Err(KinError::SignalTooShort { needed: 5, found: 4 })
        ));
    }

    #[test]
    fn test_ranges_below_threshold_groups_close_samples() {
        let mut x = vec![1000.0; 40];
        for i in [5, 6, 7, 9, 10, 20, 30, 31] {
            x[i] = 100.0;
        }
        let r = ranges_below_threshold(&x, 600.0);
        assert_eq!(
            r,
            vec![Range::new(5, 10), Range::new(20, 20), Range::new(30, 31)]
        );
    }

    #[test]
    fn test_only_inside_ranges_is_strict() {
        let candidates = [Range::new(10, 20), Range::new(0, 5), Range::new(30, 50)];
        let allowed = [Range::new(5, 25), Range::new(30, 60)];
        assert_eq!(
            only_inside_ranges(&candidates, &allowed),
            vec![Range::new(10, 20)]
        );
    }

    #[test]
    fn test_extremum_index_degenerate_range() {
        let x = [4.0, 1.0, 9.0, 2.0];
        assert_eq!(min_index(&x, Range::new(2, 2)), Some(2));
        assert_eq!(max_index(&x, Range::new(3, 3)), Some(3));
        assert_eq!(min_index(&x, Range::new(0, 4)), Some(1));
        assert_eq!(max_index(&x, Range::new(0, 4)), Some(2));
        assert_eq!(max_index(&[], Range::new(0, 0)), None);
    }

    #[test]
    fn test_extremum_index_first_on_ties() {
        let x = [1.0, 5.0, 5.0, 0.0, 0.0];
        assert_eq!(max_index(&x, Range::full(5)), Some(1));
        assert_eq!(min_index(&x, Range::full(5)), Some(3));
    }

    #[test]
    fn test_degenerate_window_uses_single_sample() {
        let x = [4.0, 1.0, 9.0];
        let r = Range::new(2, 2);
        assert_eq!(r.window(&x), &[9.0]);
        assert!(r.slice(&x).is_empty());
        assert_eq!(mean(r.window(&x)), 9.0);
        assert_eq!(std(r.window(&x)), 0.0);
    }

    #[test]
    fn test_statistics_guard_empty_input() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(variance(&[]), 0.0);
        assert_eq!(std(&[]), 0.0);
        assert!((std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_crossings() {
        let x = [1.0, 2.0, -1.0, -3.0, 0.0, 4.0];
        assert_eq!(zero_crossing_indices(&x), vec![2, 4, 5]);
        assert_eq!(last_zero_crossing_before(&x, 5), Some(2));
        assert_eq!(last_zero_crossing_before(&x, 2), None);
    }

    #[test]
    fn test_zero_crossings_above_threshold_inside_ranges() {
        let x = [5.0, 30.0, -10.0, -40.0, 10.0, -2.0, -3.0];
        assert_eq!(zero_crossings_above_threshold(&x, 20.0), vec![2]);
        assert_eq!(
            zero_crossings_above_threshold_inside_ranges(&x, 20.0, &[Range::new(1, 4)]),
            vec![2]
        );
        assert!(
            zero_crossings_above_threshold_inside_ranges(&x, 20.0, &[Range::new(2, 6)])
                .is_empty()
        );
    }

    #[test]
    fn test_unclamp_without_jumps_is_identity() {
        let x = [10.0, 20.0, 100.0, 170.0, 90.0];
        let (y, skips) = unclamp(&x, 360.0);
        assert_eq!(y, x.to_vec());
        assert!(skips.is_empty());
    }

    #[test]
    fn test_unclamp_wrapped_angle() {
        let x = [170.0, 179.0, -179.0, -170.0, 175.0];
        let (y, skips) = unclamp(&x, 360.0);
        assert_eq!(skips, vec![2, 4]);
        assert_eq!(y, vec![170.0, 179.0, 181.0, 190.0, 175.0]);
    }

    #[test]
    fn test_cumtrapz() {
        let v = cumtrapz(&[0.0, 1.0, 2.0, 3.0], 0.5);
        assert_eq!(v, vec![0.0, 0.25, 1.0, 2.25]);
    }

    #[test]
    fn test_error_metrics() {
        let a = [1.0, 2.0, 3.0];
        let b = [2.0, 2.0, 1.0];
        assert!((mae(&a, &b) - 1.0).abs() < 1e-12);
        assert!((mse(&a, &b) - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let r = Range { start: 7, end: 3 };
        assert_eq!(r.len(), 0);
        assert!(r.is_degenerate());
        assert!(r.slice(&[0.0; 10]).is_empty());
        assert_eq!(Range::new(7, 3), Range { start: 3, end: 7 });
    }
}
