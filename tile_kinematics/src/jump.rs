//! Jump detection inside low-G regions of the filtered acceleration norm.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signal::{self, Range};
use crate::stat_tests::{self as st, Reference, Scorecard};
use crate::tile::MotionSignals;

/// Standard gravity, m/s^2.
const G: f64 = 9.80665;

/// How the air phase is bounded around the low-G minimum.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum AirPhaseMethod {
    /// Sliding-window std dev of the unfiltered norm expanding outward from
    /// the minimum.
    StdExpansion,
    /// Slope scan of the filtered norm; `threshold` is in mG per sample.
    Slope { threshold: f64 },
}

impl Default for AirPhaseMethod {
    fn default() -> Self {
        AirPhaseMethod::StdExpansion
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JumpParams {
    pub low_g_threshold_mg: f64,
    /// Sliding window length in samples.
    pub std_window: usize,
    pub liftoff_std_mg: f64,
    pub touchdown_std_mg: f64,
    pub landing_window_s: f64,
    pub min_air_samples: usize,
    pub min_low_g_samples: usize,
    pub method: AirPhaseMethod,
}

impl Default for JumpParams {
    fn default() -> Self {
        Self {
            low_g_threshold_mg: 600.0,
            std_window: 16,
            liftoff_std_mg: 400.0,
            touchdown_std_mg: 1000.0,
            landing_window_s: 0.5,
            min_air_samples: 30,
            min_low_g_samples: 10,
            method: AirPhaseMethod::StdExpansion,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Jump {
    pub low_g_range: Range,
    pub min_idx: usize,
    pub liftoff_idx: usize,
    pub touch_idx: usize,
    pub air_range: Range,
    pub landing_range: Range,
    pub impulse_idx: usize,
    pub lowest_mg_lpf: f64,
    pub lowest_mg: f64,
    /// Seconds between liftoff and touchdown.
    pub air_time: f64,
    /// Metres, from the pseudo-velocity model.
    pub distance: f64,
    pub scorecard: Scorecard,
    /// The downhill range the jump was found in.
    pub run_range: Option<Range>,
}

impl Jump {
    /// Derive every index and score of one low-G candidate. `velocity` is the
    /// session's [`pseudo_velocity`].
    pub fn identify<S: MotionSignals + ?Sized>(
        low_g_range: Range,
        signals: &S,
        velocity: &[f64],
        params: &JumpParams,
        fs: f64,
    ) -> Jump {
        let mg_lpf = signals.mg_lpf();
        let mg = signals.mg();

        let min_idx = signal::min_index(mg_lpf, low_g_range)
            .unwrap_or(low_g_range.start)
            .min(mg_lpf.len().saturating_sub(1));
        let low = low_g_range.window(mg_lpf);
        let lowest_mg_lpf = signal::min_value(low).unwrap_or(f64::NAN);
        let lowest_mg = signal::min_value(low_g_range.window(mg)).unwrap_or(f64::NAN);

        let (liftoff_idx, touch_idx) = match params.method {
            AirPhaseMethod::StdExpansion => std_expansion(mg, min_idx, params),
            AirPhaseMethod::Slope { threshold } => slope_scan(mg_lpf, min_idx, threshold, params),
        };
        let air_range = Range::new(liftoff_idx, touch_idx);

        let landing_range = Range::new(
            touch_idx,
            touch_idx + signal::seconds_to_samples(params.landing_window_s, fs),
        );
        let impulse_idx = signal::max_index(mg, landing_range).unwrap_or(touch_idx);

        let air_time = air_range.len() as f64 / fs;
        let distance = signal::mean(air_range.window(velocity)) * air_time;

        debug!(
            "Jump at {min_idx}: air {}..{}, landing {}..{}, impulse {impulse_idx}",
            air_range.start, air_range.end, landing_range.start, landing_range.end
        );

        let mut jump = Jump {
            low_g_range,
            min_idx,
            liftoff_idx,
            touch_idx,
            air_range,
            landing_range,
            impulse_idx,
            lowest_mg_lpf,
            lowest_mg,
            air_time,
            distance,
            scorecard: Scorecard::default(),
            run_range: None,
        };
        jump.scorecard = jump.score(signals, params);
        jump.scorecard.log("jump");
        jump
    }

    fn score<S: MotionSignals + ?Sized>(&self, signals: &S, params: &JumpParams) -> Scorecard {
        let (mg_lpf, mg, gyro) = (signals.mg_lpf(), signals.mg(), signals.gyro());
        let (air, landing) = (self.air_range, self.landing_range);
        let pop = Reference::Population;
        let land = Reference::Window(landing);
        Scorecard::new(vec![
            st::decreasing_trend(mg_lpf, air, None)
                .with_label("mG_lpf decreasing during air"),
            st::min_sample_count(air, Some(params.min_air_samples))
                .with_label("air range sample count"),
            st::min_sample_count(self.low_g_range, Some(params.min_low_g_samples))
                .with_label("low-G range sample count"),
            st::lower_std(mg, air, pop).with_label("mG std dev (air < population)"),
            st::lower_std(gyro, air, pop).with_label("gyro std dev (air < population)"),
            st::lower_mean(mg, air, pop).with_label("mG mean (air < population)"),
            st::lower_std(mg, air, land).with_label("mG std dev (air < landing)"),
            st::lower_std(gyro, air, land).with_label("gyro std dev (air < landing)"),
            st::lower_mean(mg, air, land).with_label("mG mean (air < landing)"),
            st::larger_std(mg, landing, pop).with_label("mG std dev (landing > population)"),
            st::larger_std(gyro, landing, pop).with_label("gyro std dev (landing > population)"),
            st::larger_mean(mg, landing, pop).with_label("mG mean (landing > population)"),
            st::larger_mean(gyro, landing, pop).with_label("gyro mean (landing > population)"),
            st::largest_magnitude(mg, landing, None, None)
                .with_label("landing mG impulse > 3 std dev"),
            st::timing_of_magnitude(mg, landing, None)
                .with_label("impulse close to touchdown"),
        ])
    }

    pub fn tests_passed(&self) -> usize {
        self.scorecard.passed()
    }

    pub fn total_tests(&self) -> usize {
        self.scorecard.total()
    }

    pub fn confidence(&self) -> f64 {
        self.scorecard.confidence()
    }

    /// From liftoff to the end of the landing window.
    pub fn full_range(&self) -> Range {
        Range::new(self.liftoff_idx, self.landing_range.end)
    }
}

fn std_expansion(mg: &[f64], min_idx: usize, params: &JumpParams) -> (usize, usize) {
    let w = params.std_window.max(1);
    let half = w.div_ceil(2);

    let liftoff = (0..(min_idx + 1).saturating_sub(w))
        .find(|&i| signal::std(&mg[min_idx - (w + i)..min_idx - i]) > params.liftoff_std_mg)
        .map(|i| min_idx - (i + half))
        .unwrap_or(min_idx);

    let touch = (0..(mg.len() + 1).saturating_sub(min_idx + w))
        .find(|&i| signal::std(&mg[min_idx + i..min_idx + i + w]) > params.touchdown_std_mg)
        .map(|i| min_idx + i + half)
        .unwrap_or(min_idx);

    (liftoff, touch)
}

fn slope_scan(mg_lpf: &[f64], min_idx: usize, threshold: f64, params: &JumpParams) -> (usize, usize) {
    let start = (1..=min_idx)
        .map(|k| min_idx - k)
        .find(|&k| mg_lpf[k + 1] - mg_lpf[k] > threshold)
        .unwrap_or(0);
    let liftoff = signal::max_index(mg_lpf, Range::new(start, min_idx)).unwrap_or(min_idx);
    let touch = (min_idx..mg_lpf.len().saturating_sub(1))
        .find(|&i| mg_lpf[i] > params.low_g_threshold_mg)
        .unwrap_or(min_idx);
    (liftoff, touch)
}

/// Integral of the filtered norm minus gravity, in m/s. Drag and friction
/// are ignored.
pub fn pseudo_velocity(mg_lpf: &[f64], fs: f64) -> Vec<f64> {
    let accel: Vec<f64> = mg_lpf.iter().map(|v| (v / 1000.0 - 1.0) * G).collect();
    signal::cumtrapz(&accel, 1.0 / fs)
}

/// Low-G candidates strictly inside the allowed (downhill) ranges, one jump
/// each.
pub fn identify_jumps<S: MotionSignals + ?Sized>(
    signals: &S,
    allowed: &[Range],
    params: &JumpParams,
    fs: f64,
) -> Vec<Jump> {
    let below = signal::ranges_below_threshold(signals.mg_lpf(), params.low_g_threshold_mg);
    let candidates = signal::only_inside_ranges(&below, allowed);
    debug!(
        "{} low-G ranges, {} inside runs",
        below.len(),
        candidates.len()
    );
    let velocity = pseudo_velocity(signals.mg_lpf(), fs);
    candidates
        .into_iter()
        .map(|r| {
            let mut jump = Jump::identify(r, signals, &velocity, params, fs);
            jump.run_range = allowed.iter().find(|a| a.strictly_contains(&r)).copied();
            jump
        })
        .collect()
}
