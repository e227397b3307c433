//! Carved-turn detection at compression peaks of the filtered acceleration
//! norm.
//!
//! Every index is found by walking backward through zero crossings: of the
//! first and second derivative of `mg_lpf` for the turn baselines, and of
//! the boot roll rate for the roll peak.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::signal::{self, Range};
use crate::stat_tests::{self as st, Reference, Scorecard};

/// Edge angles whose cosine falls below this are treated as this.
const MIN_EDGE_COS: f64 = 1e-3;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TurnSide {
    #[default]
    Downhill,
    Uphill,
}

impl TurnSide {
    pub fn as_char(self) -> char {
        match self {
            TurnSide::Downhill => 'D',
            TurnSide::Uphill => 'U',
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnParams {
    /// Minimum drop of `d_mg_lpf_dt` across the compression zero crossing.
    pub derivative_threshold: f64,
    pub sidecut_radius_m: f64,
    pub min_samples: usize,
    pub recent_max_samples: usize,
    pub carve_angle_deg: f64,
    pub max_g_mg: f64,
    pub min_g_mg: f64,
}

impl Default for TurnParams {
    fn default() -> Self {
        Self {
            derivative_threshold: 10.0,
            sidecut_radius_m: 15.0,
            min_samples: 35,
            recent_max_samples: 25,
            carve_angle_deg: 20.0,
            max_g_mg: 1250.0,
            min_g_mg: 1000.0,
        }
    }
}

/// Borrowed views of the session signals a turn is derived from.
#[derive(Clone, Copy, Debug)]
pub struct TurnSignals<'a> {
    pub alt_lpf: &'a [f64],
    pub mg_lpf: &'a [f64],
    pub d_mg_lpf_dt: &'a [f64],
    pub d2_mg_lpf_dt2: &'a [f64],
    /// Unclamped boot roll, degrees.
    pub roll: &'a [f64],
    pub d_roll_dt: &'a [f64],
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub high_g_idx: usize,
    /// 1: last `d_mg_lpf_dt` crossing, 2: last `d2_mg_lpf_dt2` crossing
    /// before 1, 3: midpoint of 1 and 2, 4: midpoint of the roll peaks,
    /// 5: first sample past the mean roll between the roll peaks.
    pub baselines: [usize; 5],
    pub peak_roll_idx: usize,
    pub past_peak_roll_idx: usize,
    pub side: TurnSide,
    /// Roll change from each baseline to the roll peak, degrees.
    pub carving_angles: [f64; 5],
    pub turn_range: Range,
    pub baseline_range: Range,
    pub min_radius_range: Range,
    /// `|roll - roll[baseline 1]|` over the turn range.
    pub offset_abs_roll: Vec<f64>,
    /// Effective carving radius over the turn range, metres.
    pub turning_radius: Vec<f64>,
    pub peak_radius: f64,
    pub scorecard: Scorecard,
    pub run_range: Option<Range>,
}

fn midpoint(a: usize, b: usize) -> usize {
    (a + b + 1) / 2
}

fn carving_radius(sidecut: f64, edge_deg: f64) -> f64 {
    sidecut / edge_deg.to_radians().cos().max(MIN_EDGE_COS)
}

impl Turn {
    /// Derive the turn ending at compression peak `high_g_idx`, or `None`
    /// when one of the backward zero-crossing walks finds nothing.
    pub fn identify(high_g_idx: usize, s: &TurnSignals<'_>, params: &TurnParams) -> Option<Turn> {
        let b1 = signal::last_zero_crossing_before(s.d_mg_lpf_dt, high_g_idx)?;
        let b2 = signal::last_zero_crossing_before(s.d2_mg_lpf_dt2, b1)?;
        let peak = signal::last_zero_crossing_before(s.d_roll_dt, high_g_idx)?;
        let past = signal::last_zero_crossing_before(s.d_roll_dt, peak)?;
        let roll = s.roll;

        let between = Range::new(past, peak);
        let mean_roll = signal::mean(between.slice(roll));
        let rising = roll[past] < roll[peak];
        let b5 = (between.start..between.end)
            .find(|&j| if rising { roll[j] > mean_roll } else { roll[j] < mean_roll })
            .unwrap_or(past);
        let baselines = [b1, b2, midpoint(b1, b2), midpoint(peak, past), b5];

        let side = if roll[b1] < roll[peak] {
            TurnSide::Downhill
        } else {
            TurnSide::Uphill
        };
        let carving_angles = baselines.map(|b| (roll[b] - roll[peak]).abs());

        let turn_range = Range::new(b1, high_g_idx);
        let baseline_range = Range::new(b2, b1);
        let min_radius_range = Range::new(peak, high_g_idx);

        let offset_abs_roll: Vec<f64> = turn_range
            .slice(roll)
            .iter()
            .map(|r| (r - roll[b1]).abs())
            .collect();
        let turning_radius = offset_abs_roll
            .iter()
            .map(|&a| carving_radius(params.sidecut_radius_m, a))
            .collect();
        let peak_radius = carving_radius(params.sidecut_radius_m, (roll[peak] - roll[b1]).abs());

        debug!(
            "Turn at {high_g_idx}: baselines {baselines:?}, roll peak {peak} (past {past}), side {}",
            side.as_char()
        );

        let mut turn = Turn {
            high_g_idx,
            baselines,
            peak_roll_idx: peak,
            past_peak_roll_idx: past,
            side,
            carving_angles,
            turn_range,
            baseline_range,
            min_radius_range,
            offset_abs_roll,
            turning_radius,
            peak_radius,
            scorecard: Scorecard::default(),
            run_range: None,
        };
        turn.scorecard = turn.score(s, params);
        turn.scorecard.log("turn");
        Some(turn)
    }

    fn score(&self, s: &TurnSignals<'_>, params: &TurnParams) -> Scorecard {
        let offset = &self.offset_abs_roll;
        let whole = Range::full(offset.len());
        Scorecard::new(vec![
            st::decreasing_trend(s.alt_lpf, self.turn_range, None)
                .with_label("alt_lpf decreasing during turn"),
            st::min_sample_count(self.turn_range, Some(params.min_samples))
                .with_label("turn range sample count"),
            st::recent_max(offset, whole, Some(params.recent_max_samples))
                .with_label("max carving close to max compression"),
            st::largest_magnitude(offset, whole, None, Some(params.carve_angle_deg))
                .with_label("carving angle above threshold"),
            st::largest_magnitude(s.mg_lpf, self.turn_range, None, Some(params.max_g_mg))
                .with_label("max g-force above threshold"),
            st::lower_std(s.roll, self.min_radius_range, Reference::Window(self.baseline_range))
                .with_label("roll std dev (min radius < baseline)"),
            st::smallest_magnitude(s.mg_lpf, self.turn_range, Some(params.min_g_mg))
                .with_label("g-force at baseline below threshold"),
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
}

/// Compression peaks inside the allowed (downhill) ranges, one turn each.
pub fn identify_turns(s: &TurnSignals<'_>, allowed: &[Range], params: &TurnParams) -> Vec<Turn> {
    let candidates = signal::zero_crossings_above_threshold_inside_ranges(
        s.d_mg_lpf_dt,
        params.derivative_threshold,
        allowed,
    );
    let turns: Vec<Turn> = candidates
        .iter()
        .filter_map(|&h| {
            let mut turn = Turn::identify(h, s, params)?;
            turn.run_range = allowed.iter().find(|r| r.contains_index(h)).copied();
            Some(turn)
        })
        .collect();
    debug!("{} high-G candidates, {} turns", candidates.len(), turns.len());
    turns
}
