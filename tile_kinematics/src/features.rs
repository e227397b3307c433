//! Flat feature rows describing detected jumps and turns, one row per event.
//!
//! Header and row come out of the same builder, so their columns always line
//! up. Numbers are written with three decimals.

use crate::jump::Jump;
use crate::signal::{self, Range};
use crate::tile::{MotionSignals, TileTrack};
use crate::turn::{Turn, TurnSignals};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureRow {
    names: Vec<String>,
    values: Vec<String>,
}

impl FeatureRow {
    pub fn header(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    fn text(&mut self, name: impl Into<String>, value: impl ToString) {
        self.names.push(name.into());
        self.values.push(value.to_string());
    }

    fn number(&mut self, name: impl Into<String>, value: f64) {
        self.text(name, format!("{value:.3}"));
    }

    fn index(&mut self, name: impl Into<String>, value: usize) {
        self.text(name, value);
    }

    fn range(&mut self, name: &str, r: Range) {
        self.index(format!("{name}_start"), r.start);
        self.index(format!("{name}_end"), r.end);
    }

    fn stats(&mut self, prefix: &str, x: &[f64]) {
        let (min, max) = (signal::min_value(x), signal::max_value(x));
        self.number(format!("{prefix}_min"), min.unwrap_or(f64::NAN));
        self.number(format!("{prefix}_max"), max.unwrap_or(f64::NAN));
        let (mean, std) = if x.is_empty() {
            (f64::NAN, f64::NAN)
        } else {
            (signal::mean(x), signal::std(x))
        };
        self.number(format!("{prefix}_mean"), mean);
        self.number(format!("{prefix}_std"), std);
    }

    fn at(&mut self, prefix: &str, x: &[f64], idx: usize) {
        self.number(prefix, x.get(idx).copied().unwrap_or(f64::NAN));
    }
}

pub fn jump_header() -> Vec<String> {
    jump_row(&Jump::default(), &TileTrack::default(), 0.0).names
}

pub fn jump_row(jump: &Jump, signals: &dyn MotionSignals, threshold: f64) -> FeatureRow {
    let (mg_lpf, mg, gyro) = (signals.mg_lpf(), signals.mg(), signals.gyro());
    let mut row = FeatureRow::default();
    row.number("threshold_mG", threshold);

    let ranges = [
        ("low_g", jump.low_g_range),
        ("air", jump.air_range),
        ("landing", jump.landing_range),
        ("jump", jump.full_range()),
    ];
    for (name, r) in ranges {
        row.range(name, r);
    }
    for (name, r) in ranges {
        row.stats(&format!("{name}_mG_lpf"), r.window(mg_lpf));
        row.stats(&format!("{name}_mG"), r.window(mg));
        row.stats(&format!("{name}_gyro"), r.window(gyro));
    }

    for (name, idx) in [
        ("min", jump.min_idx),
        ("liftoff", jump.liftoff_idx),
        ("touch", jump.touch_idx),
        ("impulse", jump.impulse_idx),
    ] {
        row.index(format!("{name}_idx"), idx);
        row.at(&format!("{name}_time"), signals.time(), idx);
        row.at(&format!("{name}_mG_lpf"), mg_lpf, idx);
        row.at(&format!("{name}_mG"), mg, idx);
        row.at(&format!("{name}_gyro"), gyro, idx);
    }

    row.number("lowest_mG_lpf", jump.lowest_mg_lpf);
    row.number("lowest_mG", jump.lowest_mg);
    row.number("air_time_s", jump.air_time);
    row.number("distance_m", jump.distance);
    row.index("tests_passed", jump.tests_passed());
    row.index("total_tests", jump.total_tests());
    row.number("confidence", jump.confidence());
    row.index("run_samples", jump.run_range.map_or(0, |r| r.len()));

    row.stats("trace_mG_lpf", mg_lpf);
    row.stats("trace_mG", mg);
    row.stats("trace_gyro", gyro);
    row
}

pub fn turn_header() -> Vec<String> {
    let empty: [f64; 0] = [];
    let s = TurnSignals {
        alt_lpf: &empty,
        mg_lpf: &empty,
        d_mg_lpf_dt: &empty,
        d2_mg_lpf_dt2: &empty,
        roll: &empty,
        d_roll_dt: &empty,
    };
    turn_row(&Turn::default(), &s, 0.0).names
}

pub fn turn_row(turn: &Turn, s: &TurnSignals<'_>, threshold: f64) -> FeatureRow {
    let mut row = FeatureRow::default();
    row.number("threshold_d_mG_lpf_dt", threshold);
    row.text("side", turn.side.as_char());
    row.index("high_g_idx", turn.high_g_idx);
    for (k, b) in turn.baselines.iter().enumerate() {
        row.index(format!("baseline_{}_idx", k + 1), *b);
    }
    row.index("peak_roll_idx", turn.peak_roll_idx);
    row.index("past_peak_roll_idx", turn.past_peak_roll_idx);

    let ranges = [
        ("turn", turn.turn_range),
        ("baseline", turn.baseline_range),
        ("min_radius", turn.min_radius_range),
    ];
    for (name, r) in ranges {
        row.range(name, r);
    }
    for (name, r) in ranges {
        row.stats(&format!("{name}_mG_lpf"), r.window(s.mg_lpf));
        row.stats(&format!("{name}_roll"), r.window(s.roll));
        row.stats(&format!("{name}_d_roll_dt"), r.window(s.d_roll_dt));
        row.stats(&format!("{name}_alt_lpf"), r.window(s.alt_lpf));
    }
    row.stats("offset_abs_roll", &turn.offset_abs_roll);

    for (k, angle) in turn.carving_angles.iter().enumerate() {
        row.number(format!("carving_angle_{}_deg", k + 1), *angle);
    }
    row.number("peak_radius_m", turn.peak_radius);
    row.stats("turning_radius", &turn.turning_radius);

    row.index("tests_passed", turn.tests_passed());
    row.index("total_tests", turn.total_tests());
    row.number("confidence", turn.confidence());
    row.index("run_samples", turn.run_range.map_or(0, |r| r.len()));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jump::{identify_jumps, JumpParams};
    use crate::turn::TurnSide;
    use std::collections::HashSet;

    fn track() -> TileTrack {
        let n = 300;
        let mg_lpf: Vec<f64> = (0..n)
            .map(|i| if (120..160).contains(&i) { 300.0 } else { 1000.0 })
            .collect();
        TileTrack {
            range: Range::full(n),
            time: (0..n).map(|i| i as f64 / 100.0).collect(),
            mg: mg_lpf.clone(),
            mg_lpf,
            gyro_v: vec![5.0; n],
        }
    }

    #[test]
    fn test_jump_header_matches_row() {
        let track = track();
        let jumps = identify_jumps(&track, &[Range::new(10, 290)], &JumpParams::default(), 100.0);
        assert_eq!(jumps.len(), 1);
        let row = jump_row(&jumps[0], &track, 600.0);
        let header = jump_header();
        assert_eq!(row.header(), header.as_slice());
        assert_eq!(row.values().len(), header.len());
        assert_eq!(row.values()[0], "600.000");

        let unique: HashSet<&String> = header.iter().collect();
        assert_eq!(unique.len(), header.len());

        let at = |name: &str| {
            let k = header.iter().position(|h| h == name).unwrap();
            row.values()[k].clone()
        };
        assert_eq!(at("low_g_start"), "120");
        assert_eq!(at("lowest_mG_lpf"), "300.000");
        assert_eq!(at("total_tests"), "15");
        assert_eq!(at("run_samples"), "280");
    }

    #[test]
    fn test_turn_header_matches_row() {
        let n = 100;
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let s = TurnSignals {
            alt_lpf: &x,
            mg_lpf: &x,
            d_mg_lpf_dt: &x,
            d2_mg_lpf_dt2: &x,
            roll: &x,
            d_roll_dt: &x,
        };
        let turn = Turn {
            turn_range: Range::new(10, 20),
            offset_abs_roll: vec![1.0, 2.0, 3.0],
            ..Turn::default()
        };
        let row = turn_row(&turn, &s, 10.0);
        let header = turn_header();
        assert_eq!(row.header(), header.as_slice());
        let k = header.iter().position(|h| h == "turn_mG_lpf_mean").unwrap();
        assert_eq!(row.values()[k], "14.500");
        let k = header.iter().position(|h| h == "offset_abs_roll_max").unwrap();
        assert_eq!(row.values()[k], "3.000");
        let k = header.iter().position(|h| h == "side").unwrap();
        assert_eq!(row.values()[k], TurnSide::default().as_char().to_string());
    }

    #[test]
    fn test_empty_stats_are_nan() {
        let mut row = FeatureRow::default();
        row.stats("x", &[]);
        assert_eq!(row.values(), ["NaN", "NaN", "NaN", "NaN"]);
    }
}
