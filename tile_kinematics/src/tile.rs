//! The tile device: raw samples, derived signals, synchronization with
//! ground truth and the kinematics pipeline.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geography::Geography;
use crate::jump::{self, Jump, JumpParams};
use crate::orientation::OrientationFilter;
use crate::quat::Quat;
use crate::registration::{BootOrientation, Registrations};
use crate::signal::{self, FilterKind, Range, Vec3};
use crate::sync::{self, Offset, OffsetGrid, SyncParams};
use crate::truth::{self, GroundTruthTrack};
use crate::turn::{self, Turn, TurnSignals};
use crate::{KinError, Params};

/// Standard-atmosphere pressure altitude, metres from millibar.
pub fn pressure_altitude(pressure_mb: f64) -> f64 {
    44307.694 * (1.0 - (pressure_mb / 1013.25).powf(0.190284))
}

/// Decoded tile log. Every field has one entry per sample.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTile {
    pub time_ms: Vec<f64>,
    /// mG
    pub accel: Vec<Vec3>,
    /// mdps
    pub gyro: Vec<Vec3>,
    /// mGauss
    pub mag: Vec<Vec3>,
    /// mB
    pub pressure: Vec<f64>,
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
}

impl RawTile {
    pub fn new(
        time_ms: Vec<f64>,
        accel: Vec<Vec3>,
        gyro: Vec<Vec3>,
        mag: Vec<Vec3>,
        pressure: Vec<f64>,
        temperature: Vec<f64>,
        humidity: Vec<f64>,
    ) -> Result<Self, KinError> {
        let expected = time_ms.len();
        for (field, found) in [
            ("accel", accel.len()),
            ("gyro", gyro.len()),
            ("mag", mag.len()),
            ("pressure", pressure.len()),
            ("temperature", temperature.len()),
            ("humidity", humidity.len()),
        ] {
            if found != expected {
                return Err(KinError::LengthMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(Self {
            time_ms,
            accel,
            gyro,
            mag,
            pressure,
            temperature,
            humidity,
        })
    }

    pub fn len(&self) -> usize {
        self.time_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }
}

/// Signals the jump detector reads. Implemented by the whole tile and by
/// trimmed per-track views.
pub trait MotionSignals {
    fn time(&self) -> &[f64];
    fn mg(&self) -> &[f64];
    fn mg_lpf(&self) -> &[f64];
    fn gyro(&self) -> &[f64];

    fn len(&self) -> usize {
        self.time().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accelerometer norm and its filtered derivatives.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GForce {
    pub mg: Vec<f64>,
    pub mg_lpf: Vec<f64>,
    pub d_mg_lpf_dt: Vec<f64>,
    pub d2_mg_lpf_dt2: Vec<f64>,
}

impl GForce {
    pub fn from_accel(
        accel: &[Vec3],
        fs: f64,
        accel_cutoff: f64,
        derivative_cutoff: f64,
    ) -> Result<Self, KinError> {
        let mg = signal::magnitude(accel);
        let axis = |k: usize| -> Vec<f64> {
            let col: Vec<f64> = accel.iter().map(|v| v[k]).collect();
            signal::lowpass(&col, accel_cutoff, FilterKind::Butter2)
        };
        let (x, y, z) = (axis(0), axis(1), axis(2));
        let accel_lpf: Vec<Vec3> = (0..accel.len()).map(|i| [x[i], y[i], z[i]]).collect();
        let mg_lpf = signal::magnitude(&accel_lpf);

        let dt = 1.0 / fs;
        let d_mg_lpf_dt = signal::derivative5pt(&mg_lpf, dt, Some(derivative_cutoff))?;
        let d2_mg_lpf_dt2 = signal::derivative5pt(&d_mg_lpf_dt, dt, Some(derivative_cutoff))?;
        Ok(Self {
            mg,
            mg_lpf,
            d_mg_lpf_dt,
            d2_mg_lpf_dt2,
        })
    }
}

/// Everything detected in one session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Kinematics {
    pub geography: Geography,
    pub jumps: Vec<Jump>,
    pub registrations: Registrations,
    pub boot: BootOrientation,
    pub turns: Vec<Turn>,
}

/// Processed tile signals. All vectors share the raw sample count.
#[derive(Clone, Debug)]
pub struct Tile {
    pub fs: f64,
    /// Seconds; unix seconds once synchronized.
    pub time: Vec<f64>,
    pub raw_alt: Vec<f64>,
    pub raw_alt_lpf: Vec<f64>,
    /// Altitude with the ground-truth offset removed; equal to the raw
    /// altitude until an offset is applied.
    pub alt: Vec<f64>,
    pub alt_lpf: Vec<f64>,
    pub gyro_v: Vec<f64>,
    pub g_force: GForce,
    pub quat: Vec<Quat>,
    pub offset: Option<Offset>,
}

impl Tile {
    pub fn new(raw: &RawTile, filter: &dyn OrientationFilter, params: &Params) -> Result<Self, KinError> {
        let n = raw.len();
        let fs = params.sample_rate_hz;
        info!("Constructing processed signals for {n} samples");

        let time: Vec<f64> = raw.time_ms.iter().map(|t| t / 1000.0).collect();
        let raw_alt: Vec<f64> = raw.pressure.iter().map(|&p| pressure_altitude(p)).collect();
        let raw_alt_lpf = signal::lowpass(&raw_alt, params.altitude_cutoff, FilterKind::Butter2);
        let gyro_v = signal::magnitude(&raw.gyro);
        let g_force = GForce::from_accel(&raw.accel, fs, params.accel_cutoff, params.derivative_cutoff)?;

        let quat = filter.estimate(&raw.accel, &raw.gyro, Some(&raw.mag), fs);
        if quat.len() != n {
            return Err(KinError::LengthMismatch {
                field: "quat",
                expected: n,
                found: quat.len(),
            });
        }

        Ok(Self {
            fs,
            time,
            alt: raw_alt.clone(),
            alt_lpf: raw_alt_lpf.clone(),
            raw_alt,
            raw_alt_lpf,
            gyro_v,
            g_force,
            quat,
            offset: None,
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    fn sync_trace(&self, params: &SyncParams) -> &[f64] {
        if params.use_filtered_altitude {
            &self.raw_alt_lpf
        } else {
            &self.raw_alt
        }
    }

    /// Best (time, altitude) translation of the raw altitude onto the
    /// stitched ground truth, if any candidate overlaps it.
    pub fn identify_offset(&self, truth: &[GroundTruthTrack], params: &SyncParams) -> Result<Option<Offset>, KinError> {
        let (_, truth_alt) = truth::stitch(truth);
        sync::identify_offset(self.sync_trace(params), &truth_alt, self.fs, params)
    }

    /// Every evaluated offset cell, for inspection.
    pub fn offset_grid(&self, truth: &[GroundTruthTrack], params: &SyncParams) -> Result<OffsetGrid, KinError> {
        let (_, truth_alt) = truth::stitch(truth);
        sync::search_grid(self.sync_trace(params), &truth_alt, self.fs, params)
    }

    /// Shift time so the sample at `offset.time_offset` reads `truth_t0`,
    /// and remove the altitude offset. An offset can only be applied once.
    pub fn apply_offset(&mut self, offset: Offset, truth_t0: f64) -> Result<(), KinError> {
        if self.offset.is_some() {
            return Err(KinError::OffsetAlreadyApplied);
        }
        let Some(&anchor) = self.time.get(offset.time_offset) else {
            return Err(KinError::InvalidParameter(format!(
                "time offset {} beyond {} samples",
                offset.time_offset,
                self.len()
            )));
        };
        let shift = truth_t0 - anchor;
        for t in self.time.iter_mut() {
            *t += shift;
        }
        let a = offset.altitude_offset;
        self.alt = self.raw_alt.iter().map(|v| v - a).collect();
        self.alt_lpf = self.raw_alt_lpf.iter().map(|v| v - a).collect();
        self.offset = Some(offset);
        debug!("Applied offset: time {shift:.3} s, altitude {a:.2} m");
        Ok(())
    }

    /// Find and apply the offset. When the search finds none, the tile keeps
    /// its own clock and raw altitude.
    pub fn synchronize(&mut self, truth: &[GroundTruthTrack], params: &SyncParams) -> Result<Option<Offset>, KinError> {
        info!("Identifying timestamp and altitude offsets");
        let t0 = truth
            .iter()
            .find_map(|t| t.time.first().copied())
            .ok_or(KinError::EmptyGroundTruth)?;
        let Some(offset) = self.identify_offset(truth, params)? else {
            warn!("Tile left unsynchronized");
            return Ok(None);
        };
        self.apply_offset(offset, t0)?;
        Ok(Some(offset))
    }

    /// Geography, jumps, registrations, boot orientation and turns, in that
    /// order.
    pub fn kinematics(&self, params: &Params) -> Result<Kinematics, KinError> {
        let fs = self.fs;
        let geography = Geography::identify(&self.time, &self.alt_lpf, fs, &params.geography);
        let downhill = geography.downhill_ranges();

        info!("Identifying jumps");
        let jumps = jump::identify_jumps(self, &downhill, &params.jump, fs);

        let registrations = Registrations::identify(
            &geography.peak_ranges(),
            &self.time,
            &self.g_force.mg,
            &self.quat,
            &params.registration,
            fs,
        );
        let boot = BootOrientation::compute(
            &self.quat,
            &self.time,
            &registrations,
            fs,
            params.derivative_cutoff,
        )?;

        info!("Identifying turns");
        let turns = turn::identify_turns(&self.turn_signals(&boot), &downhill, &params.turn);

        Ok(Kinematics {
            geography,
            jumps,
            registrations,
            boot,
            turns,
        })
    }

    pub fn turn_signals<'a>(&'a self, boot: &'a BootOrientation) -> TurnSignals<'a> {
        TurnSignals {
            alt_lpf: &self.alt_lpf,
            mg_lpf: &self.g_force.mg_lpf,
            d_mg_lpf_dt: &self.g_force.d_mg_lpf_dt,
            d2_mg_lpf_dt2: &self.g_force.d2_mg_lpf_dt2,
            roll: &boot.roll,
            d_roll_dt: &boot.d_roll_dt,
        }
    }

    /// Trimmed copy of the motion signals over `range`.
    pub fn track(&self, range: Range) -> TileTrack {
        TileTrack {
            range,
            time: range.slice(&self.time).to_vec(),
            mg: range.slice(&self.g_force.mg).to_vec(),
            mg_lpf: range.slice(&self.g_force.mg_lpf).to_vec(),
            gyro_v: range.slice(&self.gyro_v).to_vec(),
        }
    }

    /// One view per ground-truth track overlapping the recording, bounded by
    /// the track's first and last timestamps. Meaningful once synchronized.
    pub fn tracks_for<'t>(&self, truth: &'t [GroundTruthTrack]) -> Vec<(&'t GroundTruthTrack, TileTrack)> {
        let half = 0.5 / self.fs;
        truth
            .iter()
            .filter_map(|gt| {
                let (first, last) = (*gt.time.first()?, *gt.time.last()?);
                let start = self.time.partition_point(|&t| t < first - half);
                let end = self.time.partition_point(|&t| t <= last + half);
                (end > start).then(|| (gt, self.track(Range::new(start, end))))
            })
            .collect()
    }
}

impl MotionSignals for Tile {
    fn time(&self) -> &[f64] {
        &self.time
    }

    fn mg(&self) -> &[f64] {
        &self.g_force.mg
    }

    fn mg_lpf(&self) -> &[f64] {
        &self.g_force.mg_lpf
    }

    fn gyro(&self) -> &[f64] {
        &self.gyro_v
    }
}

/// A section of the tile recording. `range` locates it in the parent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TileTrack {
    pub range: Range,
    pub time: Vec<f64>,
    pub mg: Vec<f64>,
    pub mg_lpf: Vec<f64>,
    pub gyro_v: Vec<f64>,
}

impl TileTrack {
    /// Jumps anywhere inside the track, indexed locally.
    pub fn identify_jumps(&self, params: &JumpParams, fs: f64) -> Vec<Jump> {
        jump::identify_jumps(self, &[Range::full(self.time.len())], params, fs)
    }

    pub fn to_parent(&self, idx: usize) -> usize {
        self.range.start + idx
    }
}

impl MotionSignals for TileTrack {
    fn time(&self) -> &[f64] {
        &self.time
    }

    fn mg(&self) -> &[f64] {
        &self.mg
    }

    fn mg_lpf(&self) -> &[f64] {
        &self.mg_lpf
    }

    fn gyro(&self) -> &[f64] {
        &self.gyro_v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orientation::GradientAhrs;
    use crate::truth::TrackKind;

    const FS: f64 = 100.0;

    fn raw_tile(n: usize, pressure: impl Fn(f64) -> f64) -> RawTile {
        let time_ms: Vec<f64> = (0..n).map(|i| i as f64 * 10.0).collect();
        let pres: Vec<f64> = (0..n).map(|i| pressure(i as f64 / FS)).collect();
        RawTile::new(
            time_ms,
            vec![[0.0, 0.0, 1000.0]; n],
            vec![[0.0; 3]; n],
            vec![[200.0, 0.0, 400.0]; n],
            pres,
            vec![-4.0; n],
            vec![60.0; n],
        )
        .unwrap()
    }

    #[test]
    fn test_length_mismatch_fails_fast() {
        let err = RawTile::new(
            vec![0.0, 10.0, 20.0],
            vec![[0.0; 3]; 3],
            vec![[0.0; 3]; 3],
            vec![[0.0; 3]; 3],
            vec![1000.0; 2],
            vec![0.0; 3],
            vec![0.0; 3],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            KinError::LengthMismatch {
                field: "pressure",
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn test_pressure_altitude() {
        assert!(pressure_altitude(1013.25).abs() < 1e-9);
        assert!((pressure_altitude(900.0) - 988.1).abs() < 1.0);
        assert!(pressure_altitude(800.0) > pressure_altitude(900.0));
    }

    #[test]
    fn test_processed_signals_of_resting_tile() {
        let raw = raw_tile(500, |_| 900.0);
        let tile = Tile::new(&raw, &GradientAhrs::default(), &Params::default()).unwrap();
        assert_eq!(tile.len(), 500);
        assert_eq!(tile.quat.len(), 500);
        assert!((tile.time[499] - 4.99).abs() < 1e-9);
        assert!(tile.g_force.mg_lpf.iter().all(|v| (v - 1000.0).abs() < 1e-6));
        assert!(tile.g_force.d_mg_lpf_dt.iter().all(|v| v.abs() < 1e-6));
        assert!(tile.gyro_v.iter().all(|&v| v == 0.0));
        assert_eq!(tile.alt, tile.raw_alt);
        assert!(tile.offset.is_none());
    }

    #[test]
    fn test_too_short_for_derivative() {
        let raw = raw_tile(4, |_| 900.0);
        assert!(matches!(
            Tile::new(&raw, &GradientAhrs::default(), &Params::default()),
            Err(KinError::SignalTooShort { .. })
        ));
    }

    #[test]
    fn test_offset_applies_once() {
        let raw = raw_tile(200, |_| 900.0);
        let mut tile = Tile::new(&raw, &GradientAhrs::default(), &Params::default()).unwrap();
        let offset = Offset {
            time_offset: 50,
            altitude_offset: 8.0,
        };
        tile.apply_offset(offset, 1_000.0).unwrap();
        assert!((tile.time[50] - 1_000.0).abs() < 1e-9);
        assert!((tile.time[0] - 999.5).abs() < 1e-9);
        assert!((tile.raw_alt[10] - tile.alt[10] - 8.0).abs() < 1e-9);
        assert!(matches!(
            tile.apply_offset(offset, 2_000.0),
            Err(KinError::OffsetAlreadyApplied)
        ));
        assert!((tile.time[50] - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_synchronize_recovers_offset_and_splits_tracks() {
        let raw = raw_tile(6000, |t| 900.0 + 1.5 * (t / 4.0).sin() + 0.8 * (t / 1.7).cos());
        let mut tile = Tile::new(&raw, &GradientAhrs::default(), &Params::default()).unwrap();

        // 1 Hz truth starting 2.5 s into the recording, 3 m below the tile
        let t0 = 1_675_242_000.0;
        let alt: Vec<f64> = (0..40).map(|k| tile.raw_alt_lpf[250 + 100 * k] - 3.0).collect();
        let time: Vec<f64> = (0..40).map(|k| t0 + k as f64).collect();
        let truth = vec![
            GroundTruthTrack::from_altitude(TrackKind::Lift, time[..20].to_vec(), alt[..20].to_vec()),
            GroundTruthTrack::from_altitude(TrackKind::Downhill, time[20..].to_vec(), alt[20..].to_vec()),
        ];
        let params = SyncParams {
            max_alt_m: 10.0,
            ..SyncParams::default()
        };
        let offset = tile.synchronize(&truth, &params).unwrap().unwrap();
        assert_eq!(offset.time_offset, 250);
        assert!((offset.altitude_offset - 3.0).abs() < 1e-6);
        assert!((tile.time[250] - t0).abs() < 1e-6);
        assert!((tile.alt_lpf[250] - truth[0].altitude[0]).abs() < 1e-6);

        let tracks = tile.tracks_for(&truth);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].0.kind, TrackKind::Lift);
        assert_eq!(tracks[0].1.range, Range::new(250, 2151));
        assert_eq!(tracks[1].1.range, Range::new(2250, 4151));
        assert_eq!(tracks[1].1.mg_lpf.len(), 1901);
        assert_eq!(tracks[1].1.to_parent(0), 2250);
    }

    #[test]
    fn test_flat_session_has_no_events() {
        let raw = raw_tile(2000, |_| 850.0);
        let params = Params::default();
        let session = crate::process_session(&raw, &[], &GradientAhrs::default(), &params).unwrap();
        assert!(session.offset.is_none());
        let k = &session.kinematics;
        assert!(k.geography.points.is_empty());
        assert!(k.jumps.is_empty());
        assert!(k.turns.is_empty());
        assert!(k.registrations.is_empty());
        assert_eq!(k.boot.roll.len(), 2000);
    }

    #[test]
    fn test_session_without_overlap_is_unsynchronized() {
        let raw = raw_tile(2000, |_| 850.0);
        let t0 = 1_675_242_000.0;
        let truth = vec![GroundTruthTrack::from_altitude(
            TrackKind::Downhill,
            (0..600).map(|k| t0 + k as f64).collect(),
            vec![1500.0; 600],
        )];
        // the 20 s tile never covers a minute of ground truth
        let mut params = Params::default();
        params.sync.min_overlap_s = 60.0;
        let session = crate::process_session(&raw, &truth, &GradientAhrs::default(), &params).unwrap();
        assert!(session.offset.is_none());
        assert!(session.tile.offset.is_none());
        assert_eq!(session.tile.alt, session.tile.raw_alt);
        assert!((session.tile.time[0]).abs() < 1e-9);
        assert_eq!(session.kinematics.boot.roll.len(), 2000);
        assert!(session.kinematics.jumps.is_empty());
    }

    #[test]
    fn test_track_jumps_use_local_indices() {
        let n = 300;
        let mut accel = vec![[0.0, 0.0, 1000.0]; n];
        for a in accel.iter_mut().take(170).skip(130) {
            *a = [0.0, 0.0, 100.0];
        }
        let raw = RawTile::new(
            (0..n).map(|i| i as f64 * 10.0).collect(),
            accel,
            vec![[0.0; 3]; n],
            vec![[0.0; 3]; n],
            vec![900.0; n],
            vec![0.0; n],
            vec![0.0; n],
        )
        .unwrap();
        let tile = Tile::new(&raw, &GradientAhrs::default(), &Params::default()).unwrap();
        let track = tile.track(Range::new(50, 280));
        let jumps = track.identify_jumps(&JumpParams::default(), FS);
        assert_eq!(jumps.len(), 1);
        let parent_min = track.to_parent(jumps[0].min_idx);
        assert!((130..170).contains(&parent_min), "min at {parent_min}");
    }
}
