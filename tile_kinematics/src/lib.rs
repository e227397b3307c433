//! Kinematic event extraction for boot-worn IMU ("tile") recordings.
//!
//! The pipeline synchronizes the tile's barometric altitude with GPS ground
//! truth, segments the session into lift and run phases, then detects jumps
//! and turns inside the runs and scores each one with a battery of
//! statistical tests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

pub mod features;
pub mod geography;
pub mod jump;
pub mod orientation;
pub mod quat;
pub mod registration;
pub mod signal;
pub mod stat_tests;
pub mod sync;
pub mod tile;
pub mod truth;
pub mod turn;

pub use geography::{GeographicalPoint, Geography, GeographyParams, PointKind};
pub use jump::{AirPhaseMethod, Jump, JumpParams};
pub use orientation::{GradientAhrs, OrientationFilter, PrecomputedOrientation};
pub use quat::{Euler, Quat};
pub use registration::{BootOrientation, Registration, RegistrationParams, Registrations};
pub use signal::{FilterKind, Range, Vec3};
pub use stat_tests::{Scorecard, TestOutcome};
pub use sync::{ErrorMetric, Offset, OffsetGrid, SyncParams};
pub use tile::{GForce, Kinematics, MotionSignals, RawTile, Tile, TileTrack};
pub use truth::{parse_tracks, stitch, GroundTruthTrack, TrackKind};
pub use turn::{Turn, TurnParams, TurnSide};

/// Nominal tile sample rate. Window constants expressed in seconds are
/// converted with the configured rate, so changing it rescales them.
pub const SAMPLE_RATE_HZ: f64 = 100.0;

#[derive(Error, Debug)]
pub enum KinError {
    #[error("field `{field}` has {found} samples, expected {expected}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("signal too short: need at least {needed} samples, got {found}")]
    SignalTooShort { needed: usize, found: usize },
    #[error("ground truth contains no samples")]
    EmptyGroundTruth,
    #[error("offsets were already applied to this tile")]
    OffsetAlreadyApplied,
    #[error("insufficient data for {0}")]
    InsufficientData(&'static str),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unsupported ground-truth format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub sample_rate_hz: f64,
    /// Butterworth cutoffs as a fraction of Nyquist.
    pub altitude_cutoff: f64,
    pub accel_cutoff: f64,
    pub derivative_cutoff: f64,
    pub sync: SyncParams,
    pub geography: GeographyParams,
    pub jump: JumpParams,
    pub turn: TurnParams,
    pub registration: RegistrationParams,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            altitude_cutoff: 1.0 / 100.0,
            accel_cutoff: 3.0 / 100.0,
            derivative_cutoff: 2.0 / 100.0,
            sync: SyncParams::default(),
            geography: GeographyParams::default(),
            jump: JumpParams::default(),
            turn: TurnParams::default(),
            registration: RegistrationParams::default(),
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), KinError> {
        if !(self.sample_rate_hz > 0.0) {
            return Err(KinError::InvalidParameter(format!(
                "sample_rate_hz must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        for (name, wn) in [
            ("altitude_cutoff", self.altitude_cutoff),
            ("accel_cutoff", self.accel_cutoff),
            ("derivative_cutoff", self.derivative_cutoff),
        ] {
            if !(wn > 0.0 && wn < 1.0) {
                return Err(KinError::InvalidParameter(format!(
                    "{name} must lie in (0, 1), got {wn}"
                )));
            }
        }
        self.sync.validate()
    }

    /// Sha256 of the JSON form, identifying the detector configuration a
    /// feature file was produced with.
    pub fn hash(&self) -> Result<String, KinError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| KinError::InvalidParameter(e.to_string()))?;
        let digest = Sha256::digest(&bytes);
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// A fully processed recording session.
#[derive(Clone, Debug)]
pub struct Session {
    pub tile: Tile,
    pub offset: Option<Offset>,
    pub kinematics: Kinematics,
}

/// Run the whole pipeline: derive signals, synchronize against the ground
/// truth (when any is given), then segment and detect events.
pub fn process_session(
    raw: &RawTile,
    truth: &[GroundTruthTrack],
    filter: &dyn OrientationFilter,
    params: &Params,
) -> Result<Session, KinError> {
    params.validate()?;
    let mut tile = Tile::new(raw, filter, params)?;
    let offset = if truth.is_empty() {
        None
    } else {
        tile.synchronize(truth, &params.sync)?
    };
    let kinematics = tile.kinematics(params)?;
    info!(
        "Session processed: {} points, {} jumps, {} turns, {} registrations",
        kinematics.geography.points.len(),
        kinematics.jumps.len(),
        kinematics.turns.len(),
        kinematics.registrations.len()
    );
    Ok(Session {
        tile,
        offset,
        kinematics,
    })
}
