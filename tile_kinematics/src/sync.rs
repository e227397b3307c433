//! Exhaustive time x altitude alignment of the tile's barometric altitude
//! against ground-truth altitude.

use ndarray::Array2;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::signal;
use crate::KinError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorMetric {
    Mae,
    Mse,
}

impl Default for ErrorMetric {
    fn default() -> Self {
        ErrorMetric::Mae
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncParams {
    pub metric: ErrorMetric,
    pub time_step_s: f64,
    pub max_time_search_s: f64,
    pub alt_step_m: f64,
    pub min_alt_m: f64,
    pub max_alt_m: f64,
    /// Ground-truth sample rate; the tile trace is decimated to match it.
    pub truth_rate_hz: f64,
    pub use_filtered_altitude: bool,
    /// Shortest overlap a cell needs to be scored; at least one sample.
    pub min_overlap_s: f64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            metric: ErrorMetric::Mae,
            time_step_s: 0.1,
            max_time_search_s: 30.0,
            alt_step_m: 0.1,
            min_alt_m: 0.0,
            max_alt_m: 75.0,
            truth_rate_hz: 1.0,
            use_filtered_altitude: true,
            min_overlap_s: 0.0,
        }
    }
}

impl SyncParams {
    pub fn validate(&self) -> Result<(), KinError> {
        if !(self.time_step_s > 0.0) || !(self.alt_step_m > 0.0) || !(self.truth_rate_hz > 0.0) {
            return Err(KinError::InvalidParameter(
                "sync steps and truth rate must be positive".into(),
            ));
        }
        if self.max_time_search_s < 0.0 || self.max_alt_m < self.min_alt_m || self.min_overlap_s < 0.0 {
            return Err(KinError::InvalidParameter(format!(
                "empty sync search bounds: time {}, altitude [{}, {}]",
                self.max_time_search_s, self.min_alt_m, self.max_alt_m
            )));
        }
        Ok(())
    }
}

/// Translation aligning a tile recording with ground truth: the tile sample
/// at `time_offset` coincides with the first ground-truth sample, and
/// `altitude_offset` is subtracted from the tile altitude.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offset {
    pub time_offset: usize,
    pub altitude_offset: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub time_offset: usize,
    pub altitude_offset: f64,
    pub mae: f64,
    pub mse: f64,
}

/// Every evaluated (time, altitude) cell. Rows follow `time_offsets`,
/// columns follow `altitude_offsets`; cells without enough overlap hold
/// infinity.
#[derive(Clone, Debug)]
pub struct OffsetGrid {
    pub time_offsets: Vec<usize>,
    pub altitude_offsets: Vec<f64>,
    pub mae: Array2<f64>,
    pub mse: Array2<f64>,
}

impl OffsetGrid {
    pub fn cells(&self) -> impl Iterator<Item = GridCell> + '_ {
        self.mae.indexed_iter().map(move |((i, j), &mae)| GridCell {
            time_offset: self.time_offsets[i],
            altitude_offset: self.altitude_offsets[j],
            mae,
            mse: self.mse[[i, j]],
        })
    }

    /// The cell minimizing `metric`; the earliest one on ties.
    pub fn best(&self, metric: ErrorMetric) -> Option<GridCell> {
        let errors = match metric {
            ErrorMetric::Mae => &self.mae,
            ErrorMetric::Mse => &self.mse,
        };
        let ((i, j), _) = errors
            .indexed_iter()
            .filter(|(_, e)| e.is_finite())
            .min_by_key(|((i, j), e)| (OrderedFloat(**e), *i, *j))?;
        Some(GridCell {
            time_offset: self.time_offsets[i],
            altitude_offset: self.altitude_offsets[j],
            mae: self.mae[[i, j]],
            mse: self.mse[[i, j]],
        })
    }
}

/// Evaluate the full grid. The tile trace (sampled at `fs`) is decimated to
/// the ground-truth rate starting at each candidate time offset and compared
/// over the overlapping length. An empty tile trace yields a grid with no
/// scored cell.
pub fn search_grid(
    tile_alt: &[f64],
    truth_alt: &[f64],
    fs: f64,
    params: &SyncParams,
) -> Result<OffsetGrid, KinError> {
    params.validate()?;
    if truth_alt.is_empty() {
        return Err(KinError::EmptyGroundTruth);
    }
    let stride = signal::seconds_to_samples(1.0 / params.truth_rate_hz, fs).max(1);
    let time_stride = signal::seconds_to_samples(params.time_step_s, fs).max(1);
    let time_steps = (params.max_time_search_s / params.time_step_s + 1e-9).floor() as usize;
    let time_offsets: Vec<usize> = (0..=time_steps).map(|k| k * time_stride).collect();
    let min_overlap = ((params.min_overlap_s * params.truth_rate_hz).ceil() as usize).max(1);

    let alt_steps = ((params.max_alt_m - params.min_alt_m) / params.alt_step_m + 1e-9).floor()
        as usize;
    let altitude_offsets: Vec<f64> = (0..=alt_steps)
        .map(|k| params.min_alt_m + k as f64 * params.alt_step_m)
        .collect();

    let mut mae = Array2::from_elem((time_offsets.len(), altitude_offsets.len()), f64::INFINITY);
    let mut mse = mae.clone();

    let mut shifted = Vec::with_capacity(truth_alt.len());
    for (i, &t0) in time_offsets.iter().enumerate() {
        let decimated: Vec<f64> = tile_alt.iter().skip(t0).step_by(stride).copied().collect();
        let n = decimated.len().min(truth_alt.len());
        if n < min_overlap {
            continue;
        }
        let truth = &truth_alt[..n];
        for (j, &a) in altitude_offsets.iter().enumerate() {
            shifted.clear();
            shifted.extend(decimated[..n].iter().map(|v| v - a));
            mae[[i, j]] = signal::mae(&shifted, truth);
            mse[[i, j]] = signal::mse(&shifted, truth);
        }
    }

    debug!(
        "Offset grid: {} time x {} altitude cells, decimation stride {}",
        time_offsets.len(),
        altitude_offsets.len(),
        stride
    );
    Ok(OffsetGrid {
        time_offsets,
        altitude_offsets,
        mae,
        mse,
    })
}

/// The best offset, or `None` when no cell overlaps the ground truth
/// enough to be scored. Malformed input is an error.
pub fn identify_offset(
    tile_alt: &[f64],
    truth_alt: &[f64],
    fs: f64,
    params: &SyncParams,
) -> Result<Option<Offset>, KinError> {
    let grid = search_grid(tile_alt, truth_alt, fs, params)?;
    let Some(best) = grid.best(params.metric) else {
        warn!(
            "No offset found: no cell overlaps {} ground-truth samples",
            truth_alt.len()
        );
        return Ok(None);
    };
    info!(
        "Offset found: {} samples, {:.2} m (mae {:.3}, mse {:.3})",
        best.time_offset, best.altitude_offset, best.mae, best.mse
    );
    Ok(Some(Offset {
        time_offset: best.time_offset,
        altitude_offset: best.altitude_offset,
    }))
}
