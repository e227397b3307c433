//! GPS ground-truth tracks: loading from FIT/GPX and stitching into the
//! single altitude trace the offset search runs against.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::KinError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const SEMICIRCLES_TO_DEG: f64 = 180.0 / 2_147_483_648.0;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    #[default]
    Downhill,
    Lift,
    Walk,
    Hold,
    Other(String),
}

impl TrackKind {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "downhill" | "run" | "ski" | "alpine_skiing" => TrackKind::Downhill,
            "lift" | "chairlift" | "gondola" => TrackKind::Lift,
            "walk" | "walking" => TrackKind::Walk,
            "hold" | "pause" => TrackKind::Hold,
            _ => TrackKind::Other(label.trim().to_string()),
        }
    }
}

/// One recorded track. Vectors are parallel; `time` is unix seconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthTrack {
    pub kind: TrackKind,
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub duration_s: f64,
    pub length_m: f64,
    pub time: Vec<f64>,
    pub distance: Vec<f64>,
    pub speed: Vec<f64>,
    pub altitude: Vec<f64>,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    pub course: Option<Vec<f64>>,
    pub variance: Option<Vec<f64>>,
}

impl GroundTruthTrack {
    /// A track carrying only time and altitude.
    pub fn from_altitude(kind: TrackKind, time: Vec<f64>, altitude: Vec<f64>) -> Self {
        let n = time.len();
        let mut track = Self {
            kind,
            time,
            altitude,
            distance: vec![0.0; n],
            speed: vec![0.0; n],
            latitude: vec![0.0; n],
            longitude: vec![0.0; n],
            ..Self::default()
        };
        track.update_summary();
        track
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    fn update_summary(&mut self) {
        self.duration_s = match (self.time.first(), self.time.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        };
        self.length_m = self.distance.last().copied().unwrap_or(0.0);
        if let Some(dt) = self.time.first().and_then(|&t| unix_to_utc(t)) {
            self.date = Some(dt.date_naive());
            self.start = Some(dt.time());
        }
    }

    /// Linear resampling onto a regular grid starting at the first sample.
    pub fn resample(&self, rate_hz: f64) -> Result<Self, KinError> {
        if !(rate_hz > 0.0) {
            return Err(KinError::InvalidParameter(format!(
                "resample rate must be positive, got {rate_hz}"
            )));
        }
        let (Some(&t0), Some(&t1)) = (self.time.first(), self.time.last()) else {
            return Err(KinError::EmptyGroundTruth);
        };
        let steps = ((t1 - t0) * rate_hz + 1e-9).floor() as usize;
        let grid: Vec<f64> = (0..=steps).map(|k| t0 + k as f64 / rate_hz).collect();
        let at = |y: &[f64]| -> Vec<f64> { grid.iter().map(|&t| interpolate(&self.time, y, t)).collect() };
        let mut out = Self {
            kind: self.kind.clone(),
            distance: at(&self.distance),
            speed: at(&self.speed),
            altitude: at(&self.altitude),
            latitude: at(&self.latitude),
            longitude: at(&self.longitude),
            course: self.course.as_deref().map(at),
            variance: self.variance.as_deref().map(at),
            time: grid,
            ..Self::default()
        };
        out.update_summary();
        Ok(out)
    }
}

fn unix_to_utc(t: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((t * 1000.0).round() as i64)
}

/// `y` at `t` over sorted `xs`, clamped at the ends.
fn interpolate(xs: &[f64], y: &[f64], t: f64) -> f64 {
    let n = xs.len().min(y.len());
    if n == 0 {
        return f64::NAN;
    }
    let i = xs[..n].partition_point(|&x| x <= t);
    if i == 0 {
        return y[0];
    }
    if i >= n {
        return y[n - 1];
    }
    let (x0, x1) = (xs[i - 1], xs[i]);
    if x1 <= x0 {
        return y[i - 1];
    }
    y[i - 1] + (y[i] - y[i - 1]) * (t - x0) / (x1 - x0)
}

/// Concatenate the tracks' time and altitude in track order.
pub fn stitch(tracks: &[GroundTruthTrack]) -> (Vec<f64>, Vec<f64>) {
    let time = tracks.iter().flat_map(|t| t.time.iter().copied()).collect();
    let altitude = tracks.iter().flat_map(|t| t.altitude.iter().copied()).collect();
    (time, altitude)
}

/// Parse ground truth from bytes using the provided format hint (extension
/// or file name).
pub fn parse_tracks(input: &[u8], format: &str) -> Result<Vec<GroundTruthTrack>, KinError> {
    let format_lc = format.to_ascii_lowercase();
    let tracks = if format_lc.ends_with(".fit") || format_lc == "fit" {
        parse_fit_tracks(input)?
    } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
        parse_gpx_tracks(input)?
    } else {
        return Err(KinError::UnsupportedFormat(format.to_string()));
    };
    let tracks: Vec<GroundTruthTrack> = tracks.into_iter().filter(|t| !t.is_empty()).collect();
    if tracks.is_empty() {
        return Err(KinError::EmptyGroundTruth);
    }
    debug!(
        "Parsed {} ground-truth tracks ({} samples)",
        tracks.len(),
        tracks.iter().map(GroundTruthTrack::len).sum::<usize>()
    );
    Ok(tracks)
}

/// Accumulates samples of one track, filling distance and speed from the
/// positions when the source lacks them.
#[derive(Default)]
struct TrackBuilder {
    track: GroundTruthTrack,
    last_fix: Option<(f64, f64)>,
    cumulative: f64,
}

struct Sample {
    time: f64,
    altitude: Option<f64>,
    position: Option<(f64, f64)>,
    distance: Option<f64>,
    speed: Option<f64>,
}

impl TrackBuilder {
    fn new(kind: TrackKind) -> Self {
        Self {
            track: GroundTruthTrack {
                kind,
                ..GroundTruthTrack::default()
            },
            ..Self::default()
        }
    }

    fn push(&mut self, s: Sample) {
        let t = &mut self.track;
        let (lat, lon) = s
            .position
            .or(self.last_fix)
            .unwrap_or((f64::NAN, f64::NAN));
        if let (Some((a, b)), Some((c, d))) = (self.last_fix, s.position) {
            self.cumulative += haversine_distance(a, b, c, d);
        }
        let distance = s.distance.unwrap_or(self.cumulative);
        let speed = s.speed.unwrap_or_else(|| {
            match (t.time.last(), t.distance.last()) {
                (Some(&t0), Some(&d0)) if s.time > t0 => (distance - d0) / (s.time - t0),
                _ => 0.0,
            }
        });
        let altitude = s
            .altitude
            .or(t.altitude.last().copied())
            .unwrap_or(f64::NAN);

        t.time.push(s.time);
        t.altitude.push(altitude);
        t.latitude.push(lat);
        t.longitude.push(lon);
        t.distance.push(distance);
        t.speed.push(speed);
        if s.position.is_some() {
            self.last_fix = s.position;
        }
    }

    fn finish(mut self) -> GroundTruthTrack {
        let missing = self.track.altitude.iter().filter(|a| a.is_nan()).count();
        if missing > 0 {
            warn!("{missing} ground-truth samples precede the first altitude fix");
            if let Some(first) = self.track.altitude.iter().copied().find(|a| !a.is_nan()) {
                for a in self.track.altitude.iter_mut().take_while(|a| a.is_nan()) {
                    *a = first;
                }
            }
        }
        self.track.update_summary();
        self.track
    }
}

fn parse_fit_tracks(input: &[u8]) -> Result<Vec<GroundTruthTrack>, KinError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let records = from_bytes(input).map_err(|e| KinError::FitParse(e.to_string()))?;

    let mut kind = TrackKind::default();
    let mut builder: Option<TrackBuilder> = None;
    for record in records.into_iter() {
        match record.kind() {
            MesgNum::Sport | MesgNum::Session => {
                if let Some(sport) = record
                    .fields()
                    .iter()
                    .find(|f| f.name() == "sport")
                    .map(|f| f.value().to_string())
                {
                    kind = TrackKind::from_label(&sport);
                }
                continue;
            }
            MesgNum::Record => {}
            _ => continue,
        }
        let mut timestamp: Option<f64> = None;
        let mut lat: Option<f64> = None;
        let mut lon: Option<f64> = None;
        let mut sample = Sample {
            time: 0.0,
            altitude: None,
            position: None,
            distance: None,
            speed: None,
        };
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.timestamp_millis() as f64 / 1000.0);
                    }
                }
                "altitude" | "enhanced_altitude" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        sample.altitude = Some(val);
                    }
                }
                "position_lat" => lat = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEG),
                "position_long" => lon = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLES_TO_DEG),
                "distance" | "enhanced_distance" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        sample.distance = Some(val);
                    }
                }
                "speed" | "enhanced_speed" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        sample.speed = Some(val);
                    }
                }
                _ => {}
            }
        }
        let Some(time) = timestamp else {
            continue;
        };
        sample.time = time;
        sample.position = lat.zip(lon);
        builder
            .get_or_insert_with(|| TrackBuilder::new(TrackKind::default()))
            .push(sample);
    }

    Ok(builder
        .map(|b| {
            let mut track = b.finish();
            track.kind = kind;
            vec![track]
        })
        .unwrap_or_default())
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_tracks(input: &[u8]) -> Result<Vec<GroundTruthTrack>, KinError> {
    use gpx::read;
    use std::io::Cursor;

    let gpx = read(Cursor::new(input)).map_err(|e| KinError::GpxParse(e.to_string()))?;
    let mut out = Vec::with_capacity(gpx.tracks.len());
    for track in gpx.tracks {
        let label = track.type_.as_deref().or(track.name.as_deref()).unwrap_or("");
        let kind = if label.is_empty() {
            TrackKind::default()
        } else {
            TrackKind::from_label(label)
        };
        let mut builder = TrackBuilder::new(kind);
        for point in track.segments.into_iter().flat_map(|s| s.points) {
            let Some(time) = point.time else {
                continue;
            };
            let iso = time.format().map_err(|e| KinError::GpxParse(e.to_string()))?;
            let utc = DateTime::parse_from_rfc3339(&iso)
                .map_err(|e| KinError::GpxParse(e.to_string()))?
                .with_timezone(&Utc);
            let geo = point.point();
            builder.push(Sample {
                time: utc.timestamp_millis() as f64 / 1000.0,
                altitude: point.elevation,
                position: Some((geo.y(), geo.x())),
                distance: None,
                speed: None,
            });
        }
        out.push(builder.finish());
    }
    Ok(out)
}

fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}
