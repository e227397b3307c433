use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tile_kinematics::features::{jump_header, jump_row, turn_header, turn_row};
use tile_kinematics::{
    parse_tracks, process_session, ErrorMetric, GradientAhrs, GroundTruthTrack, Offset, Params,
    PointKind, RawTile, Session, Tile, TrackKind, Vec3,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Jump and turn extraction from tile IMU logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline on one tile log and write feature CSVs
    Process(ProcessArgs),
    /// Process every session listed in a JSON manifest, in parallel
    Batch(BatchArgs),
    /// Only search the time/altitude offset against ground truth
    Sync(SyncArgs),
}

#[derive(Parser, Debug)]
struct CommonArgs {
    /// JSON file with detector parameters; missing keys keep their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Low-G threshold for jump candidates (mG)
    #[arg(long)]
    jump_threshold: Option<f64>,

    /// Compression threshold for turn candidates (d mG_lpf / dt)
    #[arg(long)]
    turn_threshold: Option<f64>,

    /// Offset search error metric
    #[arg(long, value_enum)]
    metric: Option<MetricOpt>,

    /// AHRS gain
    #[arg(long, default_value_t = 0.5)]
    ahrs_gain: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ProcessArgs {
    /// Tile CSV log
    #[arg(long, value_hint = ValueHint::FilePath)]
    tile: PathBuf,

    /// FIT/GPX ground-truth files, in recording order
    #[arg(long, num_args = 1.., value_hint = ValueHint::FilePath)]
    truth: Vec<PathBuf>,

    /// Directory receiving the feature CSVs and the summary
    #[arg(short, long, default_value = ".", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// JSON array of `{"tile": ..., "truth": [...]}` sessions
    #[arg(value_hint = ValueHint::FilePath)]
    manifest: PathBuf,

    /// Each session writes into `<out-dir>/<tile file stem>/`
    #[arg(short, long, default_value = "out", value_hint = ValueHint::DirPath)]
    out_dir: PathBuf,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Parser, Debug)]
struct SyncArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    tile: PathBuf,

    #[arg(long, required = true, num_args = 1.., value_hint = ValueHint::FilePath)]
    truth: Vec<PathBuf>,

    /// Write every evaluated grid cell as CSV (`-` for stdout)
    #[arg(long, value_hint = ValueHint::FilePath)]
    grid_out: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum MetricOpt {
    Mae,
    Mse,
}

impl From<MetricOpt> for ErrorMetric {
    fn from(value: MetricOpt) -> Self {
        match value {
            MetricOpt::Mae => ErrorMetric::Mae,
            MetricOpt::Mse => ErrorMetric::Mse,
        }
    }
}

#[derive(Deserialize, Debug)]
struct ManifestEntry {
    tile: PathBuf,
    #[serde(default)]
    truth: Vec<PathBuf>,
}

#[derive(Serialize, Debug)]
struct TrackSummary {
    kind: TrackKind,
    samples: usize,
    jumps: usize,
}

#[derive(Serialize, Debug)]
struct SessionSummary {
    tile: PathBuf,
    generated_at: String,
    params_hash: String,
    samples: usize,
    offset: Option<Offset>,
    lifts: usize,
    runs: usize,
    registrations: usize,
    jumps: usize,
    confident_jumps: usize,
    turns: usize,
    tracks: Vec<TrackSummary>,
    jumps_csv: PathBuf,
    turns_csv: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Process(args) => args.common.verbose,
        Command::Batch(args) => args.common.verbose,
        Command::Sync(args) => args.common.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Process(args) => handle_process(args),
        Command::Batch(args) => handle_batch(args),
        Command::Sync(args) => handle_sync(args),
    }
}

fn load_params(common: &CommonArgs) -> Result<Params> {
    let mut params = match common.config.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<Params>(&text)
                .with_context(|| format!("{} is not a valid parameter file", path.display()))?
        }
        None => Params::default(),
    };
    if let Some(th) = common.jump_threshold {
        params.jump.low_g_threshold_mg = th;
    }
    if let Some(th) = common.turn_threshold {
        params.turn.derivative_threshold = th;
    }
    if let Some(metric) = common.metric {
        params.sync.metric = metric.into();
    }
    params
        .validate()
        .map_err(|e| anyhow!("invalid parameters: {e}"))?;
    Ok(params)
}

fn handle_process(args: ProcessArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let filter = GradientAhrs {
        gain: args.common.ahrs_gain,
    };
    let summary = run_session(&args.tile, &args.truth, &args.out_dir, &params, &filter)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn handle_batch(args: BatchArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let filter = GradientAhrs {
        gain: args.common.ahrs_gain,
    };
    let text = fs::read_to_string(&args.manifest)
        .with_context(|| format!("failed to read {}", args.manifest.display()))?;
    let entries: Vec<ManifestEntry> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid manifest", args.manifest.display()))?;
    if entries.is_empty() {
        return Err(anyhow!("manifest lists no sessions"));
    }

    let t_batch = Instant::now();
    let summaries = entries
        .par_iter()
        .map(|entry| -> Result<SessionSummary> {
            let stem = entry
                .tile
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow!("tile path {} has no file name", entry.tile.display()))?;
            let out_dir = args.out_dir.join(stem);
            run_session(&entry.tile, &entry.truth, &out_dir, &params, &filter)
                .with_context(|| format!("session {} failed", entry.tile.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        "Batch finished: {} sessions, {} jumps, {} turns in {:.1} s",
        summaries.len(),
        summaries.iter().map(|s| s.jumps).sum::<usize>(),
        summaries.iter().map(|s| s.turns).sum::<usize>(),
        t_batch.elapsed().as_secs_f64()
    );
    let path = args.out_dir.join("batch-summary.json");
    write_json(&path, &summaries)
}

fn handle_sync(args: SyncArgs) -> Result<()> {
    let params = load_params(&args.common)?;
    let raw = read_tile_csv(&args.tile)?;
    let truth = load_truth(&args.truth, &params)?;
    let filter = GradientAhrs {
        gain: args.common.ahrs_gain,
    };
    let tile = Tile::new(&raw, &filter, &params)
        .with_context(|| format!("failed to process {}", args.tile.display()))?;

    let grid = tile.offset_grid(&truth, &params.sync)?;
    match grid.best(params.sync.metric) {
        Some(best) => println!(
            "time_offset_samples={} time_offset_s={:.2} altitude_offset_m={:.2} mae={:.3} mse={:.3}",
            best.time_offset,
            best.time_offset as f64 / params.sample_rate_hz,
            best.altitude_offset,
            best.mae,
            best.mse
        ),
        None => {
            warn!("No grid cell overlaps the ground truth");
            println!("no offset found");
        }
    }

    if let Some(path) = args.grid_out.as_ref() {
        let out: Box<dyn Write> = if path.as_os_str() == "-" {
            Box::new(io::stdout().lock())
        } else {
            Box::new(
                File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            )
        };
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(["time_offset", "altitude_offset_m", "mae", "mse"])?;
        for cell in grid.cells() {
            writer.write_record([
                cell.time_offset.to_string(),
                format!("{:.3}", cell.altitude_offset),
                format!("{:.3}", cell.mae),
                format!("{:.3}", cell.mse),
            ])?;
        }
        writer.flush()?;
    }
    Ok(())
}

fn run_session(
    tile_path: &Path,
    truth_paths: &[PathBuf],
    out_dir: &Path,
    params: &Params,
    filter: &GradientAhrs,
) -> Result<SessionSummary> {
    let t_session = Instant::now();
    let raw = read_tile_csv(tile_path)?;
    let truth = if truth_paths.is_empty() {
        warn!(
            "No ground truth for {}; altitude and time stay uncorrected",
            tile_path.display()
        );
        Vec::new()
    } else {
        load_truth(truth_paths, params)?
    };

    let session = process_session(&raw, &truth, filter, params)
        .with_context(|| format!("failed to process {}", tile_path.display()))?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    let date = truth
        .iter()
        .find_map(|t| t.date)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "undated".into());
    let jumps_csv = out_dir.join(format!(
        "tile-{date}-jumps-{}mG.csv",
        params.jump.low_g_threshold_mg
    ));
    let turns_csv = out_dir.join(format!(
        "tile-{date}-turns-{}d_mG_lpf_dt.csv",
        params.turn.derivative_threshold
    ));
    write_jump_csv(&session, params, &jumps_csv)?;
    write_turn_csv(&session, params, &turns_csv)?;

    let k = &session.kinematics;
    let tracks = session
        .tile
        .tracks_for(&truth)
        .into_iter()
        .map(|(gt, view)| TrackSummary {
            kind: gt.kind.clone(),
            samples: view.time.len(),
            jumps: if gt.kind == TrackKind::Downhill {
                view.identify_jumps(&params.jump, params.sample_rate_hz).len()
            } else {
                0
            },
        })
        .collect();
    let summary = SessionSummary {
        tile: tile_path.to_path_buf(),
        generated_at: Utc::now().to_rfc3339(),
        params_hash: params.hash()?,
        samples: session.tile.len(),
        offset: session.offset,
        lifts: k.geography.points_of(PointKind::LiftPeak).len(),
        runs: k.geography.downhill_ranges().len(),
        registrations: k.registrations.len(),
        jumps: k.jumps.len(),
        confident_jumps: k.jumps.iter().filter(|j| j.confidence() >= 50.0).count(),
        turns: k.turns.len(),
        tracks,
        jumps_csv,
        turns_csv,
    };
    write_json(&out_dir.join("summary.json"), &summary)?;
    info!(
        "{}: {} jumps, {} turns in {:.1} s",
        tile_path.display(),
        summary.jumps,
        summary.turns,
        t_session.elapsed().as_secs_f64()
    );
    Ok(summary)
}

fn load_truth(paths: &[PathBuf], params: &Params) -> Result<Vec<GroundTruthTrack>> {
    let mut tracks = Vec::new();
    for path in paths {
        let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let hint = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("fit");
        let parsed =
            parse_tracks(&data, hint).with_context(|| format!("failed to parse {}", path.display()))?;
        for track in parsed {
            tracks.push(track.resample(params.sync.truth_rate_hz)?);
        }
    }
    info!(
        "Loaded {} ground-truth tracks from {} files",
        tracks.len(),
        paths.len()
    );
    Ok(tracks)
}

const TILE_COLUMNS: usize = 13;

fn read_tile_csv(path: &Path) -> Result<RawTile> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    decode_tile(file).with_context(|| format!("failed to decode {}", path.display()))
}

/// Columns by position: time [ms], accel xyz [mG], gyro xyz [mdps], mag xyz
/// [mGauss], pressure [mB], temperature, humidity. The first row is a header.
fn decode_tile<R: Read>(input: R) -> Result<RawTile> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let mut time_ms = Vec::new();
    let (mut accel, mut gyro, mut mag) = (Vec::new(), Vec::new(), Vec::new());
    let (mut pressure, mut temperature, mut humidity) = (Vec::new(), Vec::new(), Vec::new());
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < TILE_COLUMNS {
            return Err(anyhow!(
                "row {} has {} columns, expected {}",
                line + 2,
                record.len(),
                TILE_COLUMNS
            ));
        }
        let mut v = [0.0; TILE_COLUMNS];
        for (k, slot) in v.iter_mut().enumerate() {
            *slot = record[k]
                .parse()
                .with_context(|| format!("row {}, column {}: '{}'", line + 2, k + 1, &record[k]))?;
        }
        let xyz = |k: usize| -> Vec3 { [v[k], v[k + 1], v[k + 2]] };
        time_ms.push(v[0]);
        accel.push(xyz(1));
        gyro.push(xyz(4));
        mag.push(xyz(7));
        pressure.push(v[10]);
        temperature.push(v[11]);
        humidity.push(v[12]);
    }
    if time_ms.is_empty() {
        return Err(anyhow!("tile log has no samples"));
    }
    Ok(RawTile::new(
        time_ms,
        accel,
        gyro,
        mag,
        pressure,
        temperature,
        humidity,
    )?)
}

fn write_jump_csv(session: &Session, params: &Params, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(jump_header())?;
    for jump in &session.kinematics.jumps {
        let row = jump_row(jump, &session.tile, params.jump.low_g_threshold_mg);
        writer.write_record(row.values())?;
    }
    writer.flush()?;
    Ok(())
}

fn write_turn_csv(session: &Session, params: &Params, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(turn_header())?;
    let signals = session.tile.turn_signals(&session.kinematics.boot);
    for turn in &session.kinematics.turns {
        let row = turn_row(turn, &signals, params.turn.derivative_threshold);
        writer.write_record(row.values())?;
    }
    writer.flush()?;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_tile_by_position() {
        let csv = "\
time,ax,ay,az,gx,gy,gz,mx,my,mz,pres,temp,hum
0, 1, 2, 1000, 10, 20, 30, 100, 200, 300, 850.5, -3.0, 60
10, 4, 5, 990, 11, 21, 31, 101, 201, 301, 850.4, -3.1, 61
";
        let raw = decode_tile(csv.as_bytes()).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw.time_ms, vec![0.0, 10.0]);
        assert_eq!(raw.accel[1], [4.0, 5.0, 990.0]);
        assert_eq!(raw.gyro[0], [10.0, 20.0, 30.0]);
        assert_eq!(raw.mag[1], [101.0, 201.0, 301.0]);
        assert_eq!(raw.pressure, vec![850.5, 850.4]);
        assert_eq!(raw.humidity[1], 61.0);
    }

    #[test]
    fn test_decode_tile_rejects_short_rows() {
        let csv = "time,ax\n0,1\n";
        let err = decode_tile(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("expected 13"), "{err}");
    }

    #[test]
    fn test_decode_tile_rejects_non_numeric() {
        let csv = "h1,h2,h3,h4,h5,h6,h7,h8,h9,h10,h11,h12,h13\n0,1,2,3,4,5,6,7,8,9,x,11,12\n";
        assert!(decode_tile(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_manifest_entries() {
        let entries: Vec<ManifestEntry> =
            serde_json::from_str(r#"[{"tile": "a.csv", "truth": ["a.gpx"]}, {"tile": "b.csv"}]"#)
                .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].truth.is_empty());
    }
}
