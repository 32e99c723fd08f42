use std::fs;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use minisector::{
    compare_laps, resolve_driver, Comparison, Driver, Lap, Params, ResolvedDriver, Session,
    SessionKey, SessionKind, TelemetryStream, DEFAULT_MINISECTORS,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod render;

use render::{render_track_map_guard, ChartKind, TrackMapOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Minisector lap comparison CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare two drivers' fastest laps minisector by minisector
    Compare(CompareArgs),
    /// List the drivers and fastest laps available in a session
    Drivers(DriversArgs),
}

#[derive(Parser, Debug, Default)]
struct CompareArgs {
    /// Season year (prompted when omitted)
    #[arg(long)]
    year: Option<u16>,

    /// Track name, e.g. "Monza" (prompted when omitted)
    #[arg(long)]
    track: Option<String>,

    /// Session type (prompted when omitted)
    #[arg(long, value_enum, ignore_case = true)]
    session: Option<SessionOpt>,

    /// First driver: abbreviation or car number
    #[arg(long)]
    driver1: Option<String>,

    /// Second driver: abbreviation or car number
    #[arg(long)]
    driver2: Option<String>,

    /// Root directory holding <year>/<track>/<session>/ data
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Number of equal-length minisectors
    #[arg(
        long,
        default_value_t = DEFAULT_MINISECTORS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    minisectors: u32,

    /// Output PNG path (defaults to <year>_<driver1>_<driver2>.png)
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Write annotated samples as CSV (`-` for stdout)
    #[arg(long, value_hint = ValueHint::FilePath)]
    csv: Option<PathBuf>,

    /// Write a JSON minisector summary
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Directory for the parsed-session cache
    #[arg(long, default_value = ".cache/sessions", value_hint = ValueHint::DirPath)]
    cache_dir: PathBuf,

    /// Skip the parsed-session cache
    #[arg(long, action = ArgAction::SetTrue)]
    no_cache: bool,

    /// Image width in pixels
    #[arg(long, default_value_t = 1800)]
    width: u32,

    /// Image height in pixels
    #[arg(long, default_value_t = 1000)]
    height: u32,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct DriversArgs {
    #[arg(long)]
    year: u16,

    #[arg(long)]
    track: String,

    #[arg(long, value_enum, ignore_case = true)]
    session: SessionOpt,

    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    data_dir: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SessionOpt {
    #[value(name = "FP1")]
    Fp1,
    #[value(name = "FP2")]
    Fp2,
    #[value(name = "FP3")]
    Fp3,
    #[value(name = "Q")]
    Q,
    #[value(name = "R")]
    R,
}

impl From<SessionOpt> for SessionKind {
    fn from(value: SessionOpt) -> Self {
        match value {
            SessionOpt::Fp1 => SessionKind::Fp1,
            SessionOpt::Fp2 => SessionKind::Fp2,
            SessionOpt::Fp3 => SessionKind::Fp3,
            SessionOpt::Q => SessionKind::Qualifying,
            SessionOpt::R => SessionKind::Race,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Compare(args) => args.verbose,
        Command::Drivers(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Compare(args) => handle_compare(args),
        Command::Drivers(args) => handle_drivers(args),
    }
}

#[derive(Clone, Debug, PartialEq)]
struct CompareInputs {
    key: SessionKey,
    driver1: String,
    driver2: String,
}

/// Fill in anything not given on the command line by prompting.
fn collect_inputs<R: BufRead, W: Write>(
    args: &CompareArgs,
    input: &mut R,
    out: &mut W,
) -> Result<CompareInputs> {
    let year = match args.year {
        Some(year) => year,
        None => {
            let text = prompt(input, out, "Enter the year")?;
            text.parse::<u16>()
                .with_context(|| format!("invalid year '{}'", text))?
        }
    };
    let track = match args.track.as_ref() {
        Some(track) => track.clone(),
        None => prompt(input, out, "Enter the track name")?,
    };
    let kind: SessionKind = match args.session {
        Some(opt) => opt.into(),
        None => prompt(input, out, "Enter the session type (FP1/FP2/FP3/Q/R)")?.parse()?,
    };
    if args.driver1.is_none() || args.driver2.is_none() {
        writeln!(
            out,
            "Please enter the driver's abbreviation (e.g., 'LEC' for Charles Leclerc, 'VER' for Max Verstappen)"
        )?;
    }
    let driver1 = match args.driver1.as_ref() {
        Some(d) => d.clone(),
        None => prompt(input, out, "Enter first driver's number or name")?,
    };
    let driver2 = match args.driver2.as_ref() {
        Some(d) => d.clone(),
        None => prompt(input, out, "Enter second driver's number or name")?,
    };

    Ok(CompareInputs {
        key: SessionKey::new(year, track.trim(), kind),
        driver1: driver1.trim().to_ascii_uppercase(),
        driver2: driver2.trim().to_ascii_uppercase(),
    })
}

fn prompt<R: BufRead, W: Write>(input: &mut R, out: &mut W, label: &str) -> Result<String> {
    write!(out, "{}: ", label)?;
    out.flush()?;
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    if read == 0 {
        bail!("input closed while waiting for: {}", label);
    }
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("no value entered for: {}", label);
    }
    Ok(value)
}

fn handle_compare(args: CompareArgs) -> Result<()> {
    let inputs = {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut stderr = io::stderr();
        collect_inputs(&args, &mut input, &mut stderr)?
    };
    let params = Params {
        minisector_count: args.minisectors,
    };

    let t_load = Instant::now();
    let dir = inputs.key.dir(&args.data_dir);
    let cache_dir = if args.no_cache {
        None
    } else {
        Some(args.cache_dir.as_path())
    };
    let session = load_session(&dir, cache_dir)?;
    if args.verbose {
        info!(
            "Load stage: {:.1} ms",
            t_load.elapsed().as_secs_f64() * 1000.0
        );
    }

    let drivers = [
        resolve_driver(&session, &inputs.driver1),
        resolve_driver(&session, &inputs.driver2),
    ];
    if drivers[0].key() == drivers[1].key() {
        warn!("Comparing {} against itself", drivers[0]);
    }
    let laps = [
        session.fastest_lap(&drivers[0]),
        session.fastest_lap(&drivers[1]),
    ];
    let streams = fastest_streams(&session, &drivers, &inputs.key)?;

    let t_compute = Instant::now();
    let comparison = compare_laps(&streams[0].samples, &streams[1].samples, &params)
        .context("minisector comparison failed")?;
    if args.verbose {
        info!(
            "Compute stage: {:.1} ms ({} samples)",
            t_compute.elapsed().as_secs_f64() * 1000.0,
            comparison.samples.len()
        );
    }
    let labels = [drivers[0].key().to_string(), drivers[1].key().to_string()];
    log_winner_summary(&comparison, &labels);

    if let Some(path) = args.csv.as_ref() {
        if path.as_os_str() == "-" {
            write_samples_stdout(&comparison, &labels)?;
        } else {
            write_samples_csv(&comparison, &labels, path)?;
            info!("Wrote samples CSV: {}", path.display());
        }
    }

    if let Some(path) = args.summary.as_ref() {
        let summary = build_summary(&inputs.key, &drivers, &laps, &comparison, Utc::now());
        write_summary(&summary, path)?;
        info!("Wrote summary: {}", path.display());
    }

    if !args.no_plot {
        let opts = TrackMapOptions {
            width: args.width,
            height: args.height,
            title: format!(
                "{} - {} vs {} fastest laps",
                inputs.key, labels[0], labels[1]
            ),
            labels: labels.clone(),
            wins: [
                comparison.minisectors_won(Driver::A),
                comparison.minisectors_won(Driver::B),
            ],
        };
        let png_path = args
            .png
            .clone()
            .unwrap_or_else(|| default_png_path(&inputs));
        let t_plot = Instant::now();
        let mut targets = vec![(png_path, ChartKind::Png)];
        if let Some(svg) = args.svg.as_ref() {
            targets.push((svg.clone(), ChartKind::Svg));
        }
        for (path, kind) in targets {
            match render_track_map_guard(&comparison.samples, &path, kind, &opts) {
                Ok(()) => info!("Wrote plot: {}", path.display()),
                Err(err) => warn!("Skipping render ({}): {}", path.display(), err),
            }
        }
        if args.verbose {
            info!(
                "Plot stage: {:.1} ms",
                t_plot.elapsed().as_secs_f64() * 1000.0
            );
        }
    }

    Ok(())
}

/// Fastest-lap telemetry per driver. A driver without a valid lap gets an
/// empty stream; having no data for either driver is an error.
fn fastest_streams(
    session: &Session,
    drivers: &[ResolvedDriver; 2],
    key: &SessionKey,
) -> Result<Vec<TelemetryStream>> {
    let streams: Vec<TelemetryStream> = drivers
        .iter()
        .map(|driver| match session.fastest_lap(driver) {
            Some(lap) => {
                debug!(
                    "{}: fastest lap {} ({:.3} s)",
                    driver,
                    lap.lap_number,
                    lap.lap_time_s.unwrap_or(0.0)
                );
                session.lap_telemetry(lap)
            }
            None => {
                warn!("No fastest lap data for {}", driver);
                TelemetryStream::new(driver.key(), Vec::new())
            }
        })
        .collect();
    if streams.iter().all(|s| s.is_empty()) {
        return Err(anyhow!(
            "no fastest-lap telemetry for {} or {} in {}",
            drivers[0],
            drivers[1],
            key
        ));
    }
    Ok(streams)
}

fn handle_drivers(args: DriversArgs) -> Result<()> {
    let key = SessionKey::new(args.year, args.track.trim(), args.session.into());
    let session = load_session(&key.dir(&args.data_dir), None)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", key)?;
    for info in &session.drivers {
        let resolved = ResolvedDriver::Known(info.clone());
        let laps = session.laps_for(&resolved).len();
        let fastest = session
            .fastest_lap(&resolved)
            .and_then(|lap| lap.lap_time_s.map(|t| (lap.lap_number, t)));
        let fastest = match fastest {
            Some((lap, t)) => format!("lap {} {}", lap, format_lap_time(t)),
            None => "no valid lap".to_string(),
        };
        writeln!(
            out,
            "  {:<4} #{:<3} {:<24} {:>3} laps  {}",
            info.abbreviation,
            info.number.as_deref().unwrap_or("-"),
            info.team.as_deref().unwrap_or(""),
            laps,
            fastest
        )?;
    }
    Ok(())
}

fn load_session(dir: &Path, cache_dir: Option<&Path>) -> Result<Session> {
    let paths = Session::files(dir);
    let key = match cache_dir {
        Some(cache_dir) => {
            let _ = fs::create_dir_all(cache_dir);
            match cache_key(&paths) {
                Ok(key) => {
                    if let Some(cached) = read_cache(cache_dir, &key) {
                        debug!("Using cached session {}", key);
                        return Ok(cached);
                    }
                    Some(key)
                }
                Err(err) => {
                    debug!("Session cache unavailable: {}", err);
                    None
                }
            }
        }
        None => None,
    };

    let session =
        Session::load(dir).with_context(|| format!("failed to load session {}", dir.display()))?;

    if let (Some(cache_dir), Some(key)) = (cache_dir, key) {
        // Best-effort cache write
        if let Err(err) = write_cache(cache_dir, &key, &session) {
            debug!("Skipping session cache write: {}", err);
        }
    }
    Ok(session)
}

fn cache_key(paths: &[PathBuf]) -> Result<String> {
    use std::time::SystemTime;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for path in paths {
        let meta =
            fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let dur = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        path.to_string_lossy().hash(&mut hasher);
        meta.len().hash(&mut hasher);
        (dur.as_secs(), dur.subsec_nanos()).hash(&mut hasher);
    }
    Ok(format!("{:016x}", hasher.finish()))
}

fn read_cache(dir: &Path, key: &str) -> Option<Session> {
    let path = dir.join(format!("{}.json", key));
    let text = fs::read_to_string(&path).ok()?;
    serde_json::from_str(&text).ok()
}

fn write_cache(dir: &Path, key: &str, session: &Session) -> Result<()> {
    let path = dir.join(format!("{}.json", key));
    let text = serde_json::to_string(session)?;
    fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn default_png_path(inputs: &CompareInputs) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}_{}.png",
        inputs.key.year, inputs.driver1, inputs.driver2
    ))
}

fn format_lap_time(seconds: f64) -> String {
    let minutes = (seconds / 60.0).floor();
    format!("{}:{:06.3}", minutes as u64, seconds - minutes * 60.0)
}

fn log_winner_summary(comparison: &Comparison, labels: &[String; 2]) {
    let total = comparison.winners.len();
    info!(
        "{} fastest in {}/{} minisectors, {} in {}/{} (minisector length {:.1} m)",
        labels[0],
        comparison.minisectors_won(Driver::A),
        total,
        labels[1],
        comparison.minisectors_won(Driver::B),
        total,
        comparison.minisector_length
    );
    for (minisector, winner) in &comparison.winners {
        debug!(
            "minisector {:>2}: {} ({} {}, {} {})",
            minisector,
            labels[winner.index()],
            labels[0],
            fmt_speed(comparison.mean_speed(*minisector, Driver::A)),
            labels[1],
            fmt_speed(comparison.mean_speed(*minisector, Driver::B)),
        );
    }
}

fn fmt_speed(speed: Option<f64>) -> String {
    speed
        .map(|v| format!("{:.1}", v))
        .unwrap_or_else(|| "n/a".into())
}

fn write_samples_stdout(comparison: &Comparison, labels: &[String; 2]) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_sample_rows(comparison, labels, &mut writer)
}

fn write_samples_csv(comparison: &Comparison, labels: &[String; 2], path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_sample_rows(comparison, labels, &mut writer)
}

fn write_sample_rows<W: Write>(
    comparison: &Comparison,
    labels: &[String; 2],
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "distance",
        "x",
        "y",
        "speed",
        "driver",
        "minisector",
        "winner",
    ])?;
    for s in &comparison.samples {
        writer.write_record([
            format!("{:.3}", s.distance),
            format!("{:.3}", s.x),
            format!("{:.3}", s.y),
            format!("{:.3}", s.speed),
            labels[s.driver.index()].clone(),
            s.minisector.to_string(),
            labels[s.winner.index()].clone(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Clone, Debug, Serialize)]
struct Summary {
    session: SessionKey,
    generated_at: DateTime<Utc>,
    minisector_count: u32,
    total_distance_m: f64,
    minisector_length_m: f64,
    drivers: Vec<DriverSummary>,
    minisectors: Vec<MinisectorSummary>,
}

#[derive(Clone, Debug, Serialize)]
struct DriverSummary {
    driver: String,
    number: Option<String>,
    lap_number: Option<u32>,
    lap_time_s: Option<f64>,
    minisectors_won: usize,
}

#[derive(Clone, Debug, Serialize)]
struct MinisectorSummary {
    minisector: u32,
    start_m: f64,
    end_m: f64,
    mean_speeds: [Option<f64>; 2],
    winner: String,
}

fn build_summary(
    key: &SessionKey,
    drivers: &[ResolvedDriver; 2],
    laps: &[Option<&Lap>; 2],
    comparison: &Comparison,
    generated_at: DateTime<Utc>,
) -> Summary {
    let slots = [Driver::A, Driver::B];
    let driver_summaries = slots
        .iter()
        .map(|&slot| {
            let driver = &drivers[slot.index()];
            let lap = laps[slot.index()];
            DriverSummary {
                driver: driver.key().to_string(),
                number: driver.number().map(str::to_string),
                lap_number: lap.map(|l| l.lap_number),
                lap_time_s: lap.and_then(|l| l.lap_time_s),
                minisectors_won: comparison.minisectors_won(slot),
            }
        })
        .collect();

    let len = comparison.minisector_length;
    let minisectors = comparison
        .winners
        .iter()
        .map(|(&minisector, &winner)| {
            let start_m = (minisector - 1) as f64 * len;
            let end_m = if minisector == comparison.minisector_count {
                comparison.total_distance
            } else {
                minisector as f64 * len
            };
            MinisectorSummary {
                minisector,
                start_m,
                end_m,
                mean_speeds: [
                    comparison.mean_speed(minisector, Driver::A),
                    comparison.mean_speed(minisector, Driver::B),
                ],
                winner: drivers[winner.index()].key().to_string(),
            }
        })
        .collect();

    Summary {
        session: key.clone(),
        generated_at,
        minisector_count: comparison.minisector_count,
        total_distance_m: comparison.total_distance,
        minisector_length_m: len,
        drivers: driver_summaries,
        minisectors,
    }
}

fn write_summary(summary: &Summary, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(summary)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
