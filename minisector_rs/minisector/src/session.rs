// Session data source: lap tables and per-lap telemetry read from CSV files,
// plus driver resolution and fastest-lap selection.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{MsError, TelemetrySample, TelemetryStream};

pub const LAPS_FILE: &str = "laps.csv";
pub const TELEMETRY_FILE: &str = "telemetry.csv";

const KMH_TO_MPS: f64 = 1.0 / 3.6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Fp1,
    Fp2,
    Fp3,
    Qualifying,
    Race,
}

impl SessionKind {
    pub fn code(self) -> &'static str {
        match self {
            SessionKind::Fp1 => "FP1",
            SessionKind::Fp2 => "FP2",
            SessionKind::Fp3 => "FP3",
            SessionKind::Qualifying => "Q",
            SessionKind::Race => "R",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for SessionKind {
    type Err = MsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FP1" => Ok(SessionKind::Fp1),
            "FP2" => Ok(SessionKind::Fp2),
            "FP3" => Ok(SessionKind::Fp3),
            "Q" => Ok(SessionKind::Qualifying),
            "R" => Ok(SessionKind::Race),
            other => Err(MsError::InvalidConfiguration(format!(
                "unknown session type '{}' (expected FP1/FP2/FP3/Q/R)",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionKey {
    pub year: u16,
    pub track: String,
    pub kind: SessionKind,
}

impl SessionKey {
    pub fn new(year: u16, track: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            year,
            track: track.into(),
            kind,
        }
    }

    /// Lowercase track name with whitespace runs collapsed to `_`.
    pub fn track_slug(&self) -> String {
        self.track
            .split_whitespace()
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn dir(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join(self.year.to_string())
            .join(self.track_slug())
            .join(self.kind.code())
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.year, self.track, self.kind)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverInfo {
    pub abbreviation: String,
    pub number: Option<String>,
    pub team: Option<String>,
    pub full_name: Option<String>,
}

impl DriverInfo {
    fn matches(&self, ident: &str) -> bool {
        self.abbreviation.eq_ignore_ascii_case(ident)
            || self
                .number
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(ident))
    }
}

/// Structured lookup of a user-supplied driver identifier.
pub trait DriverResolver {
    fn resolve(&self, ident: &str) -> Option<&DriverInfo>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResolvedDriver {
    Known(DriverInfo),
    /// Lookup failed; the uppercased input is used as the key.
    Raw(String),
}

impl ResolvedDriver {
    pub fn key(&self) -> &str {
        match self {
            ResolvedDriver::Known(info) => &info.abbreviation,
            ResolvedDriver::Raw(raw) => raw,
        }
    }

    pub fn number(&self) -> Option<&str> {
        match self {
            ResolvedDriver::Known(info) => info.number.as_deref(),
            ResolvedDriver::Raw(_) => None,
        }
    }
}

impl fmt::Display for ResolvedDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedDriver::Known(info) => match info.number.as_deref() {
                Some(number) => write!(f, "{} (#{})", info.abbreviation, number),
                None => f.write_str(&info.abbreviation),
            },
            ResolvedDriver::Raw(raw) => f.write_str(raw),
        }
    }
}

pub fn resolve_driver<R: DriverResolver + ?Sized>(resolver: &R, raw: &str) -> ResolvedDriver {
    let ident = raw.trim().to_ascii_uppercase();
    match resolver.resolve(&ident) {
        Some(info) => ResolvedDriver::Known(info.clone()),
        None => {
            debug!("driver '{}' not in roster; using raw identifier", ident);
            ResolvedDriver::Raw(ident)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawSample {
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub distance: Option<f64>,
    pub time: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lap {
    pub driver: String,
    pub lap_number: u32,
    pub lap_time_s: Option<f64>,
    pub samples: Vec<RawSample>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Session {
    pub drivers: Vec<DriverInfo>,
    pub laps: Vec<Lap>,
}

#[derive(Debug, Deserialize)]
struct LapRow {
    driver: String,
    #[serde(default)]
    driver_number: Option<String>,
    lap_number: u32,
    #[serde(default)]
    lap_time: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelemetryRow {
    driver: String,
    lap_number: u32,
    x: f64,
    y: f64,
    speed: f64,
    #[serde(default)]
    distance: Option<f64>,
    #[serde(default)]
    time: Option<f64>,
}

impl Session {
    /// Load `laps.csv` and `telemetry.csv` from a session directory.
    pub fn load(dir: &Path) -> Result<Self, MsError> {
        let [laps_path, telemetry_path] = Self::files(dir);
        let laps = read_file(&laps_path)?;
        let telemetry = read_file(&telemetry_path)?;
        let session = Self::parse(&laps, &telemetry)?;
        debug!(
            "loaded {} drivers, {} laps from {}",
            session.drivers.len(),
            session.laps.len(),
            dir.display()
        );
        Ok(session)
    }

    pub fn files(dir: &Path) -> [PathBuf; 2] {
        [dir.join(LAPS_FILE), dir.join(TELEMETRY_FILE)]
    }

    pub fn parse(laps_csv: &[u8], telemetry_csv: &[u8]) -> Result<Self, MsError> {
        let mut session = Session::default();

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(laps_csv);
        for row in reader.deserialize::<LapRow>() {
            let row = row.map_err(|e| csv_error(LAPS_FILE, e))?;
            let abbreviation = row.driver.to_ascii_uppercase();
            if !session.drivers.iter().any(|d| d.abbreviation == abbreviation) {
                session.drivers.push(DriverInfo {
                    abbreviation: abbreviation.clone(),
                    number: row.driver_number.filter(|n| !n.is_empty()),
                    team: row.team.filter(|t| !t.is_empty()),
                    full_name: row.full_name.filter(|n| !n.is_empty()),
                });
            }
            let lap_time_s = match row.lap_time.as_deref() {
                Some(text) => parse_lap_time(text)?,
                None => None,
            };
            session.laps.push(Lap {
                driver: abbreviation,
                lap_number: row.lap_number,
                lap_time_s,
                samples: Vec::new(),
            });
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(telemetry_csv);
        // First lap row wins on duplicate (driver, lap) keys.
        let mut lap_index: HashMap<(String, u32), usize> =
            HashMap::with_capacity(session.laps.len());
        for (i, lap) in session.laps.iter().enumerate() {
            lap_index.entry((lap.driver.clone(), lap.lap_number)).or_insert(i);
        }
        let mut orphans = 0usize;
        for row in reader.deserialize::<TelemetryRow>() {
            let row = row.map_err(|e| csv_error(TELEMETRY_FILE, e))?;
            // Telemetry may reference drivers by car number.
            let driver = match session.resolve(&row.driver) {
                Some(info) => info.abbreviation.clone(),
                None => row.driver.to_ascii_uppercase(),
            };
            let sample = RawSample {
                x: row.x,
                y: row.y,
                speed: row.speed,
                distance: row.distance,
                time: row.time,
            };
            match lap_index.get(&(driver, row.lap_number)) {
                Some(&i) => session.laps[i].samples.push(sample),
                None => orphans += 1,
            }
        }
        if orphans > 0 {
            warn!("{} telemetry rows reference unknown laps; ignored", orphans);
        }

        Ok(session)
    }

    pub fn laps_for(&self, driver: &ResolvedDriver) -> Vec<&Lap> {
        let key = driver.key();
        self.laps
            .iter()
            .filter(|lap| lap.driver.eq_ignore_ascii_case(key))
            .collect()
    }

    /// The lap with the lowest valid time; ties go to the earlier lap number.
    pub fn fastest_lap(&self, driver: &ResolvedDriver) -> Option<&Lap> {
        self.laps_for(driver)
            .into_iter()
            .filter_map(|lap| lap.lap_time_s.map(|t| (lap, t)))
            .min_by_key(|(lap, t)| (OrderedFloat(*t), lap.lap_number))
            .map(|(lap, _)| lap)
    }

    pub fn lap_telemetry(&self, lap: &Lap) -> TelemetryStream {
        TelemetryStream::new(lap.driver.clone(), lap_samples(&lap.samples))
    }

    pub fn fastest_lap_stream(&self, driver: &ResolvedDriver) -> Option<TelemetryStream> {
        let lap = self.fastest_lap(driver)?;
        Some(self.lap_telemetry(lap))
    }
}

impl DriverResolver for Session {
    fn resolve(&self, ident: &str) -> Option<&DriverInfo> {
        let ident = ident.trim();
        self.drivers.iter().find(|d| d.matches(ident))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, MsError> {
    if !path.exists() {
        return Err(MsError::MissingFile(path.to_path_buf()));
    }
    fs::read(path).map_err(|source| MsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn csv_error(file: &str, err: csv::Error) -> MsError {
    let line = err.position().map(|p| p.line()).unwrap_or(0);
    MsError::Csv {
        file: file.to_string(),
        line,
        message: err.to_string(),
    }
}

/// Parse `79.327`, `1:19.327`, or `0:01:19.327`. Empty means no valid time.
pub fn parse_lap_time(text: &str) -> Result<Option<f64>, MsError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let invalid = || MsError::InvalidLapTime(text.to_string());
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() > 3 {
        return Err(invalid());
    }
    let mut seconds = 0.0;
    for (idx, part) in parts.iter().enumerate() {
        let value: f64 = part.trim().parse().map_err(|_| invalid())?;
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        if idx + 1 < parts.len() && value.fract() != 0.0 {
            return Err(invalid());
        }
        seconds = seconds * 60.0 + value;
    }
    if seconds <= 0.0 {
        return Err(invalid());
    }
    Ok(Some(seconds))
}

fn lap_samples(raw: &[RawSample]) -> Vec<TelemetrySample> {
    if raw.is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<RawSample> = raw.to_vec();
    let timed = ordered.iter().all(|s| s.time.is_some());
    if timed {
        ordered.sort_by_key(|s| OrderedFloat(s.time.unwrap_or(0.0)));
    }

    let distances: Vec<f64> = if ordered.iter().all(|s| s.distance.is_some()) {
        ordered.iter().map(|s| s.distance.unwrap_or(0.0)).collect()
    } else if timed {
        integrate_speed(&ordered)
    } else {
        path_length(&ordered)
    };

    let mut samples: Vec<TelemetrySample> = ordered
        .iter()
        .zip(distances)
        .map(|(s, d)| TelemetrySample::new(d, s.x, s.y, s.speed))
        .collect();
    samples.sort_by_key(|s| OrderedFloat(s.distance));
    samples
}

fn integrate_speed(samples: &[RawSample]) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut total = 0.0;
    out.push(total);
    for w in samples.windows(2) {
        let dt = w[1].time.unwrap_or(0.0) - w[0].time.unwrap_or(0.0);
        total += w[0].speed * KMH_TO_MPS * dt.max(0.0);
        out.push(total);
    }
    out
}

fn path_length(samples: &[RawSample]) -> Vec<f64> {
    let mut out = Vec::with_capacity(samples.len());
    let mut total = 0.0;
    out.push(total);
    for w in samples.windows(2) {
        total += (w[1].x - w[0].x).hypot(w[1].y - w[0].y);
        out.push(total);
    }
    out
}
