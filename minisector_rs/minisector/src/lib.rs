//! Minisector segmentation and fastest-driver attribution for two-lap comparisons.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod session;

pub use session::{
    resolve_driver, DriverInfo, DriverResolver, Lap, ResolvedDriver, Session, SessionKey,
    SessionKind,
};

pub const DEFAULT_MINISECTORS: u32 = 25;

#[derive(Error, Debug)]
pub enum MsError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid telemetry sample #{index}: {reason}")]
    InvalidSample { index: usize, reason: String },
    #[error("missing session file: {0}")]
    MissingFile(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {file} at line {line}: {message}")]
    Csv {
        file: String,
        line: u64,
        message: String,
    },
    #[error("invalid lap time: {0}")]
    InvalidLapTime(String),
}

/// Which of the two compared streams a sample came from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Driver {
    A,
    B,
}

impl Driver {
    pub fn index(self) -> usize {
        match self {
            Driver::A => 0,
            Driver::B => 1,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Driver::A => f.write_str("A"),
            Driver::B => f.write_str("B"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    pub minisector_count: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            minisector_count: DEFAULT_MINISECTORS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    pub distance: f64,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
}

impl TelemetrySample {
    pub fn new(distance: f64, x: f64, y: f64, speed: f64) -> Self {
        Self {
            distance,
            x,
            y,
            speed,
        }
    }
}

/// One driver's lap, ordered by distance.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TelemetryStream {
    pub driver: String,
    pub samples: Vec<TelemetrySample>,
}

impl TelemetryStream {
    pub fn new(driver: impl Into<String>, samples: Vec<TelemetrySample>) -> Self {
        Self {
            driver: driver.into(),
            samples,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TaggedSample {
    pub sample: TelemetrySample,
    pub driver: Driver,
    pub minisector: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnnotatedSample {
    pub distance: f64,
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub driver: Driver,
    pub minisector: u32,
    pub winner: Driver,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MinisectorSpeedAggregate {
    pub minisector: u32,
    pub driver: Driver,
    pub mean_speed: f64,
    pub sample_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Comparison {
    pub samples: Vec<AnnotatedSample>,
    pub aggregates: Vec<MinisectorSpeedAggregate>,
    pub winners: BTreeMap<u32, Driver>,
    pub total_distance: f64,
    pub minisector_length: f64,
    pub minisector_count: u32,
}

impl Comparison {
    fn empty(minisector_count: u32) -> Self {
        Self {
            samples: Vec::new(),
            aggregates: Vec::new(),
            winners: BTreeMap::new(),
            total_distance: 0.0,
            minisector_length: 0.0,
            minisector_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn winner_of(&self, minisector: u32) -> Option<Driver> {
        self.winners.get(&minisector).copied()
    }

    pub fn minisectors_won(&self, driver: Driver) -> usize {
        self.winners.values().filter(|&&w| w == driver).count()
    }

    pub fn mean_speed(&self, minisector: u32, driver: Driver) -> Option<f64> {
        self.aggregates
            .iter()
            .find(|a| a.minisector == minisector && a.driver == driver)
            .map(|a| a.mean_speed)
    }
}

/// Annotate every sample of both laps with its minisector and that minisector's winner.
///
/// Ties in mean speed go to `stream_a`. Empty streams are not an error; a
/// `minisector_count` of zero is.
pub fn attribute_fastest_driver(
    stream_a: &[TelemetrySample],
    stream_b: &[TelemetrySample],
    minisector_count: u32,
) -> Result<Vec<AnnotatedSample>, MsError> {
    let params = Params { minisector_count };
    compare_laps(stream_a, stream_b, &params).map(|c| c.samples)
}

/// Full comparison pipeline, keeping aggregates and the winner map.
pub fn compare_laps(
    stream_a: &[TelemetrySample],
    stream_b: &[TelemetrySample],
    params: &Params,
) -> Result<Comparison, MsError> {
    let n = params.minisector_count;
    if n == 0 {
        return Err(MsError::InvalidConfiguration(
            "minisector count must be positive".into(),
        ));
    }

    let combined: Vec<(Driver, TelemetrySample)> = stream_a
        .iter()
        .map(|s| (Driver::A, *s))
        .chain(stream_b.iter().map(|s| (Driver::B, *s)))
        .collect();
    validate_samples(&combined)?;

    let total_distance = match combined
        .iter()
        .map(|(_, s)| OrderedFloat(s.distance))
        .max()
    {
        Some(OrderedFloat(d)) => d,
        None => return Ok(Comparison::empty(n)),
    };
    let minisector_length = if total_distance > 0.0 {
        total_distance / n as f64
    } else {
        0.0
    };

    let tagged: Vec<TaggedSample> = combined
        .into_iter()
        .map(|(driver, sample)| TaggedSample {
            sample,
            driver,
            minisector: minisector_for(sample.distance, minisector_length, n),
        })
        .collect();

    let aggregates = aggregate_speeds(&tagged);
    let winners = select_winners(&aggregates);

    let mut samples: Vec<AnnotatedSample> = tagged
        .iter()
        .filter_map(|t| {
            let winner = *winners.get(&t.minisector)?;
            Some(AnnotatedSample {
                distance: t.sample.distance,
                x: t.sample.x,
                y: t.sample.y,
                speed: t.sample.speed,
                driver: t.driver,
                minisector: t.minisector,
                winner,
            })
        })
        .collect();
    samples.sort_by_key(|s| OrderedFloat(s.distance));

    Ok(Comparison {
        samples,
        aggregates,
        winners,
        total_distance,
        minisector_length,
        minisector_count: n,
    })
}

fn validate_samples(samples: &[(Driver, TelemetrySample)]) -> Result<(), MsError> {
    for (index, (_, s)) in samples.iter().enumerate() {
        if !s.distance.is_finite() {
            return Err(MsError::InvalidSample {
                index,
                reason: format!("distance {} is not finite", s.distance),
            });
        }
        if !s.speed.is_finite() {
            return Err(MsError::InvalidSample {
                index,
                reason: format!("speed {} is not finite", s.speed),
            });
        }
    }
    Ok(())
}

/// Map a distance to its 1-based minisector, clamped to `[1, minisector_count]`.
///
/// A zero `minisector_length` (degenerate lap) puts everything in minisector 1.
pub fn minisector_for(distance: f64, minisector_length: f64, minisector_count: u32) -> u32 {
    if minisector_length <= 0.0 || minisector_count <= 1 {
        return 1;
    }
    let bin = (distance / minisector_length).floor();
    if bin <= 0.0 {
        1
    } else if bin >= (minisector_count - 1) as f64 {
        minisector_count
    } else {
        bin as u32 + 1
    }
}

/// Mean speed per (minisector, driver), ordered by minisector then driver.
pub fn aggregate_speeds(samples: &[TaggedSample]) -> Vec<MinisectorSpeedAggregate> {
    let mut sums: BTreeMap<(u32, Driver), (f64, usize)> = BTreeMap::new();
    for t in samples {
        let entry = sums.entry((t.minisector, t.driver)).or_insert((0.0, 0));
        entry.0 += t.sample.speed;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|((minisector, driver), (sum, count))| MinisectorSpeedAggregate {
            minisector,
            driver,
            mean_speed: sum / count as f64,
            sample_count: count,
        })
        .collect()
}

/// Pick the fastest driver per minisector; the first maximal row wins ties.
pub fn select_winners(aggregates: &[MinisectorSpeedAggregate]) -> BTreeMap<u32, Driver> {
    let mut best: BTreeMap<u32, (Driver, f64)> = BTreeMap::new();
    for agg in aggregates {
        best.entry(agg.minisector)
            .and_modify(|(driver, speed)| {
                if agg.mean_speed > *speed {
                    *driver = agg.driver;
                    *speed = agg.mean_speed;
                }
            })
            .or_insert((agg.driver, agg.mean_speed));
    }
    best.into_iter().map(|(m, (d, _))| (m, d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lap(points: &[(f64, f64)]) -> Vec<TelemetrySample> {
        points
            .iter()
            .map(|&(d, v)| TelemetrySample::new(d, d, 0.0, v))
            .collect()
    }

    #[test]
    fn test_tie_goes_to_first_stream() {
        let a = lap(&[(0.0, 100.0), (50.0, 120.0)]);
        let b = lap(&[(0.0, 90.0), (50.0, 130.0)]);
        let cmp = compare_laps(&a, &b, &Params { minisector_count: 1 }).unwrap();
        assert_eq!(cmp.winners.len(), 1);
        assert_eq!(cmp.mean_speed(1, Driver::A), Some(110.0));
        assert_eq!(cmp.mean_speed(1, Driver::B), Some(110.0));
        assert_eq!(cmp.winner_of(1), Some(Driver::A));
        assert!(cmp.samples.iter().all(|s| s.winner == Driver::A));
    }

    #[test]
    fn test_faster_driver_wins_every_minisector() {
        let a = lap(&[(0.0, 200.0), (25.0, 200.0), (75.0, 200.0), (100.0, 200.0)]);
        let b = lap(&[(0.0, 100.0), (25.0, 100.0), (75.0, 100.0), (100.0, 100.0)]);
        let cmp = compare_laps(&a, &b, &Params { minisector_count: 2 }).unwrap();
        assert_eq!(cmp.total_distance, 100.0);
        assert_eq!(cmp.minisector_length, 50.0);
        assert_eq!(cmp.winner_of(1), Some(Driver::A));
        assert_eq!(cmp.winner_of(2), Some(Driver::A));
        assert_eq!(cmp.minisectors_won(Driver::A), 2);
        assert_eq!(cmp.minisectors_won(Driver::B), 0);
    }

    #[test]
    fn test_split_winners() {
        let a = lap(&[(0.0, 300.0), (40.0, 300.0), (60.0, 150.0), (100.0, 150.0)]);
        let b = lap(&[(0.0, 250.0), (40.0, 250.0), (60.0, 200.0), (100.0, 200.0)]);
        let cmp = compare_laps(&a, &b, &Params { minisector_count: 2 }).unwrap();
        assert_eq!(cmp.winner_of(1), Some(Driver::A));
        assert_eq!(cmp.winner_of(2), Some(Driver::B));
        let last = cmp.samples.last().unwrap();
        assert_eq!(last.minisector, 2);
        assert_eq!(last.winner, Driver::B);
    }

    #[test]
    fn test_zero_minisectors_rejected() {
        let a = lap(&[(0.0, 100.0)]);
        let err = attribute_fastest_driver(&a, &[], 0).unwrap_err();
        assert!(matches!(err, MsError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_both_streams_empty() {
        let out = attribute_fastest_driver(&[], &[], 25).unwrap();
        assert!(out.is_empty());
        let cmp = compare_laps(&[], &[], &Params::default()).unwrap();
        assert!(cmp.is_empty());
        assert!(cmp.winners.is_empty());
        assert_eq!(cmp.minisector_count, DEFAULT_MINISECTORS);
    }

    #[test]
    fn test_single_stream_wins_everything() {
        let b = lap(&[(0.0, 80.0), (30.0, 90.0), (60.0, 70.0), (90.0, 60.0)]);
        let cmp = compare_laps(&[], &b, &Params { minisector_count: 3 }).unwrap();
        assert_eq!(cmp.winners.len(), 3);
        assert!(cmp.winners.values().all(|&w| w == Driver::B));
        assert!(cmp.samples.iter().all(|s| s.driver == Driver::B));
    }

    #[test]
    fn test_degenerate_lap_uses_single_minisector() {
        let a = lap(&[(0.0, 10.0), (0.0, 12.0)]);
        let b = lap(&[(0.0, 11.0)]);
        let cmp = compare_laps(&a, &b, &Params { minisector_count: 25 }).unwrap();
        assert_eq!(cmp.minisector_length, 0.0);
        assert!(cmp.samples.iter().all(|s| s.minisector == 1));
        assert_eq!(cmp.winner_of(1), Some(Driver::A));
    }

    #[test]
    fn test_final_sample_stays_in_last_minisector() {
        assert_eq!(minisector_for(100.0, 4.0, 25), 25);
        assert_eq!(minisector_for(99.9, 4.0, 25), 25);
        assert_eq!(minisector_for(0.0, 4.0, 25), 1);
        assert_eq!(minisector_for(4.0, 4.0, 25), 2);
        assert_eq!(minisector_for(-1.0, 4.0, 25), 1);
    }

    #[test]
    fn test_non_finite_sample_rejected() {
        let a = lap(&[(0.0, 100.0), (f64::NAN, 100.0)]);
        let err = attribute_fastest_driver(&a, &[], 5).unwrap_err();
        assert!(matches!(err, MsError::InvalidSample { index: 1, .. }));
        let b = lap(&[(0.0, f64::INFINITY)]);
        assert!(attribute_fastest_driver(&[], &b, 5).is_err());
    }

    #[test]
    fn test_equal_distances_keep_input_order() {
        let a = lap(&[(10.0, 1.0)]);
        let b = lap(&[(10.0, 2.0)]);
        let out = attribute_fastest_driver(&a, &b, 1).unwrap();
        assert_eq!(out[0].driver, Driver::A);
        assert_eq!(out[1].driver, Driver::B);
        assert!(out.iter().all(|s| s.winner == Driver::B));
    }

    #[test]
    fn test_aggregates_sorted_by_minisector_then_driver() {
        let a = lap(&[(0.0, 10.0), (60.0, 20.0), (100.0, 30.0)]);
        let b = lap(&[(10.0, 5.0), (70.0, 25.0)]);
        let cmp = compare_laps(&a, &b, &Params { minisector_count: 2 }).unwrap();
        let keys: Vec<(u32, Driver)> = cmp
            .aggregates
            .iter()
            .map(|a| (a.minisector, a.driver))
            .collect();
        assert_eq!(
            keys,
            vec![(1, Driver::A), (1, Driver::B), (2, Driver::A), (2, Driver::B)]
        );
        assert_eq!(cmp.aggregates[2].sample_count, 2);
        assert_eq!(cmp.aggregates[2].mean_speed, 25.0);
    }

    fn stream_strategy() -> impl Strategy<Value = Vec<TelemetrySample>> {
        prop::collection::vec((0.0f64..6000.0, 0.0f64..360.0), 0..60).prop_map(|mut pts| {
            pts.sort_by(|a, b| a.0.total_cmp(&b.0));
            pts.into_iter()
                .map(|(d, v)| TelemetrySample::new(d, d.cos(), d.sin(), v))
                .collect()
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_minisectors_in_range_and_sorted(
            a in stream_strategy(),
            b in stream_strategy(),
            n in 1u32..60,
        ) {
            let out = attribute_fastest_driver(&a, &b, n).unwrap();
            prop_assert_eq!(out.len(), a.len() + b.len());
            for s in &out {
                prop_assert!(s.minisector >= 1 && s.minisector <= n);
            }
            for w in out.windows(2) {
                prop_assert!(w[0].distance <= w[1].distance);
                prop_assert!(w[0].minisector <= w[1].minisector);
            }
        }

        #[test]
        fn prop_assignment_is_monotonic(
            d1 in 0.0f64..5000.0,
            d2 in 0.0f64..5000.0,
            len in 0.0f64..400.0,
            n in 1u32..40,
        ) {
            let (lo, hi) = if d1 <= d2 { (d1, d2) } else { (d2, d1) };
            prop_assert!(minisector_for(lo, len, n) <= minisector_for(hi, len, n));
        }

        #[test]
        fn prop_single_stream_owns_all_winners(a in stream_strategy(), n in 1u32..30) {
            let cmp = compare_laps(&a, &[], &Params { minisector_count: n }).unwrap();
            prop_assert!(cmp.winners.values().all(|&w| w == Driver::A));
        }

        #[test]
        fn prop_rerun_is_identical(a in stream_strategy(), b in stream_strategy(), n in 1u32..30) {
            let params = Params { minisector_count: n };
            let first = compare_laps(&a, &b, &params).unwrap();
            let second = compare_laps(&a, &b, &params).unwrap();
            prop_assert_eq!(first.winners, second.winners);
            prop_assert_eq!(first.samples, second.samples);
        }
    }
}
