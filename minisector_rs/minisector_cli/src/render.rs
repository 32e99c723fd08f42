use std::ops::Range;
use std::panic;
use std::path::Path;

use anyhow::Result;
use minisector::{AnnotatedSample, Driver};
use plotters::prelude::*;
use plotters::style::{FontDesc, FontFamily, FontStyle};

const DRIVER_A_COLOR: RGBColor = RGBColor(255, 0, 0);
const DRIVER_B_COLOR: RGBColor = RGBColor(128, 0, 255);
const LINE_WIDTH: u32 = 5;
const LEGEND_WIDTH: i32 = 220;
const MAP_MARGIN: u32 = 30;
const CAPTION_HEIGHT: u32 = 50;

#[derive(Clone, Copy, Debug)]
pub enum ChartKind {
    Png,
    Svg,
}

#[derive(Clone, Debug)]
pub struct TrackMapOptions {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub labels: [String; 2],
    pub wins: [usize; 2],
}

pub fn driver_color(driver: Driver) -> RGBColor {
    match driver {
        Driver::A => DRIVER_A_COLOR,
        Driver::B => DRIVER_B_COLOR,
    }
}

/// Render the track map, turning backend errors and panics into a message.
pub fn render_track_map_guard(
    samples: &[AnnotatedSample],
    path: &Path,
    kind: ChartKind,
    opts: &TrackMapOptions,
) -> Result<(), String> {
    let render = || -> Result<(), String> {
        render_track_map(samples, path, kind, opts).map_err(|e| format!("plotting error: {}", e))
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| "plotting backend panicked".to_string())?
}

fn render_track_map(
    samples: &[AnnotatedSample],
    path: &Path,
    kind: ChartKind,
    opts: &TrackMapOptions,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }
    let size = (opts.width, opts.height);
    match kind {
        ChartKind::Png => {
            let root = BitMapBackend::new(path, size).into_drawing_area();
            draw_track_map(root, samples, opts)?;
        }
        ChartKind::Svg => {
            let root = SVGBackend::new(path, size).into_drawing_area();
            draw_track_map(root, samples, opts)?;
        }
    }
    Ok(())
}

fn draw_track_map<DB>(
    root: DrawingArea<DB, plotters::coord::Shift>,
    samples: &[AnnotatedSample],
    opts: &TrackMapOptions,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;
    let (map_area, legend_area) = root.split_horizontally(map_split(opts.width));

    let (map_w, map_h) = map_area.dim_in_pixel();
    let plot_px = (
        map_w.saturating_sub(2 * MAP_MARGIN).max(1),
        map_h.saturating_sub(2 * MAP_MARGIN + CAPTION_HEIGHT).max(1),
    );
    let (x_range, y_range) = equal_aspect_ranges(track_bounds(samples), plot_px);

    let title_font = FontDesc::new(FontFamily::SansSerif, 32.0, FontStyle::Normal);
    let mut chart = ChartBuilder::on(&map_area)
        .margin(MAP_MARGIN)
        .caption(&opts.title, title_font)
        .build_cartesian_2d(x_range, y_range)?;

    for (driver, points) in winner_runs(samples) {
        let style = driver_color(driver).stroke_width(LINE_WIDTH);
        chart.draw_series(LineSeries::new(points, style))?;
    }

    draw_color_bar(&legend_area, opts)?;
    root.present()?;
    Ok(())
}

/// Horizontal offset between the map and the legend, at least one pixel.
fn map_split(width: u32) -> i32 {
    i32::try_from(width)
        .unwrap_or(i32::MAX)
        .saturating_sub(LEGEND_WIDTH)
        .max(1)
}

/// Two stacked blocks, driver A at the bottom, each labelled with its win count.
fn draw_color_bar<DB>(
    area: &DrawingArea<DB, plotters::coord::Shift>,
    opts: &TrackMapOptions,
) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (_, height) = area.dim_in_pixel();
    let top = (MAP_MARGIN + CAPTION_HEIGHT) as i32;
    let bottom = height as i32 - MAP_MARGIN as i32;
    if bottom <= top {
        return Ok(());
    }
    let mid = (top + bottom) / 2;
    let label_font = FontDesc::new(FontFamily::SansSerif, 26.0, FontStyle::Normal);
    let count_font = FontDesc::new(FontFamily::SansSerif, 18.0, FontStyle::Normal);

    let blocks = [(Driver::B, top, mid), (Driver::A, mid, bottom)];
    for (driver, y0, y1) in blocks {
        let color = driver_color(driver);
        area.draw(&Rectangle::new([(20, y0), (56, y1)], color.filled()))?;
        let center = (y0 + y1) / 2;
        area.draw(&Text::new(
            opts.labels[driver.index()].clone(),
            (68, center - 16),
            label_font.clone().color(&BLACK),
        ))?;
        area.draw(&Text::new(
            format!("{} fastest", opts.wins[driver.index()]),
            (68, center + 14),
            count_font.clone().color(&BLACK.mix(0.7)),
        ))?;
    }
    area.draw(&Rectangle::new([(20, top), (56, bottom)], BLACK.stroke_width(1)))?;
    Ok(())
}

/// Split the path into runs of constant winner. Segment `(i, i + 1)` takes the
/// colour of sample `i`, so each run ends on the first sample of the next one.
pub fn winner_runs(samples: &[AnnotatedSample]) -> Vec<(Driver, Vec<(f64, f64)>)> {
    let mut runs: Vec<(Driver, Vec<(f64, f64)>)> = Vec::new();
    for pair in samples.windows(2) {
        let (from, to) = (&pair[0], &pair[1]);
        match runs.last_mut() {
            Some((driver, points)) if *driver == from.winner => points.push((to.x, to.y)),
            _ => runs.push((from.winner, vec![(from.x, from.y), (to.x, to.y)])),
        }
    }
    runs
}

fn track_bounds(samples: &[AnnotatedSample]) -> ((f64, f64), (f64, f64)) {
    let mut x = (f64::INFINITY, f64::NEG_INFINITY);
    let mut y = (f64::INFINITY, f64::NEG_INFINITY);
    for s in samples {
        x = (x.0.min(s.x), x.1.max(s.x));
        y = (y.0.min(s.y), y.1.max(s.y));
    }
    (x, y)
}

/// Expand the data bounds so one unit spans the same number of pixels on both axes.
pub fn equal_aspect_ranges(
    bounds: ((f64, f64), (f64, f64)),
    plot_px: (u32, u32),
) -> (Range<f64>, Range<f64>) {
    let ((x0, x1), (y0, y1)) = bounds;
    let span_x = (x1 - x0).max(1.0);
    let span_y = (y1 - y0).max(1.0);
    let (w, h) = (plot_px.0.max(1) as f64, plot_px.1.max(1) as f64);
    let units_per_px = (span_x / w).max(span_y / h) * 1.05;
    let half_x = units_per_px * w / 2.0;
    let half_y = units_per_px * h / 2.0;
    let cx = (x0 + x1) / 2.0;
    let cy = (y0 + y1) / 2.0;
    ((cx - half_x)..(cx + half_x), (cy - half_y)..(cy + half_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f64, winner: Driver) -> AnnotatedSample {
        AnnotatedSample {
            distance: x,
            x,
            y: 0.0,
            speed: 100.0,
            driver: Driver::A,
            minisector: 1,
            winner,
        }
    }

    #[test]
    fn test_winner_runs_are_continuous() {
        let samples = vec![
            sample(0.0, Driver::A),
            sample(1.0, Driver::A),
            sample(2.0, Driver::B),
            sample(3.0, Driver::B),
            sample(4.0, Driver::A),
        ];
        let runs = winner_runs(&samples);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], (Driver::A, vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]));
        // The final sample only terminates a segment.
        assert_eq!(runs[1], (Driver::B, vec![(2.0, 0.0), (3.0, 0.0), (4.0, 0.0)]));
        assert!(winner_runs(&samples[..1]).is_empty());
    }

    #[test]
    fn test_equal_aspect_ranges() {
        let (xr, yr) = equal_aspect_ranges(((0.0, 100.0), (0.0, 10.0)), (200, 100));
        let x_per_px = (xr.end - xr.start) / 200.0;
        let y_per_px = (yr.end - yr.start) / 100.0;
        assert!((x_per_px - y_per_px).abs() < 1e-9);
        assert!(xr.start <= 0.0 && xr.end >= 100.0);
        assert!(yr.start <= 0.0 && yr.end >= 10.0);
        assert!(((xr.start + xr.end) / 2.0 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_narrow_width_keeps_positive_split() {
        assert_eq!(map_split(640), 420);
        assert_eq!(map_split(221), 1);
        assert_eq!(map_split(100), 1);
        assert_eq!(map_split(0), 1);
        assert_eq!(map_split(u32::MAX), i32::MAX - LEGEND_WIDTH);

        let dir = tempfile::tempdir().unwrap();
        let samples = vec![sample(0.0, Driver::A), sample(1.0, Driver::B), sample(2.0, Driver::B)];
        let opts = TrackMapOptions {
            width: 100,
            height: 200,
            title: "narrow".into(),
            labels: ["LEC".into(), "VER".into()],
            wins: [1, 1],
        };
        let path = dir.path().join("narrow.svg");
        let result = render_track_map_guard(&samples, &path, ChartKind::Svg, &opts);
        assert_ne!(result, Err("plotting backend panicked".to_string()));
    }

    #[test]
    fn test_renders_png_and_svg() {
        let dir = tempfile::tempdir().unwrap();
        let samples: Vec<AnnotatedSample> = (0..20)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / 20.0;
                AnnotatedSample {
                    distance: i as f64,
                    x: angle.cos() * 500.0,
                    y: angle.sin() * 300.0,
                    speed: 200.0,
                    driver: Driver::A,
                    minisector: 1 + i / 10,
                    winner: if i < 10 { Driver::A } else { Driver::B },
                }
            })
            .collect();
        let opts = TrackMapOptions {
            width: 640,
            height: 400,
            title: "test".into(),
            labels: ["LEC".into(), "VER".into()],
            wins: [1, 1],
        };
        let svg = dir.path().join("map.svg");
        render_track_map_guard(&samples, &svg, ChartKind::Svg, &opts).unwrap();
        let text = std::fs::read_to_string(&svg).unwrap();
        let polylines: Vec<&str> = text
            .split("<polyline")
            .skip(1)
            .map(|tag| tag.split("/>").next().unwrap_or(tag))
            .collect();
        assert_eq!(polylines.len(), 2);
        assert!(polylines[0].contains("stroke=\"#FF0000\""));
        assert!(polylines[1].contains("stroke=\"#8000FF\""));
        assert!(text.contains("LEC"));
        assert!(text.contains("VER"));
        assert!(text.contains("1 fastest"));

        let png = dir.path().join("map.png");
        render_track_map_guard(&samples, &png, ChartKind::Png, &opts).unwrap();
        assert!(std::fs::metadata(&png).unwrap().len() > 0);

        let empty = dir.path().join("empty.svg");
        render_track_map_guard(&[], &empty, ChartKind::Svg, &opts).unwrap();
        assert!(!empty.exists());
    }
}
