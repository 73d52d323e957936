//! SVG charts for database query results.
//!
//! A [`PlotSpec`] names one x column and one or more y columns of a query
//! result. Numeric x columns get a linear axis; anything else is treated as
//! categories in row order.

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::str::FromStr;
use thiserror::Error;

use crate::database::QueryOutcome;
use crate::views::escape;

const PALETTE: [&str; 6] = [
    "#4e79a7", "#f28e2b", "#e15759", "#76b7b2", "#59a14f", "#edc948",
];
const TICKS: usize = 5;
const MAX_CATEGORY_LABELS: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotKind {
    #[default]
    Line,
    Bar,
    Scatter,
}

impl FromStr for PlotKind {
    type Err = PlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "line" => Ok(PlotKind::Line),
            "bar" => Ok(PlotKind::Bar),
            "scatter" => Ok(PlotKind::Scatter),
            other => Err(PlotError::UnknownKind(other.to_string())),
        }
    }
}

impl PlotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlotKind::Line => "line",
            PlotKind::Bar => "bar",
            PlotKind::Scatter => "scatter",
        }
    }
}

/// Chart definition stored in a database item's frontmatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSpec {
    #[serde(default)]
    pub kind: PlotKind,
    pub x: String,
    #[serde(default)]
    pub y: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlotError {
    #[error("unknown plot kind '{0}': use line, bar or scatter")]
    UnknownKind(String),
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    #[error("plot needs at least one y column")]
    NoSeries,
    #[error("query result has no plottable points")]
    NoData,
}

struct Series<'a> {
    name: &'a str,
    points: Vec<(f64, f64)>,
}

struct Frame {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
    x_min: f64,
    x_max: f64,
    y_min: f64,
    y_max: f64,
}

impl Frame {
    fn sx(&self, x: f64) -> f64 {
        self.left + (x - self.x_min) / (self.x_max - self.x_min) * self.width
    }

    fn sy(&self, y: f64) -> f64 {
        self.top + self.height - (y - self.y_min) / (self.y_max - self.y_min) * self.height
    }
}

pub fn render_svg(
    spec: &PlotSpec,
    outcome: &QueryOutcome,
    width: u32,
    height: u32,
) -> Result<String, PlotError> {
    if spec.y.is_empty() {
        return Err(PlotError::NoSeries);
    }
    let x_idx = outcome
        .column_index(&spec.x)
        .ok_or_else(|| PlotError::UnknownColumn(spec.x.clone()))?;
    let y_idx: Vec<(usize, &str)> = spec
        .y
        .iter()
        .map(|name| {
            outcome
                .column_index(name)
                .map(|i| (i, name.as_str()))
                .ok_or_else(|| PlotError::UnknownColumn(name.clone()))
        })
        .collect::<Result<_, _>>()?;

    // Bars always sit on category slots; other kinds use a numeric x axis
    // when every non-null x value parses as a number.
    let numeric_x = spec.kind != PlotKind::Bar
        && outcome
            .rows
            .iter()
            .any(|row| !row[x_idx].is_null())
        && outcome
            .rows
            .iter()
            .filter(|row| !row[x_idx].is_null())
            .all(|row| row[x_idx].as_f64().is_some());
    let categories: Vec<String> = if numeric_x {
        Vec::new()
    } else {
        outcome.rows.iter().map(|r| r[x_idx].to_string()).collect()
    };

    let series: Vec<Series> = y_idx
        .iter()
        .map(|(yi, name)| {
            let points = outcome
                .rows
                .iter()
                .enumerate()
                .filter_map(|(pos, row)| {
                    let x = if numeric_x {
                        row[x_idx].as_f64()?
                    } else {
                        pos as f64
                    };
                    Some((x, row[*yi].as_f64()?))
                })
                .collect();
            Series {
                name: *name,
                points,
            }
        })
        .collect();

    if series.iter().all(|s| s.points.is_empty()) {
        return Err(PlotError::NoData);
    }

    let all_points = series.iter().flat_map(|s| s.points.iter());
    let (mut x_min, mut x_max, mut y_min, mut y_max) = all_points.fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(a, b, c, d), (x, y)| (a.min(*x), b.max(*x), c.min(*y), d.max(*y)),
    );
    if spec.kind == PlotKind::Bar {
        x_min = -0.5;
        x_max = categories.len() as f64 - 0.5;
        y_min = y_min.min(0.0);
        y_max = y_max.max(0.0);
    }
    if (x_max - x_min).abs() < f64::EPSILON {
        x_min -= 1.0;
        x_max += 1.0;
    }
    if (y_max - y_min).abs() < f64::EPSILON {
        y_min -= 1.0;
        y_max += 1.0;
    }

    let (w, h) = (width as f64, height as f64);
    let frame = Frame {
        left: 64.0,
        top: 56.0,
        width: (w - 64.0 - 24.0).max(10.0),
        height: (h - 56.0 - 56.0).max(10.0),
        x_min,
        x_max,
        y_min,
        y_max,
    };

    let mut svg = String::new();
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}" font-family="sans-serif" font-size="11">"#
    );
    let _ = writeln!(
        svg,
        r#"<rect width="{width}" height="{height}" fill="white"/>"#
    );
    if let Some(title) = &spec.title {
        let _ = writeln!(
            svg,
            r#"<text x="{:.1}" y="20" text-anchor="middle" font-size="14">{}</text>"#,
            w / 2.0,
            escape(title)
        );
    }

    draw_axes(&mut svg, &frame, numeric_x, &categories);

    for (i, s) in series.iter().enumerate() {
        let color = PALETTE[i % PALETTE.len()];
        match spec.kind {
            PlotKind::Line => {
                let mut pts = s.points.clone();
                pts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                let coords = pts
                    .iter()
                    .map(|(x, y)| format!("{:.1},{:.1}", frame.sx(*x), frame.sy(*y)))
                    .collect::<Vec<_>>()
                    .join(" ");
                let _ = writeln!(
                    svg,
                    r#"<polyline fill="none" stroke="{color}" stroke-width="2" points="{coords}"/>"#
                );
            }
            PlotKind::Scatter => {
                for (x, y) in &s.points {
                    let _ = writeln!(
                        svg,
                        r#"<circle cx="{:.1}" cy="{:.1}" r="3" fill="{color}"/>"#,
                        frame.sx(*x),
                        frame.sy(*y)
                    );
                }
            }
            PlotKind::Bar => {
                let slot = frame.width / categories.len().max(1) as f64;
                let bar_w = slot * 0.8 / series.len() as f64;
                let baseline = frame.sy(0.0_f64.clamp(frame.y_min, frame.y_max));
                for (x, y) in &s.points {
                    let left = frame.sx(*x) - slot * 0.4 + bar_w * i as f64;
                    let top = frame.sy(*y).min(baseline);
                    let bar_h = (frame.sy(*y) - baseline).abs();
                    let _ = writeln!(
                        svg,
                        r#"<rect x="{left:.1}" y="{top:.1}" width="{bar_w:.1}" height="{bar_h:.1}" fill="{color}"/>"#
                    );
                }
            }
        }

        // legend
        let lx = frame.left + 8.0 + i as f64 * 120.0;
        let _ = writeln!(
            svg,
            r#"<rect x="{lx:.1}" y="32" width="10" height="10" fill="{color}"/><text x="{:.1}" y="41">{}</text>"#,
            lx + 14.0,
            escape(s.name)
        );
    }

    svg.push_str("</svg>\n");
    Ok(svg)
}

fn draw_axes(svg: &mut String, frame: &Frame, numeric_x: bool, categories: &[String]) {
    let bottom = frame.top + frame.height;
    let right = frame.left + frame.width;
    let _ = writeln!(
        svg,
        r##"<line x1="{l:.1}" y1="{b:.1}" x2="{r:.1}" y2="{b:.1}" stroke="#333"/><line x1="{l:.1}" y1="{t:.1}" x2="{l:.1}" y2="{b:.1}" stroke="#333"/>"##,
        l = frame.left,
        b = bottom,
        r = right,
        t = frame.top
    );

    for i in 0..TICKS {
        let frac = i as f64 / (TICKS - 1) as f64;
        let value = frame.y_min + frac * (frame.y_max - frame.y_min);
        let y = frame.sy(value);
        let _ = writeln!(
            svg,
            r##"<line x1="{:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="#ddd"/><text x="{:.1}" y="{:.1}" text-anchor="end">{}</text>"##,
            frame.left,
            right,
            frame.left - 6.0,
            y + 4.0,
            format_tick(value)
        );
    }

    if numeric_x {
        for i in 0..TICKS {
            let frac = i as f64 / (TICKS - 1) as f64;
            let value = frame.x_min + frac * (frame.x_max - frame.x_min);
            let _ = writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
                frame.sx(value),
                bottom + 16.0,
                format_tick(value)
            );
        }
    } else {
        let step = categories.len().div_ceil(MAX_CATEGORY_LABELS).max(1);
        for (pos, label) in categories.iter().enumerate().step_by(step) {
            let _ = writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle">{}</text>"#,
                frame.sx(pos as f64),
                bottom + 16.0,
                escape(label)
            );
        }
    }
}

fn format_tick(value: f64) -> String {
    if value.fract().abs() < 1e-9 && value.abs() < 1e12 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}
