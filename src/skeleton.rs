use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PoseConfig;

/// A 2-D body part coordinate. Undetected parts carry NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(Option<f32>, Option<f32>)", into = "(Option<f32>, Option<f32>)")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const MISSING: Point = Point {
        x: f32::NAN,
        y: f32::NAN,
    };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(Option<f32>, Option<f32>)> for Point {
    fn from((x, y): (Option<f32>, Option<f32>)) -> Self {
        Self {
            x: x.unwrap_or(f32::NAN),
            y: y.unwrap_or(f32::NAN),
        }
    }
}

impl From<Point> for (Option<f32>, Option<f32>) {
    fn from(p: Point) -> Self {
        let finite = |v: f32| v.is_finite().then_some(v);
        (finite(p.x), finite(p.y))
    }
}

/// One pose estimate: body part name to coordinate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkeletonFrame(BTreeMap<String, Point>);

impl SkeletonFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<S: Into<String>>(&mut self, part: S, point: Point) {
        self.0.insert(part.into(), point);
    }

    pub fn get(&self, part: &str) -> Option<&Point> {
        self.0.get(part)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Point)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Point)> for SkeletonFrame {
    fn from_iter<I: IntoIterator<Item = (S, Point)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// What to write for a coordinate that was not detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPoints {
    /// Replace with the neutral value.
    #[default]
    Zero,
    /// Pass NaN through to the feature transform.
    Keep,
}

/// Turns a skeleton frame into the fixed-width row stored in a time window.
///
/// Body parts are taken in the configured order, or in name order when no
/// order is configured. Each part contributes `x, y`. Rows shorter than
/// `width` (fewer animals or parts detected) are padded with zeros, longer
/// rows are truncated.
#[derive(Debug, Clone)]
pub struct PoseTransform {
    bodyparts: Vec<String>,
    exclude: Vec<String>,
    width: usize,
    missing: MissingPoints,
    truncated: u64,
}

impl PoseTransform {
    pub fn new(width: usize) -> Self {
        Self {
            bodyparts: Vec::new(),
            exclude: Vec::new(),
            width,
            missing: MissingPoints::default(),
            truncated: 0,
        }
    }

    pub fn from_config(config: &PoseConfig) -> Self {
        Self {
            bodyparts: config.bodyparts.clone().unwrap_or_default(),
            exclude: config.exclude.clone().unwrap_or_default(),
            width: config.width,
            missing: config.missing.unwrap_or_default(),
            truncated: 0,
        }
    }

    pub fn with_bodyparts<S: Into<String>>(mut self, parts: impl IntoIterator<Item = S>) -> Self {
        self.bodyparts = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exclude<S: Into<String>>(mut self, parts: impl IntoIterator<Item = S>) -> Self {
        self.exclude = parts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_missing(mut self, missing: MissingPoints) -> Self {
        self.missing = missing;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Frames that carried more values than fit in a row.
    pub fn truncated_frames(&self) -> u64 {
        self.truncated
    }

    pub fn apply(&mut self, frame: &SkeletonFrame) -> Vec<f32> {
        let points: Vec<Point> = if self.bodyparts.is_empty() {
            frame
                .iter()
                .filter(|(name, _)| !self.exclude.contains(*name))
                .map(|(_, p)| *p)
                .collect()
        } else {
            self.bodyparts
                .iter()
                .filter(|name| !self.exclude.contains(*name))
                .map(|name| frame.get(name).copied().unwrap_or(Point::MISSING))
                .collect()
        };

        let mut row: Vec<f32> = points
            .iter()
            .flat_map(|p| [p.x, p.y])
            .map(|v| match self.missing {
                MissingPoints::Zero if !v.is_finite() => 0.0,
                _ => v,
            })
            .collect();

        if row.len() > self.width {
            // once per transform, the mismatch repeats on every frame
            if self.truncated == 0 {
                log::warn!(
                    "frame carries {} values, truncating to {}",
                    row.len(),
                    self.width
                );
            }
            self.truncated += 1;
        }
        row.resize(self.width, 0.0);
        row
    }
}
