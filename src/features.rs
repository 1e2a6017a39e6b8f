use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::tract_ndarray::Array2;

use crate::TimeWindow;

/// Turns a time window into the classifier's input matrix, one sample per row.
///
/// Implementations must be pure: the same window always yields the same
/// features, and nothing outside the call is touched. Each worker calls the
/// transform once per accepted window, from its own thread.
pub trait FeatureTransform: Send + Sync {
    fn extract(&self, window: &TimeWindow) -> Result<Array2<f32>>;
}

impl<F> FeatureTransform for F
where
    F: Fn(&TimeWindow) -> Result<Array2<f32>> + Send + Sync,
{
    fn extract(&self, window: &TimeWindow) -> Result<Array2<f32>> {
        self(window)
    }
}

/// The whole window as a single sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl FeatureTransform for Flatten {
    fn extract(&self, window: &TimeWindow) -> Result<Array2<f32>> {
        let len = window.frames() * window.width();
        Ok(Array2::from_shape_vec(
            (1, len),
            window.iter().copied().collect(),
        )?)
    }
}

/// Consecutive sub-windows of `frames` rows, one sample each. Used with label
/// classifiers that assign a cluster to every sub-window.
#[derive(Debug, Clone, Copy)]
pub struct SubWindows {
    pub frames: usize,
}

impl FeatureTransform for SubWindows {
    fn extract(&self, window: &TimeWindow) -> Result<Array2<f32>> {
        ensure!(self.frames > 0, "sub-window must span at least one frame");
        ensure!(
            window.frames() % self.frames == 0,
            "window of {} frames does not split into sub-windows of {}",
            window.frames(),
            self.frames
        );
        let rows = window.frames() / self.frames;
        Ok(Array2::from_shape_vec(
            (rows, self.frames * window.width()),
            window.iter().copied().collect(),
        )?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Flatten,
    SubWindows,
}
