use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

mod error;
pub use error::ConfigError;

mod skeleton;
pub use skeleton::{MissingPoints, Point, PoseTransform, SkeletonFrame};

mod window;
pub use window::{
    DispatchOutcome, Dispatcher, FeatureId, TimeWindow, TimeWindowAccumulator, WorkItem,
};

mod features;
pub use features::{FeatureTransform, Flatten, SubWindows, TransformKind};

mod classifier;
pub use classifier::{
    Classifier, ClassifierKind, ClassifierManifest, ClassifierSource, ModelFilters,
    OnnxClassifier, Prediction,
};

mod worker;
pub use worker::{ClassificationResult, Worker, LATENCY_HISTORY};

mod pool;
pub use pool::{PoolStats, PoolStatus, WorkerPool};

mod trigger;
pub use trigger::{
    DecisionRule, EvaluatorOptions, Freshness, Overlay, Response, ResponseBody, TriggerEvaluator,
    DEFAULT_THRESHOLD,
};

/// How a skeleton frame becomes one row of the time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseConfig {
    /// Body parts in row order. Defaults to name order.
    pub bodyparts: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    /// Values per row.
    pub width: usize,
    pub missing: Option<MissingPoints>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub frames: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub transform: Option<TransformKind>,
    pub sub_window: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub threshold: Option<f32>,
    pub target_labels: Option<Vec<i64>>,
    pub freshness: Option<Freshness>,
    pub stale_after_frames: Option<u64>,
    pub overlay: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub classifier: ClassifierSource,
    pub pose: PoseConfig,
    pub window: WindowConfig,
    pub features: Option<FeatureConfig>,
    pub pool: Option<PoolConfig>,
    pub trigger: Option<TriggerConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
classifier:
  path: models/behavior.onnx
  kind: probability
  input_shape: [1, 420]
pose:
  bodyparts: [nose, neck, tailroot]
  exclude: [tail_tip]
  width: 28
  missing: keep
window:
  frames: 15
pool:
  size: 4
trigger:
  threshold: 0.7
  freshness: reject_older
  stale_after_frames: 30
"#;

    #[test]
    fn parses_full_config() {
        let c: Config = serde_yaml::from_str(FULL).unwrap();
        let m = c.classifier.resolve().unwrap();
        assert_eq!(m.kind, ClassifierKind::Probability);
        assert_eq!(m.input_shape, Some(vec![1, 420]));
        assert_eq!(c.pose.width, 28);
        assert_eq!(c.pose.missing, Some(MissingPoints::Keep));
        assert_eq!(c.window.frames, 15);
        assert_eq!(c.pool.unwrap().size, Some(4));

        let t = c.trigger.unwrap();
        assert_eq!(t.threshold, Some(0.7));
        assert_eq!(t.freshness, Some(Freshness::RejectOlder));
        assert_eq!(t.stale_after_frames, Some(30));
        assert!(c.features.is_none());
    }

    #[test]
    fn optional_sections_may_be_omitted() {
        let c: Config = serde_yaml::from_str(
            "classifier: {path: m.onnx, kind: labels}\npose: {width: 4}\nwindow: {frames: 6}\n",
        )
        .unwrap();
        assert!(c.pool.is_none());
        assert!(c.trigger.is_none());
        assert!(c.pose.bodyparts.is_none());
    }

    #[test]
    fn classifier_may_point_at_sidecar() {
        let c: Config = serde_yaml::from_str(
            "classifier: {manifest: models/simba.yaml}\npose: {width: 4}\nwindow: {frames: 6}\n",
        )
        .unwrap();
        assert_eq!(
            c.classifier,
            ClassifierSource::Sidecar {
                manifest: "models/simba.yaml".into()
            }
        );
    }

    #[test]
    fn missing_window_is_an_error() {
        let r: Result<Config, _> =
            serde_yaml::from_str("classifier: {path: m.onnx, kind: labels}\npose: {width: 4}\n");
        assert!(r.is_err());
    }

    #[test]
    fn load_reports_path() {
        match Config::load("no/such/config.yaml") {
            Err(ConfigError::Io { path, .. }) => assert!(path.ends_with("config.yaml")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
