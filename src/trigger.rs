use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    ClassificationResult, ClassifierKind, Config, ConfigError, FeatureId, FeatureTransform,
    Flatten, OnnxClassifier, PoseTransform, Prediction, SkeletonFrame, SubWindows,
    TimeWindowAccumulator, TransformKind, Worker, WorkerPool,
};

/// Where the status text is drawn.
pub const OVERLAY_ORIGIN: (i32, i32) = (50, 50);
/// BGR colors of the status text.
pub const MATCH_COLOR: (u8, u8, u8) = (0, 255, 0);
pub const IDLE_COLOR: (u8, u8, u8) = (0, 0, 255);

pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Turns the cached prediction into a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionRule {
    /// Fires when the behavior probability reaches the threshold.
    Threshold(f32),
    /// Fires when the first predicted label is one of the targets.
    LabelMatch(BTreeSet<i64>),
}

impl DecisionRule {
    pub fn kind(&self) -> ClassifierKind {
        match self {
            Self::Threshold(_) => ClassifierKind::Probability,
            Self::LabelMatch(_) => ClassifierKind::Labels,
        }
    }

    pub fn decide(&self, prediction: Option<&Prediction>) -> bool {
        match self {
            Self::Threshold(threshold) => prediction
                .and_then(Prediction::probability)
                .is_some_and(|p| p >= *threshold),
            Self::LabelMatch(targets) => prediction
                .and_then(Prediction::labels)
                .and_then(|labels| labels.first())
                .is_some_and(|label| targets.contains(label)),
        }
    }
}

/// What to do with a result older than the one already cached. Results
/// arrive in slot order, so an older window can finish after a newer one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Every collected result replaces the cache.
    #[default]
    AcceptAll,
    /// Results with a lower feature id than the cached one are ignored.
    RejectOlder,
}

#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub freshness: Freshness,
    /// Flag the response as stale after this many frames without a result.
    pub stale_after_frames: Option<u64>,
    /// Attach overlay geometry to each response.
    pub overlay: bool,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            freshness: Freshness::default(),
            stale_after_frames: None,
            overlay: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub text: String,
    pub origin: (i32, i32),
    pub color: (u8, u8, u8),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseBody {
    pub status: String,
    pub stale: bool,
    /// Window the cached result was computed from.
    pub feature_id: Option<FeatureId>,
    pub plot: Option<Overlay>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub result: bool,
    pub body: ResponseBody,
}

/// TriggerEvaluator classifies behavior once per frame without waiting on
/// the classifier. Each frame feeds the window accumulator, at most one
/// finished result is picked up from the pool, and the decision is made on
/// whatever result is cached, however old.
pub struct TriggerEvaluator {
    accumulator: TimeWindowAccumulator,
    pool: WorkerPool,
    rule: DecisionRule,
    options: EvaluatorOptions,
    last: Option<ClassificationResult>,
    frames_since_result: u64,
}

impl TriggerEvaluator {
    pub fn new(
        accumulator: TimeWindowAccumulator,
        pool: WorkerPool,
        rule: DecisionRule,
        options: EvaluatorOptions,
    ) -> Result<Self, ConfigError> {
        if options.stale_after_frames == Some(0) {
            return Err(ConfigError::invalid(
                "trigger.stale_after_frames",
                "must be at least 1",
            ));
        }
        if rule.kind() != pool.kind() {
            return Err(ConfigError::KindMismatch {
                expected: rule.kind(),
                actual: pool.kind(),
            });
        }

        Ok(Self {
            accumulator,
            pool,
            rule,
            options,
            last: None,
            frames_since_result: 0,
        })
    }

    /// Loads the classifier named by the config, builds the pool and starts it.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let frames = config.window.frames;
        if frames == 0 {
            return Err(ConfigError::invalid("window.frames", "must be at least 1"));
        }
        let transform = transform_for(config)?;

        let manifest = config.classifier.resolve()?;
        let classifier = OnnxClassifier::load(&manifest)?;
        let worker = Worker::new(transform, Arc::new(classifier));
        let size = config.pool.as_ref().and_then(|p| p.size).unwrap_or(1);
        let pool = WorkerPool::new(size, worker)?;

        let trigger = config.trigger.clone().unwrap_or_default();
        let rule = match manifest.kind {
            ClassifierKind::Probability => {
                DecisionRule::Threshold(trigger.threshold.unwrap_or(DEFAULT_THRESHOLD))
            }
            ClassifierKind::Labels => {
                let targets: BTreeSet<i64> =
                    trigger.target_labels.unwrap_or_default().into_iter().collect();
                if targets.is_empty() {
                    log::warn!("no target labels configured, trigger will never fire");
                }
                DecisionRule::LabelMatch(targets)
            }
        };
        let options = EvaluatorOptions {
            freshness: trigger.freshness.unwrap_or_default(),
            stale_after_frames: trigger.stale_after_frames,
            overlay: trigger.overlay.unwrap_or(true),
        };

        let accumulator = TimeWindowAccumulator::new(frames, PoseTransform::from_config(&config.pose));
        let mut evaluator = Self::new(accumulator, pool, rule, options)?;
        evaluator.pool.start()?;
        Ok(evaluator)
    }

    pub fn evaluate(&mut self, frame: &SkeletonFrame) -> Response {
        self.evaluate_with(frame, None)
    }

    /// Like [`evaluate`](Self::evaluate), first replacing the decision rule.
    /// The new rule stays in effect for later frames. A rule for the wrong
    /// classifier kind is ignored.
    pub fn evaluate_with(&mut self, frame: &SkeletonFrame, rule: Option<DecisionRule>) -> Response {
        self.accumulator.push(frame, &mut self.pool);
        self.frames_since_result += 1;

        if let Some(result) = self.pool.collect() {
            self.accept(result);
        }

        if let Some(rule) = rule {
            if let Err(e) = self.set_rule(rule) {
                log::warn!("ignoring rule override: {e}");
            }
        }
        self.respond()
    }

    pub fn set_rule(&mut self, rule: DecisionRule) -> Result<(), ConfigError> {
        if rule.kind() != self.pool.kind() {
            return Err(ConfigError::KindMismatch {
                expected: rule.kind(),
                actual: self.pool.kind(),
            });
        }
        self.rule = rule;
        Ok(())
    }

    fn accept(&mut self, result: ClassificationResult) {
        if self.options.freshness == Freshness::RejectOlder {
            if let Some(last) = &self.last {
                if result.id < last.id {
                    log::debug!(
                        "ignoring window {} from worker {}, already have {}",
                        result.id,
                        result.slot,
                        last.id
                    );
                    return;
                }
            }
        }
        self.last = Some(result);
        self.frames_since_result = 0;
    }

    fn is_stale(&self) -> bool {
        self.options
            .stale_after_frames
            .is_some_and(|n| self.frames_since_result >= n)
    }

    fn respond(&self) -> Response {
        let prediction = self.last.as_ref().map(|r| &r.prediction);
        let result = self.rule.decide(prediction);

        let mut status = match &self.rule {
            DecisionRule::Threshold(_) => {
                let p = prediction.and_then(Prediction::probability).unwrap_or(0.0);
                if result {
                    format!("Motif matched: {p:.2}")
                } else {
                    format!("Current probability: {p:.2}")
                }
            }
            DecisionRule::LabelMatch(_) => {
                let labels = prediction.and_then(Prediction::labels).unwrap_or_default();
                if result {
                    format!("Motif matched: {labels:?}")
                } else {
                    format!("Current Class: {labels:?}")
                }
            }
        };
        let stale = self.is_stale();
        if stale {
            status.push_str(" (stale)");
        }

        let plot = self.options.overlay.then(|| Overlay {
            text: status.clone(),
            origin: OVERLAY_ORIGIN,
            color: if result { MATCH_COLOR } else { IDLE_COLOR },
        });

        Response {
            result,
            body: ResponseBody {
                status,
                stale,
                feature_id: self.last.as_ref().map(|r| r.id),
                plot,
            },
        }
    }

    pub fn rule(&self) -> &DecisionRule {
        &self.rule
    }

    pub fn last_result(&self) -> Option<&ClassificationResult> {
        self.last.as_ref()
    }

    pub fn accumulator(&self) -> &TimeWindowAccumulator {
        &self.accumulator
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut WorkerPool {
        &mut self.pool
    }

    pub fn stop(&mut self) {
        self.pool.stop();
    }
}

fn transform_for(config: &Config) -> Result<Arc<dyn FeatureTransform>, ConfigError> {
    let features = config.features.clone().unwrap_or_default();
    match features.transform.unwrap_or_default() {
        TransformKind::Flatten => Ok(Arc::new(Flatten)),
        TransformKind::SubWindows => {
            let frames = features
                .sub_window
                .ok_or_else(|| ConfigError::invalid("features.sub_window", "required for sub_windows"))?;
            if frames == 0 || config.window.frames % frames != 0 {
                return Err(ConfigError::invalid(
                    "features.sub_window",
                    format!(
                        "{frames} does not split a window of {} frames",
                        config.window.frames
                    ),
                ));
            }
            Ok(Arc::new(SubWindows { frames }))
        }
    }
}
