use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::tract_ndarray::Array2;
use tract_onnx::prelude::*;

use crate::ConfigError;

/// The calling convention of a classifier artifact. Declared in the manifest,
/// never guessed from the loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Binary behavior classifier returning class probabilities.
    Probability,
    /// Categorical classifier returning one cluster label per sample row.
    Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Prediction {
    Probability(f32),
    Labels(Vec<i64>),
}

impl Prediction {
    pub fn kind(&self) -> ClassifierKind {
        match self {
            Self::Probability(_) => ClassifierKind::Probability,
            Self::Labels(_) => ClassifierKind::Labels,
        }
    }

    pub fn probability(&self) -> Option<f32> {
        match self {
            Self::Probability(p) => Some(*p),
            Self::Labels(_) => None,
        }
    }

    pub fn labels(&self) -> Option<&[i64]> {
        match self {
            Self::Probability(_) => None,
            Self::Labels(l) => Some(l),
        }
    }
}

/// Predicts over a feature matrix. Shared by every worker of a pool, so
/// `predict` must be callable concurrently.
pub trait Classifier: Send + Sync {
    fn kind(&self) -> ClassifierKind;
    fn predict(&self, features: &Array2<f32>) -> Result<Prediction>;
}

/// Describes a classifier artifact and how to read its outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierManifest {
    pub path: PathBuf,
    pub kind: ClassifierKind,
    /// Index of the model output holding probabilities or labels.
    pub output: Option<usize>,
    /// Probability column of the target behavior.
    pub positive_class: Option<usize>,
    pub input_shape: Option<Vec<usize>>,
    pub scale: Option<f32>,
}

impl ClassifierManifest {
    pub fn new<P: Into<PathBuf>>(path: P, kind: ClassifierKind) -> Self {
        Self {
            path: path.into(),
            kind,
            output: None,
            positive_class: None,
            input_shape: None,
            scale: None,
        }
    }

    /// Reads a sidecar manifest. A relative model path is taken relative to
    /// the manifest's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut manifest: Self = serde_yaml::from_str(&content)?;
        if manifest.path.is_relative() {
            if let Some(dir) = path.parent() {
                manifest.path = dir.join(&manifest.path);
            }
        }
        Ok(manifest)
    }

    fn output_index(&self) -> usize {
        // sklearn exports put labels first and probabilities second
        self.output.unwrap_or(match self.kind {
            ClassifierKind::Probability => 1,
            ClassifierKind::Labels => 0,
        })
    }
}

/// Where the config finds the classifier manifest: inline, or in a file
/// shipped next to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassifierSource {
    Sidecar { manifest: PathBuf },
    Inline(ClassifierManifest),
}

impl ClassifierSource {
    pub fn resolve(&self) -> Result<ClassifierManifest, ConfigError> {
        match self {
            Self::Sidecar { manifest } => ClassifierManifest::load(manifest),
            Self::Inline(manifest) => Ok(manifest.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelFilters {
    pub scale: f32,        // how much to scale the probability
    pub clamp: (f32, f32), // bounds for output value
}

impl Default for ModelFilters {
    fn default() -> Self {
        Self {
            scale: 1.0,
            clamp: (0.0, 1.0),
        }
    }
}

impl ModelFilters {
    fn apply(&self, model: f32) -> f32 {
        (model * self.scale).min(self.clamp.1).max(self.clamp.0)
    }
}

/// A classifier exported to ONNX and run with tract.
pub struct OnnxClassifier {
    model: TypedRunnableModel<TypedModel>,
    kind: ClassifierKind,
    output: usize,
    positive_class: usize,
    filters: ModelFilters,
}

impl OnnxClassifier {
    pub fn load(manifest: &ClassifierManifest) -> Result<Self, ConfigError> {
        let model =
            Self::load_model(manifest).map_err(|e| ConfigError::model(&manifest.path, e))?;
        log::info!(
            "loaded {:?} classifier from {}",
            manifest.kind,
            manifest.path.display()
        );

        let filters = ModelFilters {
            scale: manifest.scale.unwrap_or(1.0),
            ..ModelFilters::default()
        };
        Ok(Self {
            model,
            kind: manifest.kind,
            output: manifest.output_index(),
            positive_class: manifest.positive_class.unwrap_or(1),
            filters,
        })
    }

    fn load_model(manifest: &ClassifierManifest) -> TractResult<TypedRunnableModel<TypedModel>> {
        let mut model = tract_onnx::onnx()
            // load the model
            .model_for_path(&manifest.path)?;
        if let Some(shape) = &manifest.input_shape {
            model = model.with_input_fact(0, f32::fact(shape.clone()).into())?;
        }
        model.into_optimized()?.into_runnable()
    }
}

impl Classifier for OnnxClassifier {
    fn kind(&self) -> ClassifierKind {
        self.kind
    }

    fn predict(&self, features: &Array2<f32>) -> Result<Prediction> {
        let input: Tensor = features.clone().into();
        let outputs = self.model.run(tvec!(input.into()))?;
        let out = outputs
            .get(self.output)
            .ok_or_else(|| anyhow!("model has no output {}", self.output))?;

        match self.kind {
            ClassifierKind::Probability => {
                let p = pick_probability(out.as_slice::<f32>()?, self.positive_class)?;
                Ok(Prediction::Probability(self.filters.apply(p)))
            }
            ClassifierKind::Labels => {
                let labels = out.cast_to::<i64>()?;
                Ok(Prediction::Labels(labels.as_slice::<i64>()?.to_vec()))
            }
        }
    }
}

/// Reads column `class` of the first row of a probability output.
fn pick_probability(probs: &[f32], class: usize) -> Result<f32> {
    probs.get(class).copied().ok_or_else(|| {
        anyhow!(
            "model returned {} probabilities, wanted column {}",
            probs.len(),
            class
        )
    })
}
