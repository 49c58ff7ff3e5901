use crate::emotion::{
    ClassificationResult, CrnnConfig, CrnnModel, EmotionClassifier, EmotionError,
};
use crate::features::FeatureMatrix;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::path::{Path, PathBuf};

const LOG_TARGET: &str = "emotion::classifier";

/// CRNN classifier whose weights are loaded once and never mutated.
#[derive(Clone, Debug)]
pub struct CrnnEmotionClassifier {
    model: CrnnModel,
    device: Device,
    source: Option<PathBuf>,
}

impl CrnnEmotionClassifier {
    /// Loads a checkpoint (`.safetensors`, or a PyTorch `.pth`/`.pt` state
    /// dict) and runs one warm-up pass. Any failure is `ModelUnavailable`.
    pub fn load(path: impl AsRef<Path>, config: CrnnConfig) -> Result<Self, EmotionError> {
        let path = path.as_ref();
        let unavailable = |reason: String| EmotionError::ModelUnavailable {
            path: path.to_path_buf(),
            reason,
        };

        if !path.is_file() {
            return Err(unavailable("checkpoint file not found".to_owned()));
        }

        let device = Device::Cpu;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let vb = match ext.as_str() {
            "safetensors" => {
                let tensors = candle_core::safetensors::load(path, &device)
                    .map_err(|e| unavailable(e.to_string()))?;
                VarBuilder::from_tensors(tensors, DType::F32, &device)
            }
            "pth" | "pt" => VarBuilder::from_pth(path, DType::F32, &device)
                .map_err(|e| unavailable(e.to_string()))?,
            other => {
                return Err(unavailable(format!(
                    "unsupported checkpoint extension {other:?} (expected safetensors, pth or pt)"
                )))
            }
        };

        let mut classifier =
            Self::from_var_builder(vb, config).map_err(|e| unavailable(e.to_string()))?;
        classifier.source = Some(path.to_path_buf());
        classifier
            .warm_up()
            .map_err(|e| unavailable(format!("warm-up pass failed: {e}")))?;

        tracing::info!(
            target: LOG_TARGET,
            path = %path.display(),
            n_mfcc = config.n_mfcc,
            frames = config.frames,
            "emotion model loaded"
        );
        Ok(classifier)
    }

    /// Builds the model from any variable source, e.g. an in-memory `VarMap`.
    pub fn from_var_builder(vb: VarBuilder, config: CrnnConfig) -> Result<Self, EmotionError> {
        let device = vb.device().clone();
        let model = CrnnModel::new(config, vb)?;
        Ok(Self {
            model,
            device,
            source: None,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn warm_up(&self) -> Result<(), EmotionError> {
        let (c, t) = self.input_shape();
        self.classify(&FeatureMatrix::zeros(c, t)).map(|_| ())
    }
}

impl EmotionClassifier for CrnnEmotionClassifier {
    fn classify(&self, features: &FeatureMatrix) -> Result<ClassificationResult, EmotionError> {
        let expected = self.input_shape();
        if features.shape() != expected {
            return Err(EmotionError::ShapeMismatch {
                expected,
                actual: features.shape(),
            });
        }

        let (c, t) = expected;
        let input = Tensor::from_slice(features.as_slice(), (1, c, t), &self.device)?;
        let probabilities = self.model.forward(&input)?.squeeze(0)?.to_vec1::<f32>()?;
        let result = ClassificationResult::from_probabilities(&probabilities)?;

        tracing::debug!(
            target: LOG_TARGET,
            label = %result.label(),
            confidence = result.confidence(),
            "classified clip"
        );
        Ok(result)
    }

    fn input_shape(&self) -> (usize, usize) {
        let cfg = self.model.config();
        (cfg.n_mfcc, cfg.frames)
    }
}
