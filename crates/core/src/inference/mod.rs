use crate::decode::{AudioClip, DecodeError, Decoder};
use crate::emotion::{ClassificationResult, EmotionClassifier, EmotionError};
use crate::features::{FeatureError, FeatureExtractor};
use std::sync::Arc;
use std::time::Instant;

const LOG_TARGET: &str = "inference";

#[derive(thiserror::Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("feature extraction failed: {0}")]
    Features(#[from] FeatureError),

    #[error(transparent)]
    Classification(#[from] EmotionError),

    #[error("model input {model:?} does not match extractor output {extractor:?}")]
    IncompatibleModel {
        model: (usize, usize),
        extractor: (usize, usize),
    },

    #[error("inference task failed: {0}")]
    TaskFailed(String),
}

impl InferenceError {
    /// True when the clip itself is at fault (the caller should show the
    /// error to the user rather than retry or alert).
    pub fn is_invalid_audio(&self) -> bool {
        match self {
            InferenceError::Decode(e) => e.is_invalid_input(),
            InferenceError::Features(FeatureError::EmptySignal) => true,
            _ => false,
        }
    }
}

/// Decode → MFCC → classify for a single clip.
///
/// Holds no per-request state; clone it freely, the classifier weights are
/// shared behind an `Arc`.
#[derive(Clone)]
pub struct InferenceService {
    decoder: Decoder,
    extractor: Arc<FeatureExtractor>,
    classifier: Arc<dyn EmotionClassifier>,
}

impl InferenceService {
    pub fn new(
        decoder: Decoder,
        extractor: FeatureExtractor,
        classifier: Arc<dyn EmotionClassifier>,
    ) -> Result<Self, InferenceError> {
        let cfg = extractor.config();
        let produced = (cfg.n_mfcc, cfg.max_frames);
        let accepted = classifier.input_shape();
        if produced != accepted {
            return Err(InferenceError::IncompatibleModel {
                model: accepted,
                extractor: produced,
            });
        }
        Ok(Self {
            decoder,
            extractor: Arc::new(extractor),
            classifier,
        })
    }

    pub async fn analyze(&self, clip: AudioClip) -> Result<ClassificationResult, InferenceError> {
        let started = Instant::now();
        let bytes = clip.len();
        let format = clip.format;

        let audio = self.decoder.decode(clip).await?;
        let source_rate = audio.sample_rate;
        let duration = audio.duration();

        let extractor = self.extractor.clone();
        let classifier = self.classifier.clone();
        let result = tokio::task::spawn_blocking(move || {
            let audio = audio.into_rate(extractor.config().sample_rate)?;
            let features = extractor.extract(&audio)?;
            let result = classifier.classify(&features)?;
            Ok::<_, InferenceError>(result)
        })
        .await
        .map_err(|e| InferenceError::TaskFailed(e.to_string()))??;

        tracing::info!(
            target: LOG_TARGET,
            bytes,
            format = ?format,
            source_rate,
            audio_ms = duration.as_millis() as u64,
            label = %result.label(),
            confidence = result.confidence(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "clip analyzed"
        );
        Ok(result)
    }
}
