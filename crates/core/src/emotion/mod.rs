mod classifier;
mod crnn;

use crate::features::FeatureMatrix;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

pub use classifier::CrnnEmotionClassifier;
pub use crnn::{CrnnConfig, CrnnModel};

/// Closed label set, in the classifier's output order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Neutral,
    Calm,
    Happy,
    Sad,
    Angry,
    Fear,
    Disgust,
    Surprise,
}

impl EmotionLabel {
    pub const COUNT: usize = 8;

    pub const ALL: [EmotionLabel; Self::COUNT] = [
        EmotionLabel::Neutral,
        EmotionLabel::Calm,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Angry,
        EmotionLabel::Fear,
        EmotionLabel::Disgust,
        EmotionLabel::Surprise,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Calm => "calm",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Angry => "angry",
            EmotionLabel::Fear => "fear",
            EmotionLabel::Disgust => "disgust",
            EmotionLabel::Surprise => "surprise",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LabelScore {
    pub label: EmotionLabel,
    pub probability: f32,
}

/// Top label plus the full distribution it was taken from.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClassificationResult {
    label: EmotionLabel,
    confidence: f32,
    scores: Vec<LabelScore>,
}

impl ClassificationResult {
    /// Builds a result from a softmax output in label order. The label is the
    /// arg-max; ties go to the earliest label.
    pub fn from_probabilities(probabilities: &[f32]) -> Result<Self, EmotionError> {
        if probabilities.len() != EmotionLabel::COUNT {
            return Err(EmotionError::ScoreCount {
                expected: EmotionLabel::COUNT,
                actual: probabilities.len(),
            });
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(EmotionError::NonFiniteScores);
        }

        let mut best = 0usize;
        for (i, &p) in probabilities.iter().enumerate() {
            if p > probabilities[best] {
                best = i;
            }
        }

        let scores = EmotionLabel::ALL
            .iter()
            .zip(probabilities)
            .map(|(&label, &probability)| LabelScore { label, probability })
            .collect();
        Ok(Self {
            label: EmotionLabel::ALL[best],
            confidence: probabilities[best].clamp(0.0, 1.0),
            scores,
        })
    }

    pub fn label(&self) -> EmotionLabel {
        self.label
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn scores(&self) -> &[LabelScore] {
        &self.scores
    }

    pub fn probability(&self, label: EmotionLabel) -> f32 {
        self.scores
            .iter()
            .find(|s| s.label == label)
            .map_or(0.0, |s| s.probability)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EmotionError {
    #[error("model unavailable at {path}: {reason}")]
    ModelUnavailable { path: PathBuf, reason: String },

    #[error("feature matrix shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("model produced {actual} scores, expected {expected}")]
    ScoreCount { expected: usize, actual: usize },

    #[error("model produced non-finite scores")]
    NonFiniteScores,

    #[error("inference failed: {0}")]
    Inference(#[from] candle_core::Error),
}

/// A loaded, read-only model mapping one feature matrix to a distribution
/// over [`EmotionLabel`]. Implementations are shared across requests.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, features: &FeatureMatrix) -> Result<ClassificationResult, EmotionError>;

    /// `(coefficients, frames)` the model was trained on.
    fn input_shape(&self) -> (usize, usize);
}
