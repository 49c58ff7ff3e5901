mod mel;

use crate::config::FeatureConfig;
use crate::decode::DecodedAudio;
use mel::{dct_basis, hann_window, mel_filterbank, MelFilter};
use realfft::{RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LOG_TARGET: &str = "features";
const AMIN: f32 = 1e-10;

/// MFCC coefficients over time, stored row-major by coefficient
/// (`data[c * frames + t]`). Always exactly `coefficients × frames`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeatureMatrix {
    coefficients: usize,
    frames: usize,
    data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(coefficients: usize, frames: usize, data: Vec<f32>) -> Result<Self, FeatureError> {
        if data.len() != coefficients * frames {
            return Err(FeatureError::ShapeMismatch {
                expected: coefficients * frames,
                actual: data.len(),
            });
        }
        Ok(Self {
            coefficients,
            frames,
            data,
        })
    }

    pub fn zeros(coefficients: usize, frames: usize) -> Self {
        Self {
            coefficients,
            frames,
            data: vec![0.0; coefficients * frames],
        }
    }

    /// `(coefficients, frames)`
    pub fn shape(&self) -> (usize, usize) {
        (self.coefficients, self.frames)
    }

    pub fn get(&self, coefficient: usize, frame: usize) -> Option<f32> {
        if coefficient >= self.coefficients || frame >= self.frames {
            return None;
        }
        self.data.get(coefficient * self.frames + frame).copied()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FeatureError {
    #[error("cannot extract features from an empty signal")]
    EmptySignal,
    #[error("expected audio at {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },
    #[error("feature data has {actual} values, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },
    #[error("fft failed: {0}")]
    Fft(String),
}

/// MFCC front end: centered STFT, Slaney mel filterbank, dB with an 80 dB
/// floor, orthonormal DCT-II, then pad/truncate to `max_frames`.
///
/// All tables are built once; `extract` takes `&self` and allocates its own
/// scratch so one extractor serves concurrent requests.
#[derive(Clone)]
pub struct FeatureExtractor {
    config: FeatureConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    filters: Vec<MelFilter>,
    dct: Vec<Vec<f32>>,
}

impl FeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.n_fft);
        let sr = f64::from(config.sample_rate);
        Self {
            fft,
            window: hann_window(config.n_fft),
            filters: mel_filterbank(config.n_mels, config.n_fft, sr, 0.0, sr / 2.0),
            dct: dct_basis(config.n_mfcc, config.n_mels),
            config,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    /// Extracts from audio already at the configured sample rate.
    pub fn extract(&self, audio: &DecodedAudio) -> Result<FeatureMatrix, FeatureError> {
        if audio.sample_rate != self.config.sample_rate {
            return Err(FeatureError::SampleRateMismatch {
                expected: self.config.sample_rate,
                actual: audio.sample_rate,
            });
        }
        self.extract_samples(&audio.samples)
    }

    pub fn extract_samples(&self, samples: &[f32]) -> Result<FeatureMatrix, FeatureError> {
        if samples.is_empty() {
            return Err(FeatureError::EmptySignal);
        }

        let log_mel = self.log_mel_spectrogram(samples)?;
        let total_frames = log_mel.len();
        let (n_mfcc, max_frames) = (self.config.n_mfcc, self.config.max_frames);

        // Frames past `max_frames` still shaped the dB floor above; only the
        // retained ones are projected.
        let mut data = vec![0.0f32; n_mfcc * max_frames];
        for (t, frame) in log_mel.iter().take(max_frames).enumerate() {
            for (c, basis) in self.dct.iter().enumerate() {
                data[c * max_frames + t] = basis.iter().zip(frame).map(|(b, x)| b * x).sum();
            }
        }

        tracing::trace!(
            target: LOG_TARGET,
            samples = samples.len(),
            total_frames,
            kept_frames = total_frames.min(max_frames),
            "extracted mfcc"
        );
        FeatureMatrix::new(n_mfcc, max_frames, data)
    }

    fn log_mel_spectrogram(&self, samples: &[f32]) -> Result<Vec<Vec<f32>>, FeatureError> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let pad = n_fft / 2;

        let mut padded = vec![0.0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);
        let n_frames = 1 + (padded.len() - n_fft) / hop;

        let mut input = self.fft.make_input_vec();
        let mut spectrum = self.fft.make_output_vec();
        let mut power = vec![0.0f32; spectrum.len()];
        let mut frames = Vec::with_capacity(n_frames);
        let mut max_db = f32::NEG_INFINITY;

        for frame_idx in 0..n_frames {
            let start = frame_idx * hop;
            for ((dst, &x), &w) in input
                .iter_mut()
                .zip(&padded[start..start + n_fft])
                .zip(&self.window)
            {
                *dst = x * w;
            }

            self.fft
                .process(&mut input, &mut spectrum)
                .map_err(|e| FeatureError::Fft(e.to_string()))?;
            for (p, c) in power.iter_mut().zip(&spectrum) {
                *p = c.re * c.re + c.im * c.im;
            }

            let mel_db: Vec<f32> = self
                .filters
                .iter()
                .map(|f| 10.0 * f.apply(&power).max(AMIN).log10())
                .collect();
            max_db = mel_db.iter().copied().fold(max_db, f32::max);
            frames.push(mel_db);
        }

        let floor = max_db - self.config.top_db;
        for v in frames.iter_mut().flatten() {
            *v = v.max(floor);
        }
        Ok(frames)
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}
