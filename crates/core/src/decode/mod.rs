mod fallback;
#[cfg(feature = "ffmpeg-sidecar")]
mod ffmpeg;
mod native;
mod resample;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};

pub use fallback::FallbackAudioDecoder;
#[cfg(feature = "ffmpeg-sidecar")]
pub use ffmpeg::FfmpegAudioDecoder;
pub use native::SymphoniaAudioDecoder;
pub use resample::resample_mono;

/// Filename used for browser recordings that arrive without one.
pub const DEFAULT_RECORDING_FILENAME: &str = "recording.wav";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
    Webm,
    M4a,
    Mp4,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 7] = [
        AudioFormat::Wav,
        AudioFormat::Mp3,
        AudioFormat::Ogg,
        AudioFormat::Flac,
        AudioFormat::Webm,
        AudioFormat::M4a,
        AudioFormat::Mp4,
    ];

    pub const fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Flac => "flac",
            AudioFormat::Webm => "webm",
            AudioFormat::M4a => "m4a",
            AudioFormat::Mp4 => "mp4",
        }
    }

    /// Resolves the format from an upload filename. The extension is matched
    /// case-insensitively and a name without one is rejected.
    pub fn from_filename(name: &str) -> Result<Self> {
        let (_, ext) = name
            .rsplit_once('.')
            .ok_or_else(|| DecodeError::UnsupportedFormat(name.to_owned()))?;
        ext.parse()
            .map_err(|_| DecodeError::UnsupportedFormat(name.to_owned()))
    }

    pub fn allowed_list() -> String {
        Self::ALL
            .iter()
            .map(|f| f.extension())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.extension() == lower)
            .ok_or_else(|| DecodeError::UnsupportedFormat(s.to_owned()))
    }
}

/// One uploaded or recorded clip, alive for a single request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioClip {
    pub bytes: Bytes,
    pub format: Option<AudioFormat>,
}

impl AudioClip {
    pub fn new(bytes: impl Into<Bytes>, format: Option<AudioFormat>) -> Self {
        Self {
            bytes: bytes.into(),
            format,
        }
    }

    pub fn from_upload(filename: Option<&str>, bytes: impl Into<Bytes>) -> Result<Self> {
        let name = filename
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_RECORDING_FILENAME);
        let format = AudioFormat::from_filename(name)?;
        Ok(Self::new(bytes, Some(format)))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Mono PCM in [-1, 1] at `sample_rate`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        duration_from_sample_count(self.sample_rate, 1, self.samples.len())
    }

    /// Returns the clip at `target_hz`, resampling only when the rates differ.
    pub fn into_rate(self, target_hz: u32) -> Result<Self> {
        if self.sample_rate == target_hz {
            return Ok(self);
        }
        let samples = resample_mono(&self.samples, self.sample_rate, target_hz)?;
        Ok(Self {
            sample_rate: target_hz,
            samples,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("invalid audio: {0}")]
    InvalidAudio(String),

    #[error("unsupported file type: {0} (allowed: {allowed})", allowed = AudioFormat::allowed_list())]
    UnsupportedFormat(String),

    #[error("ffmpeg unavailable: {0}")]
    FfmpegUnavailable(String),

    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),

    #[error("resampling failed: {0}")]
    Resample(String),

    #[error("decode task failed: {0}")]
    TaskFailed(String),
}

impl DecodeError {
    /// True when the upload itself is at fault rather than the host.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            DecodeError::InvalidAudio(_) | DecodeError::UnsupportedFormat(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;

pub trait AudioDecoder: Send + Sync {
    fn decode(&self, clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>>;
}

#[derive(Clone)]
pub struct Decoder {
    inner: Arc<dyn AudioDecoder>,
}

impl Decoder {
    pub fn new(inner: Arc<dyn AudioDecoder>) -> Self {
        Self { inner }
    }

    /// Symphonia first, then ffmpeg when the feature is compiled in.
    pub fn with_default_backends(target_sample_rate: u32) -> Self {
        #[cfg(feature = "ffmpeg-sidecar")]
        {
            let secondary = FfmpegAudioDecoder::new(target_sample_rate);
            Self::new(Arc::new(FallbackAudioDecoder::new(
                SymphoniaAudioDecoder,
                secondary,
            )))
        }
        #[cfg(not(feature = "ffmpeg-sidecar"))]
        {
            let _ = target_sample_rate;
            Self::new(Arc::new(SymphoniaAudioDecoder))
        }
    }

    pub async fn decode(&self, clip: AudioClip) -> Result<DecodedAudio> {
        if clip.is_empty() {
            return Err(DecodeError::InvalidAudio("empty audio stream".to_owned()));
        }
        let audio = self.inner.decode(clip).await?;
        if audio.samples.is_empty() {
            return Err(DecodeError::InvalidAudio(
                "audio decoded to zero samples".to_owned(),
            ));
        }
        if audio.sample_rate == 0 {
            return Err(DecodeError::InvalidAudio("sample rate is zero".to_owned()));
        }
        if audio.samples.iter().any(|s| !s.is_finite()) {
            return Err(DecodeError::InvalidAudio("non-finite samples".to_owned()));
        }
        Ok(audio)
    }
}

/// Averages interleaved frames down to one channel.
pub fn downmix_interleaved(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let scale = 1.0 / channels as f32;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

pub fn duration_from_sample_count(
    sample_rate_hz: u32,
    channels: u16,
    sample_count: usize,
) -> Duration {
    if sample_rate_hz == 0 || channels == 0 {
        return Duration::from_secs(0);
    }
    let frames = sample_count / usize::from(channels);
    let micros = (u128::from(frames as u64) * 1_000_000u128) / u128::from(sample_rate_hz);
    Duration::from_micros(micros.min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::Cursor;

    /// Renders a 16-bit PCM WAV file in memory.
    pub fn wav_bytes(sample_rate: u32, channels: u16, samples: &[f32]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let mut writer =
                hound::WavWriter::new(Cursor::new(&mut buf), spec).expect("wav writer");
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                writer.write_sample(v).expect("write sample");
            }
            writer.finalize().expect("finalize wav");
        }
        buf
    }

    /// Renders a 32-bit float WAV, keeping values (NaN, inf) untouched.
    pub fn wav_bytes_f32(sample_rate: u32, samples: &[f32]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut buf = Vec::new();
        {
            let mut writer =
                hound::WavWriter::new(Cursor::new(&mut buf), spec).expect("wav writer");
            for &s in samples {
                writer.write_sample(s).expect("write sample");
            }
            writer.finalize().expect("finalize wav");
        }
        buf
    }

    pub fn sine(sample_rate: u32, freq_hz: f32, seconds: f32, amplitude: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                amplitude * (2.0 * std::f32::consts::PI * freq_hz * t).sin()
            })
            .collect()
    }
}
