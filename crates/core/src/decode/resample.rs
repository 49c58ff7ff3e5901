use crate::decode::{DecodeError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

const SINC_LEN: usize = 256;
// Trailing zeros that flush the filter tail out of the single chunk.
const TAIL_PAD: usize = 8 * SINC_LEN;

/// Offline band-limited resampling of a whole mono clip.
///
/// Output length is `round(len * to_hz / from_hz)` and the output is
/// time-aligned with the input. The latency of a one-chunk `process` call
/// is measured by pushing an impulse through an identical resampler.
pub fn resample_mono(samples: &[f32], from_hz: u32, to_hz: u32) -> Result<Vec<f32>> {
    if from_hz == 0 || to_hz == 0 {
        return Err(DecodeError::Resample(format!(
            "invalid sample rates: from_hz={from_hz} to_hz={to_hz}"
        )));
    }
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to_hz) / f64::from(from_hz);
    let expected = (samples.len() as f64 * ratio).round() as usize;
    let chunk = samples.len() + TAIL_PAD;

    let mut padded = Vec::with_capacity(chunk);
    padded.extend_from_slice(samples);
    padded.resize(chunk, 0.0);

    let mut impulse = vec![0.0f32; chunk];
    impulse[0] = 1.0;
    let delay = peak_index(&process_chunk(impulse, ratio)?);

    let mut out = process_chunk(padded, ratio)?;
    let start = delay.min(out.len());
    out.drain(..start);
    out.resize(expected, 0.0);
    Ok(out)
}

fn process_chunk(input: Vec<f32>, ratio: f64) -> Result<Vec<f32>> {
    let params = SincInterpolationParameters {
        sinc_len: SINC_LEN,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, input.len(), 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    let mut waves_out = resampler
        .process(&[input], None)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    waves_out
        .pop()
        .ok_or_else(|| DecodeError::Resample("resampler returned no channels".to_owned()))
}

fn peak_index(xs: &[f32]) -> usize {
    xs.iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map_or(0, |(i, _)| i)
}
