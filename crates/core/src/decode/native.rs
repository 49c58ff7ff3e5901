use crate::decode::{
    downmix_interleaved, AudioClip, AudioDecoder, AudioFormat, DecodeError, DecodedAudio, Result,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

const LOG_TARGET: &str = "decode::native";

/// Pure-Rust decoder covering WAV, MP3, OGG/Vorbis, FLAC and MP4/M4A (AAC, ALAC).
#[derive(Clone, Copy, Debug, Default)]
pub struct SymphoniaAudioDecoder;

impl SymphoniaAudioDecoder {
    pub fn decode_bytes(&self, bytes: Bytes, format: Option<AudioFormat>) -> Result<DecodedAudio> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

        let mut hint = Hint::new();
        if let Some(f) = format {
            hint.with_extension(f.extension());
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| invalid("unrecognised container", e))?;
        let mut reader = probed.format;

        let (track_id, codec_params) = {
            let track = reader
                .tracks()
                .iter()
                .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
                .ok_or_else(|| DecodeError::InvalidAudio("no decodable audio track".to_owned()))?;
            (track.id, track.codec_params.clone())
        };

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| invalid("unsupported codec", e))?;

        let mut sample_rate = codec_params.sample_rate;
        let mut samples = Vec::new();
        let mut skipped_packets = 0usize;

        loop {
            let packet = match reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(invalid("failed to read packet", e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate.get_or_insert(spec.rate);
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    samples.extend(downmix_interleaved(buf.samples(), spec.channels.count()));
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    // Corrupt frames are skipped, as players do.
                    skipped_packets += 1;
                    tracing::debug!(target: LOG_TARGET, error = msg, "skipping undecodable packet");
                }
                Err(e) => return Err(invalid("decoder failed", e)),
            }
        }

        if skipped_packets > 0 {
            tracing::warn!(target: LOG_TARGET, skipped_packets, "some packets could not be decoded");
        }

        let sample_rate = sample_rate
            .filter(|&r| r > 0)
            .ok_or_else(|| DecodeError::InvalidAudio("unknown sample rate".to_owned()))?;
        if samples.is_empty() {
            return Err(DecodeError::InvalidAudio(
                "audio decoded to zero samples".to_owned(),
            ));
        }

        tracing::debug!(
            target: LOG_TARGET,
            sample_rate,
            samples = samples.len(),
            "decoded clip"
        );
        Ok(DecodedAudio {
            sample_rate,
            samples,
        })
    }
}

fn invalid(context: &str, err: SymphoniaError) -> DecodeError {
    DecodeError::InvalidAudio(format!("{context}: {err}"))
}

impl AudioDecoder for SymphoniaAudioDecoder {
    fn decode(&self, clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
        let this = *self;
        async move {
            tokio::task::spawn_blocking(move || this.decode_bytes(clip.bytes, clip.format))
                .await
                .map_err(|e| DecodeError::TaskFailed(e.to_string()))?
        }
        .boxed()
    }
}
