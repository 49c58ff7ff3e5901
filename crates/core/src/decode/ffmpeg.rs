use crate::decode::{AudioClip, AudioDecoder, DecodeError, DecodedAudio, Result};
use bytes::Bytes;
use ffmpeg_sidecar::{command::ffmpeg_is_installed, download, paths::ffmpeg_path};
use futures::future::BoxFuture;
use futures::FutureExt;

const LOG_TARGET: &str = "decode::ffmpeg";

/// Decodes through an ffmpeg child process, straight to f32 mono at the
/// target rate. Covers browser recordings (WebM/Opus) that symphonia lacks.
#[derive(Clone, Debug)]
pub struct FfmpegAudioDecoder {
    sample_rate: u32,
}

impl FfmpegAudioDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Downloads an ffmpeg build next to the binary when none is on the path.
    /// Blocking; call once at startup, never per request.
    pub fn install() -> Result<()> {
        download::auto_download().map_err(|e| DecodeError::FfmpegUnavailable(e.to_string()))
    }

    fn check_installed(is_installed: impl FnOnce() -> bool) -> Result<()> {
        if is_installed() {
            Ok(())
        } else {
            Err(DecodeError::FfmpegUnavailable(
                "ffmpeg binary not found".to_owned(),
            ))
        }
    }

    fn parse_f32le_mono(raw: &[u8]) -> Result<Vec<f32>> {
        if !raw.len().is_multiple_of(4usize) {
            return Err(DecodeError::InvalidAudio(format!(
                "f32le byte length must be multiple of 4, got {}",
                raw.len()
            )));
        }
        let mut out = Vec::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(out)
    }

    async fn decode_with_ffmpeg(&self, input: Bytes) -> Result<Vec<f32>> {
        let rate = self.sample_rate.to_string();
        let mut child = tokio::process::Command::new(ffmpeg_path())
            .args([
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-vn",
                "-sn",
                "-dn",
                "-ac",
                "1",
                "-ar",
                rate.as_str(),
                "-f",
                "f32le",
                "-acodec",
                "pcm_f32le",
                "pipe:1",
            ])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            DecodeError::FfmpegFailed("ffmpeg stdin unavailable (pipe not created)".to_owned())
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            DecodeError::FfmpegFailed("ffmpeg stdout unavailable (pipe not created)".to_owned())
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            DecodeError::FfmpegFailed("ffmpeg stderr unavailable (pipe not created)".to_owned())
        })?;

        let stdin_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            // ffmpeg may close stdin early on bad input; that surfaces via exit status.
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });

        let stdout_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });

        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        });

        let status = child
            .wait()
            .await
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?;

        stdin_task
            .await
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?;

        let stdout_bytes = stdout_task
            .await
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?;

        let stderr_bytes = stderr_task
            .await
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?
            .map_err(|e| DecodeError::FfmpegFailed(e.to_string()))?;

        if !status.success() {
            let stderr_s = String::from_utf8_lossy(&stderr_bytes).trim().to_owned();
            tracing::debug!(target: LOG_TARGET, code = ?status.code(), stderr = %stderr_s, "ffmpeg rejected input");
            return Err(DecodeError::InvalidAudio(format!(
                "ffmpeg could not decode input (exit_code={:?}): {stderr_s}",
                status.code()
            )));
        }

        Self::parse_f32le_mono(&stdout_bytes)
    }
}

impl AudioDecoder for FfmpegAudioDecoder {
    fn decode(&self, clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
        let this = self.clone();
        async move {
            tokio::task::spawn_blocking(|| Self::check_installed(ffmpeg_is_installed))
                .await
                .map_err(|e| DecodeError::TaskFailed(e.to_string()))??;

            let samples = this.decode_with_ffmpeg(clip.bytes).await?;
            tracing::debug!(
                target: LOG_TARGET,
                format = ?clip.format,
                samples = samples.len(),
                "decoded clip via ffmpeg"
            );
            Ok(DecodedAudio {
                sample_rate: this.sample_rate,
                samples,
            })
        }
        .boxed()
    }
}
