use crate::decode::{AudioClip, AudioDecoder, DecodeError, DecodedAudio, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const RETRY_SECONDARY_INTERVAL: Duration = Duration::from_secs(300);
const LOG_TARGET: &str = "decode::fallback";

/// Tries `primary` first and hands the clip to `secondary` when it fails.
///
/// If the secondary backend reports itself unavailable (e.g. no ffmpeg
/// binary), it is skipped for five minutes instead of being re-probed on
/// every upload. The primary's error is what callers see in that case.
#[derive(Clone)]
pub struct FallbackAudioDecoder<P, S>
where
    P: AudioDecoder + Clone,
    S: AudioDecoder + Clone,
{
    primary: P,
    secondary: S,
    state: Arc<FallbackState>,
}

struct FallbackState {
    secondary_unavailable: AtomicBool,
    unavailable_at: Mutex<Option<Instant>>,
}

impl<P, S> FallbackAudioDecoder<P, S>
where
    P: AudioDecoder + Clone,
    S: AudioDecoder + Clone,
{
    pub fn new(primary: P, secondary: S) -> Self {
        Self {
            primary,
            secondary,
            state: Arc::new(FallbackState {
                secondary_unavailable: AtomicBool::new(false),
                unavailable_at: Mutex::new(None),
            }),
        }
    }

    pub fn is_secondary_disabled(&self) -> bool {
        self.state.secondary_unavailable.load(Ordering::Relaxed)
    }

    async fn secondary_allowed(&self) -> bool {
        if !self.state.secondary_unavailable.load(Ordering::Relaxed) {
            return true;
        }
        let unavailable_at = self.state.unavailable_at.lock().await;
        unavailable_at
            .map(|t| t.elapsed() >= RETRY_SECONDARY_INTERVAL)
            .unwrap_or(true)
    }

    async fn mark_secondary(&self, available: bool) {
        self.state
            .secondary_unavailable
            .store(!available, Ordering::Relaxed);
        *self.state.unavailable_at.lock().await = if available {
            None
        } else {
            Some(Instant::now())
        };
    }
}

impl<P, S> AudioDecoder for FallbackAudioDecoder<P, S>
where
    P: AudioDecoder + Clone + Send + Sync + 'static,
    S: AudioDecoder + Clone + Send + Sync + 'static,
{
    fn decode(&self, clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
        async move {
            let primary_err = match self.primary.decode(clip.clone()).await {
                Ok(audio) => return Ok(audio),
                Err(e) => e,
            };

            if !self.secondary_allowed().await {
                return Err(primary_err);
            }

            tracing::debug!(target: LOG_TARGET, error = %primary_err, format = ?clip.format, "primary decoder failed, trying fallback");
            match self.secondary.decode(clip).await {
                Ok(audio) => {
                    if self.is_secondary_disabled() {
                        tracing::info!(target: LOG_TARGET, "fallback decoder recovered");
                        self.mark_secondary(true).await;
                    }
                    Ok(audio)
                }
                Err(DecodeError::FfmpegUnavailable(reason)) => {
                    tracing::warn!(target: LOG_TARGET, %reason, "fallback decoder unavailable, disabling for 5m");
                    self.mark_secondary(false).await;
                    Err(primary_err)
                }
                Err(e) => {
                    tracing::debug!(target: LOG_TARGET, error = %e, "fallback decoder failed too");
                    Err(primary_err)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct RejectingDecoder;

    impl AudioDecoder for RejectingDecoder {
        fn decode(&self, _clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
            async { Err(DecodeError::InvalidAudio("primary says no".into())) }.boxed()
        }
    }

    #[derive(Clone)]
    struct StubDecoder {
        rate: u32,
        calls: Arc<AtomicUsize>,
    }

    impl StubDecoder {
        fn new(rate: u32) -> Self {
            Self {
                rate,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl AudioDecoder for StubDecoder {
        fn decode(&self, _clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let rate = self.rate;
            async move {
                Ok(DecodedAudio {
                    sample_rate: rate,
                    samples: vec![0.0; 4],
                })
            }
            .boxed()
        }
    }

    #[derive(Clone)]
    struct UnavailableDecoder {
        calls: Arc<AtomicUsize>,
    }

    impl AudioDecoder for UnavailableDecoder {
        fn decode(&self, _clip: AudioClip) -> BoxFuture<'_, Result<DecodedAudio>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            async { Err(DecodeError::FfmpegUnavailable("no binary".into())) }.boxed()
        }
    }

    fn clip() -> AudioClip {
        AudioClip::new(vec![1u8, 2, 3], None)
    }

    #[tokio::test]
    async fn uses_primary_when_ok() {
        let secondary = StubDecoder::new(8_000);
        let decoder = FallbackAudioDecoder::new(StubDecoder::new(22_050), secondary.clone());
        let out = decoder.decode(clip()).await.unwrap();
        assert_eq!(out.sample_rate, 22_050);
        assert_eq!(secondary.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn falls_back_when_primary_fails() {
        let decoder = FallbackAudioDecoder::new(RejectingDecoder, StubDecoder::new(8_000));
        let out = decoder.decode(clip()).await.unwrap();
        assert_eq!(out.sample_rate, 8_000);
    }

    #[tokio::test]
    async fn unavailable_secondary_returns_primary_error_and_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let decoder = FallbackAudioDecoder::new(
            RejectingDecoder,
            UnavailableDecoder {
                calls: calls.clone(),
            },
        );

        let err = decoder.decode(clip()).await.unwrap_err();
        assert!(err.to_string().contains("primary says no"));
        assert!(decoder.is_secondary_disabled());

        let _ = decoder.decode(clip()).await.unwrap_err();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn secondary_retried_after_interval_elapsed() {
        let decoder = FallbackAudioDecoder::new(RejectingDecoder, StubDecoder::new(8_000));
        decoder
            .state
            .secondary_unavailable
            .store(true, Ordering::Relaxed);
        *decoder.state.unavailable_at.lock().await =
            Some(Instant::now() - RETRY_SECONDARY_INTERVAL - Duration::from_secs(1));

        let out = decoder.decode(clip()).await.unwrap();
        assert_eq!(out.sample_rate, 8_000);
        assert!(!decoder.is_secondary_disabled());
    }
}
