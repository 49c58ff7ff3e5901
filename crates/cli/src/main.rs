use anyhow::Context;
use clap::{Parser, Subcommand};
use moodtale_core::analytics::{AnalyticsStore, AnalyticsSummary};
use moodtale_core::config::{
    resolve_model_path, resolve_optional_path, resolve_string_with_default, AppConfig, Env,
    FeatureConfig, ServerConfig, StdEnv, DEFAULT_BIND_ADDR, DEFAULT_MAX_FRAMES,
    DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_N_MFCC, DEFAULT_SAMPLE_RATE, ENV_ANALYTICS_PATH,
    ENV_BIND_ADDR, ENV_MODEL_PATH,
};
use moodtale_core::decode::{AudioClip, Decoder};
use moodtale_core::emotion::{CrnnConfig, CrnnEmotionClassifier};
use moodtale_core::features::FeatureExtractor;
use moodtale_core::inference::InferenceService;
use moodtale_core::server::{self, AnalyzeResponse, AppState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "moodtale")]
#[command(about = "Speech emotion recognition (audio -> MFCC -> CRNN -> label)")]
struct Args {
    /// Model checkpoint (.pth, .pt or .safetensors)
    #[arg(long, global = true, env = ENV_MODEL_PATH)]
    model: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify audio files and print one result per file
    Classify {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print JSON lines instead of a table
        #[arg(long)]
        json: bool,

        #[arg(long, env = ENV_ANALYTICS_PATH)]
        analytics: Option<PathBuf>,

        #[arg(long)]
        user: Option<String>,
    },

    /// Serve the HTTP API
    Serve {
        #[arg(long, env = ENV_BIND_ADDR)]
        bind: Option<String>,

        #[arg(long, env = ENV_ANALYTICS_PATH)]
        analytics: Option<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
        max_upload_bytes: usize,
    },

    /// Summarise recorded detections
    Stats {
        #[arg(long, env = ENV_ANALYTICS_PATH)]
        analytics: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let env = StdEnv;
    let cfg = build_config(&args, &env)?;

    tracing::info!(
        model = %cfg.model_path.as_path().display(),
        sample_rate = cfg.features.sample_rate,
        n_mfcc = cfg.features.n_mfcc,
        frames = cfg.features.max_frames,
        clip_ms = cfg.features.clip_duration().as_millis() as u64,
        "config loaded"
    );

    match args.command {
        Command::Classify {
            files, json, user, ..
        } => run_classify(&cfg, &files, json, user.as_deref()).await,
        Command::Serve { .. } => run_serve(&cfg).await,
        Command::Stats { .. } => run_stats(&cfg).await,
    }
}

async fn load_service(cfg: &AppConfig) -> anyhow::Result<InferenceService> {
    let model_config = CrnnConfig {
        n_mfcc: cfg.features.n_mfcc,
        frames: cfg.features.max_frames,
        ..CrnnConfig::default()
    };
    let path = cfg.model_path.as_path().to_path_buf();
    let classifier =
        tokio::task::spawn_blocking(move || CrnnEmotionClassifier::load(path, model_config))
            .await
            .context("model loading task failed")??;

    let service = InferenceService::new(
        prepare_decoder(cfg.features.sample_rate).await,
        FeatureExtractor::new(cfg.features),
        Arc::new(classifier),
    )?;
    Ok(service)
}

/// Makes sure the ffmpeg fallback has a binary before the first clip arrives.
/// Without one, uploads symphonia cannot read are rejected as invalid audio.
async fn prepare_decoder(sample_rate: u32) -> Decoder {
    #[cfg(feature = "ffmpeg-sidecar")]
    {
        use moodtale_core::decode::FfmpegAudioDecoder;
        match tokio::task::spawn_blocking(FfmpegAudioDecoder::install).await {
            Ok(Ok(())) => tracing::debug!("ffmpeg fallback ready"),
            Ok(Err(e)) => tracing::warn!(error = %e, "ffmpeg fallback unavailable"),
            Err(e) => tracing::warn!(error = %e, "ffmpeg install task failed"),
        }
    }
    Decoder::with_default_backends(sample_rate)
}

async fn run_classify(
    cfg: &AppConfig,
    files: &[PathBuf],
    json: bool,
    user: Option<&str>,
) -> anyhow::Result<()> {
    let service = load_service(cfg).await?;
    let store = cfg.analytics_path.as_ref().map(AnalyticsStore::new);

    let mut failed = 0usize;
    for path in files {
        match classify_file(&service, path).await {
            Ok(result) => {
                let response = AnalyzeResponse::from(&result);
                if json {
                    let line = serde_json::json!({
                        "file": path.display().to_string(),
                        "emotion": response.emotion,
                        "confidence": response.confidence,
                        "scores": response.scores,
                    });
                    println!("{line}");
                } else {
                    println!(
                        "{}\t{}\t{:.3}",
                        path.display(),
                        response.emotion,
                        response.confidence
                    );
                }
                if let Some(store) = &store {
                    store
                        .record(&result, user)
                        .await
                        .with_context(|| format!("failed to record analytics for {}", path.display()))?;
                }
            }
            Err(e) => {
                failed += 1;
                tracing::error!(file = %path.display(), error = %format!("{e:#}"), "classification failed");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} files could not be classified", files.len());
    }
    Ok(())
}

async fn classify_file(
    service: &InferenceService,
    path: &Path,
) -> anyhow::Result<moodtale_core::emotion::ClassificationResult> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path.file_name().and_then(|n| n.to_str());
    let clip = AudioClip::from_upload(filename, bytes)?;
    Ok(service.analyze(clip).await?)
}

async fn run_serve(cfg: &AppConfig) -> anyhow::Result<()> {
    let service = load_service(cfg).await?;

    let mut state = AppState::new(service);
    if let Some(path) = &cfg.analytics_path {
        tracing::info!(path = %path.display(), "recording analytics");
        state = state.with_analytics(AnalyticsStore::new(path));
    }

    let app = server::router(state, cfg.server.max_upload_bytes);
    server::serve(app, &cfg.server)
        .await
        .with_context(|| format!("server on {} failed", cfg.server.bind))
}

async fn run_stats(cfg: &AppConfig) -> anyhow::Result<()> {
    let path = cfg
        .analytics_path
        .as_ref()
        .with_context(|| format!("--analytics or {ENV_ANALYTICS_PATH} is required"))?;
    let summary = AnalyticsStore::new(path).summary().await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &AnalyticsSummary) {
    println!("total detections: {}", summary.total);
    println!("distinct users:   {}", summary.distinct_users);
    for stat in &summary.per_label {
        println!("  {:<9} {:>6} {:>6.1}%", stat.label, stat.count, stat.percentage);
    }
    if let Some(most) = summary.most_detected {
        println!("most detected:    {} ({})", most.label, most.count);
    }
    if let Some(least) = summary.least_detected {
        println!("least detected:   {} ({})", least.label, least.count);
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .with_context(|| format!("invalid --log-level: {level}"))?,
        )
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn build_config(args: &Args, env: &impl Env) -> anyhow::Result<AppConfig> {
    let model_path = resolve_model_path(args.model.clone(), ENV_MODEL_PATH, env)?;

    let (analytics, bind, max_upload_bytes) = match &args.command {
        Command::Classify { analytics, .. } | Command::Stats { analytics } => {
            (analytics.clone(), None, DEFAULT_MAX_UPLOAD_BYTES)
        }
        Command::Serve {
            bind,
            analytics,
            max_upload_bytes,
        } => (analytics.clone(), bind.clone(), *max_upload_bytes),
    };

    let bind = resolve_string_with_default(bind, ENV_BIND_ADDR, env, DEFAULT_BIND_ADDR);
    let server = ServerConfig::new(&bind, max_upload_bytes)?;
    let features = FeatureConfig::new(DEFAULT_SAMPLE_RATE, DEFAULT_N_MFCC, DEFAULT_MAX_FRAMES)?;

    Ok(AppConfig {
        model_path,
        analytics_path: resolve_optional_path(analytics, ENV_ANALYTICS_PATH, env),
        features,
        server,
    })
}
