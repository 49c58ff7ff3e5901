use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_SAMPLE_RATE: u32 = 22_050;
pub const DEFAULT_N_MFCC: usize = 40;
pub const DEFAULT_MAX_FRAMES: usize = 174;
pub const DEFAULT_N_FFT: usize = 2048;
pub const DEFAULT_HOP_LENGTH: usize = 512;
pub const DEFAULT_N_MELS: usize = 128;
pub const DEFAULT_TOP_DB: f32 = 80.0;

pub const DEFAULT_MODEL_PATH: &str = "load_model/ser_model.pth";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
pub const ENV_MODEL_PATH: &str = "MOODTALE_MODEL_PATH";
pub const ENV_ANALYTICS_PATH: &str = "MOODTALE_ANALYTICS_PATH";
pub const ENV_BIND_ADDR: &str = "MOODTALE_BIND_ADDR";

/// Shape and DSP parameters of the MFCC front end.
///
/// The classifier checkpoint is trained against one exact configuration, so
/// these are treated as constants of a deployment rather than tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeatureConfig {
    pub sample_rate: u32,
    pub n_mfcc: usize,
    pub max_frames: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub top_db: f32,
}

impl FeatureConfig {
    pub fn new(sample_rate: u32, n_mfcc: usize, max_frames: usize) -> Result<Self, ConfigError> {
        let cfg = Self {
            sample_rate,
            n_mfcc,
            max_frames,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if self.n_mfcc == 0 || self.max_frames == 0 {
            return Err(ConfigError::EmptyFeatureShape);
        }
        if self.n_mfcc > self.n_mels {
            return Err(ConfigError::TooManyCoefficients {
                n_mfcc: self.n_mfcc,
                n_mels: self.n_mels,
            });
        }
        if self.hop_length == 0 || self.n_fft < 2 || self.n_fft % 2 != 0 {
            return Err(ConfigError::InvalidFft {
                n_fft: self.n_fft,
                hop_length: self.hop_length,
            });
        }
        Ok(())
    }

    /// Audio span covered by `max_frames` analysis frames.
    pub fn clip_duration(&self) -> Duration {
        let samples = self.max_frames.saturating_mul(self.hop_length) as u64;
        Duration::from_micros(samples.saturating_mul(1_000_000) / u64::from(self.sample_rate))
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            n_mfcc: DEFAULT_N_MFCC,
            max_frames: DEFAULT_MAX_FRAMES,
            n_fft: DEFAULT_N_FFT,
            hop_length: DEFAULT_HOP_LENGTH,
            n_mels: DEFAULT_N_MELS,
            top_db: DEFAULT_TOP_DB,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelPath(PathBuf);

impl ModelPath {
    pub fn new<P: Into<PathBuf>>(value: P) -> Result<Self, ConfigError> {
        let p = value.into();
        if p.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModelPath);
        }
        Ok(Self(p))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl Default for ModelPath {
    fn default() -> Self {
        Self(PathBuf::from(DEFAULT_MODEL_PATH))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub max_upload_bytes: usize,
}

impl ServerConfig {
    pub fn new(bind: &str, max_upload_bytes: usize) -> Result<Self, ConfigError> {
        let bind = bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddr(bind.to_owned()))?;
        if max_upload_bytes == 0 {
            return Err(ConfigError::ZeroUploadLimit);
        }
        Ok(Self {
            bind,
            max_upload_bytes,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub model_path: ModelPath,
    pub analytics_path: Option<PathBuf>,
    pub features: FeatureConfig,
    pub server: ServerConfig,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("model path must not be empty")]
    EmptyModelPath,
    #[error("sample rate must be > 0 Hz")]
    ZeroSampleRate,
    #[error("feature matrix must have at least one coefficient and one frame")]
    EmptyFeatureShape,
    #[error("cannot keep {n_mfcc} coefficients from {n_mels} mel bands")]
    TooManyCoefficients { n_mfcc: usize, n_mels: usize },
    #[error("invalid fft setup: n_fft={n_fft} hop_length={hop_length}")]
    InvalidFft { n_fft: usize, hop_length: usize },
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("upload limit must be > 0 bytes")]
    ZeroUploadLimit,
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

pub fn resolve_model_path(
    cli_value: Option<PathBuf>,
    env_key: &str,
    env: &impl Env,
) -> Result<ModelPath, ConfigError> {
    match cli_value {
        Some(p) => ModelPath::new(p),
        None => match env.var(env_key) {
            Some(v) => ModelPath::new(v),
            None => Ok(ModelPath::default()),
        },
    }
}

pub fn resolve_string_with_default(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
    default: &str,
) -> String {
    match cli_value {
        Some(v) => v,
        None => env.var(env_key).unwrap_or_else(|| default.to_owned()),
    }
}

pub fn resolve_optional_path(
    cli_value: Option<PathBuf>,
    env_key: &str,
    env: &impl Env,
) -> Option<PathBuf> {
    match cli_value {
        Some(v) => Some(v),
        None => env
            .var(env_key)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_path_cli_takes_precedence_over_env() {
        let env = MapEnv::default().with_var(ENV_MODEL_PATH, "env.safetensors");
        let p = resolve_model_path(Some("cli.pth".into()), ENV_MODEL_PATH, &env).expect("valid");
        assert_eq!(p.as_path(), Path::new("cli.pth"));
    }

    #[test]
    fn model_path_env_used_when_cli_missing() {
        let env = MapEnv::default().with_var(ENV_MODEL_PATH, "env.safetensors");
        let p = resolve_model_path(None, ENV_MODEL_PATH, &env).expect("valid");
        assert_eq!(p.as_path(), Path::new("env.safetensors"));
    }

    #[test]
    fn model_path_defaults_when_both_missing() {
        let p = resolve_model_path(None, ENV_MODEL_PATH, &MapEnv::default()).expect("valid");
        assert_eq!(p, ModelPath::default());
    }

    #[test]
    fn empty_model_path_is_rejected() {
        let env = MapEnv::default().with_var(ENV_MODEL_PATH, "");
        let err = resolve_model_path(None, ENV_MODEL_PATH, &env).unwrap_err();
        assert_eq!(err, ConfigError::EmptyModelPath);
    }

    #[test]
    fn optional_path_ignores_blank_env() {
        let env = MapEnv::default().with_var(ENV_ANALYTICS_PATH, "  ");
        assert_eq!(resolve_optional_path(None, ENV_ANALYTICS_PATH, &env), None);

        let env = MapEnv::default().with_var(ENV_ANALYTICS_PATH, "stats.json");
        assert_eq!(
            resolve_optional_path(None, ENV_ANALYTICS_PATH, &env),
            Some(PathBuf::from("stats.json"))
        );
    }

    #[test]
    fn resolve_string_with_default_falls_through() {
        let env = MapEnv::default().with_var(ENV_BIND_ADDR, "env");
        assert_eq!(
            resolve_string_with_default(Some("cli".to_owned()), ENV_BIND_ADDR, &env, "def"),
            "cli"
        );
        assert_eq!(
            resolve_string_with_default(None, ENV_BIND_ADDR, &env, "def"),
            "env"
        );
        assert_eq!(
            resolve_string_with_default(None, ENV_BIND_ADDR, &MapEnv::default(), "def"),
            "def"
        );
    }

    #[test]
    fn default_feature_config_covers_about_four_seconds() {
        let cfg = FeatureConfig::default();
        cfg.validate().expect("defaults are valid");
        let ms = cfg.clip_duration().as_millis();
        assert!((4000..4100).contains(&ms), "got {ms} ms");
    }

    #[test]
    fn feature_config_rejects_degenerate_shapes() {
        assert_eq!(
            FeatureConfig::new(0, 40, 174).unwrap_err(),
            ConfigError::ZeroSampleRate
        );
        assert_eq!(
            FeatureConfig::new(22_050, 0, 174).unwrap_err(),
            ConfigError::EmptyFeatureShape
        );
        assert!(matches!(
            FeatureConfig::new(22_050, 200, 174).unwrap_err(),
            ConfigError::TooManyCoefficients { .. }
        ));
    }

    #[test]
    fn server_config_parses_bind_addr() {
        let s = ServerConfig::new("0.0.0.0:8080", 1024).expect("valid");
        assert_eq!(s.bind.port(), 8080);
        assert!(matches!(
            ServerConfig::new("not an addr", 1024).unwrap_err(),
            ConfigError::InvalidBindAddr(_)
        ));
        assert_eq!(
            ServerConfig::new(DEFAULT_BIND_ADDR, 0).unwrap_err(),
            ConfigError::ZeroUploadLimit
        );
    }
}
