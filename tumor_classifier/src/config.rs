use crate::executor::Backend;
use image::ImageFormat;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub history: HistorySettings,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl ServerSettings {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How raw model outputs are turned into probabilities.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Softmax unless every output already lies in [0, 1].
    #[default]
    Auto,
    Softmax,
    Probabilities,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// URL (`http://`, `https://`) or filesystem path of the ONNX model.
    pub source: String,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    #[serde(default = "default_output_name")]
    pub output_name: String,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    #[serde(default = "default_backends")]
    pub backends: Vec<Backend>,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default)]
    pub output_activation: OutputActivation,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_input_name() -> String {
    "input".to_string()
}

fn default_output_name() -> String {
    "output".to_string()
}

fn default_classes() -> Vec<String> {
    ["glioma", "meningioma", "notumor", "pituitary"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_image_size() -> u32 {
    224
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

fn default_backends() -> Vec<Backend> {
    vec![Backend::Cpu, Backend::Cuda]
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

impl ModelConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cache_key(&self) -> String {
        format!("model:{}", self.source)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("model source must not be empty".to_string());
        }
        if self.classes.is_empty() {
            return Err("at least one class label is required".to_string());
        }
        if self.image_size == 0 {
            return Err("image_size must be greater than zero".to_string());
        }
        if let Some(c) = self.std.iter().position(|s| *s == 0.0 || !s.is_finite()) {
            return Err(format!("std[{}] must be a finite non-zero value", c));
        }
        if self.backends.is_empty() {
            return Err("at least one execution backend is required".to_string());
        }
        if self.num_instances == 0 {
            return Err("num_instances must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    #[default]
    Disk,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default)]
    pub kind: CacheKind,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".model_cache")
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitSettings {
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    #[serde(default = "default_accepted_formats")]
    pub accepted_formats: Vec<String>,
}

fn default_max_image_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_accepted_formats() -> Vec<String> {
    vec!["jpeg".to_string(), "png".to_string(), "webp".to_string()]
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_image_bytes: default_max_image_bytes(),
            accepted_formats: default_accepted_formats(),
        }
    }
}

impl LimitSettings {
    pub fn image_formats(&self) -> Result<Vec<ImageFormat>, String> {
        self.accepted_formats
            .iter()
            .map(|name| {
                ImageFormat::from_extension(name.to_lowercase())
                    .ok_or_else(|| format!("{} is not a known image format", name))
            })
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistorySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_history_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_history_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_history_endpoint() -> String {
    "http://localhost:3000/api/history".to_string()
}

fn default_history_timeout_secs() -> u64 {
    10
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_history_endpoint(),
            timeout_secs: default_history_timeout_secs(),
            auth_token: None,
        }
    }
}

impl HistorySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        self.limits.image_formats()?;
        if self.limits.max_image_bytes == 0 {
            return Err("max_image_bytes must be greater than zero".to_string());
        }
        if self.history.enabled && self.history.endpoint.trim().is_empty() {
            return Err("history endpoint is required when history is enabled".to_string());
        }
        Ok(())
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let settings = settings.try_deserialize::<Settings>()?;
    if let Err(e) = settings.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(settings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_model_config(source: &str) -> ModelConfig {
    ModelConfig {
        source: source.to_string(),
        input_name: default_input_name(),
        output_name: default_output_name(),
        classes: default_classes(),
        image_size: default_image_size(),
        mean: default_mean(),
        std: default_std(),
        backends: default_backends(),
        num_instances: 1,
        output_activation: OutputActivation::Auto,
        fetch_timeout_secs: 5,
    }
}
