//! Layered configuration for promptreel.
//!
//! Settings are read from `promptreel.toml` and layered as
//! defaults → file → environment → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! db_path = "data/promptreel.db"
//! temp_root = "temp"
//! job_retention_secs = 900
//!
//! [generator]
//! model = "gemini-2.0-flash"
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [renderer]
//! image = "manimcommunity/manim:latest"
//! timeout_secs = 600
//! memory = "2g"
//! cpus = 2.0
//!
//! [validator]
//! python_cmd = "python3"
//! max_code_bytes = 102400
//!
//! [storage]
//! backend = "s3"
//! bucket = "promptreel-videos"
//! region = "us-east-1"
//!
//! [logging]
//! filter = "info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "promptreel.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Parent of every per-job working directory.
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,
    /// How long a finished job stays visible at `GET /job/{id}`.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    /// Permissive CORS and bind to all interfaces.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/promptreel.db")
}

fn default_temp_root() -> PathBuf {
    PathBuf::from("temp")
}

fn default_job_retention_secs() -> u64 {
    900
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            temp_root: default_temp_root(),
            job_retention_secs: default_job_retention_secs(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Usually supplied through `GEMINI_API_KEY` rather than the file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_api_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base: default_api_base(),
            api_key: None,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererSection {
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_docker_cmd")]
    pub docker_cmd: String,
    /// Timeout applied to each invocation strategy separately.
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Docker network mode for the render container.
    #[serde(default = "default_network")]
    pub network: String,
    /// Stem of the canonical output file (`<output_name>.mp4`).
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

fn default_image() -> String {
    "manimcommunity/manim:latest".to_string()
}

fn default_docker_cmd() -> String {
    "docker".to_string()
}

fn default_render_timeout_secs() -> u64 {
    600
}

fn default_memory() -> String {
    "2g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_network() -> String {
    "none".to_string()
}

fn default_output_name() -> String {
    "output".to_string()
}

impl Default for RendererSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            docker_cmd: default_docker_cmd(),
            timeout_secs: default_render_timeout_secs(),
            memory: default_memory(),
            cpus: default_cpus(),
            network: default_network(),
            output_name: default_output_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSection {
    #[serde(default = "default_python_cmd")]
    pub python_cmd: String,
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
    #[serde(default = "default_syntax_timeout_secs")]
    pub syntax_timeout_secs: u64,
    /// Run the validator on freshly generated code (advisory only).
    #[serde(default = "default_validate_generated")]
    pub validate_generated: bool,
}

fn default_python_cmd() -> String {
    "python3".to_string()
}

fn default_max_code_bytes() -> usize {
    100 * 1024
}

fn default_syntax_timeout_secs() -> u64 {
    10
}

fn default_validate_generated() -> bool {
    true
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            python_cmd: default_python_cmd(),
            max_code_bytes: default_max_code_bytes(),
            syntax_timeout_secs: default_syntax_timeout_secs(),
            validate_generated: default_validate_generated(),
        }
    }
}

/// Which blob store implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(StorageBackend::S3),
            "local" => Ok(StorageBackend::Local),
            _ => anyhow::bail!("Invalid storage backend '{}'. Valid values: s3, local", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom S3 endpoint (MinIO and friends).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// Root directory for the local backend.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    #[serde(default = "default_url_ttl_secs")]
    pub default_url_ttl_secs: u64,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

fn default_url_ttl_secs() -> u64 {
    3600
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: None,
            region: None,
            endpoint: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
            local_root: default_local_root(),
            default_url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// The complete promptreel.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudioToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub renderer: RendererSection,
    #[serde(default)]
    pub validator: ValidatorSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StudioToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse promptreel.toml")
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Full layered load: file (if present) then process environment.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment values. `lookup` abstracts `std::env::var` so the
    /// layering can be exercised without touching process state.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GEMINI_API_KEY") {
            self.generator.api_key = Some(key);
        }
        if let Some(model) = non_empty("GEMINI_MODEL") {
            self.generator.model = model;
        }
        if let Some(bucket) = non_empty("AWS_S3_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
        if let Some(region) = non_empty("AWS_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(id) = non_empty("AWS_ACCESS_KEY_ID") {
            self.storage.access_key_id = Some(id);
        }
        if let Some(secret) = non_empty("AWS_SECRET_ACCESS_KEY") {
            self.storage.secret_access_key = Some(secret);
        }
        if let Some(endpoint) = non_empty("S3_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
            self.storage.force_path_style = true;
        }
        if let Some(db_path) = non_empty("PROMPTREEL_DB_PATH") {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(temp_root) = non_empty("PROMPTREEL_TEMP_ROOT") {
            self.server.temp_root = PathBuf::from(temp_root);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.generator.api_key.is_none() {
            warnings.push(
                "No generator API key configured (set GEMINI_API_KEY); generation requests will fail"
                    .to_string(),
            );
        }
        if self.generator.max_attempts == 0 {
            warnings.push("generator.max_attempts is 0; it will be treated as 1".to_string());
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_none() {
            warnings.push(
                "storage.backend is s3 but no bucket is configured (set AWS_S3_BUCKET)".to_string(),
            );
        }
        if self.storage.backend == StorageBackend::S3
            && (self.storage.access_key_id.is_none() || self.storage.secret_access_key.is_none())
        {
            warnings.push(
                "storage.backend is s3 but credentials are missing (set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY)"
                    .to_string(),
            );
        }
        if self.renderer.timeout_secs == 0 {
            warnings.push("renderer.timeout_secs is 0; every render will time out".to_string());
        }
        if self.renderer.cpus <= 0.0 {
            warnings.push(format!(
                "renderer.cpus must be positive, got {}",
                self.renderer.cpus
            ));
        }

        warnings
    }

    /// Copy with secrets replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        let mask = |v: &mut Option<String>| {
            if v.is_some() {
                *v = Some("********".to_string());
            }
        };
        mask(&mut copy.generator.api_key);
        mask(&mut copy.storage.access_key_id);
        mask(&mut copy.storage.secret_access_key);
        copy
    }

    /// Serialize to pretty TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
