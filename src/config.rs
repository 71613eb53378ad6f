//! Configuration parsing and validation for infergate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Attach a permissive CORS layer
    #[serde(default = "default_true")]
    pub cors: bool,
    /// Upper bound on concurrently handled requests
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cors: true,
            max_concurrent_requests: None,
        }
    }
}

/// Request routing and failover configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Maximum backends tried per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// TCP connect timeout towards a backend
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Deadline for a complete non-streaming request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RoutingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Streaming relay timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Abort when no chunk arrives for this long
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Abort when the whole stream exceeds this long
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_total_timeout() -> u64 {
    600
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            total_timeout_secs: default_total_timeout(),
        }
    }
}

impl StreamingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }
}

/// Background health probing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between probes of the same backend
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    /// Timeout of a single probe
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    /// Consecutive failures before a backend is marked unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Path appended to the backend URL for probing
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// Smoothing factor of the latency moving average (0 < alpha <= 1)
    #[serde(default = "default_latency_alpha")]
    pub latency_alpha: f64,
}

fn default_probe_interval() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_path() -> String {
    "/models".to_string()
}

fn default_latency_alpha() -> f64 {
    0.3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            probe_path: default_probe_path(),
            latency_alpha: default_latency_alpha(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit one structured event per proxied request
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Masked form for logs and stats: first six and last four characters.
    pub fn masked(&self) -> String {
        mask_key(self.expose_secret())
    }
}

/// Mask a credential, keeping only its first six and last four characters.
///
/// Keys of ten characters or fewer are fully hidden.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 10 {
        return "***".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s.to_string()))
    }
}

/// How a backend's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Upstream backend configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Unique identifier for this backend
    pub id: String,
    /// Base URL of the backend's OpenAI-compatible API (e.g., "http://10.0.0.5:8000/v1")
    pub url: String,
    /// Credential injected as a bearer token
    pub api_key: Option<ApiKey>,
    /// Public model names served by this backend
    #[serde(default)]
    pub models: Vec<String>,
    /// Public model name -> name the backend expects
    #[serde(default)]
    pub model_map: BTreeMap<String, String>,
    /// Requests per minute allowed towards this backend
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl Config {
    /// Load configuration from a TOML file without environment expansion.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read_config_file(path.as_ref())?;
        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            tracing::warn!("No backends configured - proxy will reject all requests");
        }

        validate_backends(&self.backends)?;

        if self.routing.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "routing.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(self.health.latency_alpha > 0.0 && self.health.latency_alpha <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "health.latency_alpha must be in (0, 1], got {}",
                self.health.latency_alpha
            )));
        }

        let timeouts = [
            ("routing.request_timeout_secs", self.routing.request_timeout_secs),
            ("routing.connect_timeout_secs", self.routing.connect_timeout_secs),
            ("streaming.idle_timeout_secs", self.streaming.idle_timeout_secs),
            ("streaming.total_timeout_secs", self.streaming.total_timeout_secs),
            ("health.interval_secs", self.health.interval_secs),
            ("health.timeout_secs", self.health.timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} must be positive", name)));
            }
        }

        Ok(())
    }
}

/// Validate a backend set: unique, non-empty ids, non-empty URLs, positive rate limits.
///
/// Shared by startup validation and registry reload.
pub fn validate_backends(backends: &[BackendConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(backends.len());
    for backend in backends {
        if backend.id.is_empty() {
            return Err(ConfigError::Validation(
                "Backend with empty id".to_string(),
            ));
        }
        if !seen.insert(backend.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate backend id '{}'",
                backend.id
            )));
        }
        if backend.url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Backend '{}' has empty URL",
                backend.id
            )));
        }
        if backend.rate_limit == Some(0) {
            return Err(ConfigError::Validation(format!(
                "Backend '{}' has a zero rate limit",
                backend.id
            )));
        }
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for backend '{backend}': {message}")]
    EnvVar {
        var: String,
        backend: String,
        message: String,
    },
}

/// Raw backend config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawBackendConfig {
    id: String,
    url: String,
    api_key: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    model_map: BTreeMap<String, String>,
    #[serde(default)]
    rate_limit: Option<u32>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    streaming: StreamingConfig,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    backends: Vec<RawBackendConfig>,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, backend_id: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            backend: backend_id.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                backend: backend_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            backend: backend_id.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in backend '{}')",
                var_name, backend_id
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a backend.
///
/// - "gpu-a" -> "INFERGATE_GPU_A_API_KEY"
/// - "nim node" -> "INFERGATE_NIM_NODE_API_KEY"
pub fn convention_env_var_name(backend_id: &str) -> String {
    let upper_snake = backend_id.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("INFERGATE_{}_API_KEY", upper_snake)
}

impl Config {
    /// Convert raw config to final config, resolving keys through `lookup`.
    ///
    /// For each backend:
    /// - `api_key` containing `${VAR}`: expanded, source = `EnvExpanded`
    /// - literal `api_key`: wrapped directly, source = `Literal`
    /// - absent `api_key`: convention lookup (`INFERGATE_<ID>_API_KEY`),
    ///   source = `Convention(var_name)` or `KeySource::None`
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut backends = Vec::with_capacity(raw.backends.len());
        let mut key_sources = Vec::with_capacity(raw.backends.len());

        for rb in raw.backends {
            let (api_key, source) = match rb.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars_with(raw_key, &rb.id, &lookup)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => {
                    let var_name = convention_env_var_name(&rb.id);
                    match lookup(&var_name) {
                        Some(value) => (Some(ApiKey::from(value)), KeySource::Convention(var_name)),
                        None => (None, KeySource::None),
                    }
                }
            };

            let url = expand_env_vars_with(&rb.url, &rb.id, &lookup)?;
            key_sources.push((rb.id.clone(), source));

            backends.push(BackendConfig {
                id: rb.id,
                url,
                api_key,
                models: rb.models,
                model_map: rb.model_map,
                rate_limit: rb.rate_limit,
            });
        }

        let config = Config {
            server: raw.server,
            routing: raw.routing,
            streaming: raw.streaming,
            health: raw.health,
            logging: raw.logging,
            backends,
        };

        Ok((config, key_sources))
    }

    /// Parse a TOML string with environment expansion through `lookup`, then validate.
    pub fn parse_str_with_env<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw_with(raw, lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-backend key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = read_config_file(path.as_ref())?;
        Self::parse_str_with_env(&content, |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert!(config.server.cors);
        assert!(config.backends.is_empty());
        assert_eq!(config.routing.max_attempts, 3);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.probe_path, "/models");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:8080"
            cors = false
            max_concurrent_requests = 256

            [routing]
            max_attempts = 2
            request_timeout_secs = 90

            [streaming]
            idle_timeout_secs = 15
            total_timeout_secs = 120

            [health]
            interval_secs = 3
            failure_threshold = 5
            probe_path = "/health"

            [logging]
            level = "debug"
            log_requests = false

            [[backends]]
            id = "gpu-a"
            url = "http://10.0.0.1:8000/v1"
            api_key = "literal-key"
            models = ["llama-3-8b"]
            rate_limit = 40

            [backends.model_map]
            "llama-3-8b" = "meta-llama/Meta-Llama-3-8B-Instruct"

            [[backends]]
            id = "gpu-b"
            url = "http://10.0.0.2:8000/v1"
            models = ["llama-3-8b", "qwen-2"]
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert!(!config.server.cors);
        assert_eq!(config.server.max_concurrent_requests, Some(256));
        assert_eq!(config.routing.max_attempts, 2);
        assert_eq!(config.routing.request_timeout(), Duration::from_secs(90));
        assert_eq!(config.streaming.idle_timeout(), Duration::from_secs(15));
        assert_eq!(config.health.interval(), Duration::from_secs(3));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].rate_limit, Some(40));
        assert_eq!(
            config.backends[0].model_map.get("llama-3-8b").map(String::as_str),
            Some("meta-llama/Meta-Llama-3-8B-Instruct")
        );
        assert_eq!(config.backends[1].models, vec!["llama-3-8b", "qwen-2"]);
    }

    #[test]
    fn test_duplicate_backend_ids_rejected() {
        let toml = r#"
            [[backends]]
            id = "a"
            url = "http://one/v1"

            [[backends]]
            id = "a"
            url = "http://two/v1"
        "#;

        let err = Config::parse_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("Duplicate")));
    }

    #[test]
    fn test_empty_url_rejected() {
        let toml = r#"
            [[backends]]
            id = "a"
            url = ""
        "#;

        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let toml = r#"
            [routing]
            max_attempts = 0
        "#;

        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_latency_alpha_rejected() {
        let toml = r#"
            [health]
            latency_alpha = 1.5
        "#;

        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let toml = r#"
            [[backends]]
            id = "a"
            url = "http://one/v1"
            rate_limit = 0
        "#;

        assert!(matches!(
            Config::parse_str(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_api_key_redaction() {
        let key = ApiKey::from("super-secret-backend-token");
        assert_eq!(format!("{:?}", key), "[REDACTED]");
        assert_eq!(format!("{}", key), "[REDACTED]");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "super-secret-backend-token");
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("nvapi-abcdefghijklmnop-1234"), "nvapi-...1234");
        assert_eq!(mask_key("short"), "***");
        assert_eq!(mask_key("exactly10c"), "***");
    }

    #[test]
    fn test_expand_multiple_vars() {
        let lookup = env(&[("SCHEME", "https"), ("HOST", "gpu.internal")]);
        let out = expand_env_vars_with("${SCHEME}://${HOST}/v1", "a", lookup).unwrap();
        assert_eq!(out, "https://gpu.internal/v1");
    }

    #[test]
    fn test_expand_missing_var() {
        let err = expand_env_vars_with("${NOPE}", "a", env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar { ref var, .. } if var == "NOPE"));
    }

    #[test]
    fn test_expand_unclosed_and_empty() {
        assert!(expand_env_vars_with("${OPEN", "a", env(&[])).is_err());
        assert!(expand_env_vars_with("${}", "a", env(&[])).is_err());
    }

    #[test]
    fn test_convention_env_var_name() {
        assert_eq!(convention_env_var_name("gpu-a"), "INFERGATE_GPU_A_API_KEY");
        assert_eq!(convention_env_var_name("nim node"), "INFERGATE_NIM_NODE_API_KEY");
        assert_eq!(convention_env_var_name("local"), "INFERGATE_LOCAL_API_KEY");
    }

    #[test]
    fn test_key_sources() {
        let toml = r#"
            [[backends]]
            id = "literal"
            url = "http://one/v1"
            api_key = "plain"

            [[backends]]
            id = "expanded"
            url = "http://two/v1"
            api_key = "${TWO_KEY}"

            [[backends]]
            id = "conv"
            url = "http://three/v1"

            [[backends]]
            id = "bare"
            url = "http://four/v1"
        "#;

        let lookup = env(&[
            ("TWO_KEY", "two-secret"),
            ("INFERGATE_CONV_API_KEY", "conv-secret"),
        ]);
        let (config, sources) = Config::parse_str_with_env(toml, lookup).unwrap();

        assert_eq!(sources[0], ("literal".to_string(), KeySource::Literal));
        assert_eq!(sources[1], ("expanded".to_string(), KeySource::EnvExpanded));
        assert_eq!(
            sources[2],
            (
                "conv".to_string(),
                KeySource::Convention("INFERGATE_CONV_API_KEY".to_string())
            )
        );
        assert_eq!(sources[3], ("bare".to_string(), KeySource::None));

        assert_eq!(
            config.backends[1].api_key.as_ref().unwrap().expose_secret(),
            "two-secret"
        );
        assert_eq!(
            config.backends[2].api_key.as_ref().unwrap().expose_secret(),
            "conv-secret"
        );
        assert!(config.backends[3].api_key.is_none());
    }

    #[test]
    fn test_url_expansion() {
        let toml = r#"
            [[backends]]
            id = "a"
            url = "http://${GPU_HOST}/v1"
        "#;

        let (config, _) =
            Config::parse_str_with_env(toml, env(&[("GPU_HOST", "10.1.1.1:8000")])).unwrap();
        assert_eq!(config.backends[0].url, "http://10.1.1.1:8000/v1");
    }
}
