use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{PsgateError, Result};
use crate::patterns::{builtin_patterns, PatternSet};
use crate::types::OverflowStrategy;

/// Top-level model of `enterprise-config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default, rename = "rateLimit")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub adaptive_defaults: AdaptiveDefaults,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default = "default_write_roots")]
    pub allowed_write_roots: Vec<String>,
    #[serde(default)]
    pub enforce_working_directory: bool,
    #[serde(default)]
    pub additional_safe: Vec<String>,
    #[serde(default)]
    pub additional_blocked: Vec<String>,
    #[serde(default)]
    pub suppress_patterns: Vec<String>,
    #[serde(default = "default_true")]
    pub require_confirmation_for_unknown: bool,
    /// Whether an authenticated operator may override a block. Off by
    /// default; the override flag is logged and ignored otherwise.
    #[serde(default)]
    pub allow_operator_override: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_write_roots: default_write_roots(),
            enforce_working_directory: false,
            additional_safe: Vec::new(),
            additional_blocked: Vec::new(),
            suppress_patterns: Vec::new(),
            require_confirmation_for_unknown: true,
            allow_operator_override: false,
        }
    }
}

fn default_write_roots() -> Vec<String> {
    vec!["${TEMP}".to_string()]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default = "default_max_output_kb", rename = "maxOutputKB")]
    pub max_output_kb: u64,
    #[serde(default = "default_max_lines")]
    pub max_lines: u64,
    #[serde(default = "default_chunk_kb", rename = "chunkKB")]
    pub chunk_kb: u64,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub hard_kill_on_overflow: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_output_kb: default_max_output_kb(),
            max_lines: default_max_lines(),
            chunk_kb: default_chunk_kb(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_seconds: default_max_timeout_seconds(),
            hard_kill_on_overflow: true,
        }
    }
}

fn default_max_output_kb() -> u64 { 1024 }
fn default_max_lines() -> u64 { 10_000 }
fn default_chunk_kb() -> u64 { 64 }
fn default_timeout_ms() -> u64 { 60_000 }
fn default_max_timeout_seconds() -> u64 { 300 }

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            max_requests: default_max_requests(),
            burst: default_burst(),
        }
    }
}

fn default_interval_ms() -> u64 { 60_000 }
fn default_max_requests() -> u32 { 60 }
fn default_burst() -> u32 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub structured_audit: bool,
    #[serde(default = "default_truncate_indicator")]
    pub truncate_indicator: String,
    #[serde(default = "default_max_log_chars")]
    pub max_log_message_chars: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            structured_audit: false,
            truncate_indicator: default_truncate_indicator(),
            max_log_message_chars: default_max_log_chars(),
        }
    }
}

fn default_truncate_indicator() -> String {
    "... [output truncated]".to_string()
}

fn default_max_log_chars() -> usize { 4_000 }

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveDefaults {
    #[serde(default = "default_extend_window_ms")]
    pub extend_window_ms: u64,
    #[serde(default = "default_extend_step_ms")]
    pub extend_step_ms: u64,
}

impl Default for AdaptiveDefaults {
    fn default() -> Self {
        Self {
            extend_window_ms: default_extend_window_ms(),
            extend_step_ms: default_extend_step_ms(),
        }
    }
}

fn default_extend_window_ms() -> u64 { 10_000 }
fn default_extend_step_ms() -> u64 { 15_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8573".to_string()
}

impl AppConfig {
    /// Load a config file. A missing file yields defaults; a present but
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| PsgateError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Environment overrides recognized at snapshot build time.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub auth_key: Option<String>,
    pub disable_self_destruct: bool,
    pub overflow_strategy: Option<OverflowStrategy>,
    pub capture_ps_metrics: bool,
    pub disable_attempt_publish: bool,
}

impl EnvOverrides {
    /// Read the `MCP_*` variables from the process environment.
    pub fn capture() -> Result<Self> {
        let overflow_strategy = match std::env::var("MCP_OVERFLOW_STRATEGY") {
            Ok(v) if !v.is_empty() => Some(
                v.parse::<OverflowStrategy>()
                    .map_err(PsgateError::Config)?,
            ),
            _ => None,
        };
        Ok(Self {
            auth_key: std::env::var("MCP_AUTH_KEY").ok().filter(|v| !v.is_empty()),
            disable_self_destruct: env_flag("MCP_DISABLE_SELF_DESTRUCT"),
            overflow_strategy,
            capture_ps_metrics: env_flag("MCP_CAPTURE_PS_METRICS"),
            disable_attempt_publish: env_flag("MCP_DISABLE_ATTEMPT_PUBLISH"),
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Immutable view of configuration handed to the pipeline.
/// Replaced atomically as a whole on reload or policy mutation.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub security: SecurityConfig,
    pub limits: LimitsConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub adaptive_defaults: AdaptiveDefaults,
    pub gateway: Option<GatewayConfig>,
    pub data_dir: PathBuf,
    pub env: EnvOverrides,
    pub patterns: PatternSet,
    /// Pattern ids dropped by `suppressPatterns`, kept for audit.
    pub suppressed: Vec<String>,
}

impl ConfigSnapshot {
    /// Compile a snapshot from a parsed config plus env overrides.
    pub fn build(config: &AppConfig, env: EnvOverrides, version: u64) -> Result<Self> {
        let patterns = PatternSet::compile(
            &builtin_patterns(),
            &config.security.additional_safe,
            &config.security.additional_blocked,
            &config.security.suppress_patterns,
        )?;
        Ok(Self {
            version,
            security: config.security.clone(),
            limits: config.limits,
            rate_limit: config.rate_limit,
            logging: config.logging.clone(),
            adaptive_defaults: config.adaptive_defaults,
            gateway: config.gateway.clone(),
            data_dir: config
                .data_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("psgate-data")),
            env,
            patterns,
            suppressed: config.security.suppress_patterns.clone(),
        })
    }

    /// Default overflow strategy for requests that do not choose one.
    pub fn overflow_strategy(&self) -> OverflowStrategy {
        self.env.overflow_strategy.unwrap_or_default()
    }

    /// Clamp a caller-requested timeout to the configured ceiling.
    pub fn clamp_timeout_sec(&self, requested: Option<u64>) -> u64 {
        let default_sec = (self.limits.default_timeout_ms / 1000).max(1);
        requested
            .unwrap_or(default_sec)
            .clamp(1, self.limits.max_timeout_seconds)
    }
}

/// Owner of the current snapshot. Readers clone the Arc and never block
/// writers for longer than a pointer swap.
pub struct ConfigStore {
    current: RwLock<Arc<ConfigSnapshot>>,
    next_version: AtomicU64,
    config: RwLock<AppConfig>,
}

impl ConfigStore {
    pub fn new(config: AppConfig, env: EnvOverrides) -> Result<Self> {
        let snapshot = ConfigSnapshot::build(&config, env, 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            next_version: AtomicU64::new(2),
            config: RwLock::new(config),
        })
    }

    pub fn load(path: &Path, env: EnvOverrides) -> Result<Self> {
        Self::new(AppConfig::load(path)?, env)
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Mutate the underlying config and publish a rebuilt snapshot.
    /// On rebuild failure the previous snapshot stays in place.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<ConfigSnapshot>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.config.write().expect("config lock poisoned");
        let mut candidate = config.clone();
        mutate(&mut candidate);

        let env = self.current().env.clone();
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(ConfigSnapshot::build(&candidate, env, version)?);

        *config = candidate;
        *self.current.write().expect("config lock poisoned") = snapshot.clone();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_file_missing() {
        let config = AppConfig::load(Path::new("/nonexistent/enterprise-config.json")).unwrap();
        assert!(config.security.require_confirmation_for_unknown);
        assert_eq!(config.limits.max_output_kb, 1024);
        assert_eq!(config.limits.chunk_kb, 64);
        assert!(config.rate_limit.enabled);
    }

    #[test]
    fn parses_enterprise_config() {
        let json = r#"{
            "security": {
                "allowedWriteRoots": ["${TEMP}", "C:\\work"],
                "enforceWorkingDirectory": true,
                "additionalBlocked": ["(?i)forbidden-tool"],
                "suppressPatterns": ["rsk-git-push"],
                "requireConfirmationForUnknown": false
            },
            "limits": {
                "maxOutputKB": 128,
                "maxLines": 500,
                "defaultTimeoutMs": 5000
            },
            "rateLimit": { "enabled": false },
            "logging": { "structuredAudit": true }
        }"#;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(json.as_bytes()).unwrap();

        let config = AppConfig::load(tmp.path()).unwrap();
        assert_eq!(config.security.allowed_write_roots.len(), 2);
        assert!(config.security.enforce_working_directory);
        assert!(!config.security.require_confirmation_for_unknown);
        assert_eq!(config.limits.max_output_kb, 128);
        assert_eq!(config.limits.max_lines, 500);
        assert!(!config.rate_limit.enabled);
        assert!(config.logging.structured_audit);
        // Untouched sections keep defaults
        assert_eq!(config.limits.chunk_kb, 64);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"{ not json").unwrap();
        assert!(matches!(
            AppConfig::load(tmp.path()),
            Err(PsgateError::Config(_))
        ));
    }

    #[test]
    fn snapshot_compiles_overrides() {
        let mut config = AppConfig::default();
        config.security.additional_blocked = vec!["(?i)never-run-this".to_string()];
        let snap = ConfigSnapshot::build(&config, EnvOverrides::default(), 1).unwrap();
        let m = snap.patterns.scan("Never-Run-This --now").unwrap();
        assert_eq!(m.tier, crate::types::Tier::Blocked);
    }

    #[test]
    fn bad_override_regex_is_fatal() {
        let mut config = AppConfig::default();
        config.security.additional_safe = vec!["(bad".to_string()];
        assert!(ConfigSnapshot::build(&config, EnvOverrides::default(), 1).is_err());
    }

    #[test]
    fn store_update_bumps_version() {
        let store = ConfigStore::new(AppConfig::default(), EnvOverrides::default()).unwrap();
        let v1 = store.current().version;
        let snap = store
            .update(|c| c.security.enforce_working_directory = true)
            .unwrap();
        assert!(snap.version > v1);
        assert!(store.current().security.enforce_working_directory);
    }

    #[test]
    fn failed_update_keeps_previous_snapshot() {
        let store = ConfigStore::new(AppConfig::default(), EnvOverrides::default()).unwrap();
        let before = store.current().version;
        let result = store.update(|c| {
            c.security.additional_safe = vec!["(broken".to_string()];
        });
        assert!(result.is_err());
        assert_eq!(store.current().version, before);
    }

    #[test]
    fn timeout_clamping() {
        let snap =
            ConfigSnapshot::build(&AppConfig::default(), EnvOverrides::default(), 1).unwrap();
        assert_eq!(snap.clamp_timeout_sec(None), 60);
        assert_eq!(snap.clamp_timeout_sec(Some(10)), 10);
        assert_eq!(snap.clamp_timeout_sec(Some(100_000)), 300);
        assert_eq!(snap.clamp_timeout_sec(Some(0)), 1);
    }
}
