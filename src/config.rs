//! Gateway configuration (spec §6 "Configuration inputs", SPEC_FULL §A.3).
//!
//! `gateway.toml` is operator-owned and loaded once at startup. Values are
//! never re-read at runtime; restart the process to pick up changes.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bind port for the loopback JSON-RPC transport.
const DEFAULT_PORT: u16 = 8765;

/// The fully-resolved configuration used by the rest of the crate.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absolute path tool invocations are sandboxed beneath.
    pub workspace_root: PathBuf,
    /// Default per-invocation timeout when a tool doesn't specify one.
    pub default_timeout: Duration,
    /// Global concurrency cap across all in-flight invocations.
    pub max_concurrent_invocations: u32,
    /// Whether any tool may require human approval at all.
    pub approvals_enabled: bool,
    /// SHA-256 hex digests of accepted bearer tokens.
    pub token_hashes: Vec<String>,
    /// Permit an empty `token_hashes` set (single-operator/local-only setups).
    pub allow_legacy_tokens: bool,
    /// Path to the command allow/deny policy file.
    pub policy_file: PathBuf,
    /// How often the background sweep runs (invocation TTL + approval expiry).
    pub cleanup_interval: Duration,
    /// Maximum age of a non-terminal invocation before it is force-failed.
    pub invocation_ttl: Duration,
    /// How long a pending approval request lives before auto-expiring.
    pub approval_expiry: Duration,
    /// Loopback-only bind address for the Transport.
    pub bind_addr: IpAddr,
    /// Bind port for the Transport.
    pub bind_port: u16,
    /// Per-user cap on concurrently running process-spawning tool invocations.
    pub per_user_process_tool_cap: u32,
    /// Directory logs are written under.
    pub logs_dir: PathBuf,
    /// Directory the approval store and session logs are written under.
    pub data_dir: PathBuf,
}

/// On-disk shape of `gateway.toml`; every field optional so the file can
/// be partial and fall back to [`Config::defaults_for`].
#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    workspace_root: Option<PathBuf>,
    default_timeout_secs: Option<u64>,
    max_concurrent_invocations: Option<u32>,
    approvals_enabled: Option<bool>,
    token_hashes: Option<Vec<String>>,
    allow_legacy_tokens: Option<bool>,
    policy_file: Option<PathBuf>,
    cleanup_interval_secs: Option<u64>,
    invocation_ttl_secs: Option<u64>,
    approval_expiry_secs: Option<u64>,
    bind_addr: Option<IpAddr>,
    bind_port: Option<u16>,
    per_user_process_tool_cap: Option<u32>,
    logs_dir: Option<PathBuf>,
    data_dir: Option<PathBuf>,
}

/// Errors raised while loading or validating [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file's contents were not valid TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was being parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// A loaded value failed post-parse validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Resolve the default `gateway.toml` location: `$HOME/.moonbot/gateway.toml`,
    /// falling back to `./gateway.toml` if the home directory cannot be found.
    pub fn default_path() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".moonbot").join("gateway.toml"))
            .unwrap_or_else(|| PathBuf::from("gateway.toml"))
    }

    /// Load configuration from `path`, or the environment/default location
    /// when `path` is `None`. Returns built-in defaults layered with
    /// whatever `path` actually sets, then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = path.map(Path::to_path_buf).unwrap_or_else(|| {
            std::env::var("WINTERMUTE_GATEWAY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::default_path())
        });

        let raw = if resolved.exists() {
            let text = std::fs::read_to_string(&resolved).map_err(|source| ConfigError::Read {
                path: resolved.clone(),
                source,
            })?;
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: resolved.clone(),
                source,
            })?
        } else {
            RawConfig::default()
        };

        let config = Self::from_raw(raw);
        config.validate()?;
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Self {
        let moonbot_dir = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".moonbot"))
            .unwrap_or_else(|| PathBuf::from(".moonbot"));

        Self {
            workspace_root: raw
                .workspace_root
                .unwrap_or_else(|| moonbot_dir.join("workspace")),
            default_timeout: Duration::from_secs(raw.default_timeout_secs.unwrap_or(30)),
            max_concurrent_invocations: raw.max_concurrent_invocations.unwrap_or(8),
            approvals_enabled: raw.approvals_enabled.unwrap_or(true),
            token_hashes: raw.token_hashes.unwrap_or_default(),
            allow_legacy_tokens: raw.allow_legacy_tokens.unwrap_or(false),
            policy_file: raw
                .policy_file
                .unwrap_or_else(|| moonbot_dir.join("exec-approvals.json")),
            cleanup_interval: Duration::from_secs(raw.cleanup_interval_secs.unwrap_or(30)),
            invocation_ttl: Duration::from_secs(raw.invocation_ttl_secs.unwrap_or(600)),
            approval_expiry: Duration::from_secs(raw.approval_expiry_secs.unwrap_or(900)),
            bind_addr: raw.bind_addr.unwrap_or(IpAddr::from([127, 0, 0, 1])),
            bind_port: raw.bind_port.unwrap_or(DEFAULT_PORT),
            per_user_process_tool_cap: raw.per_user_process_tool_cap.unwrap_or(2),
            logs_dir: raw.logs_dir.unwrap_or_else(|| moonbot_dir.join("logs")),
            data_dir: raw.data_dir.unwrap_or_else(|| moonbot_dir.join("data")),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.bind_addr.is_loopback() {
            return Err(ConfigError::Invalid(format!(
                "bind_addr {} is not a loopback address; this gateway is local-first only",
                self.bind_addr
            )));
        }
        if self.token_hashes.is_empty() && !self.allow_legacy_tokens {
            return Err(ConfigError::Invalid(
                "token_hashes is empty; set allow_legacy_tokens = true to run without auth"
                    .to_string(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_invocations == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_invocations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Commented starter file contents written when no config file exists yet,
    /// so first-run never hard-fails (mirrors the policy file's default-file
    /// generation).
    pub fn default_file_contents() -> String {
        r#"# wintermute-gateway configuration. All fields are optional; uncomment and
# edit as needed. Defaults shown.

# workspace_root = "~/.moonbot/workspace"
# default_timeout_secs = 30
# max_concurrent_invocations = 8
# approvals_enabled = true
# token_hashes = []
# allow_legacy_tokens = false
# policy_file = "~/.moonbot/exec-approvals.json"
# cleanup_interval_secs = 30
# invocation_ttl_secs = 600
# approval_expiry_secs = 900
# bind_addr = "127.0.0.1"
# bind_port = 8765
# per_user_process_tool_cap = 2
# logs_dir = "~/.moonbot/logs"
# data_dir = "~/.moonbot/data"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::from_raw(RawConfig {
            allow_legacy_tokens: Some(true),
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_loopback_bind_is_rejected() {
        let config = Config::from_raw(RawConfig {
            allow_legacy_tokens: Some(true),
            bind_addr: Some(IpAddr::from([0, 0, 0, 0])),
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_token_hashes_without_legacy_flag_is_rejected() {
        let config = Config::from_raw(RawConfig::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = Config::from_raw(RawConfig {
            allow_legacy_tokens: Some(true),
            default_timeout_secs: Some(0),
            ..Default::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
