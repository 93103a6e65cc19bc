// Configuration loading and parsing (config/warm-wallet.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::identity::canonical_address;
use crate::session::FailedDialPolicy;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "warm-wallet.toml";
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x1725e3cd3d6cac9226250981878fc9b5facf4589";
pub const DEFAULT_DB_FILE: &str = "warm-wallet.db";

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ethereum JSON-RPC endpoint used for `eth_call`. Must be the node's
    /// http(s) endpoint; a `ws://`/`wss://` node url has to be swapped for
    /// its HTTP equivalent (e.g. Infura's `/ws/v3/<key>` is `/v3/<key>`).
    pub rpc_url: String,
    /// Address of the suggester registry contract.
    pub contract_address: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            contract_address: DEFAULT_CONTRACT_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Forget a suggester session whose first dial failed, so it can be
    /// dialed again. Off by default: a failed session stays registered.
    pub evict_failed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            evict_failed: false,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn failed_dial_policy(&self) -> FailedDialPolicy {
        if self.evict_failed {
            FailedDialPolicy::Evict
        } else {
            FailedDialPolicy::KeepStale
        }
    }
}

/// The platform data directory database path, falling back to the working
/// directory when no home directory can be determined.
fn default_db_path() -> String {
    directories::ProjectDirs::from("", "", "warm-wallet")
        .map(|dirs| dirs.data_dir().join(DEFAULT_DB_FILE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE))
        .to_string_lossy()
        .into_owned()
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/warm-wallet.toml` relative to `base_dir`. A
/// missing file yields the defaults; unset keys fall back to their defaults.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);

    let mut config = match std::fs::read_to_string(&path) {
        Ok(text) => parse_config(&text, &path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    config.registry.contract_address = canonical_address(&config.registry.contract_address)
        .map_err(|e| ConfigError::ValidationError {
            field: "registry.contract_address".into(),
            message: e.to_string(),
        })?;

    validate(&config)?;
    Ok(config)
}

/// Convenience wrapper: loads config relative to the current working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    load_config_from(&cwd)
}

fn parse_config(text: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let rpc_url = &config.registry.rpc_url;
    if rpc_url.starts_with("ws://") || rpc_url.starts_with("wss://") {
        return Err(ConfigError::ValidationError {
            field: "registry.rpc_url".into(),
            message: format!(
                "WebSocket node urls are not supported, use the node's http(s) endpoint instead of `{rpc_url}`"
            ),
        });
    }
    if !(rpc_url.starts_with("http://") || rpc_url.starts_with("https://")) {
        return Err(ConfigError::ValidationError {
            field: "registry.rpc_url".into(),
            message: format!("must be an http(s) url, got `{rpc_url}`"),
        });
    }

    if config.database.path.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }

    let timeouts: &[(&str, u64)] = &[
        ("session.connect_timeout_secs", config.session.connect_timeout_secs),
        ("session.request_timeout_secs", config.session.request_timeout_secs),
    ];
    for (name, val) in timeouts {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Helper: write `contents` to `<tmp>/config/warm-wallet.toml`.
    fn write_config(contents: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join(CONFIG_FILE), contents).unwrap();
        tmp
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config_from(tmp.path()).unwrap();

        assert_eq!(config.registry.rpc_url, DEFAULT_RPC_URL);
        assert_eq!(
            config.registry.contract_address,
            canonical_address(DEFAULT_CONTRACT_ADDRESS).unwrap()
        );
        assert!(config.database.path.ends_with(DEFAULT_DB_FILE));
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.failed_dial_policy(), FailedDialPolicy::KeepStale);
    }

    #[test]
    fn full_file_is_parsed() {
        let tmp = write_config(
            r#"
            [registry]
            rpc_url = "https://rpc.example.org"
            contract_address = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"

            [database]
            path = "/var/lib/warm-wallet/wallet.db"

            [session]
            connect_timeout_secs = 3
            request_timeout_secs = 7
            evict_failed = true
            "#,
        );
        let config = load_config_from(tmp.path()).unwrap();

        assert_eq!(config.registry.rpc_url, "https://rpc.example.org");
        assert_eq!(
            config.registry.contract_address,
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
        assert_eq!(config.database.path, "/var/lib/warm-wallet/wallet.db");
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.session.request_timeout(), Duration::from_secs(7));
        assert_eq!(config.session.failed_dial_policy(), FailedDialPolicy::Evict);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = write_config("[session]\nrequest_timeout_secs = 5\n");
        let config = load_config_from(tmp.path()).unwrap();

        assert_eq!(config.session.request_timeout_secs, 5);
        assert_eq!(config.session.connect_timeout_secs, 10);
        assert_eq!(config.registry.rpc_url, DEFAULT_RPC_URL);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let tmp = write_config("[registry\nrpc_url = ");
        assert!(matches!(
            load_config_from(tmp.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn websocket_rpc_url_is_rejected_with_hint() {
        let tmp = write_config("[registry]\nrpc_url = \"wss://node.example/ws/v3/key\"\n");
        match load_config_from(tmp.path()) {
            Err(ConfigError::ValidationError { field, message }) => {
                assert_eq!(field, "registry.rpc_url");
                assert!(message.contains("http(s) endpoint"), "{message}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn non_http_rpc_url_is_rejected() {
        let tmp = write_config("[registry]\nrpc_url = \"node.example:8545\"\n");
        match load_config_from(tmp.path()) {
            Err(ConfigError::ValidationError { field, message }) => {
                assert_eq!(field, "registry.rpc_url");
                assert!(message.contains("must be an http(s) url"), "{message}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn bad_contract_address_is_rejected() {
        let tmp = write_config("[registry]\ncontract_address = \"0x1234\"\n");
        match load_config_from(tmp.path()) {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "registry.contract_address")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let tmp = write_config("[session]\nconnect_timeout_secs = 0\n");
        match load_config_from(tmp.path()) {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "session.connect_timeout_secs")
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
