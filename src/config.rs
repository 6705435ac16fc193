//! Configuration record and its on-disk store.
//!
//! The config file is JSON and is the single source of truth for the
//! sync watermark between runs. Keys this tool does not own (set by the
//! config editor or by the remote service's filter) are carried through
//! a load/save cycle untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SyncError;
use crate::validation::{normalize_host, validate_timeout};

/// Default directory for bare config names.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/blocksync";

/// Default config name when none is given.
pub const DEFAULT_CONFIG_NAME: &str = "config.json";

/// Environment variable consulted for the token when `--token` is absent.
pub const TOKEN_ENV: &str = "BLOCKSYNC_TOKEN";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const BLOCKLIST_PREFIX: &str = "blocklist_";

/// Secure string type that zeroizes memory on drop.
/// Holds the bearer token.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecureString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Filter sent with every fetch. `since` is the sync watermark; any other
/// keys belong to the remote service and are echoed back as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub since: i64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Probe ipset first, then nftables
    #[default]
    Auto,
    /// ipset set enforced by an iptables rule
    Ipset,
    /// nftables set enforced by an nftables rule
    Nftables,
}

/// Main configuration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote service base URL
    pub host: String,

    /// Log file used by the reporting side; kept for round-tripping
    pub logfile: String,

    /// Bearer token; memory is zeroed when dropped
    pub token: SecureString,

    pub filter: Filter,

    /// Install the enforcement rule if it is missing
    #[serde(rename = "autocreateIptables", alias = "autoCreateChainRules")]
    pub auto_create_chain_rules: bool,

    pub backend: Backend,

    /// Packet-filter chain that receives the DROP rule
    pub chain: String,

    /// Request timeout in seconds
    pub timeout: u64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            logfile: String::new(),
            token: SecureString::default(),
            filter: Filter::default(),
            auto_create_chain_rules: false,
            backend: Backend::Auto,
            chain: "INPUT".to_string(),
            timeout: DEFAULT_TIMEOUT_SECS,
            extra: Map::new(),
        }
    }
}

impl Config {
    /// Parse a config from JSON text
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse config JSON")
    }

    /// Load and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        normalize_host(&self.host)?;

        if self.token.is_empty() {
            anyhow::bail!("Token cannot be empty");
        }

        validate_timeout(self.timeout)?;

        if self.chain.is_empty()
            || !self
                .chain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            anyhow::bail!("Invalid chain name '{}'", self.chain);
        }

        Ok(())
    }

    /// Save the config atomically with owner-only permissions.
    ///
    /// Uses tempfile + rename so a crash never leaves a truncated file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }

    /// Current sync watermark
    pub fn watermark(&self) -> i64 {
        self.filter.since
    }

    /// Move the watermark to `new`, never backwards. Returns the stored value.
    pub fn advance_watermark(&mut self, new: i64) -> i64 {
        if new > self.filter.since {
            self.filter.since = new;
        }
        self.filter.since
    }

    /// Whether the next fetch has to request the full remote state
    pub fn needs_full_fetch(&self) -> bool {
        self.filter.since <= 0
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Apply CLI overrides on top of the file values
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref host) = overrides.host {
            if !host.is_empty() {
                self.host = host.clone();
            }
        }
        if let Some(ref token) = overrides.token {
            if !token.is_empty() {
                self.token = token.clone();
            }
        }
    }
}

/// Host/token supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub token: Option<SecureString>,
    /// `token` came from `BLOCKSYNC_TOKEN` and must not be written to disk
    pub token_from_env: bool,
}

impl ConfigOverrides {
    /// Take the token from `BLOCKSYNC_TOKEN` when none was given.
    pub fn with_env_token(mut self) -> Self {
        if self.token.as_ref().map_or(true, |t| t.is_empty()) {
            if let Ok(val) = env::var(TOKEN_ENV) {
                self.token = Some(SecureString::new(val));
                self.token_from_env = true;
            }
        }
        self
    }

    fn is_complete(&self) -> bool {
        self.host.as_ref().is_some_and(|h| !h.trim().is_empty())
            && self.token.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Loads and persists the [`Config`] for one blocklist.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Config, SyncError>;

    fn persist(&self, config: &Config) -> Result<(), SyncError>;

    /// Location of the record; also anchors backup files.
    fn path(&self) -> &Path;
}

/// JSON file store.
pub struct JsonConfigStore {
    path: PathBuf,
    overrides: ConfigOverrides,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

impl ConfigStore for JsonConfigStore {
    /// Read the file and apply overrides.
    ///
    /// A missing or empty file is accepted when both host and token were
    /// overridden; the record then starts with a zero watermark and is
    /// written on the first successful sync.
    fn load(&self) -> Result<Config, SyncError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(SyncError::Config(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let mut config = if content.trim().is_empty() {
            if !self.overrides.is_complete() {
                return Err(SyncError::Config(format!(
                    "No usable config at {}. Pass --host and --token to create one",
                    self.path.display()
                )));
            }
            Config::default()
        } else {
            Config::from_json(&content).map_err(|e| {
                SyncError::Config(format!("{}: {:#}", self.path.display(), e))
            })?
        };

        config.apply_overrides(&self.overrides);
        config
            .validate()
            .map_err(|e| SyncError::Config(format!("{}: {:#}", self.path.display(), e)))?;

        Ok(config)
    }

    /// Save `config`, keeping whatever token the file already had when
    /// the in-memory one came from the environment.
    fn persist(&self, config: &Config) -> Result<(), SyncError> {
        let mut record = config.clone();
        if self.overrides.token_from_env {
            record.token = std::fs::read_to_string(&self.path)
                .ok()
                .and_then(|content| Config::from_json(&content).ok())
                .map(|on_disk| on_disk.token.clone())
                .unwrap_or_default();
        }
        record
            .save(&self.path)
            .map_err(|e| SyncError::Config(format!("{:#}", e)))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolve a config name to a file path.
///
/// Names containing a path separator are used verbatim; bare names live
/// in `config_dir`.
pub fn resolve_config_path(config_dir: &Path, name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        config_dir.join(name)
    }
}

/// Kernel set/chain name for a config name.
///
/// Directory and extension are stripped: `configs/acme.json` becomes
/// `blocklist_acme`. The same config always maps to the same set.
pub fn derive_blocklist_name(config_name: &str) -> String {
    let base = Path::new(config_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(config_name);
    let stem = match base.rfind('.') {
        Some(idx) => &base[..idx],
        None => base,
    };
    format!("{}{}", BLOCKLIST_PREFIX, stem)
}
