//! Cache configuration: which stores are enabled, where they live and how the
//! remote API is reached.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default local cache directory, relative to the repository root.
pub const DEFAULT_CACHE_DIR: &str = ".cachet/cache";

/// Read/write switches for one cache kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheActions {
    /// Fetches may be served from this kind
    pub read: bool,
    /// Puts are written to this kind
    pub write: bool,
}

impl CacheActions {
    /// Both reads and writes enabled.
    pub const ENABLED: Self = Self {
        read: true,
        write: true,
    };

    /// Both reads and writes disabled.
    pub const DISABLED: Self = Self {
        read: false,
        write: false,
    };

    /// Whether either action is enabled.
    #[must_use]
    pub const fn any(self) -> bool {
        self.read || self.write
    }
}

impl Default for CacheActions {
    fn default() -> Self {
        Self::ENABLED
    }
}

impl FromStr for CacheActions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut actions = Self::DISABLED;
        for c in s.chars() {
            match c {
                'r' if actions.read => {
                    return Err(Error::configuration(format!(
                        "duplicate cache action 'r' in '{s}'"
                    )));
                }
                'w' if actions.write => {
                    return Err(Error::configuration(format!(
                        "duplicate cache action 'w' in '{s}'"
                    )));
                }
                'r' => actions.read = true,
                'w' => actions.write = true,
                other => {
                    return Err(Error::configuration(format!(
                        "invalid cache action '{other}' in '{s}', expected 'r' or 'w'"
                    )));
                }
            }
        }
        Ok(actions)
    }
}

impl fmt::Display for CacheActions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        }
        Ok(())
    }
}

/// Which cache kinds may be read and written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Local filesystem store
    pub local: CacheActions,
    /// Remote HTTP store
    pub remote: CacheActions,
}

impl CacheConfig {
    /// Everything off.
    pub const DISABLED: Self = Self {
        local: CacheActions::DISABLED,
        remote: CacheActions::DISABLED,
    };

    /// Whether any kind can be read.
    #[must_use]
    pub const fn can_read(self) -> bool {
        self.local.read || self.remote.read
    }

    /// Whether any kind can be written.
    #[must_use]
    pub const fn can_write(self) -> bool {
        self.local.write || self.remote.write
    }
}

impl FromStr for CacheConfig {
    type Err = Error;

    /// Parse `local:rw,remote:r`. Kinds not mentioned are disabled.
    fn from_str(s: &str) -> Result<Self> {
        let mut config = Self::DISABLED;
        if s.is_empty() {
            return Ok(config);
        }

        let mut seen_local = false;
        let mut seen_remote = false;
        for pair in s.split(',') {
            let (kind, actions) = pair.split_once(':').ok_or_else(|| {
                Error::configuration(format!(
                    "cache setting '{pair}' in '{s}' must be written as kind:actions"
                ))
            })?;
            let seen = match kind {
                "local" => &mut seen_local,
                "remote" => &mut seen_remote,
                other => {
                    return Err(Error::configuration(format!(
                        "invalid cache kind '{other}' in '{s}', expected 'local' or 'remote'"
                    )));
                }
            };
            if *seen {
                return Err(Error::configuration(format!(
                    "duplicate cache kind '{kind}' in '{s}'"
                )));
            }
            *seen = true;

            let actions: CacheActions = actions.parse()?;
            if kind == "local" {
                config.local = actions;
            } else {
                config.remote = actions;
            }
        }
        Ok(config)
    }
}

impl fmt::Display for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local:{},remote:{}", self.local, self.remote)
    }
}

/// Retry policy for remote requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Artifact signing key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureConfig {
    /// Shared HMAC key
    pub key: String,
}

impl fmt::Debug for SignatureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignatureConfig")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Connection settings for the remote artifact API.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCacheConfig {
    /// Base URL; artifacts live under `/v8/artifacts/{hash}`
    pub api_url: String,

    /// Bearer token
    #[serde(default)]
    pub token: String,

    /// Team id sent as the `teamId` query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    /// Team slug sent as the `slug` query parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_slug: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Signing key; when set, uploads are tagged and downloads verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureConfig>,

    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
}

impl fmt::Debug for RemoteCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCacheConfig")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("team_id", &self.team_id)
            .field("team_slug", &self.team_slug)
            .field("timeout_secs", &self.timeout_secs)
            .field("signature", &self.signature)
            .field("retry", &self.retry)
            .finish()
    }
}

impl RemoteCacheConfig {
    /// Settings for `api_url` with every other field at its default.
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: token.into(),
            team_id: None,
            team_slug: None,
            timeout_secs: default_timeout_secs(),
            signature: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Top-level cache options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheOpts {
    /// Local store directory; relative paths are resolved against the repo root
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Enabled kinds and actions
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote store; absent means local only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteCacheConfig>,

    /// Remote failures tolerated per run before the remote is switched off
    #[serde(default = "default_max_remote_failures")]
    pub max_remote_failures: u64,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache: CacheConfig::default(),
            remote: None,
            max_remote_failures: default_max_remote_failures(),
        }
    }
}

impl CacheOpts {
    /// Apply `CACHET_*` environment variables on top of these options.
    ///
    /// Empty values are ignored. `CACHET_API` creates a remote configuration
    /// when none exists; the other remote variables only modify an existing
    /// one. A remote without a token falls back to [`user_token`].
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(dir) = env_value("CACHET_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(cache) = env_value("CACHET_CACHE") {
            self.cache = cache.parse()?;
        }
        if let Some(api) = env_value("CACHET_API") {
            match self.remote.as_mut() {
                Some(remote) => remote.api_url = api,
                None => self.remote = Some(RemoteCacheConfig::new(api, String::new())),
            }
        }

        if let Some(remote) = self.remote.as_mut() {
            if let Some(token) = env_value("CACHET_TOKEN") {
                remote.token = token;
            }
            if let Some(team_id) = env_value("CACHET_TEAM_ID") {
                remote.team_id = Some(team_id);
            }
            if let Some(slug) = env_value("CACHET_TEAM_SLUG") {
                remote.team_slug = Some(slug);
            }
            if let Some(timeout) = env_value("CACHET_REMOTE_CACHE_TIMEOUT") {
                remote.timeout_secs = timeout.parse().map_err(|_| {
                    Error::configuration(format!(
                        "CACHET_REMOTE_CACHE_TIMEOUT must be a number of seconds, got '{timeout}'"
                    ))
                })?;
            }
            if let Some(key) = env_value("CACHET_REMOTE_CACHE_SIGNATURE_KEY") {
                remote.signature = Some(SignatureConfig { key });
            }
            if remote.token.is_empty()
                && let Some(token) = user_token()
            {
                remote.token = token;
            }
        }
        Ok(self)
    }

    /// Absolute local store directory.
    #[must_use]
    pub fn resolve_cache_dir(&self, repo_root: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            repo_root.join(&self.cache_dir)
        }
    }
}

#[derive(Deserialize)]
struct UserConfig {
    token: Option<String>,
}

/// Token stored in `<config dir>/cachet/config.json`, if any.
#[must_use]
pub fn user_token() -> Option<String> {
    let path = dirs::config_dir()?.join("cachet").join("config.json");
    read_user_token(&path)
}

fn read_user_token(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let config: UserConfig = match serde_json::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable user config");
            return None;
        }
    };
    config.token.filter(|t| !t.is_empty())
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_max_remote_failures() -> u64 {
    3
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_max_retries() -> u32 {
    2
}

fn default_min_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const CACHET_VARS: [&str; 8] = [
        "CACHET_CACHE_DIR",
        "CACHET_CACHE",
        "CACHET_API",
        "CACHET_TOKEN",
        "CACHET_TEAM_ID",
        "CACHET_TEAM_SLUG",
        "CACHET_REMOTE_CACHE_TIMEOUT",
        "CACHET_REMOTE_CACHE_SIGNATURE_KEY",
    ];

    fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
        CACHET_VARS.iter().map(|name| (*name, None)).collect()
    }

    // ==========================================================================
    // Compact form
    // ==========================================================================

    #[test]
    fn test_parse_both_kinds() {
        let config: CacheConfig = "local:rw,remote:r".parse().unwrap();
        assert_eq!(config.local, CacheActions::ENABLED);
        assert_eq!(
            config.remote,
            CacheActions {
                read: true,
                write: false
            }
        );
    }

    #[test]
    fn test_parse_unmentioned_kind_is_disabled() {
        let config: CacheConfig = "remote:w".parse().unwrap();
        assert_eq!(config.local, CacheActions::DISABLED);
        assert!(config.remote.write);
        assert!(!config.can_read());
    }

    #[test]
    fn test_parse_empty_disables_everything() {
        assert_eq!("".parse::<CacheConfig>().unwrap(), CacheConfig::DISABLED);
        assert_eq!(
            "local:,remote:".parse::<CacheConfig>().unwrap(),
            CacheConfig::DISABLED
        );
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "local:r,local:w",
            "local:rr",
            "disk:rw",
            "local:rx",
            "local",
            "local:rw,",
        ] {
            let err = bad.parse::<CacheConfig>().unwrap_err();
            assert!(
                matches!(err, Error::Configuration { .. }),
                "{bad} should be a configuration error"
            );
        }
    }

    #[test]
    fn test_display_round_trips() {
        let config: CacheConfig = "local:w,remote:rw".parse().unwrap();
        assert_eq!(config.to_string().parse::<CacheConfig>().unwrap(), config);
    }

    // ==========================================================================
    // Serde and defaults
    // ==========================================================================

    #[test]
    fn test_opts_defaults() {
        let opts: CacheOpts = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.cache_dir, PathBuf::from(".cachet/cache"));
        assert_eq!(opts.max_remote_failures, 3);
        assert_eq!(opts.cache, CacheConfig::default());
        assert!(opts.remote.is_none());
    }

    #[test]
    fn test_remote_config_camel_case() {
        let remote: RemoteCacheConfig = serde_json::from_str(
            r#"{"apiUrl": "https://cache.example.com", "teamId": "team_1", "retry": {"maxRetries": 5}}"#,
        )
        .unwrap();
        assert_eq!(remote.team_id.as_deref(), Some("team_1"));
        assert_eq!(remote.timeout_secs, 20);
        assert_eq!(remote.retry.max_retries, 5);
        assert_eq!(remote.retry.min_backoff_ms, 2_000);
    }

    #[test]
    fn test_debug_hides_credentials() {
        let mut remote = RemoteCacheConfig::new("https://cache.example.com", "tok-secret-value");
        remote.signature = Some(SignatureConfig {
            key: "sig-secret-value".into(),
        });
        let rendered = format!("{remote:?}");
        assert!(!rendered.contains("tok-secret-value"));
        assert!(!rendered.contains("sig-secret-value"));
    }

    #[test]
    fn test_resolve_cache_dir() {
        let opts = CacheOpts::default();
        assert_eq!(
            opts.resolve_cache_dir(Path::new("/repo")),
            PathBuf::from("/repo/.cachet/cache")
        );
        let absolute = CacheOpts {
            cache_dir: PathBuf::from("/var/cache/cachet"),
            ..CacheOpts::default()
        };
        assert_eq!(
            absolute.resolve_cache_dir(Path::new("/repo")),
            PathBuf::from("/var/cache/cachet")
        );
    }

    // ==========================================================================
    // Environment overrides
    // ==========================================================================

    #[test]
    fn test_env_overrides_create_remote() {
        let mut vars = cleared();
        vars.extend([
            ("CACHET_API", Some("https://cache.example.com")),
            ("CACHET_TOKEN", Some("env-token-123")),
            ("CACHET_TEAM_SLUG", Some("acme")),
            ("CACHET_CACHE", Some("local:r,remote:rw")),
            ("CACHET_REMOTE_CACHE_TIMEOUT", Some("5")),
        ]);
        temp_env::with_vars(vars, || {
            let opts = CacheOpts::default().with_env_overrides().unwrap();
            let remote = opts.remote.unwrap();
            assert_eq!(remote.api_url, "https://cache.example.com");
            assert_eq!(remote.token, "env-token-123");
            assert_eq!(remote.team_slug.as_deref(), Some("acme"));
            assert_eq!(remote.timeout_secs, 5);
            assert!(!opts.cache.local.write);
        });
    }

    #[test]
    fn test_env_overrides_ignore_empty_values() {
        let mut vars = cleared();
        vars.push(("CACHET_CACHE_DIR", Some("")));
        temp_env::with_vars(vars, || {
            let opts = CacheOpts::default().with_env_overrides().unwrap();
            assert_eq!(opts.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));
        });
    }

    #[test]
    fn test_env_overrides_reject_bad_timeout() {
        let mut vars = cleared();
        vars.extend([
            ("CACHET_API", Some("https://cache.example.com")),
            ("CACHET_TOKEN", Some("env-token-123")),
            ("CACHET_REMOTE_CACHE_TIMEOUT", Some("soon")),
        ]);
        temp_env::with_vars(vars, || {
            assert!(CacheOpts::default().with_env_overrides().is_err());
        });
    }

    #[test]
    fn test_env_signature_key() {
        let mut vars = cleared();
        vars.extend([
            ("CACHET_API", Some("https://cache.example.com")),
            ("CACHET_TOKEN", Some("env-token-123")),
            ("CACHET_REMOTE_CACHE_SIGNATURE_KEY", Some("shared-key")),
        ]);
        temp_env::with_vars(vars, || {
            let opts = CacheOpts::default().with_env_overrides().unwrap();
            assert_eq!(opts.remote.unwrap().signature.unwrap().key, "shared-key");
        });
    }

    #[test]
    fn test_read_user_token() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"token": "file-token"}"#).unwrap();
        assert_eq!(read_user_token(&path).as_deref(), Some("file-token"));

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(read_user_token(&path), None);
        assert_eq!(read_user_token(&tmp.path().join("missing.json")), None);
    }
}
