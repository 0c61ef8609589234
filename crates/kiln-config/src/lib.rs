//! Environment-driven configuration.
//!
//! Every knob comes from a `KILN_*` environment variable so the launcher can
//! be dropped into existing build systems without a config file. Invalid
//! values are logged and fall back to their defaults; the only fatal
//! condition is not being able to locate a cache root at all.

use std::path::PathBuf;
use std::time::Duration;

pub const ENV_DIR: &str = "KILN_DIR";
pub const ENV_DEBUG: &str = "KILN_DEBUG";
pub const ENV_COMPRESS: &str = "KILN_COMPRESS";
pub const ENV_COMPRESS_LEVEL: &str = "KILN_COMPRESS_LEVEL";
pub const ENV_HARD_LINKS: &str = "KILN_HARD_LINKS";
pub const ENV_ACCURACY: &str = "KILN_ACCURACY";
pub const ENV_TERMINATE_ON_MISS: &str = "KILN_TERMINATE_ON_MISS";
pub const ENV_REMOTE: &str = "KILN_REMOTE";
pub const ENV_REMOTE_CONNECT_TIMEOUT_MS: &str = "KILN_REMOTE_CONNECT_TIMEOUT_MS";
pub const ENV_REMOTE_TRANSFER_TIMEOUT_MS: &str = "KILN_REMOTE_TRANSFER_TIMEOUT_MS";
pub const ENV_MAX_CACHE_SIZE: &str = "KILN_MAX_CACHE_SIZE";
pub const ENV_PREFIX: &str = "KILN_PREFIX";

const DEFAULT_MAX_CACHE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_REMOTE_CONNECT_TIMEOUT_MS: u64 = 100;
const DEFAULT_REMOTE_TRANSFER_TIMEOUT_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,
}

/// Log verbosity, ordered from most to least chatty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 1,
    Info = 2,
    Error = 3,
    Fatal = 4,
    None = 5,
}

impl LogLevel {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().parse::<u8>().ok()? {
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Error),
            4 => Some(Self::Fatal),
            5 => Some(Self::None),
            _ => None,
        }
    }
}

/// How much preprocessing-stage detail must be preserved in the hashed
/// preprocessed output.
///
/// `Strict` keeps line markers for debuggable builds at the cost of more
/// cache misses when only line numbers move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Accuracy {
    Default,
    Strict,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub log_level: LogLevel,
    pub compress: bool,
    pub compress_level: i32,
    pub hard_links: bool,
    pub accuracy: Accuracy,
    pub terminate_on_miss: bool,
    /// Remote endpoint, e.g. `redis://localhost:6379`. `None` = local only.
    pub remote: Option<String>,
    pub remote_connect_timeout: Duration,
    pub remote_transfer_timeout: Duration,
    /// Local cache size budget in bytes.
    pub max_cache_size: u64,
    /// Command prefix prepended when running the real compiler (e.g. `icecc`).
    pub prefix: Vec<String>,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cache_dir = match env_non_empty(ENV_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_cache_dir()?,
        };

        Ok(Self {
            cache_dir,
            log_level: env_non_empty(ENV_DEBUG)
                .and_then(|raw| {
                    let parsed = LogLevel::from_env_value(&raw);
                    if parsed.is_none() {
                        tracing::error!(
                            target = "kiln.config",
                            value = %raw,
                            "invalid {ENV_DEBUG} value, using default"
                        );
                    }
                    parsed
                })
                .unwrap_or(LogLevel::Error),
            compress: env_bool(ENV_COMPRESS),
            compress_level: env_non_empty(ENV_COMPRESS_LEVEL)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(0),
            hard_links: env_bool(ENV_HARD_LINKS),
            accuracy: match env_non_empty(ENV_ACCURACY).as_deref() {
                Some("STRICT") => Accuracy::Strict,
                Some("DEFAULT") | None => Accuracy::Default,
                Some(other) => {
                    tracing::error!(
                        target = "kiln.config",
                        value = %other,
                        "invalid {ENV_ACCURACY} value, using DEFAULT"
                    );
                    Accuracy::Default
                }
            },
            terminate_on_miss: env_bool(ENV_TERMINATE_ON_MISS),
            remote: env_non_empty(ENV_REMOTE),
            remote_connect_timeout: env_millis(
                ENV_REMOTE_CONNECT_TIMEOUT_MS,
                DEFAULT_REMOTE_CONNECT_TIMEOUT_MS,
            ),
            remote_transfer_timeout: env_millis(
                ENV_REMOTE_TRANSFER_TIMEOUT_MS,
                DEFAULT_REMOTE_TRANSFER_TIMEOUT_MS,
            ),
            max_cache_size: env_non_empty(ENV_MAX_CACHE_SIZE)
                .and_then(|raw| {
                    let parsed = parse_size(&raw);
                    if parsed.is_none() {
                        tracing::error!(
                            target = "kiln.config",
                            value = %raw,
                            "invalid {ENV_MAX_CACHE_SIZE} value, using default"
                        );
                    }
                    parsed
                })
                .unwrap_or(DEFAULT_MAX_CACHE_SIZE),
            prefix: env_non_empty(ENV_PREFIX)
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".kiln"),
            log_level: LogLevel::Error,
            compress: false,
            compress_level: 0,
            hard_links: false,
            accuracy: Accuracy::Default,
            terminate_on_miss: false,
            remote: None,
            remote_connect_timeout: Duration::from_millis(DEFAULT_REMOTE_CONNECT_TIMEOUT_MS),
            remote_transfer_timeout: Duration::from_millis(DEFAULT_REMOTE_TRANSFER_TIMEOUT_MS),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            prefix: Vec::new(),
        }
    }
}

fn default_cache_dir() -> Result<PathBuf, ConfigError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .ok_or(ConfigError::MissingHomeDir)?;
    Ok(PathBuf::from(home).join(".kiln"))
}

fn env_non_empty(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn env_bool(name: &str) -> bool {
    match env_non_empty(name) {
        Some(value) => parse_bool(&value),
        None => false,
    }
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    let ms = env_non_empty(name)
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a byte size with an optional `K`/`M`/`G` suffix (case-insensitive).
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (number, multiplier) = match value.chars().last()? {
        'k' | 'K' => (&value[..value.len() - 1], 1024u64),
        'm' | 'M' => (&value[..value.len() - 1], 1024 * 1024),
        'g' | 'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let number: u64 = number.trim().parse().ok()?;
    number.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests mutate process-global environment state.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_LOCK.lock().unwrap_or_else(|err| err.into_inner())
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("123"), Some(123));
        assert_eq!(parse_size("2K"), Some(2048));
        assert_eq!(parse_size("3m"), Some(3 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size(" 5 G "), Some(5 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("nope"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn parse_bool_accepts_common_truthy_forms() {
        for value in ["1", "true", "TRUE", "yes", "on"] {
            assert!(parse_bool(value), "{value} should parse as true");
        }
        for value in ["0", "false", "off", "banana"] {
            assert!(!parse_bool(value), "{value} should parse as false");
        }
    }

    #[test]
    fn accuracy_is_ordered() {
        assert!(Accuracy::Default < Accuracy::Strict);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _guard = test_lock();
        std::env::set_var(ENV_DIR, "/tmp/kiln-test-cache");
        std::env::set_var(ENV_COMPRESS, "true");
        std::env::set_var(ENV_ACCURACY, "STRICT");
        std::env::set_var(ENV_MAX_CACHE_SIZE, "16M");
        std::env::set_var(ENV_DEBUG, "1");
        std::env::set_var(ENV_PREFIX, "nice -n 19");

        let config = Config::from_env().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/kiln-test-cache"));
        assert!(config.compress);
        assert_eq!(config.accuracy, Accuracy::Strict);
        assert_eq!(config.max_cache_size, 16 * 1024 * 1024);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.prefix, vec!["nice", "-n", "19"]);

        for name in [
            ENV_DIR,
            ENV_COMPRESS,
            ENV_ACCURACY,
            ENV_MAX_CACHE_SIZE,
            ENV_DEBUG,
            ENV_PREFIX,
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn from_env_defaults_on_invalid_values() {
        let _guard = test_lock();
        std::env::set_var(ENV_DIR, "/tmp/kiln-test-cache");
        std::env::set_var(ENV_DEBUG, "99");
        std::env::set_var(ENV_ACCURACY, "PARANOID");
        std::env::set_var(ENV_MAX_CACHE_SIZE, "lots");

        let config = Config::from_env().unwrap();
        assert_eq!(config.log_level, LogLevel::Error);
        assert_eq!(config.accuracy, Accuracy::Default);
        assert_eq!(config.max_cache_size, DEFAULT_MAX_CACHE_SIZE);

        for name in [ENV_DIR, ENV_DEBUG, ENV_ACCURACY, ENV_MAX_CACHE_SIZE] {
            std::env::remove_var(name);
        }
    }
}
