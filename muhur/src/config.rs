//! Configuration resolution for seal backends.
//!
//! Every field resolves in this order:
//! 1. environment variable(s)
//! 2. the caller's configuration map
//! 3. the backend default
//! 4. `Error::MissingConfig`
//!
//! Empty values count as absent at every level.

use crate::error::Error;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Non-sensitive resolved values echoed back by `set_config`.
pub type PublicConfig = BTreeMap<String, String>;

/// Source of environment variables.
pub trait EnvSource: Send + Sync {
    /// Returns the value of `name`, if set.
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// In-memory environment, for tests and embedders that isolate the process
/// environment.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

/// Caller-supplied configuration map plus the environment it resolves against.
///
/// # Example
///
/// ```
/// use muhur::config::{MapEnv, SealConfig};
///
/// let config = SealConfig::from_pairs([("key_glob", "/map/*.key")])
///     .with_env(MapEnv::new().with("VAULT_LOCAL_SEAL_KEY_GLOB", "/env/*.key"));
///
/// let glob = config.required("key_glob", &["VAULT_LOCAL_SEAL_KEY_GLOB"]).unwrap();
/// assert_eq!(glob, "/env/*.key");
/// ```
#[derive(Clone)]
pub struct SealConfig {
    values: HashMap<String, String>,
    env: Arc<dyn EnvSource>,
}

impl SealConfig {
    /// Creates a configuration resolving against the process environment.
    #[must_use]
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values, env: Arc::new(ProcessEnv) }
    }

    /// Creates a configuration from key/value pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Replaces the environment source.
    #[must_use]
    pub fn with_env(mut self, env: impl EnvSource + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Returns the environment source.
    #[must_use]
    pub fn env(&self) -> &dyn EnvSource {
        self.env.as_ref()
    }

    /// Returns the raw map value for `key`, ignoring the environment.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Resolves `key` from the first set environment variable in `env_vars`,
    /// then from the map.
    #[must_use]
    pub fn resolve(&self, key: &str, env_vars: &[&str]) -> Option<String> {
        env_vars
            .iter()
            .find_map(|name| self.env.var(name).filter(|v| !v.is_empty()))
            .or_else(|| self.get(key).map(ToOwned::to_owned))
    }

    /// Resolves a required value.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingConfig` naming `key` when no source provides it.
    pub fn required(&self, key: &str, env_vars: &[&str]) -> Result<String, Error> {
        self.resolve(key, env_vars).ok_or_else(|| Error::missing_config(key))
    }

    /// Resolves an optional value.
    #[must_use]
    pub fn optional(&self, key: &str, env_vars: &[&str]) -> Option<String> {
        self.resolve(key, env_vars)
    }

    /// Resolves a value, falling back to `default`.
    #[must_use]
    pub fn or_default(&self, key: &str, env_vars: &[&str], default: &str) -> String {
        self.resolve(key, env_vars).unwrap_or_else(|| default.to_owned())
    }

    /// Resolves a boolean, falling back to `default`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the value does not parse as a bool.
    pub fn flag(&self, key: &str, env_vars: &[&str], default: bool) -> Result<bool, Error> {
        self.resolve(key, env_vars).map_or(Ok(default), |value| parse_bool(key, &value))
    }
}

impl fmt::Debug for SealConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values may hold credentials.
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("SealConfig").field("keys", &keys).finish_non_exhaustive()
    }
}

impl Default for SealConfig {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

/// Parses a boolean the way operators write them in config files.
///
/// # Errors
///
/// Returns `Error::InvalidConfig` for anything other than
/// `1/0/t/f/true/false` (case-insensitive).
pub fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        other => Err(Error::invalid_config(key, format!("not a boolean: {other:?}"))),
    }
}
