//! Settings loading for relgraph services.
//!
//! Settings are layered (highest priority first):
//! 1. Environment variables (`RELGRAPH__` prefix, `__` section separator)
//! 2. Config file (`relgraph.toml` or another prefix)
//! 3. Per-section serde defaults

use serde::de::DeserializeOwned;

use crate::error::RelgraphError;

/// Environment variable prefix for every relgraph setting.
pub const ENV_PREFIX: &str = "RELGRAPH";

/// Build the layered settings source for the given file prefix.
pub fn load_settings(file_prefix: &str) -> Result<config::Config, RelgraphError> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(cfg)
}

/// Deserialize one section, falling back to its defaults when absent.
/// A present but malformed section is an error.
pub fn section<T>(settings: &config::Config, key: &str) -> Result<T, RelgraphError>
where
    T: DeserializeOwned + Default,
{
    match settings.get::<T>(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => {
            tracing::debug!(section = key, "Settings section absent, using defaults");
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}
