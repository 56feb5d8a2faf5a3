//! Configuration loading helper functions
//!
//! Layered configuration via figment: defaults, then files under `config/`,
//! then prefixed environment variables.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use errors::{config_error, ChannelError, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Load configuration from multiple sources
///
/// Priority (highest to lowest):
/// 1. Environment variables prefixed `{NAME}_` (e.g. `CHANNELS_CONNECT_TIMEOUT_MS`)
/// 2. `config/{name}.json`
/// 3. `config/{name}.yaml`
/// 4. `config/{name}.toml`
/// 5. `T::default()`
pub fn load_config<T>(name: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Serialize + Default,
{
    load_config_in(Path::new("config"), name)
}

/// Same as [`load_config`] with an explicit configuration directory
pub fn load_config_in<T>(dir: &Path, name: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Serialize + Default,
{
    let figment = Figment::from(Serialized::defaults(T::default()))
        .merge(Toml::file(dir.join(format!("{}.toml", name))))
        .merge(Yaml::file(dir.join(format!("{}.yaml", name))))
        .merge(Json::file(dir.join(format!("{}.json", name))))
        .merge(Env::prefixed(&format!("{}_", name.to_uppercase())));

    figment
        .extract()
        .map_err(|e| ChannelError::config(format!("Failed to load configuration: {}", e)))
}

/// Load configuration from a specific file, on top of `T::default()`
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Serialize + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| config_error!("Config file must have an extension"))?;

    if !path.exists() {
        return Err(config_error!("Config file not found: {}", path.display()));
    }

    let base = Figment::from(Serialized::defaults(T::default()));
    let figment = match extension {
        "toml" => base.merge(Toml::file(path)),
        "yaml" | "yml" => base.merge(Yaml::file(path)),
        "json" => base.merge(Json::file(path)),
        _ => {
            return Err(config_error!(
                "Unsupported config file format: {}",
                extension
            ))
        },
    };

    debug!("Config: {}", path.display());
    figment.extract().map_err(|e| {
        ChannelError::config(format!("Failed to load configuration from file: {}", e))
    })
}

/// Get configuration value with priority: ENV > Default
pub fn get_config_value<T>(env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(val) => {
                debug!("Using {} from environment: {}", env_var, env_str);
                return val;
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    default
}
