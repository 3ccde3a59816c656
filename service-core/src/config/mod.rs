use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::Deserialize;
use serde::de::DeserializeOwned;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Load a service configuration from an optional `<file_stem>.{toml,yaml,json}`
/// file, overridden by `<ENV_PREFIX>__SECTION__KEY` environment variables.
///
/// `.env` is read first so local development can keep values out of the shell.
/// Keys named in `list_keys` are split on commas when they come from the
/// environment.
pub fn load_layered<T: DeserializeOwned>(
    file_stem: &str,
    env_prefix: &str,
    list_keys: &[&str],
) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let mut environment = Environment::with_prefix(env_prefix)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true);
    if !list_keys.is_empty() {
        environment = environment.list_separator(",");
        for key in list_keys {
            environment = environment.with_list_parse_key(key);
        }
    }

    let config = Cfg::builder()
        .add_source(File::with_name(file_stem).required(false))
        .add_source(environment)
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        server: ServerConfig,
    }

    #[test]
    fn defaults_apply_without_sources() {
        let loaded: Sample =
            load_layered("does-not-exist", "SERVICE_CORE_CONFIG_TEST", &[]).expect("load");
        assert_eq!(loaded.server.port, 8080);
        assert_eq!(loaded.server.host, "0.0.0.0");
    }
}
