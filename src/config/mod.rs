mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, DeliveryMode, LoggingSettings, OverflowPolicy, PartialSettings,
    ServerSettings, Settings, StorageSettings,
};

/// Prefix for environment overrides, e.g. `RELAYMQ__BROKER__MAX_MESSAGES=10`.
pub const ENV_PREFIX: &str = "RELAYMQ";

/// Loads the configuration from `config/default` (if present) and environment variables.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(None)
}

/// Loads the configuration from an explicit file, falling back to
/// `config/default` when `path` is `None`, then applies environment
/// overrides and merges the result with default values.
pub fn load_config_from(path: Option<&str>) -> Result<Settings, ConfigError> {
    let file = match path {
        Some(p) => File::with_name(p).required(true),
        None => File::with_name("config/default").required(false),
    };

    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge())
}
