mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{BrokerSettings, ChannelSettings, LogSettings, ServerSettings, Settings};

/// Prefix for environment overrides, e.g. `CHATRELAY__SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "CHATRELAY";

/// Loads `config/default.toml` (if present) and environment overrides,
/// then merges them over the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] but reads the file source from `file`
/// (extension optional, as with `config::File::with_name`).
pub fn load_config_from(file: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
