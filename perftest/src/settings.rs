use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use rwire_net::{ChannelConfig, StreamHandle};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub address: String,
    pub message_count: usize,
    pub batch_size: usize,
    pub min_payload: usize,
    pub max_payload: usize,
    pub stream_count: StreamHandle,
    pub channel: ChannelConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_owned(),
            message_count: 100_000,
            batch_size: 20,
            min_payload: 16,
            max_payload: 200,
            stream_count: 50,
            channel: ChannelConfig::default(),
        }
    }
}

/// Merges Settings.toml, Settings.<environment>.toml and RWIRE_* environment variables
pub fn load(environment: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = Config::builder()
        .add_source(File::with_name("Settings").required(false))
        .add_source(File::with_name(&format!("Settings.{environment}")).required(false))
        .add_source(Environment::with_prefix("RWIRE"))
        .build()?
        .try_deserialize()?;

    if settings.min_payload > settings.max_payload {
        return Err(ConfigError::Message(format!(
            "min_payload {} is larger than max_payload {}",
            settings.min_payload, settings.max_payload
        )));
    }
    if settings.batch_size == 0 || settings.stream_count <= 0 {
        return Err(ConfigError::Message(
            "batch_size and stream_count must be at least 1".to_owned(),
        ));
    }
    if settings.batch_size > settings.channel.max_output_buffers {
        return Err(ConfigError::Message(format!(
            "batch_size {} exceeds channel.max-output-buffers {}",
            settings.batch_size, settings.channel.max_output_buffers
        )));
    }
    settings
        .channel
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;
    Ok(settings)
}
