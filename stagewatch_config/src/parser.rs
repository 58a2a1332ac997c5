use crate::config::{ConfigError, StagewatchConfig};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

pub async fn parse_config_from_file(path: impl AsRef<Path>) -> Result<StagewatchConfig> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let extension = path.extension().and_then(|s| s.to_str()).unwrap_or_default();
    let config = parse_config_from_str(&contents, extension)
        .with_context(|| format!("Failed to load config file {}", path.display()))?;

    info!(
        path = %path.display(),
        stages = config.pipeline.stages.len(),
        slos = config.slos.len(),
        "Loaded configuration"
    );
    Ok(config)
}

pub fn parse_config_from_str(content: &str, format: &str) -> Result<StagewatchConfig> {
    let config = match format.to_lowercase().as_str() {
        "yaml" | "yml" => parse_yaml(content)?,
        "toml" => toml::from_str(content)?,
        "json" => serde_json::from_str(content)?,
        other => {
            return Err(ConfigError::UnsupportedFormat(format!(
                "'{}'; use .yaml, .yml, .toml, or .json",
                other
            ))
            .into())
        }
    };

    config.validate()?;
    Ok(config)
}

fn parse_yaml(content: &str) -> Result<StagewatchConfig> {
    // serde_yaml rejects an empty document; treat it as all defaults.
    if content.trim().is_empty() {
        return Ok(StagewatchConfig::default());
    }
    Ok(serde_yaml::from_str(content)?)
}
