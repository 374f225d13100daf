use std::path::{Path, PathBuf};

use anyhow::Context;
use islands_stream::StreamConfig;
use serde::{Deserialize, Serialize};

/// Settings read from the optional YAML config file. Command-line flags win over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding the world stores.
    pub root: PathBuf,
    #[serde(flatten)]
    pub stream: StreamConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("worlds"),
            stream: StreamConfig::default(),
        }
    }
}

impl CliConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}
