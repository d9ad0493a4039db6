//! Source configuration loaded from `config/sources.json`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use store::{Metric, Table};
use tokio::fs;

#[derive(Debug, Deserialize)]
pub struct SourcesConfig {
    pub version: String,
    pub sources: Vec<Source>,
}

/// What a source feeds: one regional metric table, or the species dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dataset {
    Regional { metric: Metric },
    Species,
}

impl Dataset {
    pub fn table(self) -> Table {
        match self {
            Dataset::Regional { metric } => metric.table(),
            Dataset::Species => Table::Specie,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub provider: String,
    pub url: String,
    /// Field separator. Sources disagree (comma vs semicolon).
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    pub dataset: Dataset,
    /// Source header -> canonical column name.
    #[serde(default)]
    pub renames: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_delimiter() -> char {
    ','
}

fn default_true() -> bool {
    true
}

impl Source {
    /// The delimiter as the single byte the csv reader wants.
    pub fn delimiter_byte(&self) -> Result<u8> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            anyhow::bail!(
                "source '{}': delimiter {:?} is not a single ASCII character",
                self.id,
                self.delimiter
            )
        }
    }
}

pub fn parse_sources_config(content: &str) -> Result<SourcesConfig> {
    let config: SourcesConfig =
        serde_json::from_str(content).context("Failed to parse sources config")?;

    for source in &config.sources {
        source.delimiter_byte()?;
    }
    Ok(config)
}

pub async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read sources config {}", path))?;
    parse_sources_config(&content)
}
