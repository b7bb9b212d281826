use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::record::RecordId;
use crate::sync::builder::PrimaryRule;
use crate::sync::engine::ColumnMap;

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub tracker: Option<TrackerConfig>,
    pub board: Option<BoardConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

#[derive(Debug, Deserialize)]
pub struct TrackerConfig {
    pub url: String,
    pub token: String,
    pub projects: Vec<String>,
    /// Only records carrying one of these labels are tracked; empty means all.
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BoardConfig {
    pub url: String,
    pub token: String,
    pub project_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub columns: ColumnMap,
    pub manual_tag_prefix: String,
    pub max_depth: usize,
    pub close_done: bool,
    pub primary_rule: PrimaryRule,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            columns: ColumnMap::default(),
            manual_tag_prefix: "manual-".into(),
            max_depth: 5,
            close_done: false,
            primary_rule: PrimaryRule::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ReviewConfig {
    /// Corrective latency offsets in days, keyed by canonical record
    /// reference. Additive, may be negative.
    pub offsets: HashMap<RecordId, i64>,
}

fn config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".workboard")
        .join("config.toml")
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".workboard")
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: AppConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config.toml")?;
    Ok(config)
}
