use crate::models::DialectId;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    pub port: u16,

    /// Data directory holding lookup.csv, dialects.json, maps/ and
    /// controllers/
    #[clap(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Cache directory for fetched extractor sources
    #[clap(long, default_value = "cache")]
    pub cache_dir: PathBuf,

    /// Skip the extractor source cache and always fetch
    #[clap(long)]
    pub no_cache: bool,

    /// Retry a failed HTTPS source fetch over plain HTTP
    #[clap(long)]
    pub allow_insecure: bool,
}

impl Args {
    pub fn lookup_path(&self) -> PathBuf {
        self.data_dir.join("lookup.csv")
    }

    pub fn dialects_path(&self) -> PathBuf {
        self.data_dir.join("dialects.json")
    }

    pub fn maps_dir(&self) -> PathBuf {
        self.data_dir.join("maps")
    }

    pub fn controllers_dir(&self) -> PathBuf {
        self.data_dir.join("controllers")
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid dialect manifest: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One entry of `dialects.json`: where a dialect's extraction source lives
/// and the expression that yields its `string id → numeric id` map.
#[derive(Debug, Clone, Deserialize)]
pub struct DialectSource {
    pub dialect: DialectId,
    pub url: String,
    #[serde(rename = "fallbackUrl", default)]
    pub fallback_url: Option<String>,
    pub extractor: String,
}

pub fn load_dialect_sources(path: &Path) -> Result<Vec<DialectSource>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
