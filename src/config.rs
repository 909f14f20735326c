use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL relative ids are resolved against
  pub endpoint: Option<String>,
  /// Active locale for language-tagged literals
  #[serde(default = "default_locale")]
  pub locale: String,
  /// Container type override (compact or expanded); defaults apply when empty
  #[serde(default)]
  pub container_types: Vec<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  pub federated: Option<FederatedConfig>,
  /// Directory for rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Seconds before a cached resource is re-fetched; never when unset
  pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederatedConfig {
  /// Federated catalogue API root
  pub endpoint: String,
  /// Id of the container the catalogue is materialized into
  pub collection_id: String,
  /// Use the delta-sync snapshot; every sync is a full fetch when false
  #[serde(default = "default_true")]
  pub enable_cache: bool,
  /// Snapshot lifetime in seconds
  #[serde(default = "default_ttl")]
  pub cache_ttl_secs: u64,
  /// SQLite file for snapshots (default: $XDG_DATA_HOME/ldstore/snapshots.db)
  pub snapshot_path: Option<PathBuf>,
}

fn default_locale() -> String {
  crate::handle::DEFAULT_LOCALE.to_string()
}

fn default_true() -> bool {
  true
}

fn default_ttl() -> u64 {
  3600
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ldstore.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ldstore/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ldstore/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ldstore.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ldstore").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if let Some(federated) = &config.federated {
      if federated.endpoint.trim().is_empty() {
        return Err(eyre!("federated.endpoint must not be empty"));
      }
      if federated.collection_id.trim().is_empty() {
        return Err(eyre!("federated.collection_id must not be empty"));
      }
    }
    Ok(config)
  }

  /// Get the LDP server token from the environment, if any.
  ///
  /// Checks LDSTORE_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LDSTORE_TOKEN").ok()
  }

  /// Get the federated catalogue token from environment variables.
  ///
  /// Checks LDSTORE_FC_TOKEN first, then FC_API_TOKEN as fallback.
  pub fn get_catalog_token() -> Result<String> {
    std::env::var("LDSTORE_FC_TOKEN")
      .or_else(|_| std::env::var("FC_API_TOKEN"))
      .map_err(|_| {
        eyre!("Catalogue token not found. Set LDSTORE_FC_TOKEN or FC_API_TOKEN environment variable.")
      })
  }

  /// Default location of the snapshot database.
  pub fn default_snapshot_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ldstore").join("snapshots.db"))
  }
}
