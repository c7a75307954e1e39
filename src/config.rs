use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

use crate::cache::{GenerationId, Manifest, SqliteStorage};
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the cached application is served from, e.g. https://app.example.com
  pub origin: String,
  pub cache: CacheConfig,
  /// Resources every generation must hold before it serves (paths or URLs)
  #[serde(default)]
  pub manifest: Vec<String>,
  /// Activate new generations without waiting for existing clients to close
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  /// Take control of clients that connected before the first activation
  #[serde(default = "default_true")]
  pub claim_clients: bool,
  /// Database location (defaults to $XDG_DATA_HOME/precache/cache.db)
  pub storage_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Application name used as the generation prefix
  pub name: String,
  /// Bump whenever the manifest or the assets behind it change
  pub version: u32,
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./precache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/precache/config.yaml
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
        "No configuration file found. Create one at ~/.config/precache/config.yaml\n\
                 or pass --config."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("precache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("precache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// The configured origin, validated.
  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
      return Err(eyre!("Origin '{}' must be an http(s) URL", self.origin));
    }

    Ok(url)
  }

  /// Build the deployment inputs for a worker.
  pub fn worker_config(&self) -> Result<WorkerConfig> {
    let name = self.cache.name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
      return Err(eyre!(
        "cache.name must be a non-empty name without spaces, got '{}'",
        self.cache.name
      ));
    }

    let origin = self.origin_url()?;
    let manifest = Manifest::resolve(&origin, &self.manifest)?;
    if manifest.is_empty() {
      warn!("Manifest is empty; only responses fetched at runtime will be cached");
    }

    Ok(WorkerConfig {
      generation: GenerationId::new(name, self.cache.version),
      manifest,
      skip_waiting: self.skip_waiting,
      claim_clients: self.claim_clients,
    })
  }

  /// Where the cache database lives.
  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage_path {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const EXAMPLE: &str = r#"
origin: https://app.example.com
cache:
  name: app
  version: 2
manifest:
  - /
  - /index.html
  - /logo.png
"#;

  #[test]
  fn test_parse_with_defaults() {
    let config: Config = serde_yaml::from_str(EXAMPLE).unwrap();

    assert!(config.skip_waiting);
    assert!(config.claim_clients);
    assert!(config.storage_path.is_none());

    let worker = config.worker_config().unwrap();
    assert_eq!(worker.generation.as_str(), "app-cache-v2");
    assert_eq!(worker.manifest.len(), 3);
  }

  #[test]
  fn test_rejects_bad_origin() {
    let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();

    config.origin = "not a url".to_string();
    assert!(config.worker_config().is_err());

    config.origin = "file:///srv/app".to_string();
    assert!(config.origin_url().is_err());
  }

  #[test]
  fn test_rejects_bad_cache_name() {
    let mut config: Config = serde_yaml::from_str(EXAMPLE).unwrap();
    config.cache.name = "my app".to_string();
    assert!(config.worker_config().is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("precache.yaml");
    std::fs::write(&path, format!("{}skip_waiting: false\nstorage_path: /tmp/p.db\n", EXAMPLE)).unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert!(!config.skip_waiting);
    assert_eq!(config.storage_path().unwrap(), PathBuf::from("/tmp/p.db"));
  }

  #[test]
  fn test_load_missing_path() {
    let err = Config::load(Some(Path::new("/nonexistent/precache.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
