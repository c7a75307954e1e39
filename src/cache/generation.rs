//! Cache generations: naming, manifest pre-population and reclaiming stale
//! generations.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use crate::error::{ManifestFetchError, ReclaimPartialError, WorkerError};
use crate::net::{Network, Request};

/// Name of one cache generation, e.g. `app-cache-v3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(String);

impl GenerationId {
  pub fn new(app: &str, version: u32) -> Self {
    Self(format!("{}-cache-v{}", app, version))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for GenerationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Ordered list of resources every generation must hold before it may serve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
  entries: Vec<Url>,
}

impl Manifest {
  /// Resolve manifest entries (paths or absolute URLs) against `origin`.
  ///
  /// Entries must be http(s) and may not repeat once resolved.
  pub fn resolve(origin: &Url, entries: &[String]) -> Result<Self> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(entries.len());

    for entry in entries {
      let mut url = origin
        .join(entry)
        .map_err(|e| eyre!("Invalid manifest entry '{}': {}", entry, e))?;
      url.set_fragment(None);

      if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre!(
          "Manifest entry '{}' must be an http(s) resource",
          entry
        ));
      }
      if !seen.insert(url.to_string()) {
        return Err(eyre!("Manifest entry '{}' is listed twice", entry));
      }

      resolved.push(url);
    }

    Ok(Self { entries: resolved })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Url> {
    self.entries.iter()
  }
}

/// Result of deleting stale generations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
  /// Generations that were deleted
  pub deleted: BTreeSet<String>,
  /// Generations that could not be deleted and were left behind
  pub failures: Vec<ReclaimPartialError>,
}

/// Populates new generations and deletes superseded ones.
pub struct GenerationManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S: CacheStorage, N: Network> GenerationManager<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self { storage, network }
  }

  /// Fetch every manifest entry into `generation`.
  ///
  /// All-or-nothing: entries are fetched concurrently and written in one
  /// atomic batch only after every fetch returned a successful response.
  pub async fn populate(
    &self,
    generation: &GenerationId,
    manifest: &Manifest,
  ) -> Result<(), WorkerError> {
    self.storage.open_store(generation.as_str())?;

    let fetches = manifest.iter().map(|url| {
      let network = Arc::clone(&self.network);
      let request = Request::get(url.clone());
      async move {
        let locator = request.locator();
        match network.fetch(&request).await {
          Ok(response) if response.is_ok() => {
            debug!(locator = %locator, status = response.status, "Fetched manifest entry");
            Ok((locator, response))
          }
          Ok(response) => Err(ManifestFetchError {
            locator,
            reason: format!("unexpected status {} ({})", response.status, response.kind),
          }),
          Err(err) => Err(ManifestFetchError {
            locator,
            reason: err.to_string(),
          }),
        }
      }
    });

    let records = match try_join_all(fetches).await {
      Ok(records) => records,
      Err(err) => {
        warn!(generation = %generation, error = %err, "Manifest population failed");
        return Err(err.into());
      }
    };

    self.storage.put_all(generation.as_str(), &records)?;

    info!(
      generation = %generation,
      entries = records.len(),
      "Populated cache generation"
    );
    Ok(())
  }

  /// Delete every generation other than `current`.
  ///
  /// A failed deletion is logged and skipped; only failing to enumerate the
  /// stores is an error.
  pub async fn reclaim(&self, current: &GenerationId) -> Result<ReclaimOutcome, WorkerError> {
    let mut outcome = ReclaimOutcome::default();

    for name in self.storage.store_names()? {
      if name == current.as_str() {
        continue;
      }

      match self.storage.delete_store(&name) {
        Ok(_) => {
          info!(generation = %name, "Deleted stale cache generation");
          outcome.deleted.insert(name);
        }
        Err(e) => {
          let err = ReclaimPartialError {
            generation: name,
            reason: e.to_string(),
          };
          warn!(error = %err, "Skipping stale cache generation");
          outcome.failures.push(err);
        }
      }
    }

    Ok(outcome)
  }

  /// Whether `generation` already holds a record for every manifest entry.
  pub fn is_populated(&self, generation: &GenerationId, manifest: &Manifest) -> Result<bool> {
    if !self.storage.has_store(generation.as_str())? {
      return Ok(false);
    }

    let stored: HashSet<String> = self
      .storage
      .locators(generation.as_str())?
      .into_iter()
      .collect();

    Ok(manifest.iter().all(|url| stored.contains(url.as_str())))
  }
}
