//! Error types for the cache agent

use thiserror::Error;

use crate::worker::LifecycleState;

/// A request could not be resolved by the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
  /// Connection, DNS, TLS or body read failure
  #[error("Request to {url} failed: {reason}")]
  Request { url: String, reason: String },
  /// Cross-origin `cors` request the server did not allow
  #[error("Cross-origin request to {url} blocked by CORS policy")]
  CorsRejected { url: String },
  /// `same-origin` request that targeted another origin
  #[error("Same-origin request to {url} targets another origin")]
  CrossOrigin { url: String },
}

/// A manifest entry could not be fetched during install.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Manifest entry {locator} could not be cached: {reason}")]
pub struct ManifestFetchError {
  pub locator: String,
  pub reason: String,
}

/// A stale generation could not be deleted during activation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to delete cache generation {generation}: {reason}")]
pub struct ReclaimPartialError {
  pub generation: String,
  pub reason: String,
}

/// Failure of a lifecycle step (install, activate, restore).
#[derive(Debug, Error)]
pub enum WorkerError {
  #[error("Install failed: {0}")]
  ManifestFetch(#[from] ManifestFetchError),
  #[error("Storage error: {0}")]
  Storage(color_eyre::Report),
  #[error("Cannot {action} a worker that is {state}")]
  InvalidTransition {
    state: LifecycleState,
    action: &'static str,
  },
}

// `Report` is not a `std::error::Error`, so no `#[from]`
impl From<color_eyre::Report> for WorkerError {
  fn from(err: color_eyre::Report) -> Self {
    WorkerError::Storage(err)
  }
}
