//! Worker lifecycle controller.
//!
//! A worker owns exactly one cache generation and moves through
//! `Uninstalled -> Installing -> Installed -> Activating -> Active`. It only
//! intercepts requests once `Active`; until then every request takes the
//! default network path. A worker whose install fails, or that has been
//! replaced, becomes `Redundant`.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{
  pass_through, CacheStorage, GenerationId, GenerationManager, InterceptionPolicy, Manifest,
  ReclaimOutcome, Served,
};
use crate::error::{NetworkError, WorkerError};
use crate::net::{Network, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  Uninstalled,
  Installing,
  /// Installed and waiting to activate
  Installed,
  Activating,
  Active,
  Redundant,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LifecycleState::Uninstalled => "uninstalled",
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Active => "active",
      LifecycleState::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Deployment inputs for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub generation: GenerationId,
  pub manifest: Manifest,
  /// Activate as soon as install succeeds instead of waiting for the
  /// previous worker's clients to go away
  pub skip_waiting: bool,
  /// Take control of clients no worker controls yet on activation
  pub claim_clients: bool,
}

/// Puts the state back if a lifecycle step is dropped before it finishes.
struct Rollback<'a> {
  state: &'a watch::Sender<LifecycleState>,
  to: LifecycleState,
  armed: bool,
}

impl Rollback<'_> {
  fn disarm(mut self) {
    self.armed = false;
  }
}

impl Drop for Rollback<'_> {
  fn drop(&mut self) {
    if self.armed {
      self.state.send_replace(self.to);
    }
  }
}

pub struct Worker<S: CacheStorage, N: Network> {
  config: WorkerConfig,
  generations: GenerationManager<S, N>,
  policy: InterceptionPolicy<S, N>,
  network: Arc<N>,
  state: watch::Sender<LifecycleState>,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    let generations = GenerationManager::new(Arc::clone(&storage), Arc::clone(&network));
    let policy = InterceptionPolicy::new(storage, Arc::clone(&network), config.generation.clone());
    let (state, _) = watch::channel(LifecycleState::Uninstalled);

    Self {
      config,
      generations,
      policy,
      network,
      state,
    }
  }

  pub fn generation(&self) -> &GenerationId {
    &self.config.generation
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.borrow()
  }

  /// Watch lifecycle transitions.
  #[cfg(test)]
  pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
    self.state.subscribe()
  }

  /// Atomically move from `expected` to `next`.
  fn begin(
    &self,
    expected: LifecycleState,
    next: LifecycleState,
    action: &'static str,
  ) -> Result<(), WorkerError> {
    let mut found = expected;
    let moved = self.state.send_if_modified(|state| {
      if *state == expected {
        *state = next;
        true
      } else {
        found = *state;
        false
      }
    });

    if moved {
      Ok(())
    } else {
      Err(WorkerError::InvalidTransition {
        state: found,
        action,
      })
    }
  }

  fn set(&self, next: LifecycleState) {
    self.state.send_replace(next);
  }

  /// Handle the install event: populate this worker's generation.
  ///
  /// On failure the worker becomes redundant and never activates.
  pub async fn install(&self) -> Result<(), WorkerError> {
    self.begin(LifecycleState::Uninstalled, LifecycleState::Installing, "install")?;
    let rollback = Rollback {
      state: &self.state,
      to: LifecycleState::Redundant,
      armed: true,
    };

    info!(
      generation = %self.config.generation,
      entries = self.config.manifest.len(),
      "Installing"
    );

    let result = self
      .generations
      .populate(&self.config.generation, &self.config.manifest)
      .await;
    rollback.disarm();

    match result {
      Ok(()) => {
        self.set(LifecycleState::Installed);
        info!(generation = %self.config.generation, "Installed");
        Ok(())
      }
      Err(err) => {
        self.set(LifecycleState::Redundant);
        warn!(generation = %self.config.generation, error = %err, "Install failed");
        Err(err)
      }
    }
  }

  /// Adopt a generation that an earlier run already populated completely.
  ///
  /// Returns false, leaving the worker uninstalled, when the stored
  /// generation is missing or incomplete.
  pub fn restore(&self) -> Result<bool, WorkerError> {
    if !self
      .generations
      .is_populated(&self.config.generation, &self.config.manifest)?
    {
      return Ok(false);
    }

    self.begin(LifecycleState::Uninstalled, LifecycleState::Installed, "restore")?;
    info!(generation = %self.config.generation, "Restored installed generation");
    Ok(true)
  }

  /// Handle the activate event: delete every other generation, then start
  /// intercepting.
  pub async fn activate(&self) -> Result<ReclaimOutcome, WorkerError> {
    self.begin(LifecycleState::Installed, LifecycleState::Activating, "activate")?;
    let rollback = Rollback {
      state: &self.state,
      to: LifecycleState::Installed,
      armed: true,
    };

    let result = self.generations.reclaim(&self.config.generation).await;
    rollback.disarm();

    match result {
      Ok(outcome) => {
        self.set(LifecycleState::Active);
        info!(
          generation = %self.config.generation,
          deleted = outcome.deleted.len(),
          failed = outcome.failures.len(),
          "Activated"
        );
        Ok(outcome)
      }
      Err(err) => {
        self.set(LifecycleState::Installed);
        warn!(generation = %self.config.generation, error = %err, "Activation failed");
        Err(err)
      }
    }
  }

  /// Handle a fetch event.
  pub async fn handle(&self, request: &Request) -> Result<Served, NetworkError> {
    if self.state() != LifecycleState::Active {
      return pass_through(self.network.as_ref(), request).await;
    }
    self.policy.handle(request).await
  }

  /// Mark this worker as replaced. It stops intercepting immediately.
  pub fn retire(&self) {
    self.set(LifecycleState::Redundant);
  }

  /// Wait for outstanding cache writes.
  pub async fn settle(&self) {
    debug!(
      generation = %self.config.generation,
      pending = self.policy.pending_writes(),
      "Waiting for cache writes"
    );
    self.policy.settle().await;
  }
}
