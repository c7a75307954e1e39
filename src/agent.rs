//! Per-origin registration: which worker is active, which one is waiting,
//! and which clients each controls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cache::{pass_through, CacheStorage, GenerationId, ReclaimOutcome, Served};
use crate::error::{NetworkError, WorkerError};
use crate::net::{Network, Request};
use crate::worker::{Worker, WorkerConfig};

/// A page (or other consumer) issuing requests through the agent.
pub type ClientId = u64;

/// What a deploy or promotion did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
  /// The new generation is active and stale ones were reclaimed
  Activated {
    generation: GenerationId,
    reclaimed: ReclaimOutcome,
  },
  /// Installed, but waiting for the previous worker's clients to go away
  Waiting { generation: GenerationId },
  /// The generation is already active
  Unchanged { generation: GenerationId },
}

pub struct Agent<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Serializes deploys and promotions
  lifecycle: Mutex<()>,
  active: RwLock<Option<Arc<Worker<S, N>>>>,
  waiting: Mutex<Option<Arc<Worker<S, N>>>>,
  /// Controlling generation per client, `None` if uncontrolled
  clients: Mutex<HashMap<ClientId, Option<GenerationId>>>,
  next_client: AtomicU64,
}

impl<S: CacheStorage, N: Network> Agent<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      lifecycle: Mutex::new(()),
      active: RwLock::new(None),
      waiting: Mutex::new(None),
      clients: Mutex::new(HashMap::new()),
      next_client: AtomicU64::new(1),
    }
  }

  pub async fn active_generation(&self) -> Option<GenerationId> {
    self
      .active
      .read()
      .await
      .as_ref()
      .map(|w| w.generation().clone())
  }

  pub async fn waiting_generation(&self) -> Option<GenerationId> {
    self
      .waiting
      .lock()
      .await
      .as_ref()
      .map(|w| w.generation().clone())
  }

  /// Install a new generation and activate it when allowed.
  ///
  /// If install fails the error is returned and whatever was active keeps
  /// serving.
  pub async fn deploy(&self, config: WorkerConfig) -> Result<DeployOutcome, WorkerError> {
    let _guard = self.lifecycle.lock().await;

    if self.active_generation().await.as_ref() == Some(&config.generation) {
      return Ok(DeployOutcome::Unchanged {
        generation: config.generation,
      });
    }
    if self.waiting_generation().await.as_ref() == Some(&config.generation) {
      return Ok(DeployOutcome::Waiting {
        generation: config.generation,
      });
    }

    let worker = Arc::new(Worker::new(
      config,
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));

    if let Err(err) = worker.install().await {
      if let Some(active) = self.active_generation().await {
        warn!(generation = %active, "Keeping previous generation after failed install");
      }
      return Err(err);
    }

    let has_active = self.active.read().await.is_some();
    if !has_active || worker.config().skip_waiting || self.controlled_clients().await == 0 {
      let generation = worker.generation().clone();
      let reclaimed = self.promote(worker).await?;
      return Ok(DeployOutcome::Activated {
        generation,
        reclaimed,
      });
    }

    let generation = worker.generation().clone();
    info!(generation = %generation, "Waiting for clients of the previous generation to close");
    if let Some(superseded) = self.waiting.lock().await.replace(worker) {
      superseded.retire();
    }
    Ok(DeployOutcome::Waiting { generation })
  }

  /// Adopt a generation that is already fully populated in storage.
  ///
  /// Only applies to an agent with nothing active yet. Returns `None` when
  /// there is nothing to resume, so the caller can fall back to `deploy`.
  pub async fn resume(&self, config: WorkerConfig) -> Result<Option<DeployOutcome>, WorkerError> {
    let _guard = self.lifecycle.lock().await;

    if self.active.read().await.is_some() {
      return Ok(None);
    }

    let worker = Arc::new(Worker::new(
      config,
      Arc::clone(&self.storage),
      Arc::clone(&self.network),
    ));
    if !worker.restore()? {
      return Ok(None);
    }

    let generation = worker.generation().clone();
    let reclaimed = self.promote(worker).await?;
    Ok(Some(DeployOutcome::Activated {
      generation,
      reclaimed,
    }))
  }

  /// Activate `worker` and make it the one serving. Caller holds `lifecycle`.
  async fn promote(&self, worker: Arc<Worker<S, N>>) -> Result<ReclaimOutcome, WorkerError> {
    let reclaimed = worker.activate().await?;
    let generation = worker.generation().clone();
    let claim = worker.config().claim_clients;

    // A worker still waiting lost its store to this activation's reclaim
    let superseded = {
      let mut waiting = self.waiting.lock().await;
      match waiting.as_ref() {
        Some(parked) if !Arc::ptr_eq(parked, &worker) => waiting.take(),
        _ => None,
      }
    };
    if let Some(superseded) = superseded {
      superseded.retire();
      info!(generation = %superseded.generation(), "Discarded waiting generation");
    }

    let previous = self.active.write().await.replace(worker);

    {
      let mut clients = self.clients.lock().await;
      for controller in clients.values_mut() {
        if controller.is_some() || claim {
          *controller = Some(generation.clone());
        }
      }
    }

    if let Some(previous) = previous {
      previous.retire();
      previous.settle().await;
      info!(
        from = %previous.generation(),
        to = %generation,
        "Replaced active generation"
      );
    }

    Ok(reclaimed)
  }

  async fn controlled_clients(&self) -> usize {
    self
      .clients
      .lock()
      .await
      .values()
      .filter(|c| c.is_some())
      .count()
  }

  /// Register a client. It is controlled by the active worker, if any.
  pub async fn connect(&self) -> ClientId {
    let id = self.next_client.fetch_add(1, Ordering::SeqCst);
    let controller = self.active_generation().await;
    self.clients.lock().await.insert(id, controller);
    id
  }

  /// Forget a client. When the last controlled client leaves, a waiting
  /// worker is promoted.
  pub async fn disconnect(&self, id: ClientId) -> Result<Option<DeployOutcome>, WorkerError> {
    let _guard = self.lifecycle.lock().await;
    self.clients.lock().await.remove(&id);

    if self.controlled_clients().await > 0 {
      return Ok(None);
    }
    let Some(worker) = self.waiting.lock().await.take() else {
      return Ok(None);
    };

    let generation = worker.generation().clone();
    match self.promote(Arc::clone(&worker)).await {
      Ok(reclaimed) => Ok(Some(DeployOutcome::Activated {
        generation,
        reclaimed,
      })),
      Err(err) => {
        *self.waiting.lock().await = Some(worker);
        Err(err)
      }
    }
  }

  /// Route a request from `client` to the worker controlling it.
  ///
  /// Uncontrolled and unknown clients use the default network path.
  pub async fn fetch(&self, client: ClientId, request: &Request) -> Result<Served, NetworkError> {
    let controller = self.clients.lock().await.get(&client).cloned().flatten();
    let active = self.active.read().await.clone();

    match (controller, active) {
      (Some(generation), Some(worker)) if worker.generation() == &generation => {
        worker.handle(request).await
      }
      _ => pass_through(self.network.as_ref(), request).await,
    }
  }

  /// Wait for the active worker's outstanding cache writes.
  pub async fn settle(&self) {
    let active = self.active.read().await.clone();
    if let Some(worker) = active {
      worker.settle().await;
    }
  }
}
