//! Request interception: cache-first, network fallback, opportunistic
//! population of the current generation.

use chrono::{DateTime, Utc};
use reqwest::Method;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::generation::GenerationId;
use super::storage::{CacheStorage, CachedRecord};
use crate::error::NetworkError;
use crate::net::{Network, Request, Response, ResponseKind};

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
  /// Current generation's store, no network activity
  Cache,
  /// Network, and the response was written back to the store
  Network,
  /// Network, but the response was not eligible for storage
  NetworkUncached,
  /// Not intercepted; the default network path handled it
  PassThrough,
}

impl ServeSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      ServeSource::Cache => "cache",
      ServeSource::Network => "network",
      ServeSource::NetworkUncached => "network-uncached",
      ServeSource::PassThrough => "pass-through",
    }
  }
}

impl fmt::Display for ServeSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A response together with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServeSource,
  /// When the record was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_cache(record: CachedRecord) -> Self {
    Self {
      response: record.response,
      source: ServeSource::Cache,
      cached_at: Some(record.cached_at),
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::Network,
      cached_at: None,
    }
  }

  pub fn uncached(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::NetworkUncached,
      cached_at: None,
    }
  }

  pub fn pass_through(response: Response) -> Self {
    Self {
      response,
      source: ServeSource::PassThrough,
      cached_at: None,
    }
  }
}

/// Why a network response was not written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
  Status(u16),
  Kind(ResponseKind),
}

impl fmt::Display for Ineligible {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Ineligible::Status(status) => write!(f, "status {} is not 200", status),
      Ineligible::Kind(kind) => write!(f, "{} responses are not stored", kind),
    }
  }
}

/// Only complete, visible responses are stored: status exactly 200 and a
/// `basic` or `cors` response type. An opaque response could be a failure in
/// disguise.
pub fn cacheability(response: &Response) -> Result<(), Ineligible> {
  if response.kind == ResponseKind::Opaque {
    return Err(Ineligible::Kind(response.kind));
  }
  if response.status != 200 {
    return Err(Ineligible::Status(response.status));
  }
  Ok(())
}

/// Whether a request is subject to caching at all.
pub fn intercepts(request: &Request) -> bool {
  request.method == Method::GET && request.is_http()
}

/// The default network path for requests the policy does not intercept.
pub async fn pass_through<N: Network + ?Sized>(
  network: &N,
  request: &Request,
) -> Result<Served, NetworkError> {
  network.fetch(request).await.map(Served::pass_through)
}

/// Background store writes that outlive the request that scheduled them.
///
/// Writes run on the blocking pool and are reaped lazily. `settle` waits for
/// everything scheduled so far.
#[derive(Clone, Default)]
pub struct WriteTracker {
  tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WriteTracker {
  pub fn spawn<F>(&self, write: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
    while let Some(done) = tasks.try_join_next() {
      if let Err(e) = done {
        warn!(error = %e, "Cache write task failed");
      }
    }
    tasks.spawn_blocking(write);
  }

  /// Wait for every write scheduled before this call.
  pub async fn settle(&self) {
    let mut pending = {
      let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
      std::mem::take(&mut *tasks)
    };

    while let Some(done) = pending.join_next().await {
      if let Err(e) = done {
        warn!(error = %e, "Cache write task failed");
      }
    }
  }

  pub fn pending(&self) -> usize {
    self
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }
}

/// Cache-first request handling against one generation.
pub struct InterceptionPolicy<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  generation: GenerationId,
  writes: WriteTracker,
}

impl<S: CacheStorage, N: Network> InterceptionPolicy<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, generation: GenerationId) -> Self {
    Self {
      storage,
      network,
      generation,
      writes: WriteTracker::default(),
    }
  }

  pub fn generation(&self) -> &GenerationId {
    &self.generation
  }

  /// Serve `request`.
  ///
  /// 1. Non-GET or non-http(s) requests go straight to the network, unobserved
  /// 2. Cache hit: return the stored response, no network activity
  /// 3. Miss: fetch from network
  /// 4. Store a copy if the response is cacheable, without waiting for the write
  ///
  /// Network failures are returned as-is; no fallback response is made up.
  pub async fn handle(&self, request: &Request) -> Result<Served, NetworkError> {
    if !intercepts(request) {
      return pass_through(self.network.as_ref(), request).await;
    }

    let locator = request.locator();

    match self.storage.get(self.generation.as_str(), &locator) {
      Ok(Some(record)) => {
        debug!(locator = %locator, generation = %self.generation, "Serving from cache");
        return Ok(Served::from_cache(record));
      }
      Ok(None) => {}
      Err(e) => {
        warn!(locator = %locator, error = %e, "Cache lookup failed, treating as miss");
      }
    }

    let response = match self.network.fetch(request).await {
      Ok(response) => response,
      Err(err) => {
        warn!(locator = %locator, error = %err, "Network request failed");
        return Err(err);
      }
    };

    match cacheability(&response) {
      Ok(()) => {
        self.store(locator, response.clone());
        Ok(Served::from_network(response))
      }
      Err(reason) => {
        debug!(locator = %locator, reason = %reason, "Not caching response");
        Ok(Served::uncached(response))
      }
    }
  }

  fn store(&self, locator: String, response: Response) {
    let storage = Arc::clone(&self.storage);
    let generation = self.generation.clone();

    self.writes.spawn(move || {
      match storage.put(generation.as_str(), &locator, &response) {
        Ok(()) => debug!(locator = %locator, generation = %generation, "Cached response"),
        Err(e) => warn!(locator = %locator, error = %e, "Failed to cache response"),
      }
    });
  }

  /// Wait for outstanding store writes.
  pub async fn settle(&self) {
    self.writes.settle().await;
  }

  pub fn pending_writes(&self) -> usize {
    self.writes.pending()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::fake::FakeNetwork;
  use crate::net::RequestMode;
  use url::Url;

  const GENERATION: &str = "app-cache-v1";

  fn setup() -> (
    Arc<MemoryStorage>,
    Arc<FakeNetwork>,
    InterceptionPolicy<MemoryStorage, FakeNetwork>,
  ) {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(FakeNetwork::new());
    let generation = GenerationId::new("app", 1);
    storage.open_store(generation.as_str()).unwrap();
    let policy = InterceptionPolicy::new(Arc::clone(&storage), Arc::clone(&network), generation);
    (storage, network, policy)
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn ok(body: &str) -> Response {
    Response::new(200, ResponseKind::Basic, body)
  }

  #[test]
  fn test_cacheability() {
    assert_eq!(cacheability(&ok("a")), Ok(()));
    assert_eq!(
      cacheability(&Response::new(200, ResponseKind::Cors, "a")),
      Ok(())
    );
    assert_eq!(
      cacheability(&Response::new(206, ResponseKind::Basic, "a")),
      Err(Ineligible::Status(206))
    );
    assert_eq!(
      cacheability(&Response::opaque("a")),
      Err(Ineligible::Kind(ResponseKind::Opaque))
    );
  }

  #[test]
  fn test_intercepts_only_http_get() {
    assert!(intercepts(&get("https://app.example.com/")));
    assert!(intercepts(&get("http://app.example.com/")));
    assert!(!intercepts(&get("data:text/plain,hi")));

    let post = Request::new(
      Method::POST,
      Url::parse("https://app.example.com/api/submit").unwrap(),
      RequestMode::Cors,
    );
    assert!(!intercepts(&post));
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let (storage, network, policy) = setup();
    storage
      .put(GENERATION, "https://app.example.com/app.js", &ok("cached"))
      .unwrap();

    let served = policy
      .handle(&get("https://app.example.com/app.js"))
      .await
      .unwrap();

    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(served.response.body, b"cached".to_vec());
    assert!(served.cached_at.is_some());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_stale_entry_is_still_served() {
    let (storage, network, policy) = setup();
    storage
      .put(GENERATION, "https://app.example.com/app.js", &ok("old"))
      .unwrap();
    network.route("https://app.example.com/app.js", ok("new"));

    let served = policy
      .handle(&get("https://app.example.com/app.js"))
      .await
      .unwrap();

    assert_eq!(served.response.body, b"old".to_vec());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_second_request_served_from_cache() {
    let (storage, network, policy) = setup();
    network.route("https://app.example.com/data.json", ok("{\"a\":1}"));
    let request = get("https://app.example.com/data.json");

    let first = policy.handle(&request).await.unwrap();
    assert_eq!(first.source, ServeSource::Network);
    assert_eq!(network.calls(), 1);

    policy.settle().await;
    assert_eq!(policy.pending_writes(), 0);
    assert!(storage
      .get(GENERATION, "https://app.example.com/data.json")
      .unwrap()
      .is_some());

    let second = policy.handle(&request).await.unwrap();
    assert_eq!(second.source, ServeSource::Cache);
    assert_eq!(network.calls(), 1);
    assert_eq!(first.response.body, second.response.body);
  }

  #[tokio::test]
  async fn test_fragment_shares_record() {
    let (_storage, network, policy) = setup();
    network.route("https://app.example.com/guide", ok("guide"));

    policy
      .handle(&get("https://app.example.com/guide#install"))
      .await
      .unwrap();
    policy.settle().await;

    let served = policy
      .handle(&get("https://app.example.com/guide#usage"))
      .await
      .unwrap();
    assert_eq!(served.source, ServeSource::Cache);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_non_200_is_returned_but_not_stored() {
    let (storage, network, policy) = setup();
    network.route(
      "https://app.example.com/missing",
      Response::new(404, ResponseKind::Basic, "nope"),
    );

    let served = policy
      .handle(&get("https://app.example.com/missing"))
      .await
      .unwrap();
    policy.settle().await;

    assert_eq!(served.source, ServeSource::NetworkUncached);
    assert_eq!(served.response.status, 404);
    assert_eq!(storage.writes(), 0);
    assert!(storage
      .get(GENERATION, "https://app.example.com/missing")
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_opaque_is_returned_but_not_stored() {
    let (storage, network, policy) = setup();
    network.route("https://cdn.example.net/pixel.gif", Response::opaque("gif"));

    let served = policy
      .handle(&get("https://cdn.example.net/pixel.gif"))
      .await
      .unwrap();
    policy.settle().await;

    assert_eq!(served.source, ServeSource::NetworkUncached);
    assert_eq!(served.response.body, b"gif".to_vec());
    assert_eq!(storage.writes(), 0);
  }

  #[tokio::test]
  async fn test_cors_response_is_stored() {
    let (storage, network, policy) = setup();
    network.route(
      "https://cdn.example.net/lib.js",
      Response::new(200, ResponseKind::Cors, "lib"),
    );

    let served = policy
      .handle(&get("https://cdn.example.net/lib.js"))
      .await
      .unwrap();
    policy.settle().await;

    assert_eq!(served.source, ServeSource::Network);
    assert_eq!(storage.writes(), 1);
  }

  #[tokio::test]
  async fn test_post_is_not_intercepted() {
    let (storage, network, policy) = setup();
    network.route("https://app.example.com/api/submit", ok("accepted"));

    let request = Request::new(
      Method::POST,
      Url::parse("https://app.example.com/api/submit").unwrap(),
      RequestMode::Cors,
    );
    let served = policy.handle(&request).await.unwrap();
    policy.settle().await;

    assert_eq!(served.source, ServeSource::PassThrough);
    assert_eq!(storage.reads(), 0);
    assert_eq!(storage.writes(), 0);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_network_failure_is_surfaced() {
    let (storage, _network, policy) = setup();

    let result = policy.handle(&get("https://app.example.com/offline")).await;
    policy.settle().await;

    assert!(matches!(result, Err(NetworkError::Request { .. })));
    assert_eq!(storage.writes(), 0);
  }

  #[tokio::test]
  async fn test_write_completes_after_caller_is_gone() {
    let (storage, network, policy) = setup();
    network.route("https://app.example.com/big.bin", ok("payload"));

    {
      let served = policy
        .handle(&get("https://app.example.com/big.bin"))
        .await
        .unwrap();
      drop(served);
    }

    policy.settle().await;
    let record = storage
      .get(GENERATION, "https://app.example.com/big.bin")
      .unwrap()
      .unwrap();
    assert_eq!(record.response.body, b"payload".to_vec());
  }
}
