//! In-memory network for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{Network, Request, Response};
use crate::error::NetworkError;

/// Serves canned responses by locator and records every call.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `response` for `url`. Unrouted URLs fail like an unreachable host.
  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  /// Make `url` unreachable again.
  pub fn unroute(&self, url: &str) {
    self.routes.lock().unwrap().remove(url);
  }

  pub fn calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let locator = request.locator();
    self.calls.lock().unwrap().push(locator.clone());

    // Yield so concurrent callers interleave the way real I/O would.
    tokio::task::yield_now().await;

    self
      .routes
      .lock()
      .unwrap()
      .get(&locator)
      .cloned()
      .ok_or(NetworkError::Request {
        url: locator,
        reason: "host unreachable".to_string(),
      })
  }
}
