//! Network boundary: the request/response model and the fetch trait.

mod client;
#[cfg(test)]
pub mod fake;
mod types;

use async_trait::async_trait;

use crate::error::NetworkError;

pub use client::HttpNetwork;
pub use types::{Request, RequestMode, Response, ResponseKind};

/// Something that can resolve a request into a buffered response.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}
