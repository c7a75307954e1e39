use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use tracing::debug;
use url::Url;

use super::types::{Request, RequestMode, Response, ResponseKind};
use super::Network;
use crate::error::NetworkError;

/// HTTP client for the agent's origin
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  pub fn new(origin: Url) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("precache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();

    debug!(method = %request.method, url = %url, mode = %request.mode, "Sending request");

    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| NetworkError::Request {
        url: url.clone(),
        reason: e.to_string(),
      })?;

    let status = response.status().as_u16();
    let allow_origin = response
      .headers()
      .get(ACCESS_CONTROL_ALLOW_ORIGIN)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let kind = classify(&self.origin, request, allow_origin.as_deref())?;

    let headers: Vec<(String, String)> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| NetworkError::Request {
        url: url.clone(),
        reason: format!("failed to read body: {}", e),
      })?
      .to_vec();

    debug!(status, kind = %kind, size = body.len(), url = %url, "Received response");

    Ok(match kind {
      ResponseKind::Opaque => Response::opaque(body),
      kind => Response {
        status,
        kind,
        headers,
        body,
      },
    })
  }
}

/// Decide the response type for `request` the way a browser would when the
/// page lives at `origin`.
pub fn classify(
  origin: &Url,
  request: &Request,
  allow_origin: Option<&str>,
) -> Result<ResponseKind, NetworkError> {
  if request.url.origin() == origin.origin() || request.mode == RequestMode::Navigate {
    return Ok(ResponseKind::Basic);
  }

  match request.mode {
    RequestMode::NoCors => Ok(ResponseKind::Opaque),
    RequestMode::SameOrigin => Err(NetworkError::CrossOrigin {
      url: request.url.to_string(),
    }),
    _ => {
      let own = origin.origin().ascii_serialization();
      match allow_origin {
        Some("*") => Ok(ResponseKind::Cors),
        Some(allowed) if allowed.trim_end_matches('/') == own => Ok(ResponseKind::Cors),
        _ => Err(NetworkError::CorsRejected {
          url: request.url.to_string(),
        }),
      }
    }
  }
}
