use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// How a request may cross origins, mirroring the fetch request modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level navigation
  Navigate,
  /// Only same-origin responses are acceptable
  SameOrigin,
  /// Cross-origin allowed, response is opaque
  NoCors,
  /// Cross-origin allowed if the server opts in via CORS headers
  #[default]
  Cors,
}

impl RequestMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      RequestMode::Navigate => "navigate",
      RequestMode::SameOrigin => "same-origin",
      RequestMode::NoCors => "no-cors",
      RequestMode::Cors => "cors",
    }
  }
}

impl fmt::Display for RequestMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RequestMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "navigate" => Ok(RequestMode::Navigate),
      "same-origin" => Ok(RequestMode::SameOrigin),
      "no-cors" => Ok(RequestMode::NoCors),
      "cors" => Ok(RequestMode::Cors),
      other => Err(format!("unknown request mode '{}'", other)),
    }
  }
}

/// An outbound request as seen by the agent.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url, mode: RequestMode) -> Self {
    Self { method, url, mode }
  }

  /// A plain `GET` in the default (`cors`) mode.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url, RequestMode::default())
  }

  /// Store key for this request: the URL without its fragment.
  pub fn locator(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.into()
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// Visibility class of a response, as in the fetch response types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response the server allowed via CORS
  Cors,
  /// Cross-origin `no-cors` response; status and headers are hidden
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseKind::Basic => "basic",
      ResponseKind::Cors => "cors",
      ResponseKind::Opaque => "opaque",
    }
  }
}

impl fmt::Display for ResponseKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResponseKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "basic" => Ok(ResponseKind::Basic),
      "cors" => Ok(ResponseKind::Cors),
      "opaque" => Ok(ResponseKind::Opaque),
      other => Err(format!("unknown response type '{}'", other)),
    }
  }
}

/// A fully buffered response.
///
/// The body is read off the wire exactly once by the network client. Anything
/// that needs to both hand the response back and persist it clones this value
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub kind: ResponseKind,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, kind: ResponseKind, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      kind,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// An opaque response: status reads as 0 and no headers are visible.
  pub fn opaque(body: impl Into<Vec<u8>>) -> Self {
    Self::new(0, ResponseKind::Opaque, body)
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .push((name.to_ascii_lowercase(), value.to_string()));
    self
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Hex-encoded SHA-256 of the body.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&self.body);
    hex::encode(hasher.finalize())
  }
}
