use reqwest::Method;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use url::Url;

use crate::net::{Request, RequestMode};

/// Input events for the `run` loop
#[derive(Debug)]
pub enum Event {
  /// A request to route through the agent
  Request(Request),
  /// A line that could not be parsed
  Invalid { line: String, reason: String },
}

/// Event handler that turns request lines from a reader into events
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Start reading `input` line by line. The stream of events ends at EOF.
  pub fn new<R>(input: R) -> Self
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn line reader
    tokio::spawn(async move {
      let mut lines = input.lines();
      loop {
        let line = match lines.next_line().await {
          Ok(Some(line)) => line,
          Ok(None) => break,
          Err(e) => {
            tracing::warn!(error = %e, "Failed to read request line");
            break;
          }
        };

        let event = match parse_request_line(&line) {
          Ok(Some(request)) => Event::Request(request),
          Ok(None) => continue,
          Err(reason) => Event::Invalid { line, reason },
        };
        if tx.send(event).is_err() {
          break;
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Parse `METHOD URL [MODE]`. Blank lines and `#` comments yield `None`.
pub fn parse_request_line(line: &str) -> Result<Option<Request>, String> {
  let line = line.trim();
  if line.is_empty() || line.starts_with('#') {
    return Ok(None);
  }

  let mut parts = line.split_whitespace();
  let method = parts.next().unwrap_or_default();
  let url = parts
    .next()
    .ok_or_else(|| "expected METHOD URL [MODE]".to_string())?;
  let mode = match parts.next() {
    Some(mode) => mode.parse::<RequestMode>()?,
    None => RequestMode::default(),
  };
  if parts.next().is_some() {
    return Err("unexpected trailing input".to_string());
  }

  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| format!("invalid method '{}': {}", method, e))?;
  let url = Url::parse(url).map_err(|e| format!("invalid URL '{}': {}", url, e))?;

  Ok(Some(Request::new(method, url, mode)))
}
