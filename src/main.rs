mod agent;
mod cache;
mod config;
mod error;
mod event;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use agent::{Agent, ClientId, DeployOutcome};
use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use event::{Event, EventHandler};
use net::{HttpNetwork, Request, RequestMode};
use worker::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Versioned, cache-first response caching for a web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override cache.version from the config file
  #[arg(long)]
  cache_version: Option<u32>,

  /// Override the cache database location
  #[arg(long)]
  db: Option<PathBuf>,

  /// Keep the cache in memory for this invocation only
  #[arg(long)]
  ephemeral: bool,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured generation and activate it
  Install,
  /// Fetch URLs through the active generation
  Fetch {
    #[arg(required = true)]
    urls: Vec<Url>,

    #[arg(long, default_value = "GET")]
    method: String,

    /// navigate, same-origin, no-cors or cors
    #[arg(long, default_value = "cors")]
    mode: RequestMode,
  },
  /// Serve requests read from stdin, one `METHOD URL [MODE]` per line
  Run,
  /// List cache generations and their records
  List,
  /// Drop URLs from the configured generation so they are refetched
  Forget {
    #[arg(required = true)]
    urls: Vec<Url>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.verbose)?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Apply command line overrides
  if let Some(version) = args.cache_version {
    config.cache.version = version;
  }
  if let Some(db) = &args.db {
    config.storage_path = Some(db.clone());
  }

  if args.ephemeral {
    execute(&args.command, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = SqliteStorage::open(&config.storage_path()?)?;
    execute(&args.command, &config, Arc::new(storage)).await
  }
}

fn init_logging(verbose: bool) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new("precache=info"))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  if verbose {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("precache")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "precache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

async fn execute<S: CacheStorage>(
  command: &Command,
  config: &config::Config,
  storage: Arc<S>,
) -> Result<()> {
  let worker = match command {
    Command::List => return list(storage.as_ref()),
    _ => config.worker_config()?,
  };
  if let Command::Forget { urls } = command {
    return forget(storage.as_ref(), worker.generation.as_str(), urls);
  }

  let network = Arc::new(HttpNetwork::new(config.origin_url()?)?);
  let agent = Arc::new(Agent::new(storage, network));

  match command {
    Command::Install => {
      let outcome = agent.deploy(worker).await?;
      print_outcome(&outcome);
    }
    Command::Fetch { urls, method, mode } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

      start(&agent, worker).await;
      let client = agent.connect().await;
      for url in urls {
        let request = Request::new(method.clone(), url.clone(), *mode);
        serve(&agent, client, &request).await;
      }
      finish(&agent, client).await;
    }
    Command::Run => {
      start(&agent, worker).await;
      let client = agent.connect().await;

      let mut events = EventHandler::new(BufReader::new(tokio::io::stdin()));
      let mut tasks = JoinSet::new();
      while let Some(event) = events.next().await {
        match event {
          Event::Request(request) => {
            let agent = Arc::clone(&agent);
            tasks.spawn(async move { serve(&agent, client, &request).await });
          }
          Event::Invalid { line, reason } => {
            eprintln!("skipping '{}': {}", line, reason);
          }
        }
      }
      while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
          warn!(error = %e, "Request task failed");
        }
      }

      finish(&agent, client).await;
    }
    Command::List | Command::Forget { .. } => {}
  }

  Ok(())
}

/// Bring a generation into service: adopt a stored one if possible, else
/// install from the network. On failure requests fall back to the network.
async fn start<S: CacheStorage>(agent: &Agent<S, HttpNetwork>, worker: WorkerConfig) {
  match agent.resume(worker.clone()).await {
    Ok(Some(outcome)) => {
      info!(?outcome, "Resumed stored generation");
      return;
    }
    Ok(None) => {}
    Err(e) => warn!(error = %e, "Could not resume stored generation"),
  }

  match agent.deploy(worker).await {
    Ok(outcome) => info!(?outcome, "Deployed generation"),
    Err(e) => {
      warn!(error = %e, "Install failed, serving from the network");
      eprintln!("warning: {}; serving from the network", e);
    }
  }
}

async fn serve<S: CacheStorage>(agent: &Agent<S, HttpNetwork>, client: ClientId, request: &Request) {
  match agent.fetch(client, request).await {
    Ok(served) => println!(
      "{} {} {} {}",
      served.response.status,
      served.source,
      served.response.body.len(),
      request.url
    ),
    Err(e) => println!("ERR network 0 {} ({})", request.url, e),
  }
}

async fn finish<S: CacheStorage>(agent: &Agent<S, HttpNetwork>, client: ClientId) {
  if let Err(e) = agent.disconnect(client).await {
    warn!(error = %e, "Failed to promote waiting generation");
  }
  agent.settle().await;
}

fn print_outcome(outcome: &DeployOutcome) {
  match outcome {
    DeployOutcome::Activated {
      generation,
      reclaimed,
    } => {
      println!("activated {}", generation);
      for name in &reclaimed.deleted {
        println!("reclaimed {}", name);
      }
      for failure in &reclaimed.failures {
        println!("left behind: {}", failure);
      }
    }
    DeployOutcome::Waiting { generation } => println!("waiting {}", generation),
    DeployOutcome::Unchanged { generation } => println!("unchanged {}", generation),
  }
}

fn list<S: CacheStorage>(storage: &S) -> Result<()> {
  for store in storage.store_names()? {
    println!("{}", store);
    for locator in storage.locators(&store)? {
      let Some(record) = storage.get(&store, &locator)? else {
        continue;
      };
      println!(
        "  {} {:<6} {} {} {:<24} {}",
        record.response.status,
        record.response.kind.as_str(),
        &record.digest[..12],
        record.cached_at.format("%Y-%m-%d %H:%M:%S"),
        record.response.header("content-type").unwrap_or("-"),
        locator
      );
    }
  }
  Ok(())
}

fn forget<S: CacheStorage>(storage: &S, generation: &str, urls: &[Url]) -> Result<()> {
  for url in urls {
    let locator = Request::get(url.clone()).locator();
    if storage.delete(generation, &locator)? {
      println!("forgot {}", locator);
    } else {
      println!("not cached {}", locator);
    }
  }
  Ok(())
}
