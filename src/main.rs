use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

use offstore::config::Config;
use offstore::{
  logging, Connectivity, FormDraftStore, MutationQueue, NewAction, OfflineQuery, PersistentCache,
  StorageClient,
};

#[derive(Parser, Debug)]
#[command(name = "offstore")]
#[command(about = "Inspect and prime an offline cache, form drafts and pending actions")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offstore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Database file, overriding the configured one
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print a cached value
  Get { key: String },
  /// Cache a value (JSON; anything else is stored as a string)
  Set {
    key: String,
    value: String,
    /// Expire after this many seconds
    #[arg(long)]
    ttl_secs: Option<u64>,
  },
  /// Remove a cached value
  Delete { key: String },
  /// Print every unexpired cache entry
  List,
  /// Remove every cache entry
  Clear,
  /// Form drafts
  #[command(subcommand)]
  Draft(DraftCommand),
  /// Pending actions awaiting replay
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Fetch JSON from a URL, serving the cached copy when offline or on failure
  Fetch {
    url: String,
    /// Cache key (default: the URL)
    #[arg(long)]
    key: Option<String>,
    /// Treat the network as unavailable
    #[arg(long)]
    offline: bool,
  },
}

#[derive(Subcommand, Debug)]
enum DraftCommand {
  Save { form_id: String, value: String },
  Show { form_id: String },
  Clear { form_id: String },
  /// List forms with a saved draft
  List,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a request for later replay
  Push {
    url: String,
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,
    /// Header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Print queued requests, oldest first
  List,
  /// Drop a queued request by id
  Remove { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::install(&config.log)?;

  let path = match args.db {
    Some(path) => path,
    None => config.storage.resolved_path()?,
  };
  let client = StorageClient::sqlite(path.clone(), config.storage.open_timeout());
  if !client.open().await {
    warn!(path = %path.display(), "running without offline store");
  }

  let result = run(args.command, &client, &config).await;
  client.close();
  result
}

async fn run(command: Command, client: &StorageClient, config: &Config) -> Result<()> {
  let cache = PersistentCache::new(client.clone()).with_default_ttl(config.cache.default_ttl());

  match command {
    Command::Get { key } => match cache.get_item::<Value>(&key).await {
      Some(value) => print_json(&value),
      None => Err(eyre!("No cached value for '{}'", key)),
    },
    Command::Set {
      key,
      value,
      ttl_secs,
    } => {
      let value = parse_value(&value);
      match ttl_secs {
        Some(secs) => {
          cache
            .set_item(&key, &value, Some(Duration::from_secs(secs)))
            .await
        }
        None => cache.set_item_default(&key, &value).await,
      }
      Ok(())
    }
    Command::Delete { key } => {
      cache.delete_item(&key).await;
      Ok(())
    }
    Command::List => {
      let entries: Vec<Value> = cache
        .get_all_entries::<Value>()
        .await
        .into_iter()
        .map(|entry| {
          json!({
            "key": entry.key,
            "data": entry.data,
            "stored_at": entry.stored_at,
            "expires_at": entry.expires_at,
          })
        })
        .collect();
      print_json(&Value::Array(entries))
    }
    Command::Clear => {
      cache.clear_store().await;
      Ok(())
    }
    Command::Draft(command) => run_draft(command, client).await,
    Command::Queue(command) => run_queue(command, client).await,
    Command::Fetch { url, key, offline } => run_fetch(url, key, offline, cache, config).await,
  }
}

async fn run_draft(command: DraftCommand, client: &StorageClient) -> Result<()> {
  let drafts = FormDraftStore::new(client.clone());

  match command {
    DraftCommand::Save { form_id, value } => {
      drafts.save_draft(&form_id, &parse_value(&value)).await;
      Ok(())
    }
    DraftCommand::Show { form_id } => {
      let mut draft = drafts.mount::<Value>(form_id);
      let value = draft.load().await.cloned().unwrap_or(Value::Null);
      print_json(&value)
    }
    DraftCommand::Clear { form_id } => {
      drafts.clear_draft(&form_id).await;
      Ok(())
    }
    DraftCommand::List => {
      for form_id in drafts.form_ids().await {
        println!("{}", form_id);
      }
      Ok(())
    }
  }
}

async fn run_queue(command: QueueCommand, client: &StorageClient) -> Result<()> {
  let queue = MutationQueue::new(client.clone());

  match command {
    QueueCommand::Push {
      url,
      method,
      headers,
      body,
    } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
      let mut action = NewAction::new(method.to_uppercase(), url.as_str());
      for header in &headers {
        let (name, value) = parse_header(header)?;
        action = action.header(name, value);
      }
      if let Some(body) = body {
        action = action.body(body);
      }

      let id = queue.queue_action(action).await?;
      println!("{}", id);
      Ok(())
    }
    QueueCommand::List => {
      let actions = queue.get_pending_actions().await;
      print_json(&serde_json::to_value(actions)?)
    }
    QueueCommand::Remove { id } => {
      queue.remove_action(id).await;
      Ok(())
    }
  }
}

async fn run_fetch(
  url: String,
  key: Option<String>,
  offline: bool,
  cache: PersistentCache,
  config: &Config,
) -> Result<()> {
  let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
  let key = key.unwrap_or_else(|| url.to_string());

  let mut query = OfflineQuery::new(key, cache, Connectivity::new(!offline), move || {
    let url = url.clone();
    async move {
      let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| e.to_string())?;
      let text = response.text().await.map_err(|e| e.to_string())?;
      serde_json::from_str::<Value>(&text).map_err(|e| format!("Invalid JSON response: {}", e))
    }
  })
  .with_options(config.query.options());

  let snapshot = query.run().await;
  match (&snapshot.data, &snapshot.error) {
    (Some(data), _) => {
      if snapshot.is_stale {
        warn!("serving cached data");
      }
      print_json(data)
    }
    (None, Some(error)) => Err(eyre!("{}", error)),
    (None, None) => Err(eyre!("No data")),
  }
}

/// Parse a command-line value as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_header(raw: &str) -> Result<(String, String)> {
  let (name, value) = raw
    .split_once(':')
    .ok_or_else(|| eyre!("Header must look like 'Name: value', got '{}'", raw))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Header name is empty in '{}'", raw));
  }
  Ok((name.to_string(), value.trim().to_string()))
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_queue_push() {
    let args = Args::parse_from([
      "offstore",
      "--db",
      "/tmp/offline.db",
      "queue",
      "push",
      "https://erp.example/api/invoices",
      "-X",
      "put",
      "-H",
      "Content-Type: application/json",
      "--body",
      "{\"total\":120}",
    ]);

    assert_eq!(args.db, Some(PathBuf::from("/tmp/offline.db")));
    match args.command {
      Command::Queue(QueueCommand::Push {
        url,
        method,
        headers,
        body,
      }) => {
        assert_eq!(url, "https://erp.example/api/invoices");
        assert_eq!(method, "put");
        assert_eq!(headers, vec!["Content-Type: application/json".to_string()]);
        assert_eq!(body.as_deref(), Some("{\"total\":120}"));
      }
      other => panic!("unexpected command: {:?}", other),
    }
  }

  #[test]
  fn test_parse_fetch_offline() {
    let args = Args::parse_from(["offstore", "fetch", "https://erp.example/api/kpis", "--offline"]);
    assert!(matches!(
      args.command,
      Command::Fetch {
        offline: true,
        key: None,
        ..
      }
    ));
  }

  #[test]
  fn test_parse_value() {
    assert_eq!(parse_value("{\"a\":1}"), json!({"a": 1}));
    assert_eq!(parse_value("42"), json!(42));
    assert_eq!(parse_value("hello"), json!("hello"));
  }

  #[test]
  fn test_parse_header() {
    assert_eq!(
      parse_header("Authorization:  Bearer abc ").unwrap(),
      ("Authorization".to_string(), "Bearer abc".to_string())
    );
    assert!(parse_header("no-colon").is_err());
    assert!(parse_header(": value").is_err());
  }

  #[tokio::test]
  async fn test_queue_push_and_list() {
    let client = StorageClient::in_memory();
    let config = Config::default();

    run(
      Command::Queue(QueueCommand::Push {
        url: "https://erp.example/api/leads".to_string(),
        method: "post".to_string(),
        headers: vec!["X-Tenant: b3".to_string()],
        body: Some("{}".to_string()),
      }),
      &client,
      &config,
    )
    .await
    .unwrap();

    let pending = MutationQueue::new(client).get_pending_actions().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].method, "POST");
    assert_eq!(pending[0].headers.get("X-Tenant").map(String::as_str), Some("b3"));
  }

  #[tokio::test]
  async fn test_fetch_offline_serves_cache() {
    let client = StorageClient::in_memory();
    let mut config = Config::default();
    config.query.stale_while_revalidate = false;
    let url = "https://erp.example/api/kpis";
    PersistentCache::new(client.clone())
      .set_item(url, &json!({"revenue": 10}), None)
      .await;

    let result = run(
      Command::Fetch {
        url: url.to_string(),
        key: None,
        offline: true,
      },
      &client,
      &config,
    )
    .await;

    assert!(result.is_ok());
  }

  #[tokio::test]
  async fn test_fetch_offline_without_cache_fails() {
    let client = StorageClient::in_memory();
    let config = Config::default();

    let result = run(
      Command::Fetch {
        url: "https://erp.example/api/kpis".to_string(),
        key: None,
        offline: true,
      },
      &client,
      &config,
    )
    .await;

    assert!(result.is_err());
  }
}
