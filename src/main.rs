use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use trellis_db::{ClientPool, ConnectOptions, SqlxClientFactory};
use trellis_events::DashboardEvent;
use trellis_executor::{DashboardExecutor, ExecutorConfig};
use trellis_workspace::Workspace;

const CLI_SESSION: &str = "cli";

/// Trellis - execute interactive dashboards against SQL backends
#[derive(Parser)]
#[command(name = "trellis")]
#[command(version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a dashboard in batch mode and print its events and outputs
  Run {
    /// Path to the mod file (JSON)
    mod_file: PathBuf,

    /// Fully-qualified name of the dashboard to run
    #[arg(long)]
    dashboard: String,

    /// Input values, as name=value (value parsed as JSON, else a string)
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Backend database URI (postgres:// or sqlite:)
    #[arg(long)]
    database: Option<String>,

    /// Comma-separated search path applied to postgres backends
    #[arg(long)]
    search_path: Option<String>,

    /// Abort the execution after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
  },

  /// Load a snapshot by name and print it
  Snapshot {
    /// Path to the mod file (JSON)
    mod_file: PathBuf,

    /// Snapshot name declared in the mod
    name: String,
  },
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let rt = tokio::runtime::Runtime::new()?;

  match cli.command {
    Commands::Run {
      mod_file,
      dashboard,
      args,
      database,
      search_path,
      timeout,
    } => rt.block_on(run_dashboard(
      mod_file,
      dashboard,
      args,
      database,
      search_path,
      timeout,
    )),
    Commands::Snapshot { mod_file, name } => rt.block_on(load_snapshot(mod_file, name)),
  }
}

async fn run_dashboard(
  mod_file: PathBuf,
  dashboard: String,
  args: Vec<String>,
  database: Option<String>,
  search_path: Option<String>,
  timeout: Option<u64>,
) -> Result<()> {
  let workspace = Arc::new(
    Workspace::load(&mod_file)
      .await
      .with_context(|| format!("failed to load mod file: {}", mod_file.display()))?,
  );
  eprintln!("Loaded mod: {}", workspace.mod_name());

  let inputs = parse_args(&args)?;

  let default_database = database
    .clone()
    .unwrap_or_else(|| "sqlite::memory:".to_string());
  let pool = Arc::new(ClientPool::new(
    Arc::new(SqlxClientFactory::default()),
    default_database,
  ));

  let executor = DashboardExecutor::with_config(
    pool,
    ExecutorConfig {
      interactive: false,
      request_deadline: timeout.map(Duration::from_secs),
    },
  );

  let opts = ConnectOptions {
    database,
    search_path: search_path
      .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect()),
  };

  let mut subscription = workspace.subscribe_session(CLI_SESSION);
  executor
    .execute_dashboard(CLI_SESSION, &dashboard, inputs, &workspace, opts)
    .await
    .context("dashboard execution failed to start")?;

  // stream events until the execution reaches a terminal state
  loop {
    let event = subscription.recv().await;
    println!("{}", serde_json::to_string(&event)?);
    match event {
      DashboardEvent::ExecutionComplete { .. } | DashboardEvent::ExecutionError { .. } => break,
      _ => {}
    }
  }

  if let Some(tree) = executor.get_execution(CLI_SESSION) {
    let outputs: serde_json::Map<String, serde_json::Value> = tree
      .node_ids()
      .into_iter()
      .filter_map(|id| tree.node_output(&id).map(|output| (id, output)))
      .collect();
    println!(
      "{}",
      serde_json::to_string_pretty(&serde_json::Value::Object(outputs))?
    );
  }

  Ok(())
}

async fn load_snapshot(mod_file: PathBuf, name: String) -> Result<()> {
  let workspace = Workspace::load(&mod_file)
    .await
    .with_context(|| format!("failed to load mod file: {}", mod_file.display()))?;

  let pool = Arc::new(ClientPool::new(
    Arc::new(SqlxClientFactory::default()),
    "sqlite::memory:",
  ));
  let executor = DashboardExecutor::new(pool);

  let snapshot = executor
    .load_snapshot(CLI_SESSION, &name, &workspace)
    .await
    .context("failed to load snapshot")?;

  println!("{}", serde_json::to_string_pretty(&snapshot)?);
  Ok(())
}

/// Parse repeated `--arg name=value` flags. Values parse as JSON where
/// possible, falling back to plain strings.
fn parse_args(args: &[String]) -> Result<HashMap<String, serde_json::Value>> {
  let mut inputs = HashMap::new();
  for raw in args {
    let (name, value) = raw
      .split_once('=')
      .with_context(|| format!("invalid --arg '{raw}', expected name=value"))?;
    let value = serde_json::from_str(value)
      .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    inputs.insert(name.to_string(), value);
  }
  Ok(inputs)
}
