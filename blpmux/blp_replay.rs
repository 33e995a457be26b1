// blpmux/blp_replay.rs
// Runs dispatcher queries against a scripted provider and prints the result as JSON.
// Use it like this:
// blp_replay --script demos/refdata_replay.json refdata "F Equity" "GM Equity" -f PX_LAST -f NAME

use anyhow::{anyhow, Context, Result};
use blpmux::{
  init_logging,
  session_mock::{MockSessionFactory, ScriptedResponder},
  Config, DataTable, Dispatcher, ErrorSet, LookupKind, Overrides, SecurityIdType, Value,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// --- CLI Argument Parsing ---

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// JSON file mapping request operation names to the events to answer with.
  #[arg(long)]
  script: PathBuf,

  /// Dispatcher configuration (JSON). Defaults are used when omitted.
  #[arg(long)]
  config: Option<PathBuf>,

  #[clap(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Reference data for securities x fields.
  Refdata(QueryArgs),
  /// Daily history for securities x fields over a date range.
  History {
    #[command(flatten)]
    query: QueryArgs,
    /// First day, YYYY-MM-DD.
    #[arg(long)]
    start: NaiveDate,
    /// Last day (inclusive), YYYY-MM-DD.
    #[arg(long)]
    end: NaiveDate,
  },
  /// Instrument, curve or government lookup.
  Lookup {
    /// security, curve or government.
    kind: LookupKind,
    query: String,
    #[arg(long, default_value_t = 10)]
    max_results: u32,
  },
  /// Field search.
  Fields { query: String },
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
  #[arg(required = true)]
  securities: Vec<String>,

  #[arg(short, long = "field", required = true)]
  fields: Vec<String>,

  /// Identifier namespace, e.g. isin or cusip.
  #[arg(long)]
  id_type: Option<SecurityIdType>,

  /// Overrides as NAME=VALUE.
  #[arg(long = "override", value_parser = parse_override)]
  overrides: Vec<(String, String)>,
}

impl QueryArgs {
  fn overrides(&self) -> Overrides {
    self.overrides.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str()))).collect()
  }
}

fn parse_override(s: &str) -> Result<(String, String), String> {
  s.split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", s))
}

// --- Output ---

#[derive(Serialize)]
struct Output<K: std::hash::Hash + Eq + Clone + Serialize> {
  data: DataTable<K>,
  errors: String,
}

fn print<K: std::hash::Hash + Eq + Clone + Serialize>((data, errors): (DataTable<K>, ErrorSet)) -> Result<()> {
  if !errors.is_empty() {
    warn!("Query returned errors: {}", errors);
  }
  let output = Output { data, errors: errors.to_string() };
  println!("{}", serde_json::to_string_pretty(&output).context("Failed to serialize result")?);
  Ok(())
}

// --- Main Execution Logic ---

async fn run(dispatcher: &Dispatcher, command: Command) -> Result<()> {
  match command {
    Command::Refdata(q) => {
      print(dispatcher.get_reference_data(&q.securities, &q.fields, q.id_type, q.overrides()).await?)
    }
    Command::History { query: q, start, end } => {
      print(dispatcher.get_historical_data(&q.securities, &q.fields, start, end, q.id_type, q.overrides()).await?)
    }
    Command::Lookup { kind, query, max_results } => {
      print(dispatcher.lookup(kind, &query, max_results, BTreeMap::new()).await?)
    }
    Command::Fields { query } => print(dispatcher.search_fields(&query, BTreeMap::new()).await?),
  }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  let args = Args::parse();

  let config = match &args.config {
    Some(path) => Config::from_json_file(path).with_context(|| format!("Failed to load config {:?}", path))?,
    None => Config::default(),
  };
  init_logging(config.level_filter()?);

  if !args.script.exists() {
    return Err(anyhow!("Script does not exist: {:?}", args.script));
  }
  let responder = ScriptedResponder::from_json_file(&args.script)
    .with_context(|| format!("Failed to load script {:?}", args.script))?;
  info!("Loaded script {:?} with operations {:?}", args.script, responder.operations());

  let dispatcher = Dispatcher::new(config, Arc::new(MockSessionFactory::new(responder)))?;
  let result = run(&dispatcher, args.command).await;
  dispatcher.stop().await;
  result
}
