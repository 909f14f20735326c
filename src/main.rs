use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ldstore::federated::FederatedCatalog;
use ldstore::{Config, GetDataOptions, PathValue, Store};

#[derive(Parser, Debug)]
#[command(name = "ldstore")]
#[command(about = "Query and sync Linked Data resources from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ldstore/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a resource, optionally resolving a dotted path in it
  Get {
    id: String,
    path: Option<String>,
  },
  /// Show the types, properties and permissions of a resource
  Props { id: String },
  /// Sync the configured federated catalogue
  Sync {
    /// Ignore the snapshot and fetch every item
    #[arg(long)]
    force: bool,
  },
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ldstore=debug"));

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = RollingFileAppender::new(Rotation::DAILY, dir, "ldstore.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

  Ok(guard)
}

fn print_value(value: &PathValue) {
  match value {
    PathValue::Literal(literal) => match literal.as_str() {
      Some(s) => println!("{}", s),
      None => println!("{}", literal),
    },
    PathValue::Resource(handle) => println!("{}", handle.id()),
    PathValue::List(items) => items.iter().for_each(print_value),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_dir.as_deref())?;

  let store = Store::from_config(&config)?;

  match args.command {
    Command::Get { id, path } => {
      let handle = store
        .get_data(&id, GetDataOptions::default())
        .await
        .ok_or_else(|| eyre!("Resource {} could not be loaded", id))?;
      match path {
        Some(path) => {
          let value = handle
            .get(&path)
            .await
            .ok_or_else(|| eyre!("{} has no value at {}", id, path))?;
          print_value(&value);
        }
        None => {
          let resource = handle
            .resource()
            .ok_or_else(|| eyre!("Resource {} left the cache", id))?;
          println!("{}", serde_json::to_string_pretty(&resource.to_value())?);
        }
      }
    }
    Command::Props { id } => {
      let handle = store
        .get_data(&id, GetDataOptions::default())
        .await
        .ok_or_else(|| eyre!("Resource {} could not be loaded", id))?;
      println!("id:          {}", handle);
      println!("types:       {}", handle.get_type().join(", "));
      println!("properties:  {}", handle.get_properties().join(", "));
      println!("permissions: {}", handle.get_permissions().await.join(", "));
      if handle.is_container() {
        println!("children:    {}", handle.children().len());
      }
    }
    Command::Sync { force } => {
      let federated = config
        .federated
        .as_ref()
        .ok_or_else(|| eyre!("No federated catalogue configured"))?;
      let catalog = FederatedCatalog::from_config(store, federated)?;
      let report = catalog
        .sync(force)
        .await
        .ok_or_else(|| eyre!("Catalogue sync failed"))?;
      println!(
        "{:?} sync of {}: {} listed, {} fetched, {} unchanged, {} deleted",
        report.mode,
        federated.collection_id,
        report.listed,
        report.fetched,
        report.unchanged,
        report.deleted
      );
    }
  }

  Ok(())
}
