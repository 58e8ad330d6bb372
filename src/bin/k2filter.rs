//! k2filter: manage a local filter list mirror from the command line.

use clap::{Parser, Subcommand};
use k2filter::{Config, FilterDescriptor, FilterStorage, UpdateEvent};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "k2filter")]
#[command(author = "Kaitu.io")]
#[command(version = "0.1.0")]
#[command(about = "Keep a local mirror of remote filter lists", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, default_value = "k2filter.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered filters
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add and download a filter
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// HTTP(S) URL or absolute path
        #[arg(short, long)]
        url: String,
    },

    /// Remove a filter and its cache file
    Remove {
        /// URL of the filter
        #[arg(short, long)]
        url: String,
    },

    /// Change name, state or URL of a filter
    Set {
        /// Current URL of the filter
        #[arg(short, long)]
        url: String,

        /// Enable or disable the filter
        #[arg(long)]
        enabled: Option<bool>,

        /// New display name
        #[arg(long)]
        name: Option<String>,

        /// New URL
        #[arg(long)]
        new_url: Option<String>,
    },

    /// Update all enabled filters now
    Update {
        /// Seconds to wait for the update to finish
        #[arg(short, long, default_value = "300")]
        timeout: u64,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&cli.config)?;
    let storage = FilterStorage::new(config);

    match &cli.command {
        Commands::List { json } => {
            let filters = storage.list();
            if *json {
                println!("{}", serde_json::to_string_pretty(&filters)?);
            } else {
                print_filters(&filters);
            }
            return Ok(());
        }
        Commands::Add { name, url } => {
            let filter = storage.add(FilterDescriptor::new(name.as_str(), url.as_str()))?;
            println!(
                "Added {} ({} rules) at {:?}",
                filter.name, filter.rule_count, filter.path
            );
        }
        Commands::Remove { url } => {
            let removed = storage
                .delete(url)
                .ok_or_else(|| k2filter::Error::NotFound(url.clone()))?;
            if removed.path.exists() {
                fs::remove_file(&removed.path)?;
            }
            println!("Removed {}", removed.name);
        }
        Commands::Set {
            url,
            enabled,
            name,
            new_url,
        } => {
            let current = storage
                .list()
                .into_iter()
                .find(|f| &f.url == url)
                .ok_or_else(|| k2filter::Error::NotFound(url.clone()))?;
            let (flags, previous) = storage.modify(
                url,
                enabled.unwrap_or(current.enabled),
                name.as_deref().unwrap_or(&current.name),
                new_url.as_deref().unwrap_or(url),
            )?;
            if flags.contains(k2filter::ChangeFlags::URL) && previous.path.exists() {
                fs::remove_file(&previous.path)?;
            }
            println!("Updated {} ({:?})", url, flags);
        }
        Commands::Update { timeout } => {
            let (tx, rx) = mpsc::channel();
            storage.add_observer(move |event| {
                if event == UpdateEvent::AfterUpdate {
                    let _ = tx.send(());
                }
            });
            storage.start()?;
            storage.refresh();
            rx.recv_timeout(Duration::from_secs(*timeout))
                .map_err(|_| "timed out waiting for the update")?;
            storage.close();
            print_filters(&storage.list());
        }
    }

    storage.write_config().save(&cli.config)?;
    Ok(())
}

fn print_filters(filters: &[FilterDescriptor]) {
    for f in filters {
        println!(
            "{:>12} {:<3} {:>8} {}  {}",
            f.id,
            if f.enabled { "on" } else { "off" },
            f.rule_count,
            f.name,
            f.url
        );
    }
}
