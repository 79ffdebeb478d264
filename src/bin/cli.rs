//! Reply tracker CLI
//!
//! One-shot commands against the local store, or `daemon` for the
//! long-running crawler with a JSON-lines command channel on stdin/stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reply_tracker::{
    error::Result,
    models::{
        ClearUnreadRequest, Command as TrackerCommand, CommandResponse, Config, EntryRef,
        SwitchRequest, TopicRef, UpsertRequest,
    },
    pipeline::{Tracker, run_daemon},
    services::{HttpReplyCounter, LogSink},
    storage::LocalStorage,
};
use tokio::io::BufReader;

/// Tracks replies on watched forum entries
#[derive(Parser, Debug)]
#[command(name = "tracker", version, about = "Forum reply tracker")]
struct Cli {
    /// Path to storage directory holding config.toml and tracked entries
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config.toml into the storage directory
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,

    /// Start tracking an entry, or update its metadata
    Track {
        topic_id: String,
        entry_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        /// Posting time as shown on the site
        #[arg(long)]
        posted_at: Option<String>,
        /// Reply counter currently shown on the page
        #[arg(long)]
        replies: Option<u64>,
    },

    /// Stop tracking an entry
    Remove { topic_id: String, entry_id: String },

    /// Stop tracking every entry of a topic
    RemoveTopic { topic_id: String },

    /// Mark replies as read for one entry or a whole topic
    ClearUnread {
        topic_id: String,
        entry_id: Option<String>,
    },

    /// List tracked entries
    List,

    /// Run one crawl cycle now
    CrawlNow,

    /// Enable background crawling
    Enable,

    /// Disable background crawling
    Disable,

    /// Show crawl switch, unread total and consistency
    Status,

    /// Crawl in the background and serve JSON commands on stdin
    Daemon,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .target(env_logger::Target::Stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.storage_dir.join("config.toml");

    if let Command::Init { force } = cli.command {
        if config_path.exists() && !force {
            log::warn!(
                "Config already exists at {}. Use --force to overwrite.",
                config_path.display()
            );
            return Ok(());
        }
        std::fs::create_dir_all(&cli.storage_dir)?;
        std::fs::write(&config_path, Config::default().to_toml()?)?;
        log::info!("Default config written to {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::load_or_default(&config_path);
    config.apply_env_overrides();

    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {e}");
        return Err(e);
    }
    if matches!(cli.command, Command::Validate) {
        log::info!("✓ Config OK");
        return Ok(());
    }

    let storage = Arc::new(LocalStorage::new(&cli.storage_dir));
    let counter = Arc::new(HttpReplyCounter::new(&config)?);
    let tracker = Tracker::open(config, storage, counter, Some(Arc::new(LogSink))).await?;

    let request = match cli.command {
        Command::Init { .. } | Command::Validate => return Ok(()),
        Command::Track {
            topic_id,
            entry_id,
            title,
            body,
            posted_at,
            replies,
        } => TrackerCommand::Upsert(UpsertRequest {
            topic_id,
            entry_id,
            title,
            body,
            posted_at,
            reply_count: replies,
        }),
        Command::Remove { topic_id, entry_id } => {
            TrackerCommand::RemoveEntry(EntryRef { topic_id, entry_id })
        }
        Command::RemoveTopic { topic_id } => TrackerCommand::RemoveTopic(TopicRef { topic_id }),
        Command::ClearUnread { topic_id, entry_id } => {
            TrackerCommand::ClearUnread(ClearUnreadRequest { topic_id, entry_id })
        }
        Command::List => TrackerCommand::ListAll,
        Command::CrawlNow => TrackerCommand::CrawlNow,
        Command::Enable => TrackerCommand::SetCrawlEnabled(SwitchRequest { enabled: true }),
        Command::Disable => TrackerCommand::SetCrawlEnabled(SwitchRequest { enabled: false }),
        Command::Status => {
            let cache = tracker.store().cache();
            if tracker.accounter().check_consistency(cache).await?.is_none() {
                log::info!("Unread total consistent across {} entries", cache.len()?);
            }
            TrackerCommand::GetCrawlEnabled
        }
        Command::Daemon => {
            let input = BufReader::new(tokio::io::stdin());
            let mut output = tokio::io::stdout();
            tokio::select! {
                result = run_daemon(&tracker, input, &mut output) => result?,
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    log::info!("Interrupted; shutting down");
                }
            }
            return Ok(());
        }
    };

    let response = tracker.handle(request).await;
    print_response(&response)?;
    if !response.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_response(response: &CommandResponse) -> Result<()> {
    let json = serde_json::to_string_pretty(response)?;
    println!("{json}");
    Ok(())
}
