use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tidings::config::Config;
use tidings::feed::{opml, HttpFeedSource};
use tidings::storage::{Database, KeywordEvaluator, StoreError};
use tidings::sync::{SessionReport, SyncCoordinator, SyncTrigger};
use tidings::util::validate_feed_url;

/// Enclosures re-queued on startup when downloads are enabled.
const RESUME_DOWNLOAD_LIMIT: i64 = 100;

/// Get the config directory path (~/.config/tidings/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[derive(Parser, Debug)]
#[command(name = "tidings", about = "RSS/Atom aggregator with adaptive polling")]
struct Args {
    /// Config file (default: ~/.config/tidings/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed URL (fetched once before it is stored)
    Add { url: String },
    /// Create a query feed over all fetched articles
    AddQuery { title: String, query: String },
    /// Delete a feed with its articles
    Remove { feed_id: i64 },
    /// Rename a feed
    Rename { feed_id: i64, title: String },
    /// List feeds with unread counts and schedule
    List,
    /// Show a feed's articles
    Articles {
        feed_id: i64,
        /// Only unread articles
        #[arg(long)]
        unread: bool,
    },
    /// Mark an article read (or unread with --unread)
    Read {
        article_id: i64,
        #[arg(long)]
        unread: bool,
    },
    /// Mark every article in a feed read
    ReadAll { feed_id: i64 },
    /// Manage feed groups
    Group {
        #[command(subcommand)]
        command: GroupCommand,
    },
    /// Run one sync session and print the report
    Sync {
        /// Fetch every URL feed, ignoring backoff
        #[arg(long)]
        force: bool,
    },
    /// Keep syncing on the configured tick until Ctrl-C
    Run,
    /// Subscribe to everything in an OPML file
    Import { file: PathBuf },
    /// Write all subscriptions to an OPML file
    Export { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    Create { name: String },
    Rename { name: String, new_name: String },
    Delete { name: String },
    /// Add a feed to a group
    Add { name: String, feed_id: i64 },
    /// Remove a feed from a group
    Remove { name: String, feed_id: i64 },
    /// List groups, or a group's feeds when a name is given
    List { name: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access to the config directory
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .unwrap_or_else(|| config_dir.join("tidings.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(StoreError::InstanceLocked) => {
            eprintln!("Error: Another instance of tidings appears to be running.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    run_command(args.command, db, &config).await
}

async fn run_command(command: Command, db: Database, config: &Config) -> Result<()> {
    match command {
        Command::Add { url } => {
            let url = validate_feed_url(&url).context("Refusing feed URL")?;
            let coordinator = coordinator(db, config)?;
            let feed = coordinator.subscribe(url.as_str()).await?;
            println!(
                "Subscribed to {} (id {}, {} unread)",
                feed.title, feed.id, feed.unread_count
            );
        }
        Command::AddQuery { title, query } => {
            let coordinator = coordinator(db, config)?;
            let feed = coordinator.subscribe_query(&title, &query).await?;
            println!("Created query feed {} (id {})", feed.title, feed.id);
        }
        Command::Remove { feed_id } => {
            if !db.delete_feed(feed_id).await? {
                anyhow::bail!("No feed with id {feed_id}");
            }
            println!("Removed feed {feed_id}");
        }
        Command::Rename { feed_id, title } => {
            db.rename_feed(feed_id, &title).await?;
        }
        Command::List => {
            for feed in db.list_feeds().await? {
                let schedule = match feed.fetch_url() {
                    Some(_) => format!("every {} ticks, next in {}", feed.wait_period, feed.remaining_wait),
                    None => "query".to_string(),
                };
                let failing = match feed.consecutive_failures {
                    0 => String::new(),
                    n => format!(" [{n} failures]"),
                };
                println!(
                    "{:>5}  {:<40} {:>5} unread  ({schedule}){failing}",
                    feed.id, feed.title, feed.unread_count
                );
            }
        }
        Command::Articles { feed_id, unread } => {
            let feed = db
                .get_feed(feed_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("No feed with id {feed_id}"))?;
            let articles = db.articles_for_feed(&feed, &KeywordEvaluator).await?;
            for article in articles.iter().filter(|a| !unread || !a.read) {
                let marker = if article.read { ' ' } else { '*' };
                let when = article
                    .published
                    .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!("{marker} {:>6}  {when:<10}  {}", article.id, article.title);
            }
        }
        Command::Read { article_id, unread } => {
            if !db.mark_article_read(article_id, !unread).await? {
                anyhow::bail!("No article with id {article_id}");
            }
        }
        Command::ReadAll { feed_id } => {
            let count = db.mark_feed_read(feed_id).await?;
            println!("Marked {count} articles read");
        }
        Command::Group { command } => run_group_command(command, &db).await?,
        Command::Sync { force } => {
            let coordinator = coordinator(db, config)?;
            let trigger = if force {
                SyncTrigger::Forced
            } else {
                SyncTrigger::Manual
            };
            match coordinator.run_session(trigger).await {
                Ok(Some(report)) => print_report(&report),
                Ok(None) => println!("A sync session is already running"),
                Err(e) => {
                    print_report(e.partial_report());
                    return Err(e.into());
                }
            }
        }
        Command::Run => {
            let coordinator = coordinator(db, config)?;
            let queued = coordinator.resume_downloads(RESUME_DOWNLOAD_LIMIT).await?;
            if queued > 0 {
                tracing::info!(queued = queued, "Resumed enclosure downloads");
            }
            coordinator
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                })
                .await;
        }
        Command::Import { file } => {
            let summary = opml::import(&db, &file, config.sync.min_wait_period)
                .await
                .with_context(|| format!("Failed to import {}", file.display()))?;
            println!(
                "Imported {} new feeds ({} already subscribed, {} group memberships)",
                summary.added, summary.existing, summary.memberships
            );
        }
        Command::Export { file } => {
            let count = opml::export(&db, &file)
                .await
                .with_context(|| format!("Failed to export to {}", file.display()))?;
            println!("Exported {count} feeds to {}", file.display());
        }
    }
    Ok(())
}

async fn run_group_command(command: GroupCommand, db: &Database) -> Result<()> {
    match command {
        GroupCommand::Create { name } => {
            let id = db.create_group(&name).await?;
            println!("Group {name} (id {id})");
        }
        GroupCommand::Rename { name, new_name } => {
            let group = find_group(db, &name).await?;
            db.rename_group(group, &new_name).await?;
        }
        GroupCommand::Delete { name } => {
            let group = find_group(db, &name).await?;
            db.delete_group(group).await?;
        }
        GroupCommand::Add { name, feed_id } => {
            let group = find_group(db, &name).await?;
            if !db.add_feed_to_group(group, feed_id).await? {
                println!("Feed {feed_id} is already in {name}");
            }
        }
        GroupCommand::Remove { name, feed_id } => {
            let group = find_group(db, &name).await?;
            if !db.remove_feed_from_group(group, feed_id).await? {
                println!("Feed {feed_id} is not in {name}");
            }
        }
        GroupCommand::List { name: Some(name) } => {
            let group = find_group(db, &name).await?;
            for feed in db.feeds_in_group(group).await? {
                println!("{:>5}  {}", feed.id, feed.title);
            }
        }
        GroupCommand::List { name: None } => {
            for group in db.list_groups().await? {
                println!("{:<30} {} feeds", group.name, group.feed_count);
            }
        }
    }
    Ok(())
}

async fn find_group(db: &Database, name: &str) -> Result<i64> {
    db.find_group_by_name(name)
        .await?
        .map(|g| g.id)
        .ok_or_else(|| anyhow::anyhow!("No group named {name}"))
}

fn coordinator(db: Database, config: &Config) -> Result<SyncCoordinator> {
    let source = Arc::new(HttpFeedSource::new(&config.sync).context("Failed to build HTTP client")?);
    let mut coordinator = SyncCoordinator::new(db, source.clone(), &config.sync);
    if config.sync.download_enclosures {
        coordinator = coordinator.with_enclosure_source(source);
    }
    Ok(coordinator)
}

fn print_report(report: &SessionReport) {
    println!(
        "Checked {} feeds: {} changed, {} failed, {} skipped; {} new articles, {} updated",
        report.feeds_checked,
        report.feeds_changed,
        report.feeds_failed,
        report.feeds_skipped,
        report.articles_created,
        report.articles_updated
    );
    for alert in &report.alerts {
        println!(
            "  {} has failed {} times in a row: {}",
            alert.title, alert.consecutive_failures, alert.last_error
        );
    }
}
