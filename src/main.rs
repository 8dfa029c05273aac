use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use feedsniff::config::Config;
use feedsniff::feed::{Backoff, FeedFetcher, Scheduler, ScrapeOptions};
use feedsniff::storage::{Database, DatabaseError};
use feedsniff::util::validate_url;

/// Get the config directory path (~/.config/feedsniff/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedsniff"))
}

/// Create the config directory if needed, user-only on Unix.
fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedsniff",
    version,
    about = "Poll RSS feeds and store new posts in SQLite"
)]
struct Args {
    /// Config file (default: ~/.config/feedsniff/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// SQLite database file, overrides the config file
    #[arg(long, value_name = "FILE", global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll feeds until interrupted with Ctrl-C
    Run {
        /// Feeds fetched per tick
        #[arg(long)]
        concurrency: Option<usize>,

        /// Seconds between ticks
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Register a feed (renames it if the URL is already registered)
    Add {
        name: String,
        url: String,

        /// Owning user id
        #[arg(long)]
        user: Option<Uuid>,
    },

    /// List registered feeds with their fetch state
    Feeds,

    /// List recently published posts
    Posts {
        /// Only posts from this feed
        #[arg(long)]
        feed: Option<Uuid>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config_dir.join("config.toml"),
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.database.clone().or_else(|| config.database_path.clone()) {
        Some(path) => path,
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("feeds.db")
        }
    };

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedsniff appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    match args.command {
        Command::Run {
            concurrency,
            interval,
        } => {
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(interval) = interval {
                config.interval_secs = interval;
            }
            config.validate()?;
            run(db, &config).await
        }
        Command::Add { name, url, user } => {
            let url = validate_url(&url, config.host_policy())
                .with_context(|| format!("Refusing to register {url}"))?;
            let id = db
                .insert_feed(&name, url.as_str(), user.unwrap_or_else(Uuid::nil))
                .await
                .context("Failed to register feed")?;
            println!("{id}  {name}  {url}");
            Ok(())
        }
        Command::Feeds => {
            let feeds = db.list_feeds().await.context("Failed to load feeds")?;
            if feeds.is_empty() {
                println!("No feeds registered. Add one with: feedsniff add <NAME> <URL>");
            }
            for feed in feeds {
                let fetched = feed
                    .last_fetched_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("{}  {}  {}  fetched: {}", feed.id, feed.name, feed.url, fetched);
                if let Some(error) = &feed.last_error {
                    println!("    {} failure(s), last: {}", feed.consecutive_failures, error);
                }
            }
            Ok(())
        }
        Command::Posts { feed, limit } => {
            let posts = match feed {
                Some(feed_id) => db.get_posts_for_feed(feed_id, Some(limit)).await,
                None => db.get_recent_posts(Some(limit)).await,
            }
            .context("Failed to load posts")?;
            for post in posts {
                println!(
                    "{}  {}\n    {}",
                    post.published_at.format("%Y-%m-%d %H:%M"),
                    post.title,
                    post.url
                );
            }
            Ok(())
        }
    }
}

async fn run(db: Database, config: &Config) -> Result<()> {
    let fetcher = FeedFetcher::new(config.request_timeout(), config.max_feed_bytes)
        .context("Failed to build HTTP client")?;
    let options = ScrapeOptions {
        host_policy: config.host_policy(),
        backoff: Backoff::new(config.interval(), config.backoff_max()),
    };
    let scheduler = Scheduler::new(
        Arc::new(db),
        fetcher,
        options,
        config.concurrency,
        config.interval(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if watch_interrupts(shutdown, tokio::signal::ctrl_c).await {
                std::process::exit(130);
            }
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

/// Cancel `shutdown` on the first interrupt.
///
/// Returns `true` if a second interrupt arrives, meaning the caller should
/// exit without waiting for the running batch.
async fn watch_interrupts<F, Fut>(shutdown: CancellationToken, mut interrupt: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        return false;
    }
    tracing::info!("Interrupt received, finishing current batch (Ctrl-C again to exit now)");
    shutdown.cancel();

    match interrupt().await {
        Ok(()) => {
            tracing::warn!("Second interrupt received, exiting");
            true
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            false
        }
    }
}
