//! Mention Scraper
//!
//! Collects TikTok and Telegram token mentions and serves the correlation
//! dashboard API.
//!
//! Usage:
//!   mention-scraper scrape                  # One TikTok search + hashtag run
//!   mention-scraper monitor --continuous    # Re-check stale videos forever
//!   mention-scraper telegram --single       # One Telegram discovery + scrape cycle
//!   mention-scraper telegram add <channel>  # Register a channel by hand
//!   mention-scraper prices --hours 24       # Pull hourly volumes from Bitquery
//!   mention-scraper serve                   # Dashboard API + periodic aggregation
//!   mention-scraper stats                   # Show storage statistics

use anyhow::Result;
use chrono::Utc;
use clap::{error::ErrorKind, Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mention_scraper::comments::TikTokCommentClient;
use mention_scraper::config::{Config, Environment};
use mention_scraper::correlation::Aggregator;
use mention_scraper::db::Database;
use mention_scraper::extractor::MentionParser;
use mention_scraper::fetcher::BrowserlessDriver;
use mention_scraper::market::{refresh_volumes, BitqueryClient};
use mention_scraper::monitor::{shutdown_signal, CommentMentionSource, Monitor};
use mention_scraper::scraper::TikTokScraper;
use mention_scraper::server::{self, AppState};
use mention_scraper::telegram::TelegramScraper;

#[derive(Parser)]
#[command(name = "mention-scraper", version, about = "Token mention collection and volume correlation")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long, short, env = "SETTINGS_PATH", default_value = "config/settings.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one TikTok scrape over all search terms and hashtags
    Scrape,
    /// Re-check mentions on stale videos
    Monitor(LoopMode),
    /// Scrape registered Telegram channels
    Telegram {
        #[command(subcommand)]
        action: Option<TelegramAction>,
        #[command(flatten)]
        mode: LoopMode,
    },
    /// Manage the token reference table
    Tokens {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Fetch hourly trading volumes for known tokens
    Prices {
        /// How far back to fetch
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Compute and store one correlation run
    Aggregate,
    /// Serve the dashboard API and aggregate periodically
    Serve,
    /// Show storage statistics
    Stats,
}

#[derive(Args)]
struct LoopMode {
    /// Run a single cycle and exit
    #[arg(long, conflicts_with = "continuous")]
    single: bool,
    /// Run until SIGINT/SIGTERM
    #[arg(long)]
    continuous: bool,
}

impl LoopMode {
    /// Exactly one of the flags must be given
    fn require(&self, subcommand: &str) {
        if !self.single && !self.continuous {
            Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    format!("{} needs either --single or --continuous", subcommand),
                )
                .exit();
        }
    }
}

#[derive(Subcommand)]
enum TelegramAction {
    /// Register a public channel by username
    Add { username: String },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Add a token
    Add {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        uri: String,
    },
    /// List known tokens
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(&cli.config)?;
    let env = Environment::from_env()?;
    info!("Loaded configuration");

    let db = Arc::new(Database::open(&env.database_path)?);
    db.run_migrations()?;
    info!("Database initialized at {}", env.database_path);

    match cli.command {
        Command::Scrape => run_scrape(&db, &config, &env).await,
        Command::Monitor(mode) => {
            mode.require("monitor");
            run_monitor(db, &config, mode.continuous).await
        }
        Command::Telegram { action: Some(TelegramAction::Add { username }), .. } => {
            let scraper = telegram_scraper(&config)?;
            if scraper.register_channel(&db, &username).await? {
                println!("Registered @{}", username.trim_start_matches('@'));
            } else {
                println!("@{} is already registered", username.trim_start_matches('@'));
            }
            Ok(())
        }
        Command::Telegram { action: None, mode } => {
            mode.require("telegram");
            run_telegram(&db, &config, mode.continuous).await
        }
        Command::Tokens { action } => run_tokens(&db, action),
        Command::Prices { hours } => {
            let client = BitqueryClient::new(env.require_bitquery_key()?)?;
            let since = Utc::now() - chrono::Duration::hours(hours);
            let stored = refresh_volumes(&client, &db, since).await?;
            println!("Stored {} volume samples", stored);
            Ok(())
        }
        Command::Aggregate => {
            let scored = Aggregator::new(db.clone(), config.correlation.clone()).run_once(Utc::now())?;
            println!("Scored {} tokens", scored);
            Ok(())
        }
        Command::Serve => run_server(db, &config).await,
        Command::Stats => {
            db.stats()?.print_report();
            Ok(())
        }
    }
}

fn comment_client(config: &Config) -> Result<TikTokCommentClient> {
    Ok(TikTokCommentClient::new(
        &config.browser,
        config.scraper.comment_rate_limit_per_second,
        config.scraper.comment_pages,
    )?)
}

fn telegram_scraper(config: &Config) -> Result<TelegramScraper> {
    Ok(TelegramScraper::new(
        config.telegram.clone(),
        config.pacing.clone(),
        &config.browser,
        MentionParser::new(config.mentions.vocabulary()),
    )?)
}

/// Run one TikTok scrape
async fn run_scrape(db: &Database, config: &Config, env: &Environment) -> Result<()> {
    let mut driver = BrowserlessDriver::new(
        env.require_browserless()?,
        env.browserless_token.as_deref(),
        config.browser.clone(),
        Duration::from_secs(config.scraper.navigation_timeout_seconds),
    )?;

    let scraper = TikTokScraper::new(
        config.scraper.clone(),
        config.pacing.clone(),
        MentionParser::new(config.mentions.vocabulary()),
        comment_client(config)?,
    );

    let stats = scraper.run(&mut driver, db).await?;
    println!("\nScrape complete:");
    println!("  Videos seen:       {}", stats.videos_seen);
    println!("  Stored:            {}", stats.stored);
    println!("  Mentions inserted: {}", stats.mentions_inserted);
    println!("  Storage errors:    {}", stats.storage_errors);
    println!("  Blocked feeds:     {}", stats.blocked_targets);

    Ok(())
}

/// Run the mention monitor
async fn run_monitor(db: Arc<Database>, config: &Config, continuous: bool) -> Result<()> {
    let source = CommentMentionSource::new(comment_client(config)?, MentionParser::new(config.mentions.vocabulary()));
    let monitor = Monitor::new(db, source, config.monitor.clone());

    if continuous {
        monitor.run_continuous(shutdown_signal()).await?;
    } else {
        let stats = monitor.run_cycle_at(Utc::now()).await?;
        info!("Single cycle: {} checked, {} new mentions", stats.checked, stats.new_mentions);
    }
    Ok(())
}

/// Run the Telegram channel scraper
async fn run_telegram(db: &Database, config: &Config, continuous: bool) -> Result<()> {
    let scraper = telegram_scraper(config)?;

    if continuous {
        scraper.run_continuous(db, shutdown_signal()).await?;
    } else {
        let now = Utc::now();
        let added = scraper.discover_channels(db, now).await?;
        info!("Discovery added {} channels", added);
        scraper.scrape_all_channels(db, now).await?;
    }
    Ok(())
}

fn run_tokens(db: &Database, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Add { symbol, name, uri } => {
            let id = db.insert_token(symbol.trim().trim_start_matches('$'), &name, &uri)?;
            println!("Added token {} with id {}", symbol, id);
        }
        TokenAction::List => {
            for token in db.load_tokens()? {
                println!("{:>6}  {:<12} {:<24} {}", token.id, token.symbol, token.name, token.uri);
            }
        }
    }
    Ok(())
}

/// Serve the dashboard API with the aggregation job in the background
async fn run_server(db: Arc<Database>, config: &Config) -> Result<()> {
    let aggregator = Aggregator::new(db.clone(), config.correlation.clone());
    tokio::spawn(async move { aggregator.run_periodic().await });

    let state = Arc::new(AppState::new(db, &config.server, &config.correlation));
    server::serve(state, &config.server.host, config.server.port).await?;
    Ok(())
}
