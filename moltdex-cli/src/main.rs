//! moltdex CLI
//!
//! Index Moltbook posts and agents into a local snapshot and search it.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use moltdex_core::{Feed, Post, SearchEngine, Snapshot, DEFAULT_RESULT_LIMIT};
use moltdex_runtime::{Indexer, IndexerConfig, SnapshotStore};

#[derive(Parser)]
#[command(name = "moltdex")]
#[command(author, version, about = "moltdex: a searchable index of Moltbook posts and agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML)
    #[arg(short, long, global = true, env = "MOLTDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory holding the published snapshot (overrides config)
    #[arg(long, global = true, env = "MOLTDEX_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Verbosity level (0-3)
    #[arg(short, long, global = true, default_value = "1")]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new posts and publish a fresh snapshot
    Index {
        /// Ignore the watermark and walk both feeds from the top
        #[arg(long)]
        full: bool,
    },

    /// Search posts by keyword
    Search {
        /// Keywords; every one must match
        query: Vec<String>,

        /// Maximum results to show
        #[arg(short, long, default_value_t = DEFAULT_RESULT_LIMIT)]
        limit: usize,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search agents by name, handle or bio
    Agents {
        /// Keywords; every one must match
        query: Vec<String>,

        /// Maximum results to show
        #[arg(short, long, default_value_t = DEFAULT_RESULT_LIMIT)]
        limit: usize,
    },

    /// Show statistics for the published snapshot
    Stats,

    /// Redact credentials from stdin and write the result to stdout
    Redact,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut config = IndexerConfig::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = dir;
    }

    match cli.command {
        Commands::Index { full } => run_index(&config, full).await?,
        Commands::Search { query, limit, json } => {
            run_search(&config, &query.join(" "), limit, json)?;
        }
        Commands::Agents { query, limit } => run_agents(&config, &query.join(" "), limit)?,
        Commands::Stats => show_stats(&config)?,
        Commands::Redact => redact_stdin(&config)?,
    }

    Ok(())
}

fn open_store(config: &IndexerConfig) -> SnapshotStore {
    SnapshotStore::new(&config.store.data_dir).with_history(config.store.keep_history)
}

fn load_snapshot(config: &IndexerConfig) -> Result<Snapshot> {
    let store = open_store(config);
    store.load_current()?.with_context(|| {
        format!(
            "No snapshot in {}. Run `moltdex index` first",
            store.dir().display()
        )
    })
}

async fn run_index(config: &IndexerConfig, full: bool) -> Result<()> {
    println!("🦞 moltdex indexer\n");
    println!("📡 Source: {}", config.api.base_url);
    println!("💾 Data: {}", config.store.data_dir.display());
    if full {
        println!("🔄 Full refresh: watermark ignored");
    }
    println!();

    let indexer = Indexer::from_config(config)?;
    let (outcome, path) = match indexer.run_once(full).await {
        Ok(done) => done,
        Err(e) => {
            println!("❌ Indexing failed; the previous snapshot is still current");
            if e.is_retryable() {
                println!("   This looks transient. Try again later.");
            }
            return Err(e.into());
        }
    };

    let stats = &outcome.stats;
    println!("✅ Published {}", path.display());
    println!("   Fetched records: {}", outcome.fetched);
    println!(
        "   Posts: {} new, {} replaced, {} refreshed, {} unchanged",
        stats.posts_inserted, stats.posts_replaced, stats.posts_refreshed, stats.posts_unchanged
    );
    println!(
        "   Agents: {} new, {} updated, {} unchanged",
        stats.agents_inserted, stats.agents_updated, stats.agents_unchanged
    );
    println!(
        "📊 Snapshot: {} posts, {} agents, {} unresolved authors",
        outcome.snapshot.posts.len(),
        outcome.snapshot.agents.len(),
        stats.unresolved
    );

    Ok(())
}

fn preview(post: &Post) -> String {
    let text = post.title.as_deref().unwrap_or(&post.body);
    let line = text.lines().next().unwrap_or_default();
    let mut short: String = line.chars().take(80).collect();
    if short.len() < line.len() {
        short.push('…');
    }
    short
}

fn run_search(config: &IndexerConfig, query: &str, limit: usize, json: bool) -> Result<()> {
    let engine = SearchEngine::new(load_snapshot(config)?);
    let results = engine.search(query);
    let shown: Vec<&Post> = results.iter().take(limit).copied().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    if shown.is_empty() {
        println!("🔍 No posts match \"{}\"", query);
        return Ok(());
    }

    println!("🔍 {} posts match \"{}\" (showing {})\n", results.len(), query, shown.len());
    for (rank, post) in shown.iter().enumerate() {
        println!("{:>3}. [▲ {}] {}", rank + 1, post.upvotes, preview(post));
        let author = engine.author_name(post).unwrap_or("unknown agent");
        let submolt = post.submolt.as_deref().unwrap_or("general");
        println!(
            "     by {} in m/{} · {} · {} comments",
            author,
            submolt,
            post.created_at.format("%Y-%m-%d %H:%M"),
            post.comment_count
        );
    }

    Ok(())
}

fn run_agents(config: &IndexerConfig, query: &str, limit: usize) -> Result<()> {
    let engine = SearchEngine::new(load_snapshot(config)?);
    let results = engine.search_agents(query);

    if results.is_empty() {
        println!("🤖 No agents match \"{}\"", query);
        return Ok(());
    }

    println!("🤖 {} agents match \"{}\"\n", results.len(), query);
    for agent in results.iter().take(limit) {
        println!(
            "   {} ({}) · karma {} · {} posts · {} followers",
            agent.name, agent.id, agent.karma, agent.post_count, agent.follower_count
        );
        if let Some(bio) = &agent.bio {
            let short: String = bio.chars().take(100).collect();
            println!("     {}", short.replace('\n', " "));
        }
    }

    Ok(())
}

fn show_stats(config: &IndexerConfig) -> Result<()> {
    let store = open_store(config);
    let snapshot = load_snapshot(config)?;

    println!("📊 Snapshot statistics\n");
    println!("   Generated: {}", snapshot.generated_at.to_rfc3339());
    println!("   Posts: {}", snapshot.posts.len());
    println!("   Agents: {}", snapshot.agents.len());
    println!("   Unresolved authors: {}", snapshot.unresolved_count());
    println!("   Fingerprint: {}", snapshot.fingerprint()?);
    for feed in [Feed::Posts, Feed::Introductions] {
        match snapshot.cursor.mark(feed) {
            Some(mark) => {
                println!(
                    "   Watermark ({}): {} @ {}",
                    feed,
                    mark.newest_id,
                    mark.newest_created_at.to_rfc3339()
                );
                if let Some(gap) = &mark.backlog {
                    println!("     ⏳ Backlog: resumes at offset {} next run", gap.offset);
                }
            }
            None => println!("   Watermark ({}): none", feed),
        }
    }
    println!("   History copies: {}", store.history()?.len());

    Ok(())
}

fn redact_stdin(config: &IndexerConfig) -> Result<()> {
    let sanitizer = config.sanitizer()?;

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let (clean, report) = sanitizer.sanitize_with_report(&input);
    for info in &report {
        tracing::info!(rule = %info.rule, count = info.count, "Redacted");
    }
    print!("{}", clean);

    Ok(())
}
