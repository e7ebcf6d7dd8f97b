//! SessionVault CLI - Operator Command Line Interface
//!
//! This binary opens a redb-backed session store and provides inspection
//! and maintenance commands for it.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use sessionvault_common::{
    AttachmentKind, EngineConfig, NewAttachment, NewSession, SessionId, SessionMetadata,
    SessionStatus,
};
#[cfg(unix)]
use sessionvault_engine::StatvfsSpace;
use sessionvault_engine::{ChunkedSessionStorage, Combinator, DateRange, SearchQuery};
use sessionvault_kv::RedbBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_FILE: &str = "sessions.redb";

#[derive(Parser, Debug)]
#[command(name = "sessionvault")]
#[command(about = "SessionVault session store CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SESSIONVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the session database
    #[arg(short, long, env = "SESSIONVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Attachments per chunk
    #[arg(long)]
    chunk_size: Option<u32>,

    /// Cache budget in MiB
    #[arg(long)]
    cache_mb: Option<usize>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all sessions
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show session details
    Show {
        /// Session ID
        id: String,
        /// Also list every attachment
        #[arg(short, long)]
        attachments: bool,
    },
    /// Start a new session
    Create {
        /// Display name
        name: String,
        /// Tags (repeatable)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        /// Topic ids (repeatable)
        #[arg(long = "topic")]
        topics: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        sub_category: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Append a file as an attachment
    Attach {
        /// Session ID
        id: String,
        /// File to store
        file: PathBuf,
        /// Attachment kind (image or audio)
        #[arg(short, long, default_value = "image")]
        kind: String,
        /// MIME type
        #[arg(long)]
        mime: Option<String>,
        /// Playback length for audio
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Change a session's status
    Status {
        /// Session ID
        id: String,
        /// active, paused, completed or interrupted
        status: String,
    },
    /// Delete a session and release its attachments
    Delete {
        /// Session ID
        id: String,
    },
    /// Search sessions
    Search {
        /// Free text
        text: Option<String>,
        #[arg(short, long = "tag")]
        tags: Vec<String>,
        #[arg(long = "topic")]
        topics: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        sub_category: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Start date, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// End date, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
        /// Match any clause instead of all
        #[arg(long)]
        any: bool,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Reclaim attachment bytes no session references
    Gc,
    /// Check the search index against stored sessions
    VerifyIndex {
        /// Rebuild even if the index is healthy
        #[arg(long)]
        rebuild: bool,
    },
    /// Compact the search index
    Optimize,
    /// Show engine statistics
    Stats,
}

/// Settings read from the config file besides the engine sections
#[derive(Debug, Deserialize, Default)]
struct CliConfig {
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfig {
    #[serde(default)]
    level: Option<String>,
}

fn load_config(path: Option<&Path>) -> Result<(EngineConfig, CliConfig)> {
    let Some(path) = path else {
        return Ok((EngineConfig::default(), CliConfig::default()));
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let engine = EngineConfig::from_toml_str(&text)
        .with_context(|| format!("Invalid engine config in {}", path.display()))?;
    let cli: CliConfig = toml::from_str(&text)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    Ok((engine, cli))
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{s}', expected YYYY-MM-DD"))?;
    let start = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date '{s}'"))?;
    Ok(start.and_utc())
}

/// Format bytes as a human-readable size string.
#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn format_time(ts: Option<DateTime<Utc>>) -> String {
    ts.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

fn print_table(sessions: &[SessionMetadata]) {
    if sessions.is_empty() {
        println!("No sessions found");
        return;
    }
    println!(
        "{:<38} {:<28} {:<12} {:<17} {:>7} {:>6}",
        "SESSION ID", "NAME", "STATUS", "STARTED", "IMAGES", "AUDIO"
    );
    println!("{}", "-".repeat(113));
    for meta in sessions {
        let name: String = meta.name.chars().take(28).collect();
        println!(
            "{:<38} {:<28} {:<12} {:<17} {:>7} {:>6}",
            meta.id,
            name,
            meta.status,
            format_time(Some(meta.started_at)),
            meta.image_count,
            meta.audio_count
        );
    }
}

fn print_metadata(meta: &SessionMetadata) {
    let join = |set: &std::collections::BTreeSet<String>| {
        if set.is_empty() {
            "-".to_string()
        } else {
            set.iter().cloned().collect::<Vec<_>>().join(", ")
        }
    };
    println!("Session: {}", meta.id);
    println!("  Name:         {}", meta.name);
    println!("  Status:       {}", meta.status);
    println!("  Started:      {}", format_time(Some(meta.started_at)));
    println!("  Ended:        {}", format_time(meta.ended_at));
    println!("  Tags:         {}", join(&meta.tags));
    println!("  Topics:       {}", join(&meta.topic_ids));
    println!(
        "  Category:     {} / {}",
        meta.category.as_deref().unwrap_or("-"),
        meta.sub_category.as_deref().unwrap_or("-")
    );
    if let Some(description) = &meta.description {
        println!("  Description:  {description}");
    }
    if let Some(notes) = &meta.notes {
        println!("  Notes:        {notes}");
    }
    println!(
        "  Images:       {} in {} chunks",
        meta.image_count, meta.image_chunk_count
    );
    println!(
        "  Audio:        {} in {} chunks",
        meta.audio_count, meta.audio_chunk_count
    );
}

async fn run(storage: &ChunkedSessionStorage, command: Commands) -> Result<()> {
    match command {
        Commands::List { json } => {
            let sessions = storage.list_metadata()?;
            if json {
                let summaries = storage.list_summaries()?;
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                println!("Sessions ({})", sessions.len());
                println!("========");
                print_table(&sessions);
            }
        }
        Commands::Show { id, attachments } => {
            let id = SessionId::parse(id)?;
            if attachments {
                let session = storage
                    .load_full(&id)
                    .with_context(|| format!("Failed to load session {id}"))?;
                print_metadata(&session.metadata);
                for kind in AttachmentKind::ALL {
                    let items = session.attachments(kind);
                    if items.is_empty() {
                        continue;
                    }
                    println!();
                    println!(
                        "  {:<36} {:<6} {:<16} {:>10}  CAPTURED",
                        "ATTACHMENT", "KIND", "HASH", "SIZE"
                    );
                    for item in items {
                        println!(
                            "  {:<36} {:<6} {:<16} {:>10}  {}",
                            item.id,
                            item.kind,
                            item.hash.short(),
                            format_size(item.size_bytes),
                            format_time(Some(item.captured_at))
                        );
                    }
                }
            } else {
                let meta = storage
                    .metadata(&id)?
                    .ok_or_else(|| anyhow::anyhow!("Session {id} not found"))?;
                print_metadata(&meta);
            }
        }
        Commands::Create {
            name,
            tags,
            topics,
            category,
            sub_category,
            description,
            notes,
        } => {
            let mut new = NewSession::named(name).with_tags(tags);
            new.topic_ids = topics.into_iter().collect();
            new.category = category;
            new.sub_category = sub_category;
            new.description = description;
            new.notes = notes;
            let meta = storage.create_session(new)?;
            println!("Session created successfully!");
            println!();
            print_metadata(&meta);
        }
        Commands::Attach {
            id,
            file,
            kind,
            mime,
            duration_ms,
        } => {
            let id = SessionId::parse(id)?;
            let kind: AttachmentKind = kind.parse()?;
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let attachment = storage.append_attachment(
                &id,
                kind,
                NewAttachment {
                    bytes,
                    mime_type: mime,
                    captured_at: None,
                    duration_ms,
                },
            )?;
            println!(
                "Attached {} ({}, {}) as {}",
                file.display(),
                kind,
                format_size(attachment.size_bytes),
                attachment.id
            );
            println!("Content hash: {}", attachment.hash);
        }
        Commands::Status { id, status } => {
            let id = SessionId::parse(id)?;
            let status: SessionStatus = status.parse()?;
            let meta = storage.update_status(&id, status)?;
            println!("Session {} is now {}", meta.id, meta.status);
        }
        Commands::Delete { id } => {
            let id = SessionId::parse(id)?;
            storage
                .delete_session(&id)
                .with_context(|| format!("Failed to delete session {id}"))?;
            println!("Session {id} deleted");
        }
        Commands::Search {
            text,
            tags,
            topics,
            category,
            sub_category,
            status,
            from,
            to,
            any,
            limit,
        } => {
            let date_range = if from.is_some() || to.is_some() {
                Some(DateRange {
                    from: from.as_deref().map(parse_date).transpose()?,
                    to: to.as_deref().map(parse_date).transpose()?,
                })
            } else {
                None
            };
            let query = SearchQuery {
                text,
                tags: tags.into_iter().collect(),
                topic_ids: topics.into_iter().collect(),
                date_range,
                category,
                sub_category,
                status: status
                    .as_deref()
                    .map(str::parse::<SessionStatus>)
                    .transpose()?,
                combinator: if any { Combinator::Or } else { Combinator::And },
                limit,
            };
            debug!("Search query: {:?}", query);
            let hits = storage.search_sessions(&query)?;
            println!("Matches ({})", hits.len());
            println!("=======");
            print_table(&hits);
        }
        Commands::Gc => {
            let report = storage.garbage_collect()?;
            println!("Garbage collection");
            println!("==================");
            println!("Examined:     {}", report.examined);
            println!("Freed:        {}", report.freed);
            println!("Bytes freed:  {}", format_size(report.bytes_freed));
            println!("Resurrected:  {}", report.resurrected);
        }
        Commands::VerifyIndex { rebuild } => {
            let report = storage.verify_index()?;
            println!("Index integrity");
            println!("===============");
            println!("Sessions checked: {}", report.sessions_checked);
            println!("Orphan postings:  {}", report.orphans.len());
            println!("Missing postings: {}", report.gaps.len());
            println!("Stale postings:   {}", report.stale.len());
            let issues = report.orphans.iter().chain(&report.gaps).chain(&report.stale);
            for issue in issues.take(20) {
                println!("  {}:{} -> {}", issue.kind, issue.key, issue.session_id);
            }
            if report.rebuilt {
                println!("Index was rebuilt automatically");
            } else if rebuild || !report.is_healthy() {
                let count = storage.rebuild_index()?;
                println!("Index rebuilt from {count} sessions");
            } else {
                println!("Index is healthy");
            }
        }
        Commands::Optimize => {
            let report = storage.optimize_index()?;
            println!(
                "Index optimized: {} lists rewritten, {} empty keys removed",
                report.lists_rewritten, report.empty_keys_removed
            );
        }
        Commands::Stats => {
            let stats = storage.stats()?;
            println!("SessionVault Statistics");
            println!("=======================");
            println!("Sessions:          {}", stats.sessions);
            println!();
            println!("Content store");
            println!("  Puts:            {}", stats.cas.puts);
            println!("  Unique entries:  {}", stats.cas.new_entries);
            println!(
                "  Dedup hits:      {} ({:.1}%)",
                stats.cas.dedup_hits,
                stats.cas.dedup_ratio() * 100.0
            );
            println!("  Bytes written:   {}", format_size(stats.cas.bytes_written));
            println!("  Bytes saved:     {}", format_size(stats.cas.bytes_saved));
            println!("  Orphans:         {}", storage.cas().orphans()?.len());
            println!();
            println!("Index");
            println!("  Sessions:        {}", stats.index.sessions);
            println!("  Postings:        {}", stats.index.postings);
            for (kind, keys) in &stats.index.keys {
                println!("  {:<16} {} keys", format!("{kind}:"), keys);
            }
            let meta = storage.index().metadata();
            println!("  Last built:      {}", format_time(meta.last_built));
            println!("  Last optimized:  {}", format_time(meta.last_optimized));
            println!();
            println!("Cache");
            println!(
                "  Entries:         {} ({} of {})",
                stats.cache.entries,
                format_size(stats.cache.used_bytes as u64),
                format_size(stats.cache.max_bytes as u64)
            );
            println!("  Hit ratio:       {:.1}%", stats.cache.hit_ratio * 100.0);
            println!();
            println!("Queue");
            println!("  Pending:         {}", stats.queue.pending());
            println!("  Completed:       {}", stats.queue.completed);
            println!("  Transactions:    {}", stats.queue.transactions);
            println!("  Retried:         {}", stats.queue.retried);
            println!("  Failed:          {}", stats.queue.failed);
            println!("  Dropped:         {}", stats.queue.dropped);
        }
    }
    Ok(())
}

fn mib_to_bytes(mib: usize) -> Result<usize> {
    mib.checked_mul(1024 * 1024)
        .with_context(|| format!("--cache-mb {mib} is too large"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let (mut config, cli) = load_config(args.config.as_deref())?;

    // Initialize logging: RUST_LOG, then --log-level, then the config file
    let level = args
        .log_level
        .clone()
        .or(cli.logging.level)
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(chunk_size) = args.chunk_size {
        config.storage.chunk_size = chunk_size;
    }
    if let Some(cache_mb) = args.cache_mb {
        config.cache.max_bytes = mib_to_bytes(cache_mb)?;
    }

    let data_dir = args
        .data_dir
        .or(cli.data_dir)
        .unwrap_or_else(|| PathBuf::from("./sessionvault-data"));
    let db_path = data_dir.join(DB_FILE);
    let backend = RedbBackend::open(&db_path)
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let storage = ChunkedSessionStorage::open(Arc::new(backend), config)
        .context("Failed to open session storage")?;
    #[cfg(unix)]
    let storage = storage.with_space_source(Arc::new(StatvfsSpace::new(&data_dir)));
    info!("Opened session store at {}", db_path.display());

    let result = run(&storage, args.command).await;
    storage.shutdown().await;
    result
}
