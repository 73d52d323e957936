//! # chaos CLI
//!
//! The `chaos` binary manages a repository from the command line and starts
//! the web server.
//!
//! ## Usage
//!
//! ```bash
//! chaos --config ./config/chaos.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chaos init` | Create the storage layout and the search index |
//! | `chaos serve` | Start the web UI and JSON API |
//! | `chaos reindex` | Rebuild the search index from the item files |
//! | `chaos list <kind>` | List items of one kind |
//! | `chaos get <ref>` | Show one item |
//! | `chaos new <kind>` | Create an item |
//! | `chaos search "<query>"` | Full-text search |
//! | `chaos related <ref>` | Items sharing keywords with an item |
//! | `chaos keywords` | Keyword usage counts |
//! | `chaos query <id> "<sql>"` | Run SQL against a database item |
//! | `chaos plot <id>` | Render a database item's saved plot as SVG |
//! | `chaos sync` | Mirror the configured remote instance |
//! | `chaos export` | Write a zip backup of the repository |
//! | `chaos stats` | Repository overview |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use chaos::models::{parse_keyword_list, ItemDraft, ItemKind, ItemRef};
use chaos::progress::ProgressMode;
use chaos::{
    config, database, export, index, items, migrate, search, server, stats, sync,
};

/// chaos: a personal web content repository.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chaos.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chaos",
    about = "chaos: a personal web content repository",
    version,
    long_about = "chaos stores notes, links, images, files, SQL databases and listsets as \
    Markdown files with YAML frontmatter, relates them through shared keywords, and serves \
    them through a web UI and a JSON API that other instances can mirror."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chaos.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage directories and the search index schema.
    ///
    /// Idempotent: running it on an existing repository is safe.
    Init,

    /// Start the web UI and JSON API on `[server].bind`.
    Serve,

    /// Rebuild the search index from the item files.
    Reindex,

    /// List items of one kind, newest first.
    List {
        /// Item kind (`notes`, `links`, `images`, `files`, `databases`, `listsets`).
        kind: ItemKind,
    },

    /// Show one item.
    Get {
        /// Item ref, e.g. `notes/<id>`.
        item: ItemRef,
    },

    /// Create an item and print its ref.
    New {
        /// Item kind (singular or plural).
        kind: ItemKind,

        #[arg(long)]
        title: String,

        /// Comma-separated keywords.
        #[arg(long, default_value = "")]
        keywords: String,

        #[arg(long, default_value = "")]
        body: String,

        /// Target URL (required for links).
        #[arg(long)]
        url: Option<String>,

        /// Attachment for images and files, or an SQLite file for databases.
        #[arg(long)]
        attach: Option<PathBuf>,

        /// Default query of a database item.
        #[arg(long)]
        query: Option<String>,

        /// Member ref of a listset. Repeat for several members.
        #[arg(long = "member")]
        members: Vec<ItemRef>,
    },

    /// Full-text search over titles, keywords and bodies.
    Search {
        query: String,

        /// Restrict results to one kind.
        #[arg(long)]
        kind: Option<ItemKind>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Items sharing keywords with an item, most shared first.
    Related {
        item: ItemRef,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Keyword usage counts, most used first.
    Keywords {
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run SQL against a database item and print the result as TSV.
    Query {
        /// Database item id.
        id: String,
        sql: String,
    },

    /// Render the saved plot of a database item as SVG.
    Plot {
        /// Database item id.
        id: String,

        /// Write the SVG here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Mirror the remote instance configured in `[sync]`.
    ///
    /// Items whose content hash differs from the remote are fetched; the
    /// search index is rebuilt afterwards.
    Sync {
        /// Show what would change without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Delete local items the remote no longer has.
        #[arg(long)]
        prune: bool,

        /// Repeat every SECS seconds until interrupted. Must be at least 1.
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,

        /// Progress output on stderr: `off`, `human` or `json`.
        /// Defaults to `human` when stderr is a terminal.
        #[arg(long, value_parser = parse_progress)]
        progress: Option<ProgressMode>,
    },

    /// Write a zip backup of every item file and attachment.
    Export {
        /// Archive path. Defaults to `chaos-export-<timestamp>.zip`.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Show item, keyword, relation and index statistics.
    Stats,
}

fn parse_progress(s: &str) -> Result<ProgressMode, String> {
    match s {
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => Err(format!("unknown progress mode '{}': use off, human or json", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chaos=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
            println!("Repository initialized at {}", cfg.storage.root.display());
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Reindex => {
            index::run_reindex(&cfg).await?;
        }
        Commands::List { kind } => {
            items::run_list(&cfg, kind).await?;
        }
        Commands::Get { item } => {
            items::run_get(&cfg, &item).await?;
        }
        Commands::New {
            kind,
            title,
            keywords,
            body,
            url,
            attach,
            query,
            members,
        } => {
            let draft = ItemDraft {
                title,
                body,
                keywords: parse_keyword_list(&keywords),
                url,
                query,
                members: (kind == ItemKind::Listset).then_some(members),
                ..Default::default()
            };
            items::run_new(&cfg, kind, draft, attach.as_deref()).await?;
        }
        Commands::Search { query, kind, limit } => {
            search::run_search(&cfg, &query, kind, limit).await?;
        }
        Commands::Related { item, limit } => {
            items::run_related(&cfg, &item, limit).await?;
        }
        Commands::Keywords { limit } => {
            items::run_keywords(&cfg, limit).await?;
        }
        Commands::Query { id, sql } => {
            database::run_query(&cfg, &id, &sql).await?;
        }
        Commands::Plot { id, output } => {
            database::run_plot(&cfg, &id, output.as_deref()).await?;
        }
        Commands::Sync {
            dry_run,
            prune,
            interval,
            progress,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            sync::run_sync_command(&cfg, dry_run, prune, interval, mode).await?;
        }
        Commands::Export { output } => {
            export::run_export(&cfg, output.as_deref()).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
