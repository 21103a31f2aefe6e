//! # Document Portal CLI (`docportal`)
//!
//! Ingest documents into isolated sessions, query them, and run the HTTP
//! request layer.
//!
//! ## Usage
//!
//! ```bash
//! docportal --config ./config/portal.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docportal ingest [--session ID] [--chunk-size N] [--chunk-overlap N] FILES…` | Build (or replace) a session's index |
//! | `docportal query --session ID [--k N] QUESTION` | Most similar chunks for a question |
//! | `docportal sessions` | List sessions with a persisted index |
//! | `docportal serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! docportal ingest handbook.pdf notes.md --config ./config/portal.toml
//! docportal query --session session_20250101_120000_1a2b3c4d "vacation policy"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use document_portal::config;
use document_portal::context::PortalContext;
use document_portal::models::UploadedFile;
use document_portal::{ingest, logging, query, server};

/// Document Portal: session-scoped document ingestion and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/portal.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docportal",
    about = "Document Portal: session-scoped document ingestion and retrieval",
    version,
    long_about = "Document Portal turns uploaded PDF, DOCX, text and Markdown files into a \
    per-session vector index and answers similarity queries against it, from the CLI or \
    over HTTP."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/portal.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest files into a session, replacing its previous index.
    ///
    /// Unsupported or unreadable files are skipped with a warning. Without
    /// `--session` a new session identifier is generated and printed.
    Ingest {
        /// Session to ingest into (created if absent).
        #[arg(long)]
        session: Option<String>,

        /// Chunk size in characters (defaults to `chunking.max_chars`).
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Overlap between consecutive chunks (defaults to `chunking.overlap_chars`).
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Files to ingest (pdf, docx, txt, md).
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Query a session's index.
    Query {
        #[arg(long)]
        session: String,

        /// Number of results (defaults to `retrieval.top_k`).
        #[arg(long)]
        k: Option<usize>,

        question: String,
    },

    /// List sessions that have a persisted index.
    Sessions,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;
    let ctx = PortalContext::from_config(cfg)?;

    match cli.command {
        Commands::Ingest {
            session,
            chunk_size,
            chunk_overlap,
            files,
        } => {
            let uploads = read_uploads(&files)?;
            let options = ingest::IngestOptions {
                chunk_size,
                chunk_overlap,
                k: None,
            };
            let outcome =
                ingest::ingest_with(&ctx, session.as_deref(), uploads, options).await?;

            println!("ingest {}", outcome.session_id);
            println!("  files received: {}", outcome.stats.files_received);
            println!("  files ingested: {}", outcome.stats.files_ingested);
            println!("  chunks: {}", outcome.stats.chunks);
            println!("  dims: {}", outcome.stats.dims);
            for skipped in &outcome.skipped {
                println!("  skipped: {} ({})", skipped.name, skipped.error);
            }
            println!("ok");
        }
        Commands::Query {
            session,
            k,
            question,
        } => {
            let results = query::query(&ctx, &session, &question, k).await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (rank, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} (position {}, chunk {})",
                    rank + 1,
                    result.score,
                    result.chunk.source,
                    result.chunk.position,
                    result.chunk.chunk_index
                );
                println!("   {}", snippet(&result.chunk.text, 200));
            }
        }
        Commands::Sessions => {
            let sessions = ctx.sessions().list()?;
            if sessions.is_empty() {
                println!("No sessions found.");
            }
            for id in sessions {
                println!("{}", id);
            }
        }
        Commands::Serve => {
            server::run_server(ctx).await?;
        }
    }

    Ok(())
}

fn read_uploads(paths: &[PathBuf]) -> Result<Vec<UploadedFile>> {
    paths
        .iter()
        .map(|path| {
            let content = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(UploadedFile::new(upload_name(path), content))
        })
        .collect()
}

fn upload_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// First `max` characters of `text` on one line.
fn snippet(text: &str, max: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{}…", cut)
    }
}
