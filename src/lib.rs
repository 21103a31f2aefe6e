//! # Document Portal
//!
//! Session-scoped document ingestion and retrieval.
//!
//! A caller uploads PDF, DOCX, plain-text or Markdown files into a session.
//! The portal extracts their text, splits it into overlapping chunks, embeds
//! every chunk, and persists a vector index under the session's own storage
//! namespace. Later queries against that session return the most similar
//! chunks, best first.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │ Uploads  │──▶│ Extract ▸ Chunk ▸ Embed      │──▶│ index.sqlite │
//! │ pdf/docx │   │ (per-session pipeline)       │   │ per session  │
//! │ txt/md   │   └──────────────────────────────┘   └──────┬───────┘
//! └──────────┘                                             │
//!                      ┌───────────────────────────────────┤
//!                      ▼                                   ▼
//!                 ┌──────────┐                       ┌──────────┐
//!                 │   CLI    │                       │   HTTP   │
//!                 │(docportal)│                      │  (axum)  │
//!                 └──────────┘                       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docportal ingest handbook.pdf faq.md       # prints the new session id
//! docportal query --session <id> "parental leave"
//! docportal serve                            # POST /chat/index, /chat/query
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Process-wide collaborators passed to every operation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`session`] | Session identifiers and storage namespaces |
//! | [`extract`] | PDF, DOCX, text and Markdown extraction |
//! | [`chunk`] | Overlapping character-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory cosine-similarity index |
//! | [`store`] | Atomic SQLite persistence for indexes |
//! | [`retriever`] | Top-k query handle |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Query service over persisted sessions |
//! | [`server`] | HTTP request layer |
//! | [`logging`] | Tracing subscriber setup |

pub mod chunk;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod query;
pub mod retriever;
pub mod server;
pub mod session;
pub mod store;

pub use context::PortalContext;
pub use error::{Error, Result};
