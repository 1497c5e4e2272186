//! # raged
//!
//! **A retrieval service for AI agents.**
//!
//! Callers ingest text (or URLs the service fetches), then issue
//! natural-language queries that return the most relevant stored fragments,
//! optionally enriched with extracted metadata and entity relationships by
//! external workers through a Postgres-backed task queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌─────────────────┐
//! │  Caller  │──▶│ ingest: fetch → classify  │──▶│  Postgres        │
//! │  (HTTP)  │   │ → chunk → embed → upsert  │   │  + pgvector      │
//! └────┬─────┘   └─────────────┬─────────────┘   └───────┬─────────┘
//!      │                       │ enqueue                 │
//!      │                       ▼                         │
//!      │               ┌──────────────┐                  │
//!      │               │  task queue  │◀── claim/result ─┼── workers
//!      │               └──────────────┘                  │
//!      │                                                 │
//!      └──────────────▶ query: semantic / metadata / ────┘
//!                       fulltext, graph expansion
//! ```
//!
//! ## Data flow
//!
//! 1. **Ingestion** ([`ingest`]) resolves each item — URL items go through
//!    the SSRF-guarded [`fetch`]er — classifies it ([`doctype`]), extracts
//!    tier-1 metadata, splits it with the [`chunker`], embeds the chunks
//!    ([`embedding`]), and upserts document + chunks idempotently by
//!    `(collection, identity_key)`.
//! 2. When enrichment is enabled, one [`queue`] task per chunk is enqueued.
//!    External workers claim tasks under lease, compute tier-2/3 metadata,
//!    and submit results, which also feed the entity [`graph`].
//! 3. **Queries** ([`query`]) dispatch to a strategy — vector kNN over
//!    pgvector, metadata-only scan, or Postgres full-text with ILIKE
//!    fallback — honouring the safe [`filter`] DSL.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration, validated at startup |
//! | [`error`] | Tagged error taxonomy with HTTP status mapping |
//! | [`models`] | Document / chunk / task row types and enums |
//! | [`db`] | Postgres connection pool |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`chunker`] | Deterministic paragraph/sentence/hard-cut splitter |
//! | [`embedding`] | Embedding backends (OpenAI, Ollama) with batch fan-out |
//! | [`filter`] | Filter DSL → parameterised SQL compiler |
//! | [`fetch`] | SSRF-safe URL fetcher |
//! | [`doctype`] | Doc-type classification + tier-1 metadata |
//! | [`ingest`] | Ingestion orchestration |
//! | [`query`] | Strategy-driven retrieval + companion endpoints |
//! | [`queue`] | Lease-based enrichment task queue |
//! | [`graph`] | Entity/relationship storage and bounded expansion |
//! | [`blob`] | S3-compatible blob store for oversized raw payloads |
//! | [`server`] | Axum HTTP surface with bearer auth |

pub mod blob;
pub mod chunker;
pub mod config;
pub mod db;
pub mod doctype;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod graph;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod query;
pub mod queue;
pub mod server;
