//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Designed
//! to be run via `raged migrate`.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | One row per ingested source, unique per `(collection, identity_key)` |
//! | `chunks` | Embedded fragments, unique per `(document_id, chunk_index)` |
//! | `tasks` | Enrichment work queue (lease-based, at-least-once) |
//! | `entities` | Extracted entities, merged across documents |
//! | `relationships` | Directed entity→entity edges |
//! | `entity_mentions` | Per-document mention counts per entity |
//!
//! # Indexes
//!
//! - HNSW cosine index over `chunks.embedding` (pgvector)
//! - `UNIQUE(collection, identity_key)` on documents (the idempotence key)
//! - `UNIQUE(document_id, chunk_index)` on chunks
//! - B-tree on `documents.ingested_at`, `updated_at`, `last_seen`,
//!   `mime_type` and `chunks.created_at`
//! - Partial index on `tasks(queue, run_after)` for pending rows — the
//!   claim query's scan target
//!
//! # Idempotency
//!
//! Every statement is `IF NOT EXISTS`-guarded. Running `raged migrate`
//! multiple times is safe. The `vector(N)` column dimension comes from
//! `VECTOR_DIM`; changing it requires dropping `chunks` and re-ingesting.

use anyhow::Result;
use sqlx::PgPool;

use crate::config::Config;

/// Run all migrations against the given pool.
pub async fn run_migrations(pool: &PgPool, config: &Config) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            base_id TEXT NOT NULL,
            collection TEXT NOT NULL,
            source TEXT NOT NULL,
            identity_key TEXT NOT NULL,
            mime_type TEXT NOT NULL DEFAULT 'text/plain',
            ingested_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
            summary TEXT,
            summary_short TEXT,
            summary_medium TEXT,
            summary_long TEXT,
            raw_data BYTEA,
            raw_key TEXT,
            payload_checksum TEXT NOT NULL,
            UNIQUE(collection, identity_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The embedding column dimension is fixed per deployment.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id UUID PRIMARY KEY,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding vector({dim}) NOT NULL,
            doc_type TEXT NOT NULL DEFAULT 'text',
            source TEXT NOT NULL,
            path TEXT,
            lang TEXT,
            repo_id TEXT,
            repo_url TEXT,
            item_url TEXT,
            tier1_meta JSONB NOT NULL DEFAULT '{{}}',
            tier2_meta JSONB,
            tier3_meta JSONB,
            enrichment_status TEXT NOT NULL DEFAULT 'none',
            enriched_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            UNIQUE(document_id, chunk_index)
        )
        "#,
        dim = config.vector_dim
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id BIGSERIAL PRIMARY KEY,
            queue TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            payload JSONB NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            priority INTEGER NOT NULL DEFAULT 0,
            run_after TIMESTAMPTZ NOT NULL DEFAULT now(),
            leased_until TIMESTAMPTZ,
            worker_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            completed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id UUID PRIMARY KEY,
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            rel_type TEXT NOT NULL,
            UNIQUE(source, target, rel_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_mentions (
            entity_id UUID NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            document_id UUID NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            mention_count INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (entity_id, document_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Dense vector index, cosine metric. HNSW builds incrementally so it is
    // safe to create before any rows exist.
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_embedding
         ON chunks USING hnsw (embedding vector_cosine_ops)",
    )
    .execute(pool)
    .await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_created_at ON chunks(created_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_ingested_at ON documents(ingested_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_updated_at ON documents(updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_last_seen ON documents(last_seen DESC)",
        "CREATE INDEX IF NOT EXISTS idx_documents_mime_type ON documents(mime_type)",
        "CREATE INDEX IF NOT EXISTS idx_documents_base_id ON documents(base_id)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim
         ON tasks(queue, priority DESC, id) WHERE status = 'pending'",
        "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
        "CREATE INDEX IF NOT EXISTS idx_entity_mentions_document ON entity_mentions(document_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}
