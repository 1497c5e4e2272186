//! Postgres-backed enrichment task queue.
//!
//! Lease-based, at-least-once delivery. State machine per task:
//!
//! ```text
//! pending → processing → completed
//!               │
//!               ├→ pending   (attempt < max_attempts, run_after += 60s)
//!               └→ dead      (attempts exhausted; chunk marked failed)
//! ```
//!
//! The claim operation selects the oldest eligible row under
//! `FOR UPDATE SKIP LOCKED` and flips it to `processing` in the same
//! statement, so two workers can never own one task and a slow worker never
//! blocks the queue head. Leases expire: the stale sweep returns expired
//! `processing` rows to `pending` without touching `attempt`.
//!
//! Retry delay is a fixed 60 seconds — deliberately not exponential; the
//! sweep plus `SKIP LOCKED` already give liveness, and enrichment backends
//! fail mostly in ways where waiting longer does not help.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph;
use crate::models::{self, EnrichmentStatus, TaskStatus};

/// The single queue this service operates.
pub const QUEUE_NAME: &str = "enrichment";
/// Default lease duration granted to a claiming worker.
pub const DEFAULT_LEASE_SECS: i64 = 300;
/// Fixed delay before a failed task becomes eligible again.
pub const RETRY_DELAY_SECS: i64 = 60;
/// Tasks inserted per INSERT statement during enqueue.
const ENQUEUE_BATCH: usize = 100;
/// Chunk rows loaded per page while enqueueing a document.
const CHUNK_PAGE: i64 = 1000;
/// Default number of attempts before a task goes dead.
const DEFAULT_MAX_ATTEMPTS: i32 = 3;

// ============ Enqueue ============

/// Enqueue one enrichment task per chunk of `document_id`.
///
/// Chunks are paged by the `(document_id, chunk_index)` cursor in
/// [`CHUNK_PAGE`]-row pages to bound memory; each page commits one
/// transaction containing [`ENQUEUE_BATCH`]-row task INSERTs plus the
/// chunk status flip to `pending`. Returns the number of tasks created.
pub async fn enqueue_for_document(pool: &PgPool, document_id: Uuid) -> Result<u64> {
    let doc = sqlx::query(
        "SELECT base_id, collection, source FROM documents WHERE id = $1",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("document {} not found", document_id)))?;

    let base_id: String = doc.get("base_id");
    let collection: String = doc.get("collection");
    let source: String = doc.get("source");

    // At most one pending/processing task per chunk: chunks that already
    // have an active task are skipped, not double-queued.
    let active: std::collections::HashSet<String> = sqlx::query_scalar::<_, String>(
        r#"
        SELECT payload->>'chunkId' FROM tasks
        WHERE queue = $1 AND status IN ('pending', 'processing')
          AND payload->>'collection' = $2 AND payload->>'baseId' = $3
        "#,
    )
    .bind(QUEUE_NAME)
    .bind(&collection)
    .bind(&base_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let mut enqueued = 0u64;
    let mut cursor: i32 = -1;

    loop {
        let rows = sqlx::query(
            r#"
            SELECT id, chunk_index, text, doc_type, tier1_meta
            FROM chunks
            WHERE document_id = $1 AND chunk_index > $2
            ORDER BY chunk_index
            LIMIT $3
            "#,
        )
        .bind(document_id)
        .bind(cursor)
        .bind(CHUNK_PAGE)
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            break;
        }
        let page_len = rows.len();
        cursor = rows.last().map(|r| r.get::<i32, _>("chunk_index")).unwrap_or(cursor);

        let rows: Vec<_> = rows
            .into_iter()
            .filter(|r| {
                let cid = models::chunk_id(&base_id, r.get::<i32, _>("chunk_index"));
                !active.contains(&cid)
            })
            .collect();

        if rows.is_empty() {
            if (page_len as i64) < CHUNK_PAGE {
                break;
            }
            continue;
        }

        let mut tx = pool.begin().await?;
        let mut chunk_ids: Vec<Uuid> = Vec::with_capacity(rows.len());

        for batch in rows.chunks(ENQUEUE_BATCH) {
            let mut qb: QueryBuilder<sqlx::Postgres> =
                QueryBuilder::new("INSERT INTO tasks (queue, status, payload, max_attempts) ");
            qb.push_values(batch, |mut b, row| {
                let chunk_index: i32 = row.get("chunk_index");
                let payload = json!({
                    "chunkId": models::chunk_id(&base_id, chunk_index),
                    "baseId": base_id,
                    "chunkIndex": chunk_index,
                    "collection": collection,
                    "docType": row.get::<String, _>("doc_type"),
                    "text": row.get::<String, _>("text"),
                    "source": source,
                    "tier1Meta": row.get::<Value, _>("tier1_meta"),
                });
                b.push_bind(QUEUE_NAME)
                    .push_bind(TaskStatus::Pending.as_str())
                    .push_bind(payload)
                    .push_bind(DEFAULT_MAX_ATTEMPTS);
            });
            qb.build().execute(&mut *tx).await?;

            chunk_ids.extend(batch.iter().map(|r| r.get::<Uuid, _>("id")));
        }

        sqlx::query("UPDATE chunks SET enrichment_status = $1 WHERE id = ANY($2)")
            .bind(EnrichmentStatus::Pending.as_str())
            .bind(&chunk_ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        enqueued += chunk_ids.len() as u64;

        if (page_len as i64) < CHUNK_PAGE {
            break;
        }
    }

    info!(document_id = %document_id, tasks = enqueued, "enrichment tasks enqueued");
    Ok(enqueued)
}

// ============ Claim ============

/// Chunk text shipped with a claim so workers can compute document-level
/// summaries without a second round-trip.
#[derive(Debug, Serialize)]
pub struct ClaimedChunk {
    #[serde(rename = "chunkIndex")]
    pub chunk_index: i32,
    pub text: String,
}

/// A claimed task: the payload plus the fresh text of every chunk of the
/// payload's document.
#[derive(Debug, Serialize)]
pub struct ClaimedTask {
    #[serde(rename = "taskId")]
    pub task_id: i64,
    pub payload: Value,
    pub attempt: i32,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: i32,
    #[serde(rename = "leasedUntil")]
    pub leased_until: DateTime<Utc>,
    #[serde(rename = "documentChunks")]
    pub chunks: Vec<ClaimedChunk>,
}

/// Atomically claim the oldest eligible task for `worker_id`.
///
/// FIFO within a priority tier. Returns `None` when the queue is empty.
pub async fn claim(
    pool: &PgPool,
    worker_id: &str,
    lease_secs: Option<i64>,
) -> Result<Option<ClaimedTask>> {
    let lease = lease_secs.unwrap_or(DEFAULT_LEASE_SECS).clamp(10, 3600);

    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        WITH next AS (
            SELECT id FROM tasks
            WHERE queue = $1 AND status = 'pending' AND run_after <= now()
            ORDER BY priority DESC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE tasks t
        SET status = 'processing',
            leased_until = now() + ($2::float8 * interval '1 second'),
            worker_id = $3
        FROM next
        WHERE t.id = next.id
        RETURNING t.id, t.payload, t.attempt, t.max_attempts, t.leased_until
        "#,
    )
    .bind(QUEUE_NAME)
    .bind(lease as f64)
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.commit().await?;
        return Ok(None);
    };

    let task_id: i64 = row.get("id");
    let payload: Value = row.get("payload");
    let attempt: i32 = row.get("attempt");
    let max_attempts: i32 = row.get("max_attempts");
    let leased_until: DateTime<Utc> = row.get("leased_until");

    // Reflect the lease on the chunk, and ship the document's fresh text.
    let mut chunks = Vec::new();
    if let Some((document_id, chunk_index)) = locate_chunk(&mut tx, &payload).await? {
        sqlx::query(
            "UPDATE chunks SET enrichment_status = $1 WHERE document_id = $2 AND chunk_index = $3",
        )
        .bind(EnrichmentStatus::Processing.as_str())
        .bind(document_id)
        .bind(chunk_index)
        .execute(&mut *tx)
        .await?;

        chunks = sqlx::query(
            "SELECT chunk_index, text FROM chunks WHERE document_id = $1 ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|r| ClaimedChunk {
            chunk_index: r.get("chunk_index"),
            text: r.get("text"),
        })
        .collect();
    }

    tx.commit().await?;

    Ok(Some(ClaimedTask {
        task_id,
        payload,
        attempt,
        max_attempts,
        leased_until,
        chunks,
    }))
}

// ============ Submit result ============

/// Worker-submitted enrichment result.
#[derive(Debug, Deserialize)]
pub struct TaskResult {
    #[serde(rename = "chunkId")]
    pub chunk_id: String,
    #[serde(rename = "tier2Meta", default)]
    pub tier2_meta: Option<Value>,
    #[serde(rename = "tier3Meta", default)]
    pub tier3_meta: Option<Value>,
    #[serde(default)]
    pub entities: Option<Vec<graph::EntityInput>>,
    #[serde(default)]
    pub relationships: Option<Vec<graph::RelationshipInput>>,
}

/// Keys promoted from tier-3 metadata to the parent document, and stripped
/// from the stored chunk copy. `_error` is reserved for the failure path
/// and never accepted from a successful result.
const PROMOTED_KEYS: &[&str] = &[
    "summary",
    "summary_short",
    "summary_medium",
    "summary_long",
    "_error",
];

/// Apply a worker result: update the chunk, promote document summaries,
/// merge extracted entities, and complete the task — all in one
/// transaction. The whole result is applied or none of it is.
pub async fn submit_result(pool: &PgPool, task_id: i64, result: TaskResult) -> Result<()> {
    let (base_id, chunk_index) = models::parse_chunk_id(&result.chunk_id)?;

    let mut tx = pool.begin().await?;

    let task = sqlx::query("SELECT payload, status FROM tasks WHERE id = $1 FOR UPDATE")
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::TaskNotFound(task_id))?;
    let payload: Value = task.get("payload");

    let collection = payload
        .get("collection")
        .and_then(|c| c.as_str())
        .unwrap_or("default")
        .to_string();

    let doc_row = sqlx::query("SELECT id FROM documents WHERE collection = $1 AND base_id = $2")
        .bind(&collection)
        .bind(&base_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("document '{}' not found", base_id)))?;
    let document_id: Uuid = doc_row.get("id");

    // Split tier-3 into the chunk-local copy and the promoted summaries.
    let mut tier3 = result.tier3_meta.clone().unwrap_or_else(|| json!({}));
    let mut promoted: BTreeMap<&str, String> = BTreeMap::new();
    if let Some(obj) = tier3.as_object_mut() {
        for key in PROMOTED_KEYS {
            if let Some(value) = obj.remove(*key) {
                if *key == "_error" {
                    continue;
                }
                if let Some(s) = value.as_str() {
                    if !s.is_empty() {
                        promoted.insert(*key, s.to_string());
                    }
                }
            }
        }
    }

    let updated = sqlx::query(
        r#"
        UPDATE chunks
        SET tier2_meta = $1,
            tier3_meta = $2,
            enrichment_status = 'enriched',
            enriched_at = now()
        WHERE document_id = $3 AND chunk_index = $4
        "#,
    )
    .bind(&result.tier2_meta)
    .bind(&tier3)
    .bind(document_id)
    .bind(chunk_index)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "chunk {} not found",
            result.chunk_id
        )));
    }

    // Promote summaries; `summary` falls back to `summary_medium`.
    let summary = promoted
        .get("summary")
        .or_else(|| promoted.get("summary_medium"))
        .cloned();
    sqlx::query(
        r#"
        UPDATE documents
        SET summary = COALESCE($1, summary),
            summary_short = COALESCE($2, summary_short),
            summary_medium = COALESCE($3, summary_medium),
            summary_long = COALESCE($4, summary_long),
            updated_at = now()
        WHERE id = $5
        "#,
    )
    .bind(summary)
    .bind(promoted.get("summary_short"))
    .bind(promoted.get("summary_medium"))
    .bind(promoted.get("summary_long"))
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    if let Some(entities) = &result.entities {
        graph::merge_extraction(
            &mut tx,
            document_id,
            entities,
            result.relationships.as_deref().unwrap_or(&[]),
        )
        .await?;
    }

    sqlx::query(
        "UPDATE tasks SET status = 'completed', completed_at = now(), leased_until = NULL WHERE id = $1",
    )
    .bind(task_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    info!(task_id, chunk_id = %result.chunk_id, "enrichment result applied");
    Ok(())
}

// ============ Fail ============

/// What happened to a failed task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome")]
pub enum FailOutcome {
    /// Requeued with a 60 s delay.
    Retried {
        attempt: i32,
        #[serde(rename = "runAfter")]
        run_after: DateTime<Utc>,
    },
    /// Attempts exhausted; the chunk carries the error record.
    Dead,
}

/// Record a worker-reported failure.
///
/// Below `max_attempts` the task returns to `pending` with the attempt
/// counter bumped. At the limit it goes `dead` and the chunk's
/// `tier3_meta._error` records `{message, taskId, attempt, maxAttempts,
/// final, failedAt, chunkIndex}` with `enrichment_status = failed`.
pub async fn fail(pool: &PgPool, task_id: i64, message: &str) -> Result<FailOutcome> {
    let mut tx = pool.begin().await?;

    let task = sqlx::query(
        "SELECT payload, attempt, max_attempts FROM tasks WHERE id = $1 FOR UPDATE",
    )
    .bind(task_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(Error::TaskNotFound(task_id))?;

    let payload: Value = task.get("payload");
    let attempt: i32 = task.get("attempt");
    let max_attempts: i32 = task.get("max_attempts");

    if attempt < max_attempts {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempt = attempt + 1,
                leased_until = NULL,
                worker_id = NULL,
                run_after = now() + ($2::float8 * interval '1 second')
            WHERE id = $1
            RETURNING attempt, run_after
            "#,
        )
        .bind(task_id)
        .bind(RETRY_DELAY_SECS as f64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        let attempt: i32 = row.get("attempt");
        warn!(task_id, attempt, "enrichment task retried");
        return Ok(FailOutcome::Retried {
            attempt,
            run_after: row.get("run_after"),
        });
    }

    sqlx::query("UPDATE tasks SET status = 'dead', completed_at = now(), leased_until = NULL WHERE id = $1")
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

    // The chunk index comes from the payload, falling back to the chunkId.
    let chunk_index = payload
        .get("chunkIndex")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| {
            payload
                .get("chunkId")
                .and_then(|v| v.as_str())
                .and_then(|s| models::parse_chunk_id(s).ok())
                .map(|(_, idx)| idx)
        });

    if let Some(chunk_index) = chunk_index {
        if let Some((document_id, _)) = locate_chunk(&mut tx, &payload).await? {
            let error_record = json!({
                "message": message,
                "taskId": task_id,
                "attempt": attempt,
                "maxAttempts": max_attempts,
                "final": true,
                "failedAt": Utc::now(),
                "chunkIndex": chunk_index,
            });
            sqlx::query(
                r#"
                UPDATE chunks
                SET enrichment_status = 'failed',
                    tier3_meta = jsonb_set(COALESCE(tier3_meta, '{}'::jsonb), '{_error}', $1::jsonb)
                WHERE document_id = $2 AND chunk_index = $3
                "#,
            )
            .bind(&error_record)
            .bind(document_id)
            .bind(chunk_index)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    warn!(task_id, attempt, "enrichment task dead-lettered");
    Ok(FailOutcome::Dead)
}

// ============ Stale-lease recovery ============

/// Return expired `processing` tasks to `pending` without incrementing
/// `attempt`, and flip their chunks back to `pending`. Returns the number
/// of recovered tasks.
pub async fn recover_stale(pool: &PgPool) -> Result<u64> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query(
        r#"
        UPDATE tasks
        SET status = 'pending', leased_until = NULL, worker_id = NULL
        WHERE queue = $1 AND status = 'processing' AND leased_until < now()
        RETURNING payload
        "#,
    )
    .bind(QUEUE_NAME)
    .fetch_all(&mut *tx)
    .await?;

    for row in &rows {
        let payload: Value = row.get("payload");
        if let Some((document_id, chunk_index)) = locate_chunk(&mut tx, &payload).await? {
            sqlx::query(
                r#"
                UPDATE chunks SET enrichment_status = 'pending'
                WHERE document_id = $1 AND chunk_index = $2 AND enrichment_status = 'processing'
                "#,
            )
            .bind(document_id)
            .bind(chunk_index)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    let recovered = rows.len() as u64;
    if recovered > 0 {
        info!(recovered, "stale leases recovered");
    }
    Ok(recovered)
}

// ============ Stats, clear, status ============

/// Queue and chunk status counts, optionally narrowed by collection and a
/// free-text filter.
#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub tasks: BTreeMap<String, i64>,
    pub chunks: BTreeMap<String, i64>,
}

/// Count tasks by status and chunks by enrichment status.
///
/// The free-text filter runs full-text (`websearch_to_tsquery`, `simple`
/// config) OR ILIKE over the payload's text/source/baseId/docType and the
/// chunk side's text/source/docType/summaries. Invalid tsquery input falls
/// back to ILIKE-only automatically.
pub async fn stats(
    pool: &PgPool,
    collection: Option<&str>,
    q: Option<&str>,
) -> Result<QueueStats> {
    let mut out = QueueStats::default();

    for status in ["pending", "processing", "completed", "dead"] {
        out.tasks.insert(status.to_string(), 0);
    }
    for status in ["none", "pending", "processing", "enriched", "failed"] {
        out.chunks.insert(status.to_string(), 0);
    }

    let task_rows = match task_counts(pool, collection, q, true).await {
        Err(Error::Database(e)) if is_tsquery_syntax_error(&e) => {
            task_counts(pool, collection, q, false).await?
        }
        other => other?,
    };
    for (status, count) in task_rows {
        out.tasks.insert(status, count);
    }

    let chunk_rows = match chunk_counts(pool, collection, q, true).await {
        Err(Error::Database(e)) if is_tsquery_syntax_error(&e) => {
            chunk_counts(pool, collection, q, false).await?
        }
        other => other?,
    };
    for (status, count) in chunk_rows {
        out.chunks.insert(status, count);
    }

    Ok(out)
}

async fn task_counts(
    pool: &PgPool,
    collection: Option<&str>,
    q: Option<&str>,
    with_fts: bool,
) -> Result<Vec<(String, i64)>> {
    let mut sql = String::from(
        "SELECT status, COUNT(*) AS n FROM tasks t WHERE t.queue = $1",
    );
    let mut idx = 1;
    if collection.is_some() {
        idx += 1;
        sql.push_str(&format!(" AND t.payload->>'collection' = ${}", idx));
    }
    if q.is_some() {
        idx += 1;
        sql.push_str(&task_text_filter(idx, with_fts));
    }
    sql.push_str(" GROUP BY status");

    let mut query = sqlx::query(&sql).bind(QUEUE_NAME);
    if let Some(c) = collection {
        query = query.bind(c);
    }
    if let Some(q) = q {
        query = query.bind(q);
    }

    Ok(query
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

fn task_text_filter(idx: usize, with_fts: bool) -> String {
    let haystack = "COALESCE(t.payload->>'text','') || ' ' || COALESCE(t.payload->>'source','') \
                    || ' ' || COALESCE(t.payload->>'baseId','') || ' ' || COALESCE(t.payload->>'docType','')";
    let ilike = format!(
        "t.payload->>'text' ILIKE '%' || ${i} || '%' \
         OR t.payload->>'source' ILIKE '%' || ${i} || '%' \
         OR t.payload->>'baseId' ILIKE '%' || ${i} || '%' \
         OR t.payload->>'docType' ILIKE '%' || ${i} || '%'",
        i = idx
    );
    if with_fts {
        format!(
            " AND (to_tsvector('simple', {}) @@ websearch_to_tsquery('simple', ${}) OR {})",
            haystack, idx, ilike
        )
    } else {
        format!(" AND ({})", ilike)
    }
}

async fn chunk_counts(
    pool: &PgPool,
    collection: Option<&str>,
    q: Option<&str>,
    with_fts: bool,
) -> Result<Vec<(String, i64)>> {
    let mut sql = String::from(
        "SELECT c.enrichment_status AS status, COUNT(*) AS n \
         FROM chunks c JOIN documents d ON d.id = c.document_id WHERE TRUE",
    );
    let mut idx = 0;
    if collection.is_some() {
        idx += 1;
        sql.push_str(&format!(" AND d.collection = ${}", idx));
    }
    if q.is_some() {
        idx += 1;
        sql.push_str(&chunk_text_filter(idx, with_fts));
    }
    sql.push_str(" GROUP BY c.enrichment_status");

    let mut query = sqlx::query(&sql);
    if let Some(c) = collection {
        query = query.bind(c);
    }
    if let Some(q) = q {
        query = query.bind(q);
    }

    Ok(query
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

fn chunk_text_filter(idx: usize, with_fts: bool) -> String {
    let haystack = "c.text || ' ' || d.source || ' ' || c.doc_type || ' ' || \
                    COALESCE(d.summary,'') || ' ' || COALESCE(d.summary_short,'') || ' ' || \
                    COALESCE(d.summary_medium,'') || ' ' || COALESCE(d.summary_long,'')";
    let ilike = format!(
        "c.text ILIKE '%' || ${i} || '%' \
         OR d.source ILIKE '%' || ${i} || '%' \
         OR c.doc_type ILIKE '%' || ${i} || '%' \
         OR COALESCE(d.summary,'') ILIKE '%' || ${i} || '%'",
        i = idx
    );
    if with_fts {
        format!(
            " AND (to_tsvector('simple', {}) @@ websearch_to_tsquery('simple', ${}) OR {})",
            haystack, idx, ilike
        )
    } else {
        format!(" AND ({})", ilike)
    }
}

/// Bulk-delete queued tasks for a collection. `completed` rows are never
/// touched — they are the audit trail.
pub async fn clear(pool: &PgPool, collection: &str, q: Option<&str>) -> Result<u64> {
    let run = |with_fts: bool| {
        let mut sql = String::from(
            "DELETE FROM tasks t WHERE t.queue = $1 \
             AND t.status IN ('pending', 'processing', 'dead') \
             AND t.payload->>'collection' = $2",
        );
        if q.is_some() {
            sql.push_str(&task_text_filter(3, with_fts));
        }
        sql
    };

    let exec = |sql: String| {
        let q = q.map(|s| s.to_string());
        let collection = collection.to_string();
        async move {
            let mut query = sqlx::query(&sql).bind(QUEUE_NAME).bind(&collection);
            if let Some(ref q) = q {
                query = query.bind(q);
            }
            Result::Ok(query.execute(pool).await?.rows_affected())
        }
    };

    match exec(run(true)).await {
        Err(Error::Database(e)) if is_tsquery_syntax_error(&e) => exec(run(false)).await,
        other => other,
    }
}

/// Per-document enrichment state for `/enrichment/status/:baseId`.
#[derive(Debug, Serialize)]
pub struct DocumentEnrichment {
    #[serde(rename = "baseId")]
    pub base_id: String,
    pub collection: String,
    pub counts: BTreeMap<String, i64>,
    pub chunks: Vec<ChunkEnrichment>,
}

#[derive(Debug, Serialize)]
pub struct ChunkEnrichment {
    #[serde(rename = "chunkIndex")]
    pub chunk_index: i32,
    pub status: String,
    #[serde(rename = "enrichedAt")]
    pub enriched_at: Option<DateTime<Utc>>,
    #[serde(rename = "tier2Meta")]
    pub tier2_meta: Option<Value>,
    #[serde(rename = "tier3Meta")]
    pub tier3_meta: Option<Value>,
}

/// Enrichment state of one document, by base id.
pub async fn document_status(pool: &PgPool, base_id: &str) -> Result<DocumentEnrichment> {
    let doc = sqlx::query("SELECT id, base_id, collection FROM documents WHERE base_id = $1")
        .bind(base_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("document '{}' not found", base_id)))?;
    let document_id: Uuid = doc.get("id");

    let chunks: Vec<ChunkEnrichment> = sqlx::query(
        r#"
        SELECT chunk_index, enrichment_status, enriched_at, tier2_meta, tier3_meta
        FROM chunks WHERE document_id = $1 ORDER BY chunk_index
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|r| ChunkEnrichment {
        chunk_index: r.get("chunk_index"),
        status: r.get("enrichment_status"),
        enriched_at: r.get("enriched_at"),
        tier2_meta: r.get("tier2_meta"),
        tier3_meta: r.get("tier3_meta"),
    })
    .collect();

    let mut counts = BTreeMap::new();
    for chunk in &chunks {
        *counts.entry(chunk.status.clone()).or_insert(0) += 1;
    }

    Ok(DocumentEnrichment {
        base_id: doc.get("base_id"),
        collection: doc.get("collection"),
        counts,
        chunks,
    })
}

// ============ Helpers ============

/// Resolve the payload's `(collection, baseId, chunkIndex)` to a concrete
/// chunk row. Returns `None` when the document vanished (re-ingest with
/// fewer chunks, cleared collection).
async fn locate_chunk(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    payload: &Value,
) -> Result<Option<(Uuid, i32)>> {
    let base_id = payload.get("baseId").and_then(|v| v.as_str());
    let collection = payload
        .get("collection")
        .and_then(|v| v.as_str())
        .unwrap_or("default");
    let chunk_index = payload
        .get("chunkIndex")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| {
            payload
                .get("chunkId")
                .and_then(|v| v.as_str())
                .and_then(|s| models::parse_chunk_id(s).ok())
                .map(|(_, idx)| idx)
        });

    let (Some(base_id), Some(chunk_index)) = (base_id, chunk_index) else {
        return Ok(None);
    };

    let row = sqlx::query(
        r#"
        SELECT c.document_id, c.chunk_index
        FROM chunks c JOIN documents d ON d.id = c.document_id
        WHERE d.collection = $1 AND d.base_id = $2 AND c.chunk_index = $3
        "#,
    )
    .bind(collection)
    .bind(base_id)
    .bind(chunk_index)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| (r.get("document_id"), r.get("chunk_index"))))
}

/// SQLSTATE 42601 is Postgres' syntax error, the code tsquery parsing
/// failures surface under.
pub fn is_tsquery_syntax_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42601"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_filter_sql_shapes() {
        let fts = task_text_filter(2, true);
        assert!(fts.contains("websearch_to_tsquery('simple', $2)"));
        assert!(fts.contains("ILIKE"));

        let ilike_only = task_text_filter(2, false);
        assert!(!ilike_only.contains("websearch_to_tsquery"));
        assert!(ilike_only.contains("ILIKE"));
    }

    #[test]
    fn chunk_filter_covers_summaries() {
        let fts = chunk_text_filter(1, true);
        assert!(fts.contains("d.summary_long"));
        assert!(fts.contains("c.doc_type"));
    }

    #[test]
    fn promoted_keys_include_reserved_error() {
        assert!(PROMOTED_KEYS.contains(&"_error"));
        assert!(PROMOTED_KEYS.contains(&"summary_medium"));
    }

    #[test]
    fn fail_outcome_serialises_with_tag() {
        let v = serde_json::to_value(FailOutcome::Dead).unwrap();
        assert_eq!(v["outcome"], "dead");
    }
}
