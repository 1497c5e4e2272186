//! Strategy-driven query engine.
//!
//! Three retrieval strategies share one result shape:
//!
//! | Strategy | Engine | Score |
//! |----------|--------|-------|
//! | `semantic` | pgvector cosine kNN over `chunks.embedding` | `1 - distance`, cut at `minScore` |
//! | `metadata` | filter-only scan, newest chunks first | constant `1.0` |
//! | `fulltext` | `websearch_to_tsquery('simple', …)` OR ILIKE | `ts_rank`, or `1.0` in ILIKE fallback |
//!
//! Dispatch: an explicit `strategy` wins; an empty query with a filter runs
//! `metadata`; everything else runs `semantic`. The strategy is selected
//! once, up front — a semantic search that finds nothing above the cut
//! returns an empty result set, it does not re-run under another strategy.
//! A tsquery the database rejects (SQLSTATE 42601) automatically retries as
//! ILIKE-only; `routing.method` reports which variant ran.
//!
//! `minScore` auto-derives from the query's term count unless the caller
//! pins it: ≤1 term → 0.3, 2 → 0.4, 3–4 → 0.5, ≥5 → 0.6. `topK` is
//! clamped to 1–100 (default 8). Rank order is score descending, then
//! document id, then chunk index.
//!
//! Two companion operations reuse the ranking: [`download_first`] returns
//! the raw bytes of the top document (inline or via blob store), and
//! [`fulltext_first`] returns its concatenated chunk text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::filter::{self, CompiledFilter};
use crate::models;

/// Bounds on `topK`.
pub const TOP_K_MIN: i64 = 1;
pub const TOP_K_MAX: i64 = 100;
pub const TOP_K_DEFAULT: i64 = 8;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub collection: Option<String>,
    /// `semantic`, `metadata`, or `fulltext`. Absent → internal rule.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Optional seed entity; when present the response carries a bounded
    /// graph expansion alongside the results.
    #[serde(default)]
    pub entity: Option<String>,
}

/// One ranked result row.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// `<baseId>:<chunkIndex>`.
    pub id: String,
    pub score: f64,
    pub text: String,
    pub base_id: String,
    pub chunk_index: i32,
    pub collection: String,
    pub doc_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_short: Option<String>,
    pub payload_checksum: String,
    pub enrichment_status: String,
}

#[derive(Debug, Serialize)]
pub struct Routing {
    pub strategy: String,
    pub method: String,
    pub confidence: f64,
    pub ms: u64,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub ok: bool,
    pub results: Vec<QueryResult>,
    pub routing: Routing,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<crate::graph::GraphExpansion>,
}

/// Derive the default minimum similarity from the query's term count.
pub fn auto_min_score(query: &str) -> f64 {
    match query.split_whitespace().count() {
        0 | 1 => 0.3,
        2 => 0.4,
        3 | 4 => 0.5,
        _ => 0.6,
    }
}

/// Clamp `topK` into its accepted range.
pub fn clamp_top_k(requested: Option<i64>) -> i64 {
    requested.unwrap_or(TOP_K_DEFAULT).clamp(TOP_K_MIN, TOP_K_MAX)
}

/// Run one query request end to end.
pub async fn run_query(
    pool: &PgPool,
    embedder: &Arc<dyn Embedder>,
    request: &QueryRequest,
) -> Result<QueryResponse> {
    let started = Instant::now();
    let collection = request.collection.as_deref().unwrap_or("default");
    let top_k = clamp_top_k(request.top_k);

    let filter = request.filter.as_ref();
    let query_text = request.query.trim();
    let strategy = resolve_strategy(request.strategy.as_deref(), query_text, filter.is_some())?;

    let (results, method, confidence) = match strategy {
        Strategy::Semantic => {
            let min_score = request
                .min_score
                .unwrap_or_else(|| auto_min_score(query_text));
            let rows = semantic_search(
                pool,
                embedder,
                query_text,
                collection,
                filter,
                top_k,
                min_score,
            )
            .await?;

            let confidence = rows.first().map(|r| r.score).unwrap_or(min_score);
            (rows, "vector_knn".to_string(), confidence)
        }
        Strategy::Metadata => {
            let rows = metadata_search(pool, collection, filter, top_k).await?;
            (rows, "metadata_scan".to_string(), 1.0)
        }
        Strategy::Fulltext => {
            let (rows, method) =
                fulltext_search(pool, query_text, collection, filter, top_k).await?;
            (rows, method, 0.5)
        }
    };

    let graph = match &request.entity {
        Some(name) => Some(crate::graph::expand(pool, name, crate::graph::DEFAULT_DEPTH).await?),
        None => None,
    };

    Ok(QueryResponse {
        ok: true,
        results,
        routing: Routing {
            strategy: strategy.name().to_string(),
            method,
            confidence,
            ms: started.elapsed().as_millis() as u64,
        },
        graph,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Semantic,
    Metadata,
    Fulltext,
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Semantic => "semantic",
            Strategy::Metadata => "metadata",
            Strategy::Fulltext => "fulltext",
        }
    }
}

fn resolve_strategy(
    explicit: Option<&str>,
    query_text: &str,
    has_filter: bool,
) -> Result<Strategy> {
    if let Some(name) = explicit {
        return match name {
            "semantic" => Ok(Strategy::Semantic),
            "metadata" => Ok(Strategy::Metadata),
            "fulltext" => Ok(Strategy::Fulltext),
            other => Err(Error::BadRequest(format!(
                "unknown strategy '{}'; use semantic, metadata, or fulltext",
                other
            ))),
        };
    }

    if query_text.is_empty() {
        if has_filter {
            return Ok(Strategy::Metadata);
        }
        return Err(Error::EmptyQuery);
    }

    Ok(Strategy::Semantic)
}

/// Columns every strategy selects; keeps the row mapper shared.
const RESULT_COLUMNS: &str = "c.text, c.chunk_index, c.doc_type, c.source, c.path, c.lang, \
     c.item_url, c.enrichment_status, d.id AS doc_id, d.base_id, d.collection, d.summary, \
     d.summary_short, d.payload_checksum";

fn map_row(row: &PgRow, score: f64) -> QueryResult {
    let base_id: String = row.get("base_id");
    let chunk_index: i32 = row.get("chunk_index");
    QueryResult {
        id: models::chunk_id(&base_id, chunk_index),
        score,
        text: row.get("text"),
        base_id,
        chunk_index,
        collection: row.get("collection"),
        doc_type: row.get("doc_type"),
        source: row.get("source"),
        path: row.get("path"),
        lang: row.get("lang"),
        item_url: row.get("item_url"),
        summary: row.get("summary"),
        summary_short: row.get("summary_short"),
        payload_checksum: row.get("payload_checksum"),
        enrichment_status: row.get("enrichment_status"),
    }
}

/// Append a compiled filter's parameters to a query.
fn bind_filter_params<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    compiled: &CompiledFilter,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for value in &compiled.params {
        query = match value {
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => query.bind(*b),
            // The compiler only emits scalars; anything else is a bug there.
            other => query.bind(other.to_string()),
        };
    }
    query
}

async fn semantic_search(
    pool: &PgPool,
    embedder: &Arc<dyn Embedder>,
    query_text: &str,
    collection: &str,
    filter: Option<&Value>,
    top_k: i64,
    min_score: f64,
) -> Result<Vec<QueryResult>> {
    let mut query_vector = embedder
        .embed(&[query_text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Upstream("empty embedding for query".into()))?;
    crate::embedding::l2_normalize(&mut query_vector);

    // $1 = vector, $2 = collection; filter placeholders continue from 2.
    let compiled = match filter {
        Some(f) => filter::compile(f, 2)?,
        None => CompiledFilter::empty(),
    };
    let limit_ph = 2 + compiled.params.len() + 1;

    let sql = format!(
        "SELECT {cols}, 1 - (c.embedding <=> $1) AS score \
         FROM chunks c JOIN documents d ON d.id = c.document_id \
         WHERE d.collection = $2{filter} \
         ORDER BY c.embedding <=> $1, d.id, c.chunk_index \
         LIMIT ${limit}",
        cols = RESULT_COLUMNS,
        filter = compiled.sql,
        limit = limit_ph,
    );

    let mut query = sqlx::query(&sql)
        .bind(pgvector::Vector::from(query_vector))
        .bind(collection);
    query = bind_filter_params(query, &compiled);
    query = query.bind(top_k);

    let rows = query.fetch_all(pool).await?;
    debug!(candidates = rows.len(), min_score, "semantic search");

    Ok(rows
        .iter()
        .filter_map(|row| {
            let score: f64 = row.get("score");
            (score >= min_score).then(|| map_row(row, score))
        })
        .collect())
}

async fn metadata_search(
    pool: &PgPool,
    collection: &str,
    filter: Option<&Value>,
    top_k: i64,
) -> Result<Vec<QueryResult>> {
    let compiled = match filter {
        Some(f) => filter::compile(f, 1)?,
        None => CompiledFilter::empty(),
    };
    let limit_ph = 1 + compiled.params.len() + 1;

    let sql = format!(
        "SELECT {cols} \
         FROM chunks c JOIN documents d ON d.id = c.document_id \
         WHERE d.collection = $1{filter} \
         ORDER BY c.created_at DESC, d.id, c.chunk_index \
         LIMIT ${limit}",
        cols = RESULT_COLUMNS,
        filter = compiled.sql,
        limit = limit_ph,
    );

    let mut query = sqlx::query(&sql).bind(collection);
    query = bind_filter_params(query, &compiled);
    query = query.bind(top_k);

    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(|row| map_row(row, 1.0)).collect())
}

/// Full-text search; returns the rows and the method actually used.
async fn fulltext_search(
    pool: &PgPool,
    query_text: &str,
    collection: &str,
    filter: Option<&Value>,
    top_k: i64,
) -> Result<(Vec<QueryResult>, String)> {
    match fulltext_attempt(pool, query_text, collection, filter, top_k, true).await {
        Ok(rows) => Ok((rows, "fts_websearch".to_string())),
        Err(Error::Database(e)) if crate::queue::is_tsquery_syntax_error(&e) => {
            let rows = fulltext_attempt(pool, query_text, collection, filter, top_k, false).await?;
            Ok((rows, "ilike_fallback".to_string()))
        }
        Err(e) => Err(e),
    }
}

async fn fulltext_attempt(
    pool: &PgPool,
    query_text: &str,
    collection: &str,
    filter: Option<&Value>,
    top_k: i64,
    with_fts: bool,
) -> Result<Vec<QueryResult>> {
    // $1 = collection, $2 = query text; filter placeholders continue from 2.
    let compiled = match filter {
        Some(f) => filter::compile(f, 2)?,
        None => CompiledFilter::empty(),
    };
    let limit_ph = 2 + compiled.params.len() + 1;

    let (score_expr, match_expr, order_expr) = if with_fts {
        (
            "ts_rank(to_tsvector('simple', c.text), websearch_to_tsquery('simple', $2))::float8",
            "(to_tsvector('simple', c.text) @@ websearch_to_tsquery('simple', $2) \
             OR c.text ILIKE '%' || $2 || '%')",
            "score DESC, d.id, c.chunk_index",
        )
    } else {
        (
            "1.0::float8",
            "c.text ILIKE '%' || $2 || '%'",
            "c.created_at DESC, d.id, c.chunk_index",
        )
    };

    let sql = format!(
        "SELECT {cols}, {score} AS score \
         FROM chunks c JOIN documents d ON d.id = c.document_id \
         WHERE d.collection = $1 AND {matcher}{filter} \
         ORDER BY {order} \
         LIMIT ${limit}",
        cols = RESULT_COLUMNS,
        score = score_expr,
        matcher = match_expr,
        filter = compiled.sql,
        order = order_expr,
        limit = limit_ph,
    );

    let mut query = sqlx::query(&sql).bind(collection).bind(query_text);
    query = bind_filter_params(query, &compiled);
    query = query.bind(top_k);

    let rows = query.fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| {
            let score: f64 = row.get("score");
            map_row(row, score)
        })
        .collect())
}

// ============ Companion endpoints ============

/// Raw bytes of the top-ranked document for a query.
///
/// 404 when the query matches nothing, the document is gone, or it has no
/// raw payload; 502 when the payload is in the blob store and the store is
/// unreachable.
pub async fn download_first(
    pool: &PgPool,
    embedder: &Arc<dyn Embedder>,
    blob_store: &Option<Arc<BlobStore>>,
    request: &QueryRequest,
) -> Result<(String, Vec<u8>)> {
    let doc = fetch_document(pool, top_document(pool, embedder, request).await?).await?;

    if let Some(bytes) = doc.raw_data {
        return Ok((doc.mime_type, bytes));
    }

    if let Some(key) = doc.raw_key {
        let store = blob_store
            .as_ref()
            .ok_or_else(|| Error::BlobUnavailable("blob store not configured".into()))?;
        let bytes = store.get(&key).await?;
        return Ok((doc.mime_type, bytes));
    }

    Err(Error::NotFound("document has no raw payload".into()))
}

/// Concatenated chunk text of the top-ranked document, in index order.
pub async fn fulltext_first(
    pool: &PgPool,
    embedder: &Arc<dyn Embedder>,
    request: &QueryRequest,
) -> Result<FulltextDocument> {
    let doc = fetch_document(pool, top_document(pool, embedder, request).await?).await?;

    let chunks: Vec<String> = sqlx::query_scalar(
        "SELECT text FROM chunks WHERE document_id = $1 ORDER BY chunk_index",
    )
    .bind(doc.id)
    .fetch_all(pool)
    .await?;

    if chunks.is_empty() {
        return Err(Error::NotFound("document has no chunks".into()));
    }

    Ok(FulltextDocument {
        base_id: doc.base_id,
        collection: doc.collection,
        source: doc.source,
        mime_type: doc.mime_type,
        updated_at: doc.updated_at,
        text: chunks.join("\n\n"),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulltextDocument {
    pub base_id: String,
    pub collection: String,
    pub source: String,
    pub mime_type: String,
    pub updated_at: DateTime<Utc>,
    pub text: String,
}

/// The document owning the top-ranked result of `request`.
async fn top_document(
    pool: &PgPool,
    embedder: &Arc<dyn Embedder>,
    request: &QueryRequest,
) -> Result<Uuid> {
    let response = run_query(pool, embedder, request).await?;
    let top = response
        .results
        .first()
        .ok_or_else(|| Error::NotFound("no results for query".into()))?;

    let row = sqlx::query("SELECT id FROM documents WHERE collection = $1 AND base_id = $2")
        .bind(&top.collection)
        .bind(&top.base_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound("document not found".into()))?;
    Ok(row.get("id"))
}

async fn fetch_document(pool: &PgPool, id: Uuid) -> Result<models::Document> {
    sqlx::query_as::<_, models::Document>("SELECT * FROM documents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound("document not found".into()))
}

// ============ Collections overview ============

/// Per-collection document and chunk counts, for `GET /collections`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub collection: String,
    pub documents: i64,
    pub chunks: i64,
    pub enriched_chunks: i64,
    pub last_ingested_at: Option<DateTime<Utc>>,
}

pub async fn collection_stats(pool: &PgPool) -> Result<Vec<CollectionStats>> {
    let rows = sqlx::query(
        r#"
        SELECT
            d.collection,
            COUNT(DISTINCT d.id) AS documents,
            COUNT(c.id) AS chunks,
            COUNT(c.id) FILTER (WHERE c.enrichment_status = 'enriched') AS enriched_chunks,
            MAX(d.ingested_at) AS last_ingested_at
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        GROUP BY d.collection
        ORDER BY documents DESC, d.collection
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| CollectionStats {
            collection: r.get("collection"),
            documents: r.get("documents"),
            chunks: r.get("chunks"),
            enriched_chunks: r.get("enriched_chunks"),
            last_ingested_at: r.get("last_ingested_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_score_derivation_table() {
        assert_eq!(auto_min_score(""), 0.3);
        assert_eq!(auto_min_score("hello"), 0.3);
        assert_eq!(auto_min_score("hello world"), 0.4);
        assert_eq!(auto_min_score("one two three"), 0.5);
        assert_eq!(auto_min_score("one two three four"), 0.5);
        assert_eq!(auto_min_score("one two three four five"), 0.6);
        assert_eq!(auto_min_score("a b c d e f g"), 0.6);
    }

    #[test]
    fn top_k_clamping() {
        assert_eq!(clamp_top_k(None), 8);
        assert_eq!(clamp_top_k(Some(0)), 1);
        assert_eq!(clamp_top_k(Some(-5)), 1);
        assert_eq!(clamp_top_k(Some(50)), 50);
        assert_eq!(clamp_top_k(Some(1000)), 100);
    }

    #[test]
    fn strategy_resolution() {
        assert_eq!(
            resolve_strategy(Some("metadata"), "x", false).unwrap(),
            Strategy::Metadata
        );
        assert_eq!(
            resolve_strategy(None, "find the thing", false).unwrap(),
            Strategy::Semantic
        );
        assert_eq!(
            resolve_strategy(None, "", true).unwrap(),
            Strategy::Metadata
        );
        assert!(matches!(
            resolve_strategy(None, "", false).unwrap_err(),
            Error::EmptyQuery
        ));
        assert!(matches!(
            resolve_strategy(Some("turbo"), "x", false).unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[test]
    fn explicit_strategy_is_honoured_verbatim() {
        // Dispatch is one-shot: the name a caller asks for is the strategy
        // that runs and the one routing reports, filter or no filter,
        // whatever the result count turns out to be.
        for name in ["semantic", "metadata", "fulltext"] {
            let resolved = resolve_strategy(Some(name), "anything", true).unwrap();
            assert_eq!(resolved.name(), name);
            let resolved = resolve_strategy(Some(name), "anything", false).unwrap();
            assert_eq!(resolved.name(), name);
        }
    }
}
