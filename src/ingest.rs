//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow: resolve (fetch URLs) → classify → tier-1
//! extraction → chunk → embed → upsert → chunk replacement → blob off-load
//! → enrichment enqueue.
//!
//! # Idempotence
//!
//! Each document is identified by `(collection, identity_key)`. Re-ingesting
//! an existing identity with `overwrite=false` bumps `last_seen` only — no
//! chunking, no embedding, no writes to children. With `overwrite=true` the
//! content, raw payload, and the full chunk set are replaced; the chunk
//! replacement runs inside one transaction so readers never observe a
//! half-replaced document.
//!
//! # Failure policy
//!
//! Per-item tolerant: a failed fetch or an invalid item lands in `errors[]`
//! and the batch continues. An embedding backend failure aborts the request
//! with 502 — items already committed stay committed. Enqueue failures
//! after a successful upsert degrade to `warnings[]`; the ingest itself is
//! already durable at that point.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::blob::{self, BlobStore};
use crate::chunker::chunk_text;
use crate::config::Config;
use crate::doctype;
use crate::embedding::{embed_batched, Embedder};
use crate::error::{Error, Result};
use crate::fetch::{self, FetchedPage};
use crate::queue;

/// One item to ingest: inline text with a source label, or a URL to fetch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestItem {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub base_id: Option<String>,
    #[serde(default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub item_url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Caller-supplied metadata, merged into the tier-1 bag.
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub collection: Option<String>,
    pub items: Vec<IngestItem>,
    #[serde(default)]
    pub enrich: Option<bool>,
    #[serde(default)]
    pub overwrite: Option<bool>,
}

/// Per-item failure surfaced in the response; never aborts the batch.
#[derive(Debug, Serialize)]
pub struct ItemError {
    /// The URL or source the item was identified by.
    pub url: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub ok: bool,
    pub upserted: u64,
    pub chunks: u64,
    pub enqueued: u64,
    pub errors: Vec<ItemError>,
    pub warnings: Vec<String>,
}

/// Canonicalise a source for idempotent upsert. URLs keep origin + path and
/// discard query and fragment; anything else is used verbatim.
pub fn identity_key(source: &str) -> String {
    match Url::parse(source) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            format!("{}{}", url.origin().ascii_serialization(), url.path())
        }
        _ => source.to_string(),
    }
}

/// Run one ingestion request. Items commit in request order.
pub async fn run_ingest(
    pool: &PgPool,
    config: &Config,
    embedder: &Arc<dyn Embedder>,
    blob_store: &Option<Arc<BlobStore>>,
    request: IngestRequest,
) -> Result<IngestOutcome> {
    let collection = request
        .collection
        .unwrap_or_else(|| "default".to_string());
    let overwrite = request.overwrite.unwrap_or(false);
    let enrich = request.enrich.unwrap_or(false) && config.enrichment_enabled;

    let mut outcome = IngestOutcome {
        ok: true,
        upserted: 0,
        chunks: 0,
        enqueued: 0,
        errors: Vec::new(),
        warnings: Vec::new(),
    };

    // Fetch all URL items up front: de-duplicated, bounded parallelism,
    // per-URL errors. Text items skip this entirely.
    let urls: Vec<String> = request
        .items
        .iter()
        .filter_map(|i| i.url.clone())
        .collect();
    let fetched = if urls.is_empty() {
        fetch::BatchOutcome::default()
    } else {
        let client = fetch::build_client()
            .map_err(|e| Error::Other(anyhow::anyhow!("fetch client: {}", e)))?;
        fetch::fetch_batch(&client, &urls).await
    };
    for (url, err) in &fetched.errors {
        outcome.errors.push(ItemError {
            url: url.clone(),
            reason: err.reason().to_string(),
            message: err.to_string(),
        });
    }

    for item in &request.items {
        let resolved = match resolve_item(item, &fetched) {
            Ok(Some(r)) => r,
            // Fetch failure already recorded against the URL.
            Ok(None) => continue,
            Err((label, message)) => {
                outcome.errors.push(ItemError {
                    url: label,
                    reason: "invalid_item".to_string(),
                    message,
                });
                continue;
            }
        };

        let ingested = ingest_one(
            pool,
            config,
            embedder,
            blob_store,
            &collection,
            item,
            resolved,
            overwrite,
            &mut outcome.warnings,
        )
        .await?;

        outcome.upserted += 1;
        outcome.chunks += ingested.chunks_written;

        if enrich && ingested.content_changed {
            match queue::enqueue_for_document(pool, ingested.document_id).await {
                Ok(n) => outcome.enqueued += n,
                // The upsert is committed; enqueue failure must not undo it.
                Err(e) => {
                    warn!(document_id = %ingested.document_id, error = %e, "enqueue failed");
                    outcome.warnings.push(format!(
                        "enrichment enqueue failed for {}: {}",
                        ingested.base_id, e
                    ));
                }
            }
        }
    }

    Ok(outcome)
}

struct ResolvedItem {
    source: String,
    text: String,
    raw: Vec<u8>,
    mime_type: String,
}

struct IngestedDocument {
    document_id: Uuid,
    base_id: String,
    chunks_written: u64,
    /// False when the upsert was a `last_seen`-only refresh.
    content_changed: bool,
}

/// Turn an item into text + raw bytes, or report why it can't be.
///
/// `Ok(None)` means the item was a URL whose fetch already failed (and was
/// reported); the item is silently skipped here.
fn resolve_item(
    item: &IngestItem,
    fetched: &fetch::BatchOutcome,
) -> std::result::Result<Option<ResolvedItem>, (String, String)> {
    if let Some(url) = &item.url {
        let Some(page) = fetched.pages.get(url) else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&page.body).to_string();
        let mime_type = sniff_mime(item, page);
        return Ok(Some(ResolvedItem {
            source: url.clone(),
            text,
            raw: page.body.clone(),
            mime_type,
        }));
    }

    let Some(text) = &item.text else {
        let label = item
            .source
            .clone()
            .unwrap_or_else(|| "(unnamed item)".to_string());
        return Err((label, "item needs either 'text' or 'url'".to_string()));
    };

    let source = match &item.source {
        Some(s) if !s.trim().is_empty() => s.clone(),
        _ => {
            return Err((
                "(unnamed item)".to_string(),
                "text items need a 'source'".to_string(),
            ))
        }
    };

    let mime_type = item
        .mime_type
        .clone()
        .unwrap_or_else(|| mime_from_extension(&source));

    Ok(Some(ResolvedItem {
        raw: text.as_bytes().to_vec(),
        text: text.clone(),
        source,
        mime_type,
    }))
}

fn sniff_mime(item: &IngestItem, page: &FetchedPage) -> String {
    if let Some(m) = &item.mime_type {
        return m.clone();
    }
    if let Some(header) = &page.content_type {
        return header
            .split(';')
            .next()
            .unwrap_or(header)
            .trim()
            .to_string();
    }
    mime_from_extension(&page.final_url)
}

fn mime_from_extension(source: &str) -> String {
    let path = source.split(['?', '#']).next().unwrap_or(source);
    match path.rsplit('.').next() {
        Some("md" | "markdown") => "text/markdown",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("yaml" | "yml") => "text/yaml",
        Some("csv") => "text/csv",
        _ => "text/plain",
    }
    .to_string()
}

#[allow(clippy::too_many_arguments)]
async fn ingest_one(
    pool: &PgPool,
    config: &Config,
    embedder: &Arc<dyn Embedder>,
    blob_store: &Option<Arc<BlobStore>>,
    collection: &str,
    item: &IngestItem,
    resolved: ResolvedItem,
    overwrite: bool,
    warnings: &mut Vec<String>,
) -> Result<IngestedDocument> {
    let identity = identity_key(&resolved.source);
    let base_id = item.base_id.clone().unwrap_or_else(|| identity.clone());

    let existing = sqlx::query("SELECT id FROM documents WHERE collection = $1 AND identity_key = $2")
        .bind(collection)
        .bind(&identity)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = existing {
        if !overwrite {
            let document_id: Uuid = row.get("id");
            sqlx::query("UPDATE documents SET last_seen = now() WHERE id = $1")
                .bind(document_id)
                .execute(pool)
                .await?;
            return Ok(IngestedDocument {
                document_id,
                base_id,
                chunks_written: 0,
                content_changed: false,
            });
        }
    }

    let doc_type = doctype::classify(
        item.doc_type.as_deref(),
        &resolved.source,
        Some(&resolved.mime_type),
        &resolved.text,
    );

    let mut tier1 = doctype::tier1_metadata(doc_type, &resolved.text, &resolved.source);
    if let Some(Value::Object(extra)) = &item.metadata {
        if let Some(bag) = tier1.as_object_mut() {
            for (k, v) in extra {
                bag.insert(k.clone(), v.clone());
            }
        }
    }

    let texts = chunk_text(&resolved.text, &config.chunking);
    let vectors = embed_batched(
        embedder.as_ref(),
        &texts,
        config.embedding.batch_size,
        config.embedding.concurrency,
    )
    .await?;

    // The dimension check happens here, at ingest, against the configured
    // constant — not at config load — so a provider switch followed by
    // re-ingest just works.
    for v in &vectors {
        if v.len() != config.vector_dim {
            return Err(Error::VectorDimMismatch {
                expected: config.vector_dim,
                got: v.len(),
            });
        }
    }

    let checksum = hex::encode(Sha256::digest(&resolved.raw));

    // Off-load oversized raw payloads before touching the row, so the row
    // never points at a key that was not written.
    let (raw_data, raw_key) = match blob_store {
        Some(store) if resolved.raw.len() > store_threshold(config) => {
            let key = blob::raw_key_for(collection, &checksum);
            match store.put(&key, &resolved.raw).await {
                Ok(()) => (None, Some(key)),
                Err(e) => {
                    warnings.push(format!("blob off-load failed for {}: {}", base_id, e));
                    (Some(resolved.raw.clone()), None)
                }
            }
        }
        _ => (Some(resolved.raw.clone()), None),
    };

    let lang = item
        .lang
        .clone()
        .or_else(|| doctype::code_lang(&resolved.source).map(|l| l.to_string()));

    let mut tx = pool.begin().await?;

    let document_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO documents (
            id, base_id, collection, source, identity_key, mime_type,
            raw_data, raw_key, payload_checksum
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (collection, identity_key) DO UPDATE SET
            base_id = EXCLUDED.base_id,
            source = EXCLUDED.source,
            mime_type = EXCLUDED.mime_type,
            raw_data = EXCLUDED.raw_data,
            raw_key = EXCLUDED.raw_key,
            payload_checksum = EXCLUDED.payload_checksum,
            updated_at = now(),
            last_seen = now()
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&base_id)
    .bind(collection)
    .bind(&resolved.source)
    .bind(&identity)
    .bind(&resolved.mime_type)
    .bind(&raw_data)
    .bind(&raw_key)
    .bind(&checksum)
    .fetch_one(&mut *tx)
    .await?;

    // Replace chunks atomically: delete the old set, insert the new one in
    // index order.
    sqlx::query("DELETE FROM chunks WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (index, (text, vector)) in texts.iter().zip(vectors.iter()).enumerate() {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                id, document_id, chunk_index, text, embedding, doc_type, source,
                path, lang, repo_id, repo_url, item_url, tier1_meta, enrichment_status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'none')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(document_id)
        .bind(index as i32)
        .bind(text)
        .bind(pgvector::Vector::from(vector.clone()))
        .bind(doc_type.as_str())
        .bind(&resolved.source)
        .bind(&item.path)
        .bind(&lang)
        .bind(&item.repo_id)
        .bind(&item.repo_url)
        .bind(&item.item_url)
        .bind(&tier1)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(
        collection,
        base_id = %base_id,
        doc_type = %doc_type,
        chunks = texts.len(),
        "document ingested"
    );

    Ok(IngestedDocument {
        document_id,
        base_id,
        chunks_written: texts.len() as u64,
        content_changed: true,
    })
}

fn store_threshold(config: &Config) -> usize {
    config
        .blob
        .as_ref()
        .map(|b| b.threshold_bytes)
        .unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_strips_query_and_fragment() {
        assert_eq!(
            identity_key("https://example.com/docs/page?utm=1#section"),
            "https://example.com/docs/page"
        );
    }

    #[test]
    fn identity_key_keeps_port_and_path() {
        assert_eq!(
            identity_key("http://example.com:8080/a/b"),
            "http://example.com:8080/a/b"
        );
    }

    #[test]
    fn identity_key_non_url_verbatim() {
        assert_eq!(identity_key("notes/standup.md"), "notes/standup.md");
        assert_eq!(identity_key("x.txt"), "x.txt");
    }

    #[test]
    fn identity_key_same_page_different_query_collides() {
        let a = identity_key("https://example.com/doc?v=1");
        let b = identity_key("https://example.com/doc?v=2");
        assert_eq!(a, b);
    }

    #[test]
    fn mime_from_extension_handles_query_strings() {
        assert_eq!(mime_from_extension("https://x.test/a.md?dl=1"), "text/markdown");
        assert_eq!(mime_from_extension("plain"), "text/plain");
        assert_eq!(mime_from_extension("report.pdf"), "application/pdf");
    }

    #[test]
    fn resolve_rejects_empty_items() {
        let item = IngestItem {
            text: None,
            url: None,
            source: Some("x".into()),
            base_id: None,
            doc_type: None,
            lang: None,
            path: None,
            repo_id: None,
            repo_url: None,
            item_url: None,
            mime_type: None,
            metadata: None,
        };
        let outcome = resolve_item(&item, &fetch::BatchOutcome::default());
        assert!(outcome.is_err());
    }

    #[test]
    fn resolve_requires_source_for_text() {
        let item = IngestItem {
            text: Some("hello".into()),
            url: None,
            source: None,
            base_id: None,
            doc_type: None,
            lang: None,
            path: None,
            repo_id: None,
            repo_url: None,
            item_url: None,
            mime_type: None,
            metadata: None,
        };
        assert!(resolve_item(&item, &fetch::BatchOutcome::default()).is_err());
    }
}
