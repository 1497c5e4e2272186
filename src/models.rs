//! Core data model shared by the pipeline and the HTTP surface.
//!
//! The data lifecycle is:
//!
//! ```text
//! IngestItem → resolve (fetch) → classify → chunk() → embed() → Document + Chunks
//!                                                                    ↓
//!                                                     enqueue → Task → worker
//!                                                                    ↓
//!                                                  tier2/tier3 → Entities + summaries
//! ```
//!
//! - A **[`Document`]** is the stored source, unique per
//!   `(collection, identity_key)`.
//! - A **[`Chunk`]** is one embedded fragment, unique per
//!   `(document_id, chunk_index)`, externally addressed as
//!   `<baseId>:<chunkIndex>`.
//! - A **[`Task`]** is one unit of enrichment work in the lease-based queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::Error;

/// Coarse classification of source content, driving tier-1 extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Text,
    Code,
    Article,
    Email,
    Slack,
    Meeting,
    Pdf,
    Image,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Text => "text",
            DocType::Code => "code",
            DocType::Article => "article",
            DocType::Email => "email",
            DocType::Slack => "slack",
            DocType::Meeting => "meeting",
            DocType::Pdf => "pdf",
            DocType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(DocType::Text),
            "code" => Some(DocType::Code),
            "article" => Some(DocType::Article),
            "email" => Some(DocType::Email),
            "slack" => Some(DocType::Slack),
            "meeting" => Some(DocType::Meeting),
            "pdf" => Some(DocType::Pdf),
            "image" => Some(DocType::Image),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chunk enrichment lifecycle, driven by the task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    /// Enrichment was never requested for this chunk.
    None,
    /// A task is queued.
    Pending,
    /// A worker holds the lease.
    Processing,
    /// Tier-2/3 metadata landed.
    Enriched,
    /// The task exhausted its attempts; `tier3_meta._error` has the record.
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::None => "none",
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Processing => "processing",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task queue states. `pending → processing → (completed | pending | dead)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored source, created on first observation of its
/// `(collection, identity_key)` and refreshed on every re-ingest.
#[derive(Debug, Clone, FromRow)]
pub struct Document {
    pub id: Uuid,
    /// Caller-provided or derived external identifier; the prefix of every
    /// chunk id quoted to callers.
    pub base_id: String,
    pub collection: String,
    /// Original URL or path as submitted.
    pub source: String,
    /// Canonicalised source used for idempotent upsert. For URLs this is
    /// origin + path with query and fragment discarded; otherwise verbatim.
    pub identity_key: String,
    pub mime_type: String,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub summary: Option<String>,
    pub summary_short: Option<String>,
    pub summary_medium: Option<String>,
    pub summary_long: Option<String>,
    /// Raw payload inline, unless off-loaded to the blob store.
    pub raw_data: Option<Vec<u8>>,
    /// Blob store key when the payload exceeded the off-load threshold.
    pub raw_key: Option<String>,
    /// SHA-256 of the stored content, stable across identical re-ingests.
    pub payload_checksum: String,
}

/// One embedded fragment of a document.
#[derive(Debug, Clone, FromRow)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Zero-based, contiguous within the document.
    pub chunk_index: i32,
    pub text: String,
    pub doc_type: String,
    pub source: String,
    pub path: Option<String>,
    pub lang: Option<String>,
    pub repo_id: Option<String>,
    pub repo_url: Option<String>,
    pub item_url: Option<String>,
    pub tier1_meta: serde_json::Value,
    pub tier2_meta: Option<serde_json::Value>,
    /// Reserved key `_error` records the final failure of enrichment.
    pub tier3_meta: Option<serde_json::Value>,
    pub enrichment_status: String,
    pub enriched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One unit of enrichment work.
#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: i64,
    pub queue: String,
    pub status: String,
    pub payload: serde_json::Value,
    /// 1-based; bumped on retry, never on claim.
    pub attempt: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Extracted entity, merged across documents.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
}

/// Directed relationship between two entities.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
}

/// Compose the externally quoted chunk id: `<baseId>:<chunkIndex>`.
pub fn chunk_id(base_id: &str, chunk_index: i32) -> String {
    format!("{}:{}", base_id, chunk_index)
}

/// Parse a chunk id back into `(base_id, chunk_index)`.
///
/// The base id may itself contain colons, so the split is on the *last*
/// colon and the trailing segment must be a non-negative integer.
pub fn parse_chunk_id(raw: &str) -> Result<(String, i32), Error> {
    let (base, idx) = raw
        .rsplit_once(':')
        .ok_or_else(|| Error::ChunkIdInvalid(raw.to_string()))?;
    if base.is_empty() {
        return Err(Error::ChunkIdInvalid(raw.to_string()));
    }
    let index: i32 = idx
        .parse()
        .map_err(|_| Error::ChunkIdInvalid(raw.to_string()))?;
    if index < 0 {
        return Err(Error::ChunkIdInvalid(raw.to_string()));
    }
    Ok((base.to_string(), index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_roundtrip() {
        let id = chunk_id("docs/readme", 3);
        assert_eq!(id, "docs/readme:3");
        let (base, idx) = parse_chunk_id(&id).unwrap();
        assert_eq!(base, "docs/readme");
        assert_eq!(idx, 3);
    }

    #[test]
    fn chunk_id_base_with_colons() {
        let (base, idx) = parse_chunk_id("https://example.com/a:b:7").unwrap();
        assert_eq!(base, "https://example.com/a:b");
        assert_eq!(idx, 7);
    }

    #[test]
    fn chunk_id_rejects_garbage() {
        assert!(parse_chunk_id("no-colon").is_err());
        assert!(parse_chunk_id("base:").is_err());
        assert!(parse_chunk_id("base:-1").is_err());
        assert!(parse_chunk_id("base:abc").is_err());
        assert!(parse_chunk_id(":0").is_err());
    }

    #[test]
    fn doc_type_parse_display() {
        for dt in [
            DocType::Text,
            DocType::Code,
            DocType::Article,
            DocType::Email,
            DocType::Slack,
            DocType::Meeting,
            DocType::Pdf,
            DocType::Image,
        ] {
            assert_eq!(DocType::parse(dt.as_str()), Some(dt));
        }
        assert_eq!(DocType::parse("spreadsheet"), None);
    }
}
