//! Environment-driven configuration.
//!
//! All settings are read once at startup by [`Config::from_env`] and passed
//! down by reference; nothing re-reads the environment afterwards. Sections
//! mirror the subsystems: database, embedding backend, chunking, blob store,
//! server. Validation happens at load — with one deliberate exception: the
//! embedding dimension is re-checked against actual backend output on every
//! ingest batch, so switching providers only requires a re-ingest, not a
//! config rework.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Expected embedding dimension; also baked into the `vector(N)` DDL.
    pub vector_dim: usize,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    /// Bearer token for all routes except `/healthz`. Empty disables auth.
    pub api_token: Option<String>,
    /// Gates task enqueueing during ingest.
    pub enrichment_enabled: bool,
    pub blob: Option<BlobConfig>,
    /// Maximum accepted HTTP request body, enforced by the server layer.
    pub body_limit_bytes: usize,
    pub bind: SocketAddr,
}

/// Embedding backend selection and tuning.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` or `"ollama"`.
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Texts per backend request.
    pub batch_size: usize,
    /// Maximum in-flight backend requests per ingest batch.
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Chunker window tuning. The defaults land in the 1–2 KB window the
/// retrieval quality was calibrated for.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub target_chars: usize,
    pub overlap_chars: usize,
}

/// S3-compatible blob store for raw payloads above the threshold.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Raw payloads larger than this are written to the blob store and the
    /// document row keeps only the key.
    pub threshold_bytes: usize,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is not valid: {}", name, e)),
        None => Ok(default),
    }
}

impl Config {
    /// Load and validate configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is missing, a numeric variable
    /// fails to parse, the embedding provider is unknown, or the blob store
    /// section is only partially configured.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env_var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let vector_dim: usize = env_parse("VECTOR_DIM", 768)?;
        if vector_dim == 0 {
            bail!("VECTOR_DIM must be > 0");
        }

        let embedding = EmbeddingConfig::from_env()?;

        let chunking = ChunkingConfig {
            target_chars: env_parse("CHUNK_TARGET_CHARS", 1600)?,
            overlap_chars: env_parse("CHUNK_OVERLAP_CHARS", 200)?,
        };
        if chunking.target_chars == 0 {
            bail!("CHUNK_TARGET_CHARS must be > 0");
        }
        if chunking.overlap_chars >= chunking.target_chars {
            bail!("CHUNK_OVERLAP_CHARS must be smaller than CHUNK_TARGET_CHARS");
        }

        let blob = BlobConfig::from_env()?;

        let bind: SocketAddr = env_var("BIND_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3000".to_string())
            .parse()
            .context("BIND_ADDR is not a valid socket address")?;

        Ok(Self {
            database_url,
            vector_dim,
            embedding,
            chunking,
            api_token: env_var("RAGED_API_TOKEN"),
            enrichment_enabled: env_parse("ENRICHMENT_ENABLED", false)?,
            blob,
            body_limit_bytes: env_parse("BODY_LIMIT_BYTES", 10 * 1024 * 1024)?,
            bind,
        })
    }
}

impl EmbeddingConfig {
    fn from_env() -> Result<Self> {
        let provider = env_var("EMBED_PROVIDER").unwrap_or_else(|| "ollama".to_string());

        let (default_model, default_base) = match provider.as_str() {
            "openai" => ("text-embedding-3-small", "https://api.openai.com/v1"),
            "ollama" => ("nomic-embed-text", "http://localhost:11434"),
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai or ollama.",
                other
            ),
        };

        let api_key = env_var("OPENAI_API_KEY");
        if provider == "openai" && api_key.is_none() {
            bail!("OPENAI_API_KEY must be set when EMBED_PROVIDER=openai");
        }

        Ok(Self {
            provider,
            model: env_var("EMBED_MODEL").unwrap_or_else(|| default_model.to_string()),
            base_url: env_var("EMBED_BASE_URL").unwrap_or_else(|| default_base.to_string()),
            api_key,
            batch_size: env_parse("EMBED_BATCH_SIZE", 64)?,
            concurrency: env_parse("EMBED_CONCURRENCY", 10)?,
            timeout_secs: env_parse("EMBED_TIMEOUT_SECS", 30)?,
            max_retries: env_parse("EMBED_MAX_RETRIES", 5)?,
        })
    }
}

impl BlobConfig {
    /// Blob storage is all-or-nothing: no endpoint means the fallback is
    /// disabled; an endpoint with missing credentials is a config error.
    fn from_env() -> Result<Option<Self>> {
        let endpoint = match env_var("BLOB_STORE_ENDPOINT") {
            Some(e) => e,
            None => return Ok(None),
        };

        let bucket = env_var("BLOB_STORE_BUCKET")
            .context("BLOB_STORE_BUCKET required when BLOB_STORE_ENDPOINT is set")?;
        let access_key = env_var("BLOB_STORE_ACCESS_KEY")
            .context("BLOB_STORE_ACCESS_KEY required when BLOB_STORE_ENDPOINT is set")?;
        let secret_key = env_var("BLOB_STORE_SECRET_KEY")
            .context("BLOB_STORE_SECRET_KEY required when BLOB_STORE_ENDPOINT is set")?;

        Ok(Some(Self {
            endpoint,
            bucket,
            region: env_var("BLOB_STORE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key,
            secret_key,
            threshold_bytes: env_parse("BLOB_STORE_THRESHOLD_BYTES", 1024 * 1024)?,
        }))
    }
}
