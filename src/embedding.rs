//! Embedding backend abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two concrete backends:
//! - **[`OpenAiEmbedder`]** — `POST {base}/embeddings`, batched, with
//!   exponential backoff on 429/5xx and immediate failure on other 4xx.
//! - **[`OllamaEmbedder`]** — `POST {base}/api/embed` for local models.
//!
//! [`embed_batched`] is the ingestion entry point: it slices the input into
//! backend-sized batches, keeps at most `concurrency` requests in flight,
//! and reassembles the output **in input order**. Each returned vector is
//! validated (configured dimension, all values finite) and L2-normalised so
//! cosine distance in the index is a pure dot-product complement.
//!
//! Any individual backend failure aborts the whole call with
//! [`Error::Upstream`] — a half-embedded batch is worse than a retried one.
//! No local caching.

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// An embedding backend. `embed` maps texts to vectors, preserving index.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn dims(&self) -> usize;
    fn model_name(&self) -> &str;
}

/// Build the configured backend.
pub fn create_embedder(config: &EmbeddingConfig, dims: usize) -> Result<Arc<dyn Embedder>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| Error::Upstream(format!("failed to build HTTP client: {}", e)))?;

    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder {
            client,
            config: config.clone(),
            dims,
        })),
        "ollama" => Ok(Arc::new(OllamaEmbedder {
            client,
            config: config.clone(),
            dims,
        })),
        other => Err(Error::Upstream(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Embed `texts` in backend-sized batches with bounded concurrency,
/// preserving input order. This is the only embedding path ingestion uses.
pub async fn embed_batched(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    concurrency: usize,
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let batch_size = batch_size.max(1);
    let batches: Vec<Vec<String>> = texts.chunks(batch_size).map(|b| b.to_vec()).collect();

    // `buffered` (not `buffer_unordered`) keeps completion in submission
    // order, so index alignment falls out for free.
    let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
        .map(|batch| async move { embedder.embed(&batch).await })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    let mut out: Vec<Vec<f32>> = results.into_iter().flatten().collect();
    if out.len() != texts.len() {
        return Err(Error::Upstream(format!(
            "embedding backend returned {} vectors for {} texts",
            out.len(),
            texts.len()
        )));
    }

    for v in &mut out {
        l2_normalize(v);
    }

    Ok(out)
}

/// Validate one backend vector: configured dimension, finite values only.
/// A wrong dimension is the caller-visible `VECTOR_DIM_MISMATCH`, not an
/// upstream failure — it is what a provider switch without re-configuring
/// `VECTOR_DIM` looks like.
fn validate_vector(v: &[f32], dims: usize) -> Result<()> {
    if v.len() != dims {
        return Err(Error::VectorDimMismatch {
            expected: dims,
            got: v.len(),
        });
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(Error::Upstream(
            "embedding backend returned a non-finite value".into(),
        ));
    }
    Ok(())
}

/// Scale to unit length. Zero vectors are left untouched rather than
/// dividing by zero.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ OpenAI backend ============

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    dims: usize,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Upstream("OPENAI_API_KEY not configured".into()))?;

        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let json = post_with_retry(
            &self.client,
            &url,
            &body,
            Some(api_key),
            self.config.max_retries,
        )
        .await?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Upstream("embedding response missing 'data' array".into()))?;

        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let raw = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| Error::Upstream("embedding response missing vector".into()))?;
            let v: Vec<f32> = raw
                .iter()
                .map(|x| x.as_f64().unwrap_or(f64::NAN) as f32)
                .collect();
            validate_vector(&v, self.dims)?;
            out.push(v);
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// ============ Ollama backend ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    dims: usize,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.config.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let json = post_with_retry(&self.client, &url, &body, None, self.config.max_retries).await?;

        let data = json
            .get("embeddings")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Upstream("embedding response missing 'embeddings'".into()))?;

        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let raw = item
                .as_array()
                .ok_or_else(|| Error::Upstream("embedding response row is not an array".into()))?;
            let v: Vec<f32> = raw
                .iter()
                .map(|x| x.as_f64().unwrap_or(f64::NAN) as f32)
                .collect();
            validate_vector(&v, self.dims)?;
            out.push(v);
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// POST JSON with retry. 429 and 5xx back off exponentially (1s, 2s, 4s, …
/// capped at 32s); other 4xx fail immediately; network errors retry.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    bearer: Option<&str>,
    max_retries: u32,
) -> Result<serde_json::Value> {
    let mut last_err: Option<Error> = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response
                        .json()
                        .await
                        .map_err(|e| Error::Upstream(format!("invalid JSON from backend: {}", e)));
                }

                let text = response.text().await.unwrap_or_default();
                let err = Error::Upstream(format!("embedding backend {}: {}", status, text));

                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(Error::Upstream(format!("embedding request failed: {}", e)));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Upstream("embedding failed after retries".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeEmbedder {
        dims: usize,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; self.dims];
                    v[0] = t.len() as f32;
                    v[1] = 1.0;
                    v
                })
                .collect())
        }

        fn dims(&self) -> usize {
            self.dims
        }

        fn model_name(&self) -> &str {
            "fake"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(Error::Upstream("backend down".into()))
        }

        fn dims(&self) -> usize {
            4
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn batched_preserves_order_and_length() {
        let embedder = FakeEmbedder { dims: 4 };
        let texts: Vec<String> = (0..25).map(|i| "x".repeat(i + 1)).collect();
        let out = embed_batched(&embedder, &texts, 4, 3).await.unwrap();
        assert_eq!(out.len(), texts.len());
        for (i, v) in out.iter().enumerate() {
            // After normalisation the ratio of components identifies the input.
            let ratio = v[0] / v[1];
            assert!((ratio - (i as f32 + 1.0)).abs() < 1e-3, "order broken at {}", i);
        }
    }

    #[tokio::test]
    async fn batched_failure_cancels_whole_call() {
        let texts: Vec<String> = (0..10).map(|i| format!("t{}", i)).collect();
        let err = embed_batched(&FailingEmbedder, &texts, 2, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let embedder = FakeEmbedder { dims: 4 };
        let out = embed_batched(&embedder, &[], 8, 2).await.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn vectors_are_unit_length_after_normalise() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_survives_normalise() {
        let mut v = vec![0.0f32; 3];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn validate_rejects_wrong_shape() {
        assert!(matches!(
            validate_vector(&[1.0, 2.0], 3).unwrap_err(),
            Error::VectorDimMismatch {
                expected: 3,
                got: 2
            }
        ));
        assert!(matches!(
            validate_vector(&[1.0, f32::NAN, 2.0], 3).unwrap_err(),
            Error::Upstream(_)
        ));
        assert!(validate_vector(&[1.0, 2.0, 3.0], 3).is_ok());
    }
}
