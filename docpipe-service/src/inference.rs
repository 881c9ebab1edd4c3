use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::error::{InferenceError, ServiceError, ServiceResult};

/// Summarization and embedding collaborator
#[async_trait]
pub trait Inference: Send + Sync {
    /// Summarize chunk text, optionally looking at images behind `image_urls`
    async fn summarize(&self, text: &str, image_urls: &[String]) -> ServiceResult<String>;

    /// Embed text into a vector of the configured dimensionality
    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;

    /// Whether the backend currently answers
    async fn health_check(&self) -> bool {
        true
    }
}

/// Inference service API client
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    api_token: Option<String>,
    summarize_timeout: Duration,
    embed_timeout: Duration,
    dimensions: usize,
}

impl HttpInferenceClient {
    /// Create a new inference client
    pub fn new(config: &InferenceConfig) -> ServiceResult<Self> {
        let client = Client::builder().build().map_err(|e| {
            ServiceError::Inference(InferenceError::Connection {
                url: config.base_url.clone(),
                source: e,
            })
        })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            summarize_timeout: Duration::from_secs(config.summarize_timeout_secs),
            embed_timeout: Duration::from_secs(config.embed_timeout_secs),
            dimensions: config.embedding_dimensions,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B, timeout: Duration) -> ServiceResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .authorized(self.client.post(&url))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&url, e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Inference(InferenceError::Status {
                status,
                message,
            }));
        }

        response
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    return transport_error(&url, e);
                }
                InferenceError::InvalidResponse {
                    message: e.to_string(),
                }
            })
            .map_err(ServiceError::from)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl Inference for HttpInferenceClient {
    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Inference health check failed");
                false
            }
        }
    }

    async fn summarize(&self, text: &str, image_urls: &[String]) -> ServiceResult<String> {
        let request = SummarizeRequest {
            chunk_text: text,
            image_urls,
        };
        let response: SummarizeResponse = self
            .post("/summarize", &request, self.summarize_timeout)
            .await?;

        debug!(images = image_urls.len(), "Summarized chunk");
        Ok(response.summary_text)
    }

    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let request = EmbedRequest {
            summarized_text: text,
        };
        let response: EmbedResponse = self.post("/embed", &request, self.embed_timeout).await?;

        if response.embedding_vector.len() != self.dimensions {
            return Err(ServiceError::Inference(InferenceError::InvalidResponse {
                message: format!(
                    "expected {} embedding dimensions, got {}",
                    self.dimensions,
                    response.embedding_vector.len()
                ),
            }));
        }

        Ok(response.embedding_vector)
    }
}

fn transport_error(url: &str, source: reqwest::Error) -> InferenceError {
    if source.is_timeout() {
        InferenceError::Timeout {
            url: url.to_string(),
        }
    } else {
        InferenceError::Connection {
            url: url.to_string(),
            source,
        }
    }
}

// Internal inference API types

#[derive(Debug, Serialize)]
struct SummarizeRequest<'a> {
    chunk_text: &'a str,
    image_urls: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SummarizeResponse {
    summary_text: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    summarized_text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding_vector: Vec<f32>,
}
