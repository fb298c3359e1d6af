use crate::error::{LlmError, Result};
use crate::retry::RetryPolicy;
use crate::types::{EmbeddingRequest, EmbeddingResponse, GenerateRequest, GenerateResponse};
use std::time::Duration;

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OllamaClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(base_url: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Non-streaming completion. Returns the raw model text.
    #[tracing::instrument(level = "info", skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<String> {
        if model.trim().is_empty() {
            return Err(LlmError::InvalidInput("model must not be empty".to_string()));
        }
        let req = GenerateRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            stream: false,
        };
        let url = format!("{}/api/generate", self.base_url);
        let resp: GenerateResponse = self.post_json("ollama.generate", &url, &req).await?;
        Ok(resp.response)
    }

    #[tracing::instrument(level = "debug", skip(self, text), fields(text_len = text.len()))]
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(LlmError::InvalidInput(
                "cannot embed empty text".to_string(),
            ));
        }
        let req = EmbeddingRequest {
            model: model.to_string(),
            prompt: text.to_string(),
        };
        let url = format!("{}/api/embeddings", self.base_url);
        let resp: EmbeddingResponse = self.post_json("ollama.embeddings", &url, &req).await?;
        if resp.embedding.is_empty() {
            return Err(LlmError::ResponseFormat(
                "ollama returned an empty embedding".to_string(),
            ));
        }
        Ok(resp.embedding)
    }

    async fn post_json<Req, Resp>(&self, label: &str, url: &str, req: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let http = &self.http;
        let attempt = || async move {
            let response = http.post(url).json(req).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(LlmError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            serde_json::from_str::<Resp>(&body).map_err(LlmError::from)
        };
        self.retry
            .run_while(label, attempt, LlmError::is_transient)
            .await
            .map_err(|(attempts, e)| {
                if e.is_transient() {
                    LlmError::Exhausted {
                        attempts,
                        last_error: format!("{label}: {e}"),
                    }
                } else {
                    e
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = OllamaClient::new(
            "http://localhost:11434/",
            Duration::from_secs(1),
            RetryPolicy::none(),
        );
        assert_eq!(c.base_url(), "http://localhost:11434");
    }

    #[tokio::test]
    async fn generate_rejects_empty_model() {
        let c = OllamaClient::new("http://127.0.0.1:9", Duration::from_secs(1), RetryPolicy::none());
        let err = c.generate(" ", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidInput(_)));
    }

    /// Serves `response` to every connection and counts them.
    async fn canned_server(response: &'static str) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn client_error_status_is_not_retried() {
        let (url, hits) = canned_server(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 27\r\nconnection: close\r\n\r\n{\"error\":\"model not found\"}",
        )
        .await;
        let c = OllamaClient::new(&url, Duration::from_secs(2), RetryPolicy::new(4, Duration::ZERO));
        let err = c.generate("missing-model", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 404, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_not_retried() {
        let (url, hits) = canned_server(
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
        )
        .await;
        let c = OllamaClient::new(&url, Duration::from_secs(2), RetryPolicy::new(4, Duration::ZERO));
        let err = c.embed("all-minilm", "disk full").await.unwrap_err();
        assert!(matches!(err, LlmError::ResponseFormat(_)), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_error_status_is_retried() {
        let (url, hits) = canned_server(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let c = OllamaClient::new(&url, Duration::from_secs(2), RetryPolicy::new(3, Duration::ZERO));
        let err = c.generate("llama3:latest", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { attempts: 3, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries() {
        let c = OllamaClient::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            RetryPolicy::new(2, Duration::ZERO),
        );
        let err = c.embed("all-minilm", "disk full").await.unwrap_err();
        match err {
            LlmError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
