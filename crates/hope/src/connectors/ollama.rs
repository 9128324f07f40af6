//! Ollama generator over HTTP.
//!
//! Streaming uses `/api/generate` with `stream: true`, which answers with
//! newline-delimited JSON objects carrying a `response` fragment until one
//! arrives with `done: true`.

use std::ops::ControlFlow;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use hope_stream::{ConnectorError, GenerationStream, GenerativeConnector};

use crate::config::GeneratorConfig;

/// Request for /api/generate
#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

/// One object from /api/generate, streamed or not
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaConnector {
    client: reqwest::Client,
    base_url: String,
    model: String,
    request_timeout: Duration,
}

impl OllamaConnector {
    pub fn new(config: &GeneratorConfig) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream,
            });
        // No overall timeout on streamed answers
        if stream { request } else { request.timeout(self.request_timeout) }
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, ConnectorError> {
        let resp = self.request(prompt, stream).send().await.map_err(classify)?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ConnectorError::Generation(format!("status {status}: {body}")));
        }
        Ok(resp)
    }
}

fn classify(e: reqwest::Error) -> ConnectorError {
    if e.is_connect() || e.is_timeout() {
        ConnectorError::Unavailable(e.to_string())
    } else {
        ConnectorError::Generation(e.to_string())
    }
}

#[async_trait]
impl GenerativeConnector for OllamaConnector {
    async fn generate(&self, prompt: &str) -> Result<String, ConnectorError> {
        let resp = self.send(prompt, false).await?;
        let body: GenerateResponse = resp.json().await.map_err(classify)?;
        match body.error {
            Some(error) => Err(ConnectorError::Generation(error)),
            None => Ok(body.response),
        }
    }

    async fn generate_stream(&self, prompt: &str) -> Result<GenerationStream, ConnectorError> {
        let resp = self.send(prompt, true).await?;
        let (tx, rx) = mpsc::channel(64);

        let bytes = Box::pin(resp.bytes_stream().map(|chunk| chunk.map_err(classify)));
        tokio::spawn(forward(bytes, tx));

        Ok(GenerationStream::new(Box::pin(ReceiverStream::new(rx))))
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Forward fragments of an NDJSON body until the done marker, an error or
/// the consumer going away. A body that ends early is an error.
async fn forward<S, B>(mut bytes: S, tx: mpsc::Sender<Result<String, ConnectorError>>)
where
    S: Stream<Item = Result<B, ConnectorError>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut lines = LineBuffer::default();
    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        for line in lines.push(chunk.as_ref()) {
            if deliver(&line, &tx).await.is_break() {
                return;
            }
        }
    }
    if let Some(line) = lines.finish() {
        if deliver(&line, &tx).await.is_break() {
            return;
        }
    }

    warn!("Ollama stream ended without a done marker");
    let _ = tx
        .send(Err(ConnectorError::Generation(
            "stream ended without a done marker".into(),
        )))
        .await;
}

async fn deliver(line: &str, tx: &mpsc::Sender<Result<String, ConnectorError>>) -> ControlFlow<()> {
    match parse_line(line) {
        Some(Fragment::Text { text, last }) => {
            if tx.send(Ok(text)).await.is_err() {
                debug!("Ollama stream dropped by consumer");
                return ControlFlow::Break(());
            }
            if last {
                return ControlFlow::Break(());
            }
        }
        Some(Fragment::Done) => return ControlFlow::Break(()),
        Some(Fragment::Failed(error)) => {
            let _ = tx.send(Err(error)).await;
            return ControlFlow::Break(());
        }
        None => {}
    }
    ControlFlow::Continue(())
}

/// Splits a byte stream into complete lines.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever trails the last newline.
    fn finish(self) -> Option<String> {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[derive(Debug, PartialEq)]
enum Fragment {
    /// `last` when the same object carries the done marker
    Text { text: String, last: bool },
    Done,
    Failed(ConnectorError),
}

fn parse_line(line: &str) -> Option<Fragment> {
    let parsed: GenerateResponse = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "Skipping malformed Ollama line");
            return None;
        }
    };
    if let Some(error) = parsed.error {
        return Some(Fragment::Failed(ConnectorError::Generation(error)));
    }
    if !parsed.response.is_empty() {
        // The final object usually has an empty response
        return Some(Fragment::Text {
            text: parsed.response,
            last: parsed.done,
        });
    }
    parsed.done.then_some(Fragment::Done)
}
