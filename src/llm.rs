//! Client for the generative model API.
//!
//! Generation uses a streamed messages request so file events can be
//! surfaced in real time; repair uses a one-shot request. Both sit behind
//! the [`GenerativeModel`] trait so the pipeline and repair loop can be
//! exercised with test doubles.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::config::ServiceConfig;
use crate::errors::PipelineError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A stream of text deltas. Dropping the stream aborts the request, which
/// is how the deadline guard cuts off an in-flight generation.
pub type DeltaStream = BoxStream<'static, Result<String, PipelineError>>;

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Start a streamed generation, yielding text deltas as they arrive.
    async fn stream_generation(&self, prompt: &str) -> Result<DeltaStream, PipelineError>;

    /// One-shot call returning the full response text. Used for repair,
    /// where the response is consumed whole.
    async fn complete(&self, prompt: &str) -> Result<String, PipelineError>;
}

pub struct ModelClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl ModelClient {
    pub fn new(config: &ServiceConfig) -> Result<Self, PipelineError> {
        let api_key = config
            .model_api_key
            .clone()
            .ok_or_else(|| PipelineError::ModelRequest("ANTHROPIC_API_KEY is not set".into()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_url: config.model_api_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.model_max_tokens,
        })
    }

    fn request(&self, prompt: &str, stream: bool) -> reqwest::RequestBuilder {
        self.http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": self.max_tokens,
                "stream": stream,
                "messages": [{"role": "user", "content": prompt}],
            }))
    }
}

#[async_trait]
impl GenerativeModel for ModelClient {
    async fn stream_generation(&self, prompt: &str) -> Result<DeltaStream, PipelineError> {
        let resp = self
            .request(prompt, true)
            .send()
            .await
            .map_err(|e| PipelineError::ModelRequest(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::ModelRequest(format!(
                "model API returned {}: {}",
                status, body
            )));
        }

        // Reassemble SSE lines from the byte stream and pull out text deltas.
        let deltas = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let out: Vec<Result<String, PipelineError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        let mut events = Vec::new();
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(event) = parse_sse_line(&line) {
                                events.push(event);
                            }
                        }
                        events
                    }
                    Err(e) => vec![Err(PipelineError::ModelStream(e.to_string()))],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(deltas))
    }

    async fn complete(&self, prompt: &str) -> Result<String, PipelineError> {
        let resp = self
            .request(prompt, false)
            .send()
            .await
            .map_err(|e| PipelineError::ModelRequest(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::ModelRequest(format!(
                "model API returned {}: {}",
                status, body
            )));
        }

        let message: MessageResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::ModelRequest(e.to_string()))?;
        Ok(message.text())
    }
}

/// One line of the model's SSE stream. Returns a text delta, an error for
/// explicit error events, or None for framing noise and non-text events.
fn parse_sse_line(line: &str) -> Option<Result<String, PipelineError>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    let event: StreamJson = serde_json::from_str(data).ok()?;
    match event {
        StreamJson::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => Some(Ok(text)),
            Delta::Other => None,
        },
        StreamJson::Error { error } => Some(Err(PipelineError::ModelStream(error.message))),
        StreamJson::Other => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamJson {
    ContentBlockDelta { delta: Delta },
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ResponseBlock>,
}

impl MessageResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                ResponseBlock::Other => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}
