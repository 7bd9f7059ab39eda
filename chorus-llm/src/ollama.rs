use crate::error::{LlmError, Result};
use crate::types::{ChatBackend, ChatRequest, ChunkStream, StreamChunk, Turn};
use bytes::Bytes;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

/// How long the backend should keep the model loaded between calls.
pub const KEEP_ALIVE_SECS: u64 = 30 * 60;

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    host: String,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.trim_end_matches('/').to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait::async_trait]
impl ChatBackend for OllamaClient {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        let req = OllamaChatRequest::new(&request);

        let response = self
            .http
            .post(format!("{}/api/chat", self.host))
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!(
                "ollama chat status={status} body={body}"
            )));
        }

        Ok(Box::pin(decode_chunks(response.bytes_stream())))
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    stream: bool,
    keep_alive: u64,
    format: &'a serde_json::Value,
}

impl<'a> OllamaChatRequest<'a> {
    fn new(request: &'a ChatRequest) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            keep_alive: KEEP_ALIVE_SECS,
            format: &request.format,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    message: Option<OllamaStreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamMessage {
    #[serde(default)]
    content: String,
}

/// Decode the newline-delimited JSON stream Ollama produces into
/// [`StreamChunk`] values. The stream ends after the `done: true` line.
fn decode_chunks<S>(bytes_stream: S) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures_util::stream::unfold(
        (bytes_stream, String::new(), false),
        |(mut stream, mut buffer, mut finished)| async move {
            loop {
                if finished {
                    return None;
                }

                if let Some(idx) = buffer.find('\n') {
                    let raw = buffer[..idx].trim().to_string();
                    buffer = buffer[idx + 1..].to_string();
                    if raw.is_empty() {
                        continue;
                    }

                    let line: OllamaStreamLine = match serde_json::from_str(&raw) {
                        Ok(v) => v,
                        Err(e) => {
                            return Some((
                                Err(LlmError::StreamParse(format!(
                                    "ollama chunk json error={e} data={raw}"
                                ))),
                                (stream, buffer, finished),
                            ));
                        }
                    };

                    if line.done {
                        finished = true;
                        return Some((Ok(StreamChunk::Done), (stream, buffer, finished)));
                    }

                    let content = line.message.map(|m| m.content).unwrap_or_default();
                    if content.is_empty() {
                        continue;
                    }
                    return Some((
                        Ok(StreamChunk::Delta { content }),
                        (stream, buffer, finished),
                    ));
                }

                match stream.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        continue;
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(LlmError::Http(e.to_string())),
                            (stream, buffer, finished),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}
