use crate::types::{ChatBackend, ChatRequest, StreamChunk};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Result of one structured generation attempt.
///
/// Callers treat `Cancelled` and `Failed` identically: no usable result, no
/// side effects this turn. The variants are kept separate so cancellation is
/// never logged as an error.
#[derive(Debug)]
pub enum GenOutcome<T> {
    Complete(T),
    Cancelled,
    Failed,
}

impl<T> GenOutcome<T> {
    pub fn complete(self) -> Option<T> {
        match self {
            Self::Complete(v) => Some(v),
            Self::Cancelled | Self::Failed => None,
        }
    }
}

/// Run one streaming generation to completion, polling `cancel` between
/// chunks, and parse the accumulated text as `T`.
///
/// A token cancelled before the call starts short-circuits without touching
/// the backend. Cancellation observed mid-stream drops the stream, which
/// aborts the backend call.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn generate<T: DeserializeOwned>(
    backend: &dyn ChatBackend,
    cancel: &CancellationToken,
    request: ChatRequest,
) -> GenOutcome<T> {
    if cancel.is_cancelled() {
        return GenOutcome::Cancelled;
    }

    let mut stream = match backend.chat_stream(request).await {
        Ok(stream) => stream,
        Err(e) => {
            if cancel.is_cancelled() {
                return GenOutcome::Cancelled;
            }
            tracing::warn!(error = %e, "generation request failed");
            return GenOutcome::Failed;
        }
    };

    let mut buffer = String::new();
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                drop(stream);
                return GenOutcome::Cancelled;
            }
            next = futures_util::StreamExt::next(&mut stream) => next,
        };

        match next {
            Some(Ok(StreamChunk::Delta { content })) => buffer.push_str(&content),
            Some(Ok(StreamChunk::Done)) | None => break,
            Some(Err(e)) => {
                if cancel.is_cancelled() {
                    return GenOutcome::Cancelled;
                }
                tracing::warn!(error = %e, "generation stream failed");
                return GenOutcome::Failed;
            }
        }
    }

    if cancel.is_cancelled() {
        return GenOutcome::Cancelled;
    }

    tracing::debug!(response = %buffer, "generation complete");
    match serde_json::from_str::<T>(&buffer) {
        Ok(parsed) => GenOutcome::Complete(parsed),
        Err(e) => {
            tracing::warn!(error = %e, response = %buffer, "generation output did not parse");
            GenOutcome::Failed
        }
    }
}
