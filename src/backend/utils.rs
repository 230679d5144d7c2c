use std::pin::Pin;

use futures::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio_util::io::StreamReader;

use crate::models::{ArcEventTx, BackendError, Event};

/// A server-sent event payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SseEvent {
    /// `data:` line
    Data(String),
    /// `error:` line, as llama.cpp reports failures mid-stream
    Error(String),
}

/// Reads the `data:` and `error:` payloads of a server-sent events
/// response body.
pub(crate) struct SseReader {
    lines: Lines<Pin<Box<dyn AsyncBufRead + Send>>>,
}

impl SseReader {
    pub(crate) fn new(res: reqwest::Response) -> Self {
        let stream = res.bytes_stream().map_err(|e| {
            let err_msg = e.to_string();
            std::io::Error::new(std::io::ErrorKind::Interrupted, err_msg)
        });
        let reader: Pin<Box<dyn AsyncBufRead + Send>> = Box::pin(StreamReader::new(stream));
        Self {
            lines: reader.lines(),
        }
    }

    /// Next payload, `None` once the body is exhausted.
    pub(crate) async fn next_event(&mut self) -> Result<Option<SseEvent>, BackendError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(err) => {
                    return Err(BackendError::Generation(format!(
                        "reading response stream: {}",
                        err
                    )));
                }
            };

            log::trace!("streaming response: {}", line);
            let line = line.trim();
            if let Some(data) = line.strip_prefix("data:") {
                return Ok(Some(SseEvent::Data(data.trim().to_string())));
            }
            if let Some(error) = line.strip_prefix("error:") {
                return Ok(Some(SseEvent::Error(error.trim().to_string())));
            }
        }
    }
}

pub(crate) fn request_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        return BackendError::Generation(format!("request timed out: {}", err));
    }
    BackendError::Generation(format!("sending request: {}", err))
}

/// Pushes an event to the engine. A closed receiver means nobody will
/// commit the output, so generation stops.
pub(crate) async fn send(event_tx: &ArcEventTx, event: Event) -> Result<(), BackendError> {
    event_tx
        .send(event)
        .await
        .map_err(|_| BackendError::Generation("event receiver closed".to_string()))
}
