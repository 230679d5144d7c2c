use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::models::{EngineError, MessageSnapshot};

/// Prefix of the in-band fragment that reports a failure mid-stream. Text
/// received before it is not a final answer.
pub const ERROR_MARKER: &str = "[ERROR]";

pub fn error_fragment(detail: &str) -> String {
    format!("{} {}", ERROR_MARKER, detail)
}

pub fn is_error_fragment(fragment: &str) -> bool {
    fragment.starts_with(ERROR_MARKER)
}

pub(crate) type CommitResult = Result<MessageSnapshot, EngineError>;

/// Fragments of one generated answer, in production order.
///
/// The sequence is finite and not restartable. Dropping it detaches the
/// caller; generation still runs to completion and is committed.
pub struct ResponseStream {
    session_id: String,
    message_idx: usize,
    fragments: mpsc::UnboundedReceiver<String>,
    commit: CommitHandle,
}

/// Resolves once the turn has been durably committed, or the commit was
/// abandoned.
pub struct CommitHandle {
    rx: oneshot::Receiver<CommitResult>,
}

impl ResponseStream {
    pub(crate) fn new(
        session_id: &str,
        message_idx: usize,
        fragments: mpsc::UnboundedReceiver<String>,
        commit: oneshot::Receiver<CommitResult>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_idx,
            fragments,
            commit: CommitHandle { rx: commit },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_idx(&self) -> usize {
        self.message_idx
    }

    pub async fn next_fragment(&mut self) -> Option<String> {
        self.fragments.recv().await
    }

    /// Stops receiving fragments and keeps only the commit outcome.
    pub fn into_commit(self) -> CommitHandle {
        self.commit
    }

    /// Drains the stream, then waits for the commit.
    pub async fn finish(mut self) -> (Vec<String>, CommitResult) {
        let mut fragments = vec![];
        while let Some(fragment) = self.fragments.recv().await {
            fragments.push(fragment);
        }
        (fragments, self.commit.wait().await)
    }
}

impl Stream for ResponseStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.fragments.poll_recv(cx)
    }
}

impl CommitHandle {
    pub async fn wait(self) -> CommitResult {
        self.rx
            .await
            .map_err(|_| EngineError::internal("commit task ended without a result"))
            .and_then(|r| r)
    }
}
