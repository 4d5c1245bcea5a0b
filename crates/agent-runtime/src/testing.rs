//! Deterministic completion service for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use crate::completion::{CompletionRequest, CompletionResponse, CompletionService, ToolCall};
use crate::error::ProviderError;

pub type ScriptedReply = Result<CompletionResponse, ProviderError>;

/// Replays queued replies in order and records every request it receives.
///
/// Once the queue is drained it answers with the fallback reply, or with an
/// `InvalidRequest` error when none is set.
#[derive(Debug, Default)]
pub struct ScriptedCompletionService {
    replies: TokioMutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    delay: Option<Duration>,
    requests: TokioMutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl ScriptedCompletionService {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: TokioMutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Plain-text answers, one per call.
    pub fn texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|text| Ok(CompletionResponse::text(text))),
        )
    }

    /// A model that requests the same tool call on every turn.
    pub fn always_tool_call(call: ToolCall) -> Self {
        Self::default().with_fallback(Ok(CompletionResponse::tool_calls(vec![call])))
    }

    pub fn with_fallback(mut self, reply: ScriptedReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, reply: ScriptedReply) {
        self.replies.lock().await.push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().await.last().cloned()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletionService {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.replies.lock().await.pop_front();
        match next {
            Some(reply) => reply,
            None => self.fallback.clone().unwrap_or_else(|| {
                Err(ProviderError::InvalidRequest(
                    "scripted replies exhausted".to_string(),
                ))
            }),
        }
    }
}
