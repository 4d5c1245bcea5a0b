use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::completion::{CompletionRequest, CompletionResponse, CompletionService};
use crate::error::ProviderError;
use crate::settings::RetryPolicy;

/// Call the completion service with a per-attempt timeout, retrying
/// transient failures with exponential backoff.
///
/// Non-transient failures return immediately. Once the attempt budget is
/// spent the last failure is wrapped in [`ProviderError::Exhausted`].
pub async fn complete_with_retry(
    service: &dyn CompletionService,
    request: &CompletionRequest,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<CompletionResponse, ProviderError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, service.complete(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        match outcome {
            Ok(response) => {
                debug!(
                    target: "agent_runtime::retry",
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    tool_calls = response.tool_calls.len(),
                    "completion succeeded"
                );
                return Ok(response);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    target: "agent_runtime::retry",
                    attempt,
                    max_attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient completion failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_transient() => {
                warn!(
                    target: "agent_runtime::retry",
                    attempts = attempt,
                    error = %err,
                    "completion retries exhausted"
                );
                return Err(ProviderError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            Err(err) => {
                warn!(
                    target: "agent_runtime::retry",
                    attempt,
                    error = %err,
                    "completion failed"
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ModelOptions;
    use crate::testing::ScriptedCompletionService;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system_prompt: "You are terse.".into(),
            messages: Vec::new(),
            tools: Vec::new(),
            options: ModelOptions::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let service = ScriptedCompletionService::new([
            Err(ProviderError::Transient("503".into())),
            Err(ProviderError::RateLimited("429".into())),
            Ok(CompletionResponse::text("ok")),
        ]);
        let response = complete_with_retry(
            &service,
            &request(),
            &RetryPolicy::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(response.content.as_deref(), Some("ok"));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let service = ScriptedCompletionService::default()
            .with_fallback(Err(ProviderError::Transient("connection reset".into())));
        let err = complete_with_retry(
            &service,
            &request(),
            &RetryPolicy::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Exhausted { attempts: 3, .. }));
        assert_eq!(service.calls(), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let service = ScriptedCompletionService::new([Err(ProviderError::Authentication(
            "bad key".into(),
        ))]);
        let err = complete_with_retry(
            &service,
            &request(),
            &RetryPolicy::default(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err, ProviderError::Authentication("bad key".into()));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let service = ScriptedCompletionService::texts(["late", "late"])
            .with_delay(Duration::from_secs(10));
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let err = complete_with_retry(&service, &request(), &policy, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ProviderError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(*last, ProviderError::Timeout(Duration::from_secs(1)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
