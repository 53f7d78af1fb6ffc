//! Tool invocation plumbing.
//!
//! Wraps the external `ToolInvoker` with the concerns the core owns:
//! per-tool token-bucket rate limiting (sleeps the calling dispatcher and
//! only it), token/cost metering, per-call timeouts and bounded retry of
//! retryable failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::ports::{ToolCall, ToolError, ToolErrorKind, ToolInvoker, ToolName, ToolResponse};
use crate::services::config::{RateLimit, ToolsConfig};
use crate::services::metrics::Metrics;

/// Backoff schedule for retryable tool failures.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(2)];

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(limit: &RateLimit) -> Self {
        Self {
            capacity: limit.capacity.max(1.0),
            tokens: limit.capacity.max(1.0),
            refill_per_sec: limit.refill_per_sec.max(0.001),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, returning how long the caller must sleep first.
    fn take(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

/// Per-tool token buckets. Tools without a configured limit pass through.
pub struct ToolRateLimiter {
    buckets: Mutex<HashMap<ToolName, Bucket>>,
}

impl ToolRateLimiter {
    pub fn new(config: &ToolsConfig) -> Self {
        let mut buckets = HashMap::new();
        for (name, limit) in &config.rate_limits {
            if let Some(tool) = ToolName::from_str(name) {
                buckets.insert(tool, Bucket::new(limit));
            } else {
                warn!(tool = %name, "ignoring rate limit for unknown tool");
            }
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Acquire a slot for `tool`, sleeping the caller when the bucket is dry.
    pub async fn acquire(&self, tool: ToolName) {
        let wait = {
            let mut buckets = self.buckets.lock().await;
            match buckets.get_mut(&tool) {
                Some(bucket) => bucket.take(Instant::now()),
                None => Duration::ZERO,
            }
        };
        if !wait.is_zero() {
            debug!(tool = %tool, wait_ms = wait.as_millis() as u64, "tool rate limit, sleeping caller");
            tokio::time::sleep(wait).await;
        }
    }
}

/// `ToolInvoker` decorator owned by the service: rate limit, per-call
/// timeout, metrics. Retry policy lives in [`invoke_with_retry`] so callers
/// that must not retry (already inside a retry loop) can bypass it.
pub struct MeteredInvoker {
    inner: Arc<dyn ToolInvoker>,
    limiter: ToolRateLimiter,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl MeteredInvoker {
    pub fn new(
        inner: Arc<dyn ToolInvoker>,
        config: &ToolsConfig,
        metrics: Arc<Metrics>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            inner,
            limiter: ToolRateLimiter::new(config),
            metrics,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl ToolInvoker for MeteredInvoker {
    async fn invoke(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        self.limiter.acquire(call.tool).await;

        let tool = call.tool;
        let timeout_secs = self.timeout.as_secs();
        let started = Instant::now();

        let result = tokio::select! {
            result = tokio::time::timeout(self.timeout, self.inner.invoke(call, cancel)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::timeout(timeout_secs)),
                }
            }
            _ = cancel.cancelled() => Err(ToolError {
                kind: ToolErrorKind::Provider,
                retryable: false,
                message: "cancelled".to_string(),
            }),
        };

        match &result {
            Ok(response) => {
                self.metrics
                    .record_tokens(response.input_tokens, response.output_tokens);
                self.metrics.record_cost("USD", response.cost);
                self.metrics.record_request_duration(
                    tool.as_str(),
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(err) => {
                self.metrics.record_error(tool.as_str(), &err.kind.to_string());
            }
        }
        result
    }
}

/// Attaches a run's per-tool provider/model overrides to outgoing calls.
/// The override content is opaque to the core; the tool layer interprets it.
pub struct OverridingInvoker {
    inner: Arc<dyn ToolInvoker>,
    overrides: HashMap<String, crate::domain::models::ToolOverride>,
}

impl OverridingInvoker {
    pub fn new(
        inner: Arc<dyn ToolInvoker>,
        overrides: HashMap<String, crate::domain::models::ToolOverride>,
    ) -> Self {
        Self { inner, overrides }
    }
}

#[async_trait]
impl ToolInvoker for OverridingInvoker {
    async fn invoke(
        &self,
        mut call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        if call.overrides.is_none() {
            if let Some(found) = self.overrides.get(call.tool.as_str()) {
                call.overrides = Some(found.clone());
            }
        }
        self.inner.invoke(call, cancel).await
    }
}

/// Per-task accounting decorator. The dispatcher wraps the shared invoker
/// with one of these so tokens and cost land in the task's stats as well as
/// the process metrics.
pub struct UsageTrackingInvoker {
    inner: Arc<dyn ToolInvoker>,
    input_tokens: std::sync::atomic::AtomicU64,
    output_tokens: std::sync::atomic::AtomicU64,
    cost_micros: std::sync::atomic::AtomicU64,
}

impl UsageTrackingInvoker {
    pub fn new(inner: Arc<dyn ToolInvoker>) -> Self {
        Self {
            inner,
            input_tokens: Default::default(),
            output_tokens: Default::default(),
            cost_micros: Default::default(),
        }
    }

    /// (input tokens, output tokens, cost) consumed so far.
    pub fn usage(&self) -> (u64, u64, f64) {
        use std::sync::atomic::Ordering::Relaxed;
        (
            self.input_tokens.load(Relaxed),
            self.output_tokens.load(Relaxed),
            self.cost_micros.load(Relaxed) as f64 / 1_000_000.0,
        )
    }
}

#[async_trait]
impl ToolInvoker for UsageTrackingInvoker {
    async fn invoke(
        &self,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> Result<ToolResponse, ToolError> {
        use std::sync::atomic::Ordering::Relaxed;
        let response = self.inner.invoke(call, cancel).await?;
        self.input_tokens.fetch_add(response.input_tokens, Relaxed);
        self.output_tokens.fetch_add(response.output_tokens, Relaxed);
        self.cost_micros
            .fetch_add((response.cost * 1_000_000.0).max(0.0) as u64, Relaxed);
        Ok(response)
    }
}

/// Invoke with bounded retry of retryable failures (2 retries, 500 ms then
/// 2 s backoff). Non-retryable errors propagate immediately.
pub async fn invoke_with_retry(
    invoker: &dyn ToolInvoker,
    call: ToolCall,
    cancel: &CancellationToken,
) -> Result<ToolResponse, ToolError> {
    let mut attempt = 0;
    loop {
        match invoker.invoke(call.clone(), cancel).await {
            Ok(response) => return Ok(response),
            Err(err) if err.retryable && attempt < RETRY_BACKOFF.len() => {
                warn!(
                    tool = %call.tool,
                    attempt = attempt + 1,
                    error = %err,
                    "retryable tool failure, backing off"
                );
                tokio::time::sleep(RETRY_BACKOFF[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FlakyInvoker {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl ToolInvoker for FlakyInvoker {
        async fn invoke(
            &self,
            _call: ToolCall,
            _cancel: &CancellationToken,
        ) -> Result<ToolResponse, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ToolError::provider("boom", true))
            } else {
                Ok(ToolResponse {
                    text: "ok".into(),
                    input_tokens: 10,
                    output_tokens: 5,
                    cost: 0.01,
                })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let invoker = FlakyInvoker {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        };
        let call = ToolCall::new(ToolName::SubtaskPlanner, Uuid::new_v4(), "plan");
        let cancel = CancellationToken::new();
        let response = invoke_with_retry(&invoker, call, &cancel).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let invoker = FlakyInvoker {
            calls: AtomicUsize::new(0),
            fail_first: 10,
        };
        let call = ToolCall::new(ToolName::Grounding, Uuid::new_v4(), "locate");
        let cancel = CancellationToken::new();
        let err = invoke_with_retry(&invoker, call, &cancel).await.unwrap_err();
        assert!(err.retryable);
        // Initial attempt plus two retries.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        struct Fatal;
        #[async_trait]
        impl ToolInvoker for Fatal {
            async fn invoke(
                &self,
                _call: ToolCall,
                _cancel: &CancellationToken,
            ) -> Result<ToolResponse, ToolError> {
                Err(ToolError::provider("bad request", false))
            }
        }
        let call = ToolCall::new(ToolName::Grounding, Uuid::new_v4(), "locate");
        let err = invoke_with_retry(&Fatal, call, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_delays_when_dry() {
        let mut config = ToolsConfig::default();
        config.rate_limits.insert(
            "grounding".to_string(),
            RateLimit {
                capacity: 1.0,
                refill_per_sec: 10.0,
            },
        );
        let limiter = ToolRateLimiter::new(&config);

        let start = Instant::now();
        limiter.acquire(ToolName::Grounding).await;
        limiter.acquire(ToolName::Grounding).await;
        // Second acquire had to wait ~100 ms for a refill.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_unlimited_tools_pass_through() {
        let limiter = ToolRateLimiter::new(&ToolsConfig::default());
        let start = Instant::now();
        for _ in 0..20 {
            limiter.acquire(ToolName::SubtaskPlanner).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    struct NeverReturns;

    #[async_trait]
    impl ToolInvoker for NeverReturns {
        async fn invoke(
            &self,
            _call: ToolCall,
            _cancel: &CancellationToken,
        ) -> Result<ToolResponse, ToolError> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_metered_invoker_times_out_as_retryable() {
        let invoker = MeteredInvoker::new(
            Arc::new(NeverReturns),
            &ToolsConfig::default(),
            Metrics::disabled(),
            2,
        );
        let call = ToolCall::new(ToolName::ActionGenerator, Uuid::new_v4(), "hang");
        let err = invoker
            .invoke(call, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::domain::ports::ToolErrorKind::Timeout);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_metered_invoker_observes_cancellation() {
        let invoker = MeteredInvoker::new(
            Arc::new(NeverReturns),
            &ToolsConfig::default(),
            Metrics::disabled(),
            600,
        );
        let cancel = CancellationToken::new();
        let call = ToolCall::new(ToolName::ActionGenerator, Uuid::new_v4(), "hang");
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let err = invoker.invoke(call, &cancel).await.unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_usage_tracker_accumulates() {
        let tracker = UsageTrackingInvoker::new(Arc::new(FlakyInvoker {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        }));
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let call = ToolCall::new(ToolName::Grounding, Uuid::new_v4(), "where");
            tracker.invoke(call, &cancel).await.unwrap();
        }
        let (input, output, cost) = tracker.usage();
        assert_eq!(input, 30);
        assert_eq!(output, 15);
        assert!((cost - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_overriding_invoker_attaches_overrides() {
        use crate::domain::models::ToolOverride;

        struct Capture {
            seen: std::sync::Mutex<Option<Option<ToolOverride>>>,
        }
        #[async_trait]
        impl ToolInvoker for Capture {
            async fn invoke(
                &self,
                call: ToolCall,
                _cancel: &CancellationToken,
            ) -> Result<ToolResponse, ToolError> {
                *self.seen.lock().unwrap() = Some(call.overrides);
                Ok(ToolResponse::default())
            }
        }

        let capture = Arc::new(Capture {
            seen: std::sync::Mutex::new(None),
        });
        let mut overrides = HashMap::new();
        overrides.insert(
            "grounding".to_string(),
            ToolOverride {
                model_name: Some("pixel-locator-2".to_string()),
                ..Default::default()
            },
        );
        let invoker = OverridingInvoker::new(Arc::clone(&capture) as Arc<dyn ToolInvoker>, overrides);

        let call = ToolCall::new(ToolName::Grounding, Uuid::new_v4(), "where");
        invoker.invoke(call, &CancellationToken::new()).await.unwrap();
        let seen = capture.seen.lock().unwrap().clone().flatten();
        assert_eq!(seen.unwrap().model_name.as_deref(), Some("pixel-locator-2"));

        // Tools without an override pass through untouched.
        let call = ToolCall::new(ToolName::SubtaskPlanner, Uuid::new_v4(), "plan");
        invoker.invoke(call, &CancellationToken::new()).await.unwrap();
        assert!(capture.seen.lock().unwrap().clone().flatten().is_none());
    }

    #[tokio::test]
    async fn test_metered_invoker_records_tokens() {
        let metrics = Arc::new(Metrics::new(true, 1));
        let invoker = MeteredInvoker::new(
            Arc::new(FlakyInvoker {
                calls: AtomicUsize::new(0),
                fail_first: 0,
            }),
            &ToolsConfig::default(),
            Arc::clone(&metrics),
            120,
        );
        let call = ToolCall::new(ToolName::ActionGenerator, Uuid::new_v4(), "act");
        invoker.invoke(call, &CancellationToken::new()).await.unwrap();

        assert_eq!(metrics.tokens_consumed_total.get("input"), 10);
        assert_eq!(metrics.tokens_consumed_total.get("output"), 5);
        assert!(metrics.cost_total.get("USD") > 0.0);
    }
}
