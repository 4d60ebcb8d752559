use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use super::{
    Completion, LlmError, LlmProvider, LlmRequest, TextCallback, TokenUsage, ToolResponse,
};
use crate::core::retry::{RetryPolicy, Retryable, retry_with_backoff};
use crate::core::telemetry::{LlmCallRecord, TelemetrySink};

/// Identifies the run a call belongs to, for spans and telemetry.
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    pub session_id: &'a str,
    pub run_id: &'a str,
    pub iteration: u32,
    pub cancel: &'a CancellationToken,
}

/// Told that text already streamed belongs to a failed attempt.
pub type RestartCallback<'a> = &'a mut (dyn FnMut() + Send);

struct StreamSink<'a> {
    on_text: TextCallback<'a>,
    on_restart: RestartCallback<'a>,
    sent: bool,
}

impl StreamSink<'_> {
    fn text(&mut self, fragment: &str) {
        self.sent = true;
        (self.on_text)(fragment);
    }

    fn begin_attempt(&mut self) {
        if std::mem::take(&mut self.sent) {
            (self.on_restart)();
        }
    }
}

/// Front door to the LLM service: timeouts, retries, cancellation, spans and
/// usage telemetry wrapped around a raw [`LlmProvider`].
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    telemetry: Arc<dyn TelemetrySink>,
}

impl LlmGateway {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        retry: RetryPolicy,
        timeout: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            provider,
            retry,
            timeout,
            telemetry,
        }
    }

    pub async fn complete(
        &self,
        request: &LlmRequest,
        ctx: &CallContext<'_>,
    ) -> Result<Completion, LlmError> {
        let provider = &*self.provider;
        self.invoke(ctx, false, |c: &Completion| c.usage, move || {
            provider.complete(request)
        })
        .await
    }

    pub async fn call_tools(
        &self,
        request: &LlmRequest,
        ctx: &CallContext<'_>,
    ) -> Result<ToolResponse, LlmError> {
        let provider = &*self.provider;
        self.invoke(ctx, false, |r: &ToolResponse| r.usage, move || {
            provider.complete_with_tools(request)
        })
        .await
    }

    /// Streaming twin of [`call_tools`](Self::call_tools). Text fragments reach
    /// `on_text` as they arrive; the returned response is the same assembled
    /// object the one-shot path produces. Before a retried attempt that
    /// follows streamed text, `on_restart` fires so the listener can drop the
    /// failed attempt's fragments.
    pub async fn stream_tools(
        &self,
        request: &LlmRequest,
        ctx: &CallContext<'_>,
        on_text: TextCallback<'_>,
        on_restart: RestartCallback<'_>,
    ) -> Result<ToolResponse, LlmError> {
        let provider = &*self.provider;
        let sink = Mutex::new(StreamSink {
            on_text,
            on_restart,
            sent: false,
        });
        let sink = &sink;
        self.invoke(ctx, true, |r: &ToolResponse| r.usage, move || async move {
            if let Ok(mut s) = sink.lock() {
                s.begin_attempt();
            }
            let mut forward = |fragment: &str| {
                if let Ok(mut s) = sink.lock() {
                    s.text(fragment);
                }
            };
            provider.stream_with_tools(request, &mut forward).await
        })
        .await
    }

    async fn invoke<T, F, Fut>(
        &self,
        ctx: &CallContext<'_>,
        streaming: bool,
        usage_of: fn(&T) -> TokenUsage,
        mut op: F,
    ) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let span = info_span!(
            "llm_call",
            session_id = %ctx.session_id,
            run_id = %ctx.run_id,
            iteration = ctx.iteration,
            streaming
        );
        let gateway = self;
        retry_with_backoff(&self.retry, ctx.cancel, "LLM call", move |_attempt| {
            let fut = op();
            async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(LlmError::Cancelled),
                    r = tokio::time::timeout(gateway.timeout, fut) => {
                        r.unwrap_or_else(|_| Err(LlmError::Timeout(gateway.timeout)))
                    }
                };
                gateway.record(ctx, streaming, started.elapsed(), &outcome, usage_of);
                outcome
            }
        })
        .instrument(span)
        .await
    }

    fn record<T>(
        &self,
        ctx: &CallContext<'_>,
        streaming: bool,
        elapsed: Duration,
        outcome: &Result<T, LlmError>,
        usage_of: fn(&T) -> TokenUsage,
    ) {
        let (usage, success, error_class) = match outcome {
            Ok(v) => (usage_of(v), true, None),
            Err(e) => (TokenUsage::default(), false, Some(e.retry_class().as_str())),
        };
        self.telemetry.record_llm_call(&LlmCallRecord {
            provider: self.provider.name().to_string(),
            model: self.provider.model().to_string(),
            session_id: ctx.session_id.to_string(),
            run_id: ctx.run_id.to_string(),
            iteration: ctx.iteration,
            streaming,
            duration_ms: elapsed.as_millis() as u64,
            usage,
            success,
            error_class,
        });
    }
}
