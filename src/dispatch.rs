//! End-to-end request driving: routing attempt loop, unary and streaming
//! dispatch, usage attribution, and health reporting.
//!
//! The streaming path locks in its candidate at the first upstream chunk.
//! From that point the bytes flow to the client verbatim and no failover is
//! permitted; a later upstream error truncates the client's stream. Failures
//! before the first chunk are indistinguishable from unary failures and move
//! on to the next candidate.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::clock::Clock;
use crate::counters::{CounterStore, Scope, UsageDelta};
use crate::error::{Result, SwitchboardError};
use crate::health::HealthController;
use crate::limits::hard_breach_after;
use crate::providers::{ChunkStream, UpstreamFailure, UsageReport};
use crate::registry::{ProviderEntry, Registry, RegistrySnapshot};
use crate::router::{check_candidate, route, Candidate};
use crate::types::{estimate_tokens, ChatCompletionRequest, ChatCompletionResponse};
use crate::utils::sse::SseUsageScanner;

pub struct Dispatcher {
    registry: Arc<Registry>,
    counters: Arc<CounterStore>,
    health: Arc<HealthController>,
    clock: Arc<dyn Clock>,
}

/// A streaming reply whose candidate is locked in. The stream yields the
/// upstream bytes unchanged, starting with the chunk that committed it.
pub struct CommittedStream {
    pub provider_id: String,
    pub stream: BoxStream<'static, std::result::Result<Bytes, std::io::Error>>,
}

pub enum DispatchReply {
    Unary {
        provider_id: String,
        response: ChatCompletionResponse,
    },
    Streaming(CommittedStream),
}

impl std::fmt::Debug for DispatchReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchReply::Unary {
                provider_id,
                response,
            } => f
                .debug_struct("Unary")
                .field("provider_id", provider_id)
                .field("response", response)
                .finish(),
            DispatchReply::Streaming(committed) => f
                .debug_struct("Streaming")
                .field("provider_id", &committed.provider_id)
                .finish(),
        }
    }
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        counters: Arc<CounterStore>,
        health: Arc<HealthController>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            counters,
            health,
            clock,
        }
    }

    /// Drives one request to completion or to a terminal error.
    ///
    /// `bearer_token` is the client-supplied credential, captured into the
    /// dispatch audit event and never validated or inspected.
    pub async fn dispatch(
        &self,
        request: ChatCompletionRequest,
        selector: Option<&str>,
        bearer_token: Option<&str>,
    ) -> Result<DispatchReply> {
        let snapshot = self.registry.load();
        let plan = route(
            &snapshot,
            &self.health,
            &self.counters,
            selector,
            &request.model,
        )?;

        tracing::info!(
            target: "switchboard::dispatch",
            model = %request.model,
            selector = selector.unwrap_or(""),
            via_virtual = plan.virtual_id.as_deref().unwrap_or(""),
            candidates = plan.candidates.len(),
            stream = request.wants_stream(),
            bearer_token = bearer_token.unwrap_or(""),
            "dispatch.request"
        );

        let streaming = request.wants_stream();
        let mut attempts = 0usize;
        let mut last_error: Option<String> = None;

        for candidate in &plan.candidates {
            // State may have moved since the plan was built.
            if let Err(reason) =
                check_candidate(&snapshot, &self.health, &self.counters, candidate)
            {
                tracing::debug!(
                    provider = %candidate.provider_id,
                    reason = %reason,
                    "candidate no longer eligible at dispatch time"
                );
                continue;
            }
            let Some(entry) = snapshot.provider(&candidate.provider_id) else {
                continue;
            };
            attempts += 1;

            let failure = if streaming {
                match entry.adapter.send_streaming(&request).await {
                    Ok(upstream) => {
                        match self
                            .try_commit_stream(upstream, &snapshot, entry, candidate, &request)
                            .await
                        {
                            Ok(committed) => return Ok(DispatchReply::Streaming(committed)),
                            Err(failure) => failure,
                        }
                    }
                    Err(failure) => failure,
                }
            } else {
                match entry.adapter.send_unary(&request).await {
                    Ok(reply) => {
                        self.settle_success(&snapshot, entry, candidate, &reply.usage);
                        tracing::info!(
                            target: "switchboard::dispatch",
                            provider = %candidate.provider_id,
                            input_tokens = reply.usage.input_tokens,
                            output_tokens = reply.usage.output_tokens,
                            estimated = reply.usage.estimated,
                            "dispatch.response"
                        );
                        return Ok(DispatchReply::Unary {
                            provider_id: candidate.provider_id.clone(),
                            response: reply.response,
                        });
                    }
                    Err(failure) => failure,
                }
            };

            if let Some(terminal) = self.settle_failure(entry, candidate, &failure) {
                return Err(terminal);
            }
            last_error = Some(failure.to_string());
        }

        match last_error {
            Some(last_error) => Err(SwitchboardError::UpstreamExhausted {
                attempts,
                last_error,
            }),
            None => Err(SwitchboardError::NoProviderAvailable {
                reason: "every candidate became ineligible before dispatch".to_string(),
            }),
        }
    }

    /// Usage attribution for a completed request, followed by post-flight
    /// token/cost enforcement and only then the health success report. The
    /// ordering is load-bearing: the next request's limit check must see
    /// these counters before the provider can look healthy again.
    fn settle_success(
        &self,
        snapshot: &RegistrySnapshot,
        entry: &ProviderEntry,
        candidate: &Candidate,
        usage: &UsageReport,
    ) {
        let delta = UsageDelta {
            requests: 1,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            errors: 0,
            cost_usd_micros: entry.cost_usd_micros(usage.input_tokens, usage.output_tokens),
        };
        for scope in &candidate.scopes {
            self.counters.record(scope, &delta);
        }

        self.enforce_post_flight(snapshot, entry, candidate);
        self.health.on_success(&candidate.provider_id);
    }

    /// Token and derived-cost limits can only be checked once the request's
    /// usage is known. A hard breach cools the provider so nothing further
    /// is routed to it; the request that crossed the line is not rolled
    /// back.
    fn enforce_post_flight(
        &self,
        snapshot: &RegistrySnapshot,
        entry: &ProviderEntry,
        candidate: &Candidate,
    ) {
        PostFlight {
            counters: &self.counters,
            health: &self.health,
            snapshot,
            entry,
            candidate,
        }
        .enforce();
    }

    /// Books a failed attempt and reports it to the health controller.
    /// Returns the terminal error when the failure must surface instead of
    /// failing over.
    fn settle_failure(
        &self,
        entry: &ProviderEntry,
        candidate: &Candidate,
        failure: &UpstreamFailure,
    ) -> Option<SwitchboardError> {
        tracing::warn!(
            provider = %candidate.provider_id,
            error = %failure,
            "upstream attempt failed"
        );

        match failure {
            UpstreamFailure::Transient(detail) => {
                self.record_error(candidate);
                self.health
                    .on_failure(&candidate.provider_id, &entry.policy, detail);
                None
            }
            UpstreamFailure::Auth { status, detail } => {
                self.record_error(candidate);
                self.health.force_cooldown(
                    &candidate.provider_id,
                    &entry.policy,
                    None,
                    &format!("auth rejected ({status}): {detail}"),
                );
                None
            }
            UpstreamFailure::RateLimited {
                retry_after_seconds,
                detail,
            } => {
                self.record_error(candidate);
                let min_until = retry_after_seconds
                    .map(|seconds| self.clock.now_epoch_seconds().saturating_add(seconds));
                self.health.force_cooldown(
                    &candidate.provider_id,
                    &entry.policy,
                    min_until,
                    detail,
                );
                None
            }
            // The provider cannot serve this call shape; not a fault, not
            // an upstream attempt worth accounting.
            UpstreamFailure::Unsupported(_) => None,
            // The upstream judged the request itself invalid. That verdict
            // would repeat at every other provider, so it surfaces directly.
            UpstreamFailure::Request { status, detail } => {
                self.record_error(candidate);
                Some(SwitchboardError::UpstreamRequest {
                    status: *status,
                    detail: detail.clone(),
                })
            }
        }
    }

    fn record_error(&self, candidate: &Candidate) {
        let delta = UsageDelta {
            requests: 1,
            errors: 1,
            ..UsageDelta::default()
        };
        for scope in &candidate.scopes {
            self.counters.record(scope, &delta);
        }
    }

    /// Waits for the first chunk. Before it arrives, failures flow back into
    /// the candidate loop; once it arrives the candidate is locked in and
    /// the returned stream owns settlement through its finalizer.
    async fn try_commit_stream(
        &self,
        mut upstream: ChunkStream,
        snapshot: &Arc<RegistrySnapshot>,
        entry: &Arc<ProviderEntry>,
        candidate: &Candidate,
        request: &ChatCompletionRequest,
    ) -> std::result::Result<CommittedStream, UpstreamFailure> {
        let first = match upstream.next().await {
            Some(Ok(first)) => first,
            Some(Err(failure)) => return Err(failure),
            None => {
                return Err(UpstreamFailure::Transient(
                    "upstream closed before first chunk".to_string(),
                ))
            }
        };

        let mut scanner = SseUsageScanner::default();
        scanner.ingest(&first);

        let finalizer = StreamFinalizer {
            counters: Arc::clone(&self.counters),
            health: Arc::clone(&self.health),
            snapshot: Arc::clone(snapshot),
            entry: Arc::clone(entry),
            candidate: candidate.clone(),
            input_tokens_estimate: estimate_tokens(request.content_chars()),
        };

        let provider_id = candidate.provider_id.clone();
        let state = ForwardState {
            upstream,
            scanner,
            bytes_sent: first.len() as u64,
            finalizer: Some(finalizer),
        };

        let forwarded = futures_util::stream::try_unfold(state, |mut state| async move {
            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    state.bytes_sent = state.bytes_sent.saturating_add(chunk.len() as u64);
                    state.scanner.ingest(&chunk);
                    Ok(Some((chunk, state)))
                }
                Some(Err(failure)) => {
                    let detail = failure.to_string();
                    state.settle(StreamEnd::Error(detail.clone()));
                    Err(std::io::Error::other(detail))
                }
                None => {
                    state.settle(StreamEnd::Completed);
                    Ok(None)
                }
            }
        });

        let stream = futures_util::stream::iter([Ok::<Bytes, std::io::Error>(first)])
            .chain(forwarded)
            .boxed();

        Ok(CommittedStream {
            provider_id,
            stream,
        })
    }
}

enum StreamEnd {
    Completed,
    Error(String),
    /// The client went away; whatever was observed so far still counts.
    Aborted,
}

struct StreamFinalizer {
    counters: Arc<CounterStore>,
    health: Arc<HealthController>,
    snapshot: Arc<RegistrySnapshot>,
    entry: Arc<ProviderEntry>,
    candidate: Candidate,
    input_tokens_estimate: u64,
}

impl StreamFinalizer {
    /// Settlement mirrors the unary path: counters first, post-flight
    /// enforcement, then the health report matching how the stream ended.
    fn finalize(self, scanner: &SseUsageScanner, end: StreamEnd, bytes_sent: u64) {
        let observed = scanner.observed_usage();
        let input_tokens = observed
            .and_then(|usage| usage.input_tokens)
            .unwrap_or(self.input_tokens_estimate);
        let output_tokens = observed
            .and_then(|usage| usage.output_tokens)
            .unwrap_or_else(|| estimate_tokens(scanner.delta_content_chars()));

        let errors = u64::from(matches!(end, StreamEnd::Error(_)));
        let delta = UsageDelta {
            requests: 1,
            input_tokens,
            output_tokens,
            errors,
            cost_usd_micros: self.entry.cost_usd_micros(input_tokens, output_tokens),
        };
        for scope in &self.candidate.scopes {
            self.counters.record(scope, &delta);
        }

        tracing::info!(
            target: "switchboard::dispatch",
            provider = %self.candidate.provider_id,
            input_tokens,
            output_tokens,
            bytes_sent,
            estimated = observed.is_none(),
            outcome = match &end {
                StreamEnd::Completed => "completed",
                StreamEnd::Error(_) => "error",
                StreamEnd::Aborted => "aborted",
            },
            "dispatch.stream_close"
        );

        // Post-flight enforcement applies to partial usage too; a truncated
        // stream can still cross a token limit.
        PostFlight {
            counters: &self.counters,
            health: &self.health,
            snapshot: &self.snapshot,
            entry: &self.entry,
            candidate: &self.candidate,
        }
        .enforce();

        match end {
            StreamEnd::Completed => self.health.on_success(&self.candidate.provider_id),
            StreamEnd::Error(detail) => {
                self.health
                    .on_failure(&self.candidate.provider_id, &self.entry.policy, &detail)
            }
            // A client disconnect says nothing about provider health.
            StreamEnd::Aborted => {}
        }
    }
}

/// Post-flight enforcement shared between the unary settle path and the
/// stream finalizer, which no longer has the dispatcher in reach.
struct PostFlight<'a> {
    counters: &'a CounterStore,
    health: &'a HealthController,
    snapshot: &'a RegistrySnapshot,
    entry: &'a ProviderEntry,
    candidate: &'a Candidate,
}

impl PostFlight<'_> {
    fn enforce(&self) {
        for scope in &self.candidate.scopes {
            if matches!(scope, Scope::VirtualMember { .. }) {
                continue;
            }
            let key = scope.key();
            let rules = self.snapshot.limits_for(&key);
            if rules.is_empty() {
                continue;
            }
            if let Some(breach) = hard_breach_after(&self.counters.snapshot(scope), rules) {
                tracing::warn!(
                    provider = %self.candidate.provider_id,
                    scope = %breach.scope_key,
                    window = %breach.window,
                    metric = %breach.metric,
                    observed = breach.observed,
                    threshold = breach.threshold,
                    "hard limit crossed post-flight; cooling provider"
                );
                self.health.force_cooldown(
                    &self.candidate.provider_id,
                    &self.entry.policy,
                    None,
                    &breach.detail(),
                );
                return;
            }
        }
    }
}

struct ForwardState {
    upstream: ChunkStream,
    scanner: SseUsageScanner,
    bytes_sent: u64,
    finalizer: Option<StreamFinalizer>,
}

impl ForwardState {
    fn settle(&mut self, end: StreamEnd) {
        if let Some(finalizer) = self.finalizer.take() {
            finalizer.finalize(&self.scanner, end, self.bytes_sent);
        }
    }
}

impl Drop for ForwardState {
    fn drop(&mut self) {
        // Reached when the client disconnects mid-stream: the axum body is
        // dropped without the unfold ever seeing the upstream end.
        self.settle(StreamEnd::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::clock::Window;
    use crate::config::{
        ConfigFile, ConfigMetric, HttpProviderConfig, LimitConfig, PricingConfig, ProviderConfig,
        ProviderKind, VirtualMember, VirtualProviderConfig,
    };
    use crate::health::{CooldownPolicy, HealthState};
    use crate::limits::Severity;
    use crate::types::ChatMessage;
    use crate::utils::test_support::{ManualClock, ScriptedAdapter, ScriptedCall};

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.to_string(),
            display_name: String::new(),
            kind: ProviderKind::Http(HttpProviderConfig {
                base_url: format!("http://{id}.example/v1"),
                auth_header: None,
                headers: BTreeMap::new(),
                timeout_seconds: 30,
                retries: 0,
                probe: None,
            }),
            enabled: true,
            models: Vec::new(),
            pricing: Some(PricingConfig {
                currency: "usd".to_string(),
                input_usd_per_million: 1.0,
                output_usd_per_million: 2.0,
            }),
            failure_threshold: 3,
            cooldown: CooldownPolicy::Fixed { seconds: 60 },
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<Registry>,
        counters: Arc<CounterStore>,
        health: Arc<HealthController>,
        adapter_a: Arc<ScriptedAdapter>,
        adapter_b: Arc<ScriptedAdapter>,
    }

    fn fixture(
        limits: Vec<LimitConfig>,
        script_a: Vec<ScriptedCall>,
        script_b: Vec<ScriptedCall>,
    ) -> Fixture {
        let config = ConfigFile {
            providers: vec![provider("a"), provider("b")],
            virtual_providers: vec![VirtualProviderConfig {
                id: "v".to_string(),
                display_name: String::new(),
                members: vec![
                    VirtualMember {
                        provider: "a".to_string(),
                        priority: 1,
                    },
                    VirtualMember {
                        provider: "b".to_string(),
                        priority: 2,
                    },
                ],
                models: Vec::new(),
            }],
            limits,
        };

        let adapter_a = Arc::new(ScriptedAdapter::new(script_a));
        let adapter_b = Arc::new(ScriptedAdapter::new(script_b));
        let a = Arc::clone(&adapter_a);
        let b = Arc::clone(&adapter_b);
        let snapshot = RegistrySnapshot::build_with(&config, &move |provider| {
            Ok(match provider.id.as_str() {
                "a" => Arc::clone(&a) as _,
                _ => Arc::clone(&b) as _,
            })
        })
        .expect("snapshot");

        let clock = Arc::new(ManualClock::new(1_000)) as Arc<dyn Clock>;
        let registry = Arc::new(Registry::new(snapshot));
        let counters = Arc::new(CounterStore::new(Arc::clone(&clock)));
        let health = Arc::new(HealthController::new(Arc::clone(&clock)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&counters),
            Arc::clone(&health),
            clock,
        );
        Fixture {
            dispatcher,
            registry,
            counters,
            health,
            adapter_a,
            adapter_b,
        }
    }

    fn request(model: &str, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello there".to_string(),
                name: None,
            }],
            temperature: None,
            max_tokens: None,
            stream: stream.then_some(true),
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
        }
    }

    fn provider_bucket(counters: &CounterStore, id: &str) -> crate::counters::CounterBucket {
        *counters
            .snapshot(&Scope::Provider(id.to_string()))
            .bucket(Window::Minute)
    }

    #[tokio::test]
    async fn transient_failure_fails_over_in_priority_order() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Fail(UpstreamFailure::Transient(
                "connect refused".to_string(),
            ))],
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((10, 5)),
            }],
        );

        let reply = fx
            .dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .expect("reply");
        match reply {
            DispatchReply::Unary { provider_id, .. } => assert_eq!(provider_id, "b"),
            DispatchReply::Streaming(_) => panic!("expected unary"),
        }

        let a = provider_bucket(&fx.counters, "a");
        assert_eq!((a.requests, a.errors, a.input_tokens), (1, 1, 0));
        let b = provider_bucket(&fx.counters, "b");
        assert_eq!((b.requests, b.errors, b.input_tokens), (1, 0, 10));
        // $1/M input, $2/M output: 10 + 10 micro-USD.
        assert_eq!(b.cost_usd_micros, 20);

        let v = fx.counters.snapshot(&Scope::Virtual("v".to_string()));
        assert_eq!(v.bucket(Window::Minute).requests, 2);
        assert_eq!(v.bucket(Window::Minute).errors, 1);
        assert_eq!(v.bucket(Window::Minute).input_tokens, 10);
    }

    #[tokio::test]
    async fn direct_selector_bypasses_virtual_accounting() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((4, 4)),
            }],
            Vec::new(),
        );

        fx.dispatcher
            .dispatch(request("v", false), Some("a"), None)
            .await
            .expect("reply");

        assert_eq!(provider_bucket(&fx.counters, "a").requests, 1);
        let v = fx.counters.snapshot(&Scope::Virtual("v".to_string()));
        assert_eq!(v.bucket(Window::Minute).requests, 0);
    }

    #[tokio::test]
    async fn upstream_4xx_surfaces_without_failover() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Fail(UpstreamFailure::Request {
                status: 422,
                detail: "bad shape".to_string(),
            })],
            vec![ScriptedCall::Reply {
                content: "never".to_string(),
                usage: None,
            }],
        );

        let err = fx
            .dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SwitchboardError::UpstreamRequest { status: 422, .. }
        ));
        assert_eq!(fx.adapter_b.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        // Not a provider fault: health untouched.
        assert_eq!(fx.health.snapshot("a").state, HealthState::Healthy);
        assert_eq!(provider_bucket(&fx.counters, "a").errors, 1);
    }

    #[tokio::test]
    async fn auth_rejection_cools_immediately_and_fails_over() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Fail(UpstreamFailure::Auth {
                status: 401,
                detail: "bad key".to_string(),
            })],
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((1, 1)),
            }],
        );

        fx.dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .expect("reply");
        assert_eq!(fx.health.snapshot("a").state, HealthState::Cooling);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after_hint() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Fail(UpstreamFailure::RateLimited {
                retry_after_seconds: Some(600),
                detail: "slow down".to_string(),
            })],
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((1, 1)),
            }],
        );

        fx.dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .expect("reply");
        let snapshot = fx.health.snapshot("a");
        assert_eq!(snapshot.state, HealthState::Cooling);
        // Fixed 60s cooldown, but Retry-After says 600s.
        assert_eq!(snapshot.cooldown_until_epoch_seconds, Some(1_600));
    }

    #[tokio::test]
    async fn exhausted_plan_reports_last_error() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Fail(UpstreamFailure::Transient(
                "a down".to_string(),
            ))],
            vec![ScriptedCall::Fail(UpstreamFailure::Transient(
                "b down".to_string(),
            ))],
        );

        let err = fx
            .dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .unwrap_err();
        match err {
            SwitchboardError::UpstreamExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("b down"));
            }
            other => panic!("expected exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn streaming_failure_before_first_chunk_fails_over() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Stream(vec![Err(UpstreamFailure::Transient(
                "reset".to_string(),
            ))])],
            vec![ScriptedCall::Stream(vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ])],
        );

        let reply = fx
            .dispatcher
            .dispatch(request("v", true), None, None)
            .await
            .expect("reply");
        let DispatchReply::Streaming(committed) = reply else {
            panic!("expected stream");
        };
        assert_eq!(committed.provider_id, "b");

        let collected: Vec<_> = committed.stream.collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected.iter().all(|r| r.is_ok()));

        // a took the error; b took the success with estimated usage.
        assert_eq!(provider_bucket(&fx.counters, "a").errors, 1);
        let b = provider_bucket(&fx.counters, "b");
        assert_eq!(b.requests, 1);
        assert_eq!(b.errors, 0);
        // "hello there" is 11 chars -> 3 input tokens; "hi" -> 1 output.
        assert_eq!(b.input_tokens, 3);
        assert_eq!(b.output_tokens, 1);
        assert_eq!(fx.health.snapshot("b").state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn no_failover_after_first_chunk() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Stream(vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n")),
                Err(UpstreamFailure::Transient("mid-stream reset".to_string())),
            ])],
            vec![ScriptedCall::Stream(vec![Ok(Bytes::from_static(
                b"data: [DONE]\n\n",
            ))])],
        );

        let reply = fx
            .dispatcher
            .dispatch(request("v", true), None, None)
            .await
            .expect("reply");
        let DispatchReply::Streaming(committed) = reply else {
            panic!("expected stream");
        };
        assert_eq!(committed.provider_id, "a");

        let collected: Vec<_> = committed.stream.collect().await;
        assert!(collected[0].is_ok());
        assert!(collected.last().unwrap().is_err());

        // The client saw a truncated stream; b never heard about it.
        assert_eq!(fx.adapter_b.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        let a = provider_bucket(&fx.counters, "a");
        assert_eq!(a.errors, 1);
        // Partial usage observed so far still lands.
        assert_eq!(a.output_tokens, 1);
    }

    #[tokio::test]
    async fn client_drop_records_partial_usage_without_health_penalty() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Stream(vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n")),
                Ok(Bytes::from_static(b"data: never-read\n\n")),
            ])],
            Vec::new(),
        );

        let reply = fx
            .dispatcher
            .dispatch(request("v", true), None, None)
            .await
            .expect("reply");
        let DispatchReply::Streaming(committed) = reply else {
            panic!("expected stream");
        };
        drop(committed);

        let a = provider_bucket(&fx.counters, "a");
        assert_eq!(a.requests, 1);
        assert_eq!(a.errors, 0);
        // "partial" = 7 chars -> 2 tokens.
        assert_eq!(a.output_tokens, 2);
        assert_eq!(fx.health.snapshot("a").state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn post_flight_token_breach_cools_the_provider() {
        let fx = fixture(
            vec![LimitConfig {
                scope: "a".to_string(),
                window: Window::Day,
                metric: ConfigMetric::TotalTokens,
                threshold: 10,
                severity: Severity::Hard,
            }],
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((8, 8)),
            }],
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((1, 1)),
            }],
        );

        // First request is admitted (counters were below the limit) and its
        // usage crosses the threshold: provider cools, request stands.
        fx.dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .expect("reply");
        assert_eq!(fx.health.snapshot("a").state, HealthState::Cooling);
        assert_eq!(provider_bucket(&fx.counters, "a").input_tokens, 8);

        // The next request routes around the cooled provider.
        let reply = fx
            .dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .expect("reply");
        match reply {
            DispatchReply::Unary { provider_id, .. } => assert_eq!(provider_id, "b"),
            DispatchReply::Streaming(_) => panic!("expected unary"),
        }
    }

    #[tokio::test]
    async fn config_swap_mid_flight_keeps_the_old_snapshot() {
        let fx = fixture(
            Vec::new(),
            vec![ScriptedCall::Reply {
                content: "ok".to_string(),
                usage: Some((1, 1)),
            }],
            Vec::new(),
        );

        // Replace the registry with an empty config while a request holds
        // the old snapshot: the in-flight dispatch still succeeds.
        let held = fx.registry.load();
        fx.registry.swap(
            RegistrySnapshot::build_with(&ConfigFile::default(), &|_| {
                unreachable!("no providers to build")
            })
            .expect("empty snapshot"),
        );
        assert!(held.provider("a").is_some());

        // New requests see the new, empty world.
        let err = fx
            .dispatcher
            .dispatch(request("v", false), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::InvalidRequest(_)));
    }
}
