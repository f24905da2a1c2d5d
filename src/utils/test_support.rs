//! Helpers shared by unit and integration tests. Not part of the public
//! API surface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use time::UtcOffset;

use crate::clock::Clock;
use crate::providers::{
    ChunkStream, ProviderAdapter, UnaryReply, UpstreamFailure, UsageReport,
};
use crate::types::{ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, UsageInfo};

/// Sandboxed environments may forbid binding localhost, which httpmock
/// needs. Tests that depend on a mock server bail out early instead of
/// failing.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: cannot bind localhost here");
            true
        }
        Err(err) => panic!("probe bind for httpmock failed: {err}"),
    }
}

/// Settable clock with a fixed UTC offset. Window boundaries and cooldown
/// deadlines become deterministic.
pub struct ManualClock {
    epoch_seconds: AtomicU64,
    offset: UtcOffset,
}

impl ManualClock {
    pub fn new(epoch_seconds: u64) -> Self {
        Self {
            epoch_seconds: AtomicU64::new(epoch_seconds),
            offset: UtcOffset::UTC,
        }
    }

    pub fn advance(&self, seconds: u64) {
        self.epoch_seconds.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, epoch_seconds: u64) {
        self.epoch_seconds.store(epoch_seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> u64 {
        self.epoch_seconds.load(Ordering::SeqCst)
    }

    fn local_offset(&self) -> UtcOffset {
        self.offset
    }
}

pub fn sample_response(content: &str, usage: Option<(u64, u64)>) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: "chatcmpl-test".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: "test".to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
                name: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: usage.map(|(input, output)| UsageInfo {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        }),
    }
}

/// One scripted adapter behavior, consumed per call.
pub enum ScriptedCall {
    Reply {
        content: String,
        usage: Option<(u64, u64)>,
    },
    Fail(UpstreamFailure),
    Stream(Vec<Result<Bytes, UpstreamFailure>>),
}

/// Adapter that replays a queue of scripted outcomes and counts calls.
/// An exhausted script fails transiently.
pub struct ScriptedAdapter {
    script: Mutex<VecDeque<ScriptedCall>>,
    pub calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(calls: Vec<ScriptedCall>) -> Self {
        Self {
            script: Mutex::new(calls.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn next_call(&self) -> ScriptedCall {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| {
                ScriptedCall::Fail(UpstreamFailure::Transient("script exhausted".to_string()))
            })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn send_unary(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<UnaryReply, UpstreamFailure> {
        match self.next_call() {
            ScriptedCall::Reply { content, usage } => {
                let response = sample_response(&content, usage);
                let usage = UsageReport::from_response(request, &response);
                Ok(UnaryReply { response, usage })
            }
            ScriptedCall::Fail(failure) => Err(failure),
            ScriptedCall::Stream(_) => Err(UpstreamFailure::Transient(
                "scripted stream used on unary path".to_string(),
            )),
        }
    }

    async fn send_streaming(
        &self,
        _request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamFailure> {
        match self.next_call() {
            ScriptedCall::Stream(chunks) => Ok(futures_util::stream::iter(chunks).boxed()),
            ScriptedCall::Fail(failure) => Err(failure),
            ScriptedCall::Reply { .. } => Err(UpstreamFailure::Transient(
                "scripted reply used on streaming path".to_string(),
            )),
        }
    }

    async fn probe(&self) -> Result<(), UpstreamFailure> {
        Ok(())
    }
}

/// Adapter that always fails transiently. Handy where the adapter must
/// exist but should never be reached.
#[derive(Default)]
pub struct FailingAdapter {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ProviderAdapter for FailingAdapter {
    async fn send_unary(
        &self,
        _request: &ChatCompletionRequest,
    ) -> Result<UnaryReply, UpstreamFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(UpstreamFailure::Transient("always down".to_string()))
    }

    async fn send_streaming(
        &self,
        _request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(UpstreamFailure::Transient("always down".to_string()))
    }

    async fn probe(&self) -> Result<(), UpstreamFailure> {
        Err(UpstreamFailure::Transient("always down".to_string()))
    }
}
