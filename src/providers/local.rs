//! Spawned-process upstream adapter.
//!
//! One invocation per request: the serialized request goes to the child's
//! stdin, a single JSON chat-completion response is read from stdout, and
//! the child is killed if it outlives the configured timeout. Concurrent
//! spawns are capped per provider. Streaming is not offered by local
//! providers.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::config::LocalProviderConfig;
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

use super::{ChunkStream, ProviderAdapter, UnaryReply, UpstreamFailure, UsageReport};

pub struct LocalProcessAdapter {
    config: LocalProviderConfig,
    spawn_permits: Arc<Semaphore>,
}

impl LocalProcessAdapter {
    pub fn new(config: LocalProviderConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            config,
            spawn_permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    async fn run_once(&self, payload: &[u8]) -> Result<Vec<u8>, UpstreamFailure> {
        let _permit = self
            .spawn_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UpstreamFailure::Transient("spawn permits closed".to_string()))?;

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            UpstreamFailure::Transient(format!(
                "spawn {}: {err}",
                self.config.command.display()
            ))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload)
                .await
                .map_err(|err| UpstreamFailure::Transient(format!("write stdin: {err}")))?;
            drop(stdin);
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamFailure::Transient("child stdout missing".to_string()))?;

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let wait = async {
            let mut out = Vec::new();
            stdout
                .read_to_end(&mut out)
                .await
                .map_err(|err| UpstreamFailure::Transient(format!("read stdout: {err}")))?;
            let status = child
                .wait()
                .await
                .map_err(|err| UpstreamFailure::Transient(format!("wait: {err}")))?;
            if !status.success() {
                return Err(UpstreamFailure::Transient(format!(
                    "process exited with {status}"
                )));
            }
            Ok(out)
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamFailure::Transient(format!(
                "process exceeded {}s timeout",
                self.config.timeout_seconds
            ))),
        }
    }
}

#[async_trait]
impl ProviderAdapter for LocalProcessAdapter {
    async fn send_unary(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<UnaryReply, UpstreamFailure> {
        let payload = serde_json::to_vec(request)
            .map_err(|err| UpstreamFailure::Transient(format!("serialize request: {err}")))?;
        let stdout = self.run_once(&payload).await?;
        let response: ChatCompletionResponse = serde_json::from_slice(&stdout)
            .map_err(|err| UpstreamFailure::Transient(format!("invalid process output: {err}")))?;
        let usage = UsageReport::from_response(request, &response);
        Ok(UnaryReply { response, usage })
    }

    async fn send_streaming(
        &self,
        _request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamFailure> {
        Err(UpstreamFailure::Unsupported(
            "local providers serve unary completions only".to_string(),
        ))
    }

    async fn probe(&self) -> Result<(), UpstreamFailure> {
        match tokio::fs::metadata(&self.config.command).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(UpstreamFailure::Transient(format!(
                "{} is not an executable file",
                self.config.command.display()
            ))),
            Err(err) => Err(UpstreamFailure::Transient(format!(
                "{}: {err}",
                self.config.command.display()
            ))),
        }
    }
}
