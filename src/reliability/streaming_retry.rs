//! Connection-level retry for streams, with partial-response preservation.
//!
//! Wraps a stream-producing function: connections are established under a
//! timeout, each chunk is read under a timeout and recorded into a
//! `StreamState` (checkpoint every tenth chunk), and recoverable failures
//! reconnect with exponential backoff. The stream function receives a resume
//! hint; if it cannot honor it, the retry restarts from scratch with the
//! partial response preserved for the caller.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::StreamExt;
use tracing::{info, warn};

use crate::config::env::streaming_state_ttl_secs;
use crate::providers::base::{ProviderError, TextStream};
use crate::providers::classify::{ErrorCategory, classify_provider_error};
use crate::reliability::state::StreamStateManager;

#[derive(Debug, Clone)]
pub struct StreamingRetryConfig {
    pub max_connection_attempts: u32,
    pub connection_timeout: Duration,
    pub read_timeout: Duration,
    pub reconnect_on_error: bool,
    pub preserve_partial_response: bool,
    pub backoff_multiplier: f64,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StreamingRetryConfig {
    fn default() -> Self {
        Self {
            max_connection_attempts: 3,
            connection_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(300),
            reconnect_on_error: true,
            preserve_partial_response: true,
            backoff_multiplier: 1.5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

const MAX_CONSECUTIVE_READ_TIMEOUTS: u32 = 3;

fn timeout_error(provider: &str, message: String) -> ProviderError {
    let mut err = ProviderError::new(message, provider).with_status(504);
    err.error_category = ErrorCategory::Timeout;
    err.is_retryable = true;
    err
}

pub struct StreamingRetryManager {
    states: Arc<StreamStateManager>,
}

impl Default for StreamingRetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRetryManager {
    pub fn new() -> Self {
        Self {
            states: Arc::new(StreamStateManager::new(Duration::from_secs(
                streaming_state_ttl_secs(),
            ))),
        }
    }

    pub fn with_states(states: Arc<StreamStateManager>) -> Self {
        Self { states }
    }

    pub fn has_partial_response(&self, request_id: &str) -> bool {
        self.states.has_partial_response(request_id)
    }

    pub fn partial_response(&self, request_id: &str) -> Option<String> {
        self.states.partial_response(request_id)
    }

    /// Wrap a stream function with connection retry. `stream_fn` is invoked
    /// with the resume position (0 on the first attempt).
    pub fn stream_with_retry<F, Fut>(
        &self,
        stream_fn: F,
        request_id: &str,
        provider: &str,
        config: StreamingRetryConfig,
    ) -> TextStream
    where
        F: Fn(usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<TextStream, ProviderError>> + Send,
    {
        let states = self.states.clone();
        let request_id = request_id.to_string();
        let provider = provider.to_string();
        states.cleanup_old_states();
        states.create(&request_id, &provider, "");

        let stream = try_stream! {
            let mut attempt: u32 = 0;
            let mut backoff = config.initial_backoff;

            'connect: loop {
                let resume_from = states.resume_position(&request_id).unwrap_or(0);
                if attempt > 0 {
                    let chunks = states
                        .with_state(&request_id, |s| s.chunks.len())
                        .unwrap_or(0);
                    info!(
                        request_id = %request_id,
                        provider = %provider,
                        attempt = attempt + 1,
                        chunks_received = chunks,
                        resume_from,
                        "retrying stream connection"
                    );
                }

                let connected =
                    tokio::time::timeout(config.connection_timeout, stream_fn(resume_from)).await;
                let mut inner = match connected {
                    Err(_) => {
                        attempt += 1;
                        if attempt >= config.max_connection_attempts {
                            // State is retained for partial-response retrieval.
                            Err::<(), ProviderError>(timeout_error(
                                &provider,
                                format!("Stream connection timeout after {} attempts", attempt),
                            ))?;
                            unreachable!();
                        }
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, &config);
                        continue 'connect;
                    }
                    Ok(Err(error)) => {
                        let classification = classify_provider_error(&error);
                        attempt += 1;
                        if !config.reconnect_on_error
                            || attempt >= config.max_connection_attempts
                            || !classification.is_retryable
                        {
                            Err::<(), ProviderError>(error)?;
                            unreachable!();
                        }
                        log_stream_error(&states, &request_id, &provider, &error.message, &config);
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, &config);
                        continue 'connect;
                    }
                    Ok(Ok(stream)) => stream,
                };

                let mut consecutive_timeouts: u32 = 0;
                loop {
                    let next = tokio::time::timeout(config.read_timeout, inner.next()).await;
                    match next {
                        Err(_) => {
                            consecutive_timeouts += 1;
                            states.with_state(&request_id, |s| s.record_error("read timeout"));
                            if consecutive_timeouts < MAX_CONSECUTIVE_READ_TIMEOUTS {
                                // Retry the read on the same stream.
                                continue;
                            }
                            // Three consecutive timeouts: the stream is dead.
                            attempt += 1;
                            if attempt >= config.max_connection_attempts || !config.reconnect_on_error {
                                Err::<(), ProviderError>(timeout_error(
                                    &provider,
                                    format!(
                                        "No data received after {} read timeouts",
                                        consecutive_timeouts
                                    ),
                                ))?;
                                unreachable!();
                            }
                            tokio::time::sleep(backoff).await;
                            backoff = next_backoff(backoff, &config);
                            continue 'connect;
                        }
                        Ok(None) => {
                            states.remove(&request_id);
                            break 'connect;
                        }
                        Ok(Some(Ok(chunk))) => {
                            consecutive_timeouts = 0;
                            states.with_state(&request_id, |s| {
                                s.record_chunk(&chunk);
                                if s.chunks.len() % 10 == 0 {
                                    s.create_checkpoint();
                                }
                            });
                            yield chunk;
                        }
                        Ok(Some(Err(error))) => {
                            let classification = classify_provider_error(&error);
                            attempt += 1;
                            if !config.reconnect_on_error
                                || attempt >= config.max_connection_attempts
                                || !classification.is_retryable
                            {
                                states.with_state(&request_id, |s| s.record_error(error.to_string()));
                                Err::<(), ProviderError>(error)?;
                                unreachable!();
                            }
                            log_stream_error(
                                &states,
                                &request_id,
                                &provider,
                                &error.message,
                                &config,
                            );
                            states.with_state(&request_id, |s| s.record_error(error.to_string()));
                            tokio::time::sleep(backoff).await;
                            backoff = next_backoff(backoff, &config);
                            continue 'connect;
                        }
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

fn next_backoff(current: Duration, config: &StreamingRetryConfig) -> Duration {
    current
        .mul_f64(config.backoff_multiplier)
        .min(config.max_backoff)
}

fn log_stream_error(
    states: &StreamStateManager,
    request_id: &str,
    provider: &str,
    error: &str,
    config: &StreamingRetryConfig,
) {
    let preview = states
        .partial_response(request_id)
        .map(|p| p.chars().take(100).collect::<String>())
        .unwrap_or_else(|| "None".to_string());
    let can_resume = states.has_partial_response(request_id);
    warn!(
        request_id = %request_id,
        provider = %provider,
        error = %error,
        partial_response = %preview,
        can_resume,
        preserve = config.preserve_partial_response,
        "stream error, preparing reconnect"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> StreamingRetryConfig {
        StreamingRetryConfig {
            max_connection_attempts: 3,
            connection_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..StreamingRetryConfig::default()
        }
    }

    fn chunk_stream(chunks: Vec<Result<String, ProviderError>>) -> TextStream {
        Box::pin(futures_util::stream::iter(chunks))
    }

    fn transient_error() -> ProviderError {
        let mut err = ProviderError::new("connection reset", "xai").with_status(503);
        err.error_category = ErrorCategory::ServerError;
        err.is_retryable = true;
        err
    }

    #[tokio::test]
    async fn passes_through_successful_stream() {
        let manager = StreamingRetryManager::new();
        let stream = manager.stream_with_retry(
            |_resume| async {
                Ok(chunk_stream(vec![
                    Ok("a".to_string()),
                    Ok("b".to_string()),
                ]))
            },
            "req-ok",
            "xai",
            fast_config(),
        );
        let chunks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec!["a", "b"]);
        // Completed streams release their state.
        assert!(!manager.has_partial_response("req-ok"));
    }

    #[tokio::test]
    async fn reconnects_after_recoverable_mid_stream_error() {
        let manager = StreamingRetryManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let stream = manager.stream_with_retry(
            move |resume| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        assert_eq!(resume, 0);
                        Ok(chunk_stream(vec![
                            Ok("partial".to_string()),
                            Err(transient_error()),
                        ]))
                    } else {
                        Ok(chunk_stream(vec![Ok(" rest".to_string())]))
                    }
                }
            },
            "req-retry",
            "xai",
            fast_config(),
        );
        let chunks: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(chunks, vec!["partial", " rest"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_with_partial_preserved() {
        let manager = StreamingRetryManager::new();
        let stream = manager.stream_with_retry(
            |_resume| async {
                let mut err = ProviderError::new("invalid api key", "xai").with_status(401);
                err.error_category = ErrorCategory::Authentication;
                Ok(chunk_stream(vec![Ok("before failure".to_string()), Err(err)]))
            },
            "req-auth",
            "xai",
            fast_config(),
        );
        let collected = Mutex::new(Vec::new());
        let mut stream = stream;
        let mut failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => collected.lock().unwrap().push(chunk),
                Err(e) => {
                    assert_eq!(e.status_code, Some(401));
                    failed = true;
                    break;
                }
            }
        }
        assert!(failed);
        assert!(manager.has_partial_response("req-auth"));
        assert_eq!(
            manager.partial_response("req-auth").as_deref(),
            Some("before failure")
        );
    }

    #[tokio::test]
    async fn exhausted_connection_attempts_fail() {
        let manager = StreamingRetryManager::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let mut stream = manager.stream_with_retry(
            move |_resume| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<TextStream, _>(transient_error())
                }
            },
            "req-fail",
            "xai",
            fast_config(),
        );
        let first = stream.next().await.unwrap();
        assert!(first.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn checkpoints_every_tenth_chunk() {
        let manager = StreamingRetryManager::new();
        let chunks: Vec<Result<String, ProviderError>> =
            (0..12).map(|i| Ok(format!("c{}", i))).collect();
        let mut stream = manager.stream_with_retry(
            move |_resume| {
                let chunks = chunks.clone();
                async move { Ok(chunk_stream(chunks)) }
            },
            "req-ckpt",
            "xai",
            fast_config(),
        );
        // Drain 11 chunks but not the end-of-stream, so state is retained.
        for _ in 0..11 {
            stream.next().await.unwrap().unwrap();
        }
        let resume = manager.states.resume_position("req-ckpt");
        assert_eq!(resume, Some(10));
    }
}
