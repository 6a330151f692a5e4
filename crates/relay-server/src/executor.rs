//! Streaming query executor.
//!
//! Turns one generator call into `query_start`, numbered `chunk`s, and a
//! terminal `complete` or `error`, all routed through the registry so they
//! are buffered if the session has no live connection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use metrics::{counter, histogram};
use relay_core::{RelayError, ServerMessage, SessionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::generation::{GenerationRequest, TextGenerator};
use crate::history::{HistoryEntry, NoopSessionStore, QueryOutcome, SessionStore};
use crate::registry::SessionRegistry;

/// One query to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    /// Session that receives the output.
    pub session_id: SessionId,
    /// Prompt text.
    pub query: String,
    /// Fetch session context from the store first.
    pub include_context: bool,
    /// Optional system instructions.
    pub system_prompt: Option<String>,
}

impl QueryRequest {
    /// A bare query.
    pub fn new(session_id: SessionId, query: impl Into<String>) -> Self {
        Self {
            session_id,
            query: query.into(),
            include_context: false,
            system_prompt: None,
        }
    }
}

/// Record of one finished query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryExecution {
    /// Owning session.
    pub session_id: SessionId,
    /// Chunks emitted; the last `chunk_number` sent.
    pub chunks: u64,
    /// Concatenated text of every chunk.
    pub full_response: String,
    /// When `query_start` was emitted.
    pub started_at: DateTime<Utc>,
    /// When the terminal message was emitted.
    pub finished_at: DateTime<Utc>,
    /// Terminal outcome.
    pub outcome: QueryOutcome,
    /// Failure message when the outcome is `Failed`.
    pub error: Option<String>,
}

#[derive(Default)]
struct Progress {
    chunks: u64,
    text: String,
}

/// Drives generator calls and emits protocol events through the registry.
pub struct QueryExecutor {
    registry: Arc<SessionRegistry>,
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn SessionStore>,
}

impl QueryExecutor {
    /// Executor with no history store.
    pub fn new(registry: Arc<SessionRegistry>, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            registry,
            generator,
            store: Arc::new(NoopSessionStore),
        }
    }

    /// Replace the history store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Registry the executor emits through.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one query to completion.
    ///
    /// Cancelling `cancel` (the owning connection went away) aborts the
    /// generator and ends the query with a `connection_closed` error.
    #[instrument(skip_all, fields(session_id = %request.session_id, generator = self.generator.name()))]
    pub async fn execute(&self, request: QueryRequest, cancel: CancellationToken) -> QueryExecution {
        let session_id = request.session_id.clone();
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        counter!(crate::metrics::QUERIES_STARTED_TOTAL).increment(1);

        self.emit(&session_id, &ServerMessage::query_start(&request.query, session_id.clone()));

        let context = if request.include_context {
            self.store.context(&session_id).await
        } else {
            None
        };
        let gen_request = GenerationRequest {
            session_id: session_id.clone(),
            query: request.query.clone(),
            context,
            system_prompt: request.system_prompt.clone(),
        };

        let mut progress = Progress::default();
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RelayError::ConnectionClosed),
            res = self.stream_chunks(&gen_request, &mut progress) => res,
        };

        let elapsed = clock.elapsed();
        histogram!(crate::metrics::QUERY_DURATION_SECONDS).record(elapsed.as_secs_f64());

        let (outcome, error) = match result {
            Ok(()) => {
                self.emit(
                    &session_id,
                    &ServerMessage::complete(&progress.text, progress.chunks, session_id.clone()),
                );
                counter!(crate::metrics::QUERIES_COMPLETED_TOTAL).increment(1);
                histogram!(crate::metrics::QUERY_CHUNKS).record(progress.chunks as f64);
                info!(chunks = progress.chunks, elapsed_ms = elapsed.as_millis() as u64, "query completed");
                (QueryOutcome::Completed, None)
            }
            Err(err) => {
                self.emit(&session_id, &ServerMessage::from_error(&err));
                let reason = err.code().map_or("unknown", relay_core::ErrorCode::as_str);
                counter!(crate::metrics::QUERIES_FAILED_TOTAL, "reason" => reason).increment(1);
                warn!(chunks = progress.chunks, error = %err, "query failed");
                (QueryOutcome::Failed, Some(err.to_string()))
            }
        };

        let finished_at = Utc::now();
        self.notify_history(
            &session_id,
            HistoryEntry {
                query: request.query,
                response_length: progress.text.chars().count(),
                timestamp: finished_at,
                outcome,
            },
        );

        QueryExecution {
            session_id,
            chunks: progress.chunks,
            full_response: progress.text,
            started_at,
            finished_at,
            outcome,
            error,
        }
    }

    async fn stream_chunks(&self, request: &GenerationRequest, progress: &mut Progress) -> Result<(), RelayError> {
        let mut stream = self
            .generator
            .generate(request)
            .await
            .map_err(|e| RelayError::Execution(e.to_string()))?;

        while let Some(item) = stream.next().await {
            let delta = item.map_err(|e| RelayError::Execution(e.to_string()))?;
            progress.chunks += 1;
            progress.text.push_str(&delta);
            self.emit(
                &request.session_id,
                &ServerMessage::chunk(delta, progress.chunks, request.session_id.clone()),
            );
        }
        Ok(())
    }

    fn emit(&self, session_id: &SessionId, message: &ServerMessage) {
        match self.registry.send(session_id, message) {
            Ok(outcome) => debug!(kind = message.type_name(), ?outcome, "emitted"),
            Err(e) => warn!(kind = message.type_name(), error = %e, "failed to emit"),
        }
    }

    fn notify_history(&self, session_id: &SessionId, entry: HistoryEntry) {
        let store = Arc::clone(&self.store);
        let session_id = session_id.clone();
        let _ = tokio::spawn(async move {
            if let Err(e) = store.record(&session_id, entry).await {
                counter!(crate::metrics::HISTORY_FAILURES_TOTAL).increment(1);
                warn!(%session_id, error = %e, "history record failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationError;
    use crate::history::{HistoryError, InMemorySessionStore};
    use crate::mock::{MockGenerator, MockResponse};
    use crate::websocket::connection::ConnectionHandle;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use relay_core::ErrorCode;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn sid() -> SessionId {
        SessionId::from_raw("s1")
    }

    fn setup(responses: Vec<MockResponse>) -> (QueryExecutor, Arc<MockGenerator>, mpsc::UnboundedReceiver<Arc<String>>) {
        let registry = Arc::new(SessionRegistry::new(100));
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = registry.connect(&sid(), None, ConnectionHandle::new(tx));
        let generator = Arc::new(MockGenerator::new(responses));
        let executor = QueryExecutor::new(registry, Arc::clone(&generator) as Arc<dyn TextGenerator>);
        (executor, generator, rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Arc<String>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(ServerMessage::parse(&frame).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn hello_streams_two_chunks_then_completes() {
        let (executor, _, mut rx) = setup(vec![MockResponse::chunks(&["He", "llo"])]);
        let execution = executor
            .execute(QueryRequest::new(sid(), "hello"), CancellationToken::new())
            .await;

        assert_eq!(execution.outcome, QueryOutcome::Completed);
        assert_eq!(execution.chunks, 2);
        assert_eq!(execution.full_response, "Hello");

        let msgs = received(&mut rx);
        assert_eq!(msgs.len(), 4);
        assert_matches!(&msgs[0], ServerMessage::QueryStart { query, .. } => assert_eq!(query, "hello"));
        assert_matches!(&msgs[1], ServerMessage::Chunk { content, chunk_number: 1, .. } => assert_eq!(content, "He"));
        assert_matches!(&msgs[2], ServerMessage::Chunk { content, chunk_number: 2, .. } => assert_eq!(content, "llo"));
        assert_matches!(&msgs[3], ServerMessage::Complete { full_response, total_chunks: 2, .. } => {
            assert_eq!(full_response, "Hello");
        });
    }

    #[tokio::test]
    async fn every_delta_is_a_numbered_chunk_even_when_empty() {
        let (executor, _, mut rx) = setup(vec![MockResponse::chunks(&["a", "", "b", "c", ""])]);
        let execution = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;
        assert_eq!(execution.chunks, 5);
        assert_eq!(execution.full_response, "abc");

        let chunks: Vec<(u64, String)> = received(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Chunk {
                    chunk_number, content, ..
                } => Some((chunk_number, content)),
                _ => None,
            })
            .collect();
        let numbers: Vec<u64> = chunks.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(chunks[1].1, "");
        assert_eq!(chunks[4].1, "");
    }

    #[tokio::test]
    async fn empty_response_completes_with_zero_chunks() {
        let (executor, _, mut rx) = setup(vec![MockResponse::chunks(&[])]);
        let execution = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;
        assert_eq!(execution.chunks, 0);
        let msgs = received(&mut rx);
        assert_matches!(msgs.last(), Some(ServerMessage::Complete { total_chunks: 0, .. }));
    }

    #[tokio::test]
    async fn mid_stream_failure_emits_error_without_complete() {
        let (executor, _, mut rx) = setup(vec![MockResponse::fail_after(&["partial"], "model crashed")]);
        let execution = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;

        assert_eq!(execution.outcome, QueryOutcome::Failed);
        assert!(execution.error.unwrap().contains("model crashed"));
        let msgs = received(&mut rx);
        assert!(!msgs.iter().any(|m| matches!(m, ServerMessage::Complete { .. })));
        assert_matches!(msgs.last(), Some(ServerMessage::Error { code: Some(ErrorCode::ExecutionFailed), error, .. }) => {
            assert!(error.contains("model crashed"));
        });
    }

    #[tokio::test]
    async fn generator_refusal_emits_error() {
        let (executor, _, mut rx) = setup(vec![MockResponse::Error(GenerationError::Unavailable("down".into()))]);
        let execution = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;
        assert_eq!(execution.outcome, QueryOutcome::Failed);
        let msgs = received(&mut rx);
        assert_eq!(msgs.len(), 2);
        assert_matches!(&msgs[1], ServerMessage::Error { .. });
    }

    #[tokio::test]
    async fn cancellation_ends_with_connection_closed() {
        let (executor, _, mut rx) = setup(vec![MockResponse::Hang(vec!["a".into()])]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let execution = executor.execute(QueryRequest::new(sid(), "q"), cancel).await;
        assert_eq!(execution.outcome, QueryOutcome::Failed);
        assert_eq!(execution.chunks, 1);
        let msgs = received(&mut rx);
        assert_matches!(msgs.last(), Some(ServerMessage::Error { code: Some(ErrorCode::ConnectionClosed), .. }));
    }

    #[tokio::test]
    async fn output_is_buffered_when_session_has_no_handle() {
        let registry = Arc::new(SessionRegistry::new(100));
        let generator = Arc::new(MockGenerator::new(vec![MockResponse::chunks(&["x"])]));
        let executor = QueryExecutor::new(Arc::clone(&registry), generator);
        let _ = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;
        assert_eq!(registry.buffered_payloads(&sid()).len(), 3);
    }

    #[tokio::test]
    async fn include_context_passes_store_context_to_generator() {
        let (executor, generator, _rx) = setup(vec![MockResponse::chunks(&["ok"])]);
        let store = Arc::new(InMemorySessionStore::default());
        store
            .record(
                &sid(),
                HistoryEntry {
                    query: "earlier".into(),
                    response_length: 2,
                    timestamp: Utc::now(),
                    outcome: QueryOutcome::Completed,
                },
            )
            .await
            .unwrap();
        let executor = executor.with_store(store);

        let mut request = QueryRequest::new(sid(), "now");
        request.include_context = true;
        request.system_prompt = Some("be terse".into());
        let _ = executor.execute(request, CancellationToken::new()).await;

        let seen = generator.requests();
        assert!(seen[0].context.as_deref().unwrap().contains("earlier"));
        assert_eq!(seen[0].system_prompt.as_deref(), Some("be terse"));
    }

    #[tokio::test]
    async fn history_receives_entry() {
        let (executor, _, _rx) = setup(vec![MockResponse::chunks(&["He", "llo"])]);
        let store = Arc::new(InMemorySessionStore::default());
        let executor = executor.with_store(Arc::clone(&store) as Arc<dyn SessionStore>);
        let _ = executor
            .execute(QueryRequest::new(sid(), "hello"), CancellationToken::new())
            .await;

        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = store.entries(&sid());
            if !entries.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query, "hello");
        assert_eq!(entries[0].response_length, 5);
    }

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn record(&self, _: &SessionId, _: HistoryEntry) -> Result<(), HistoryError> {
            Err(HistoryError::Unavailable("disk full".into()))
        }
    }

    #[tokio::test]
    async fn history_failure_does_not_affect_outcome() {
        let (executor, _, mut rx) = setup(vec![MockResponse::chunks(&["a"])]);
        let executor = executor.with_store(Arc::new(FailingStore));
        let execution = executor
            .execute(QueryRequest::new(sid(), "q"), CancellationToken::new())
            .await;
        assert_eq!(execution.outcome, QueryOutcome::Completed);
        assert_matches!(received(&mut rx).last(), Some(ServerMessage::Complete { .. }));
    }
}
