//! Text-generation collaborator.
//!
//! The executor only needs an incremental stream of text deltas; any backend
//! that can produce one implements [`TextGenerator`].

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use relay_core::SessionId;

/// Failure reported by a generator.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The backend could not be reached or refused the request.
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    /// The backend failed partway through a response.
    #[error("{0}")]
    Failed(String),
}

/// Everything a generator needs for one query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Session the query belongs to.
    pub session_id: SessionId,
    /// Prompt text.
    pub query: String,
    /// Prior-session context, when the client asked for it.
    pub context: Option<String>,
    /// Optional system instructions.
    pub system_prompt: Option<String>,
}

impl GenerationRequest {
    /// A request with no context or system prompt.
    pub fn new(session_id: SessionId, query: impl Into<String>) -> Self {
        Self {
            session_id,
            query: query.into(),
            context: None,
            system_prompt: None,
        }
    }
}

/// Ordered stream of text deltas.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// A long-running text generator with a streaming call.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start generating. Errors before the first delta are returned here;
    /// later failures arrive as `Err` items on the stream.
    async fn generate(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError>;
}

/// Demo generator that streams the query back in fixed-size pieces.
#[derive(Clone, Debug)]
pub struct EchoGenerator {
    chunk_chars: usize,
    delay: Duration,
}

impl EchoGenerator {
    /// Echo in pieces of `chunk_chars` characters, pausing `delay` before each.
    pub fn new(chunk_chars: usize, delay: Duration) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
            delay,
        }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(20))
    }
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        let mut text = String::new();
        if let Some(context) = request.context.as_deref() {
            text.push_str(&format!("[{} chars of context] ", context.chars().count()));
        }
        text.push_str(&request.query);

        let pieces = split_chars(&text, self.chunk_chars);
        let delay = self.delay;
        let stream = stream::iter(pieces).then(move |piece| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(piece)
        });
        Ok(Box::pin(stream))
    }
}

/// Split on character boundaries into pieces of at most `size` characters.
pub fn split_chars(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}
