//! Scripted generator for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;

use crate::generation::{GenerationError, GenerationRequest, TextGenerator, TextStream};

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these deltas, then finish.
    Chunks(Vec<String>),
    /// Yield these deltas, then fail with the message.
    FailAfter(Vec<String>, String),
    /// Fail before producing anything.
    Error(GenerationError),
    /// Yield these deltas, then never finish.
    Hang(Vec<String>),
    /// Sleep before every delta of the inner response.
    Paced(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Deltas from string slices.
    pub fn chunks(parts: &[&str]) -> Self {
        Self::Chunks(parts.iter().map(|p| (*p).to_string()).collect())
    }

    /// Deltas followed by a mid-stream failure.
    pub fn fail_after(parts: &[&str], message: &str) -> Self {
        Self::FailAfter(
            parts.iter().map(|p| (*p).to_string()).collect(),
            message.to_string(),
        )
    }

    /// Pace any response.
    pub fn paced(delay: Duration, inner: MockResponse) -> Self {
        Self::Paced(delay, Box::new(inner))
    }
}

/// Generator that replays [`MockResponse`]s in order and records requests.
///
/// Once the script runs out, the last response is repeated.
pub struct MockGenerator {
    script: Mutex<VecDeque<MockResponse>>,
    last: Mutex<Option<MockResponse>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    /// Script the replies.
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Number of `generate` calls.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn next_response(&self) -> Option<MockResponse> {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(response) => {
                *last = Some(response.clone());
                Some(response)
            }
            None => last.clone(),
        }
    }
}

fn into_stream(response: MockResponse, pace: Duration) -> Result<TextStream, GenerationError> {
    let (parts, tail): (Vec<String>, Option<Result<(), String>>) = match response {
        MockResponse::Chunks(parts) => (parts, None),
        MockResponse::FailAfter(parts, message) => (parts, Some(Err(message))),
        MockResponse::Hang(parts) => (parts, Some(Ok(()))),
        MockResponse::Error(err) => return Err(err),
        MockResponse::Paced(delay, inner) => return into_stream(*inner, pace + delay),
    };

    let body = stream::iter(parts.into_iter().map(Ok)).then(move |item| async move {
        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
        item
    });

    let stream: TextStream = match tail {
        None => Box::pin(body),
        Some(Err(message)) => Box::pin(body.chain(stream::once(async move {
            Err(GenerationError::Failed(message))
        }))),
        Some(Ok(())) => Box::pin(body.chain(stream::pending())),
    };
    Ok(stream)
}

#[async_trait]
impl TextGenerator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<TextStream, GenerationError> {
        self.requests.lock().push(request.clone());
        let Some(response) = self.next_response() else {
            return Err(GenerationError::Unavailable(
                "MockGenerator: no response scripted".into(),
            ));
        };
        into_stream(response, Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::SessionId;

    fn request(q: &str) -> GenerationRequest {
        GenerationRequest::new(SessionId::from_raw("s1"), q)
    }

    #[tokio::test]
    async fn replays_chunks() {
        let mock = MockGenerator::new(vec![MockResponse::chunks(&["He", "llo"])]);
        let items: Vec<_> = mock.generate(&request("hello")).await.unwrap().collect().await;
        assert_eq!(items, vec![Ok("He".to_string()), Ok("llo".to_string())]);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.requests()[0].query, "hello");
    }

    #[tokio::test]
    async fn fail_after_ends_with_error() {
        let mock = MockGenerator::new(vec![MockResponse::fail_after(&["a"], "boom")]);
        let items: Vec<_> = mock.generate(&request("q")).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Err(GenerationError::Failed("boom".into())));
    }

    #[tokio::test]
    async fn error_fails_generate() {
        let mock = MockGenerator::new(vec![MockResponse::Error(GenerationError::Unavailable(
            "down".into(),
        ))]);
        assert!(mock.generate(&request("q")).await.is_err());
    }

    #[tokio::test]
    async fn repeats_last_response() {
        let mock = MockGenerator::new(vec![MockResponse::chunks(&["x"])]);
        for _ in 0..3 {
            let items: Vec<_> = mock.generate(&request("q")).await.unwrap().collect().await;
            assert_eq!(items.len(), 1);
        }
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let mock = MockGenerator::new(Vec::new());
        assert!(matches!(
            mock.generate(&request("q")).await,
            Err(GenerationError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn paced_waits_between_chunks() {
        let mock = MockGenerator::new(vec![MockResponse::paced(
            Duration::from_secs(1),
            MockResponse::chunks(&["a", "b"]),
        )]);
        let start = tokio::time::Instant::now();
        let items: Vec<_> = mock.generate(&request("q")).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
