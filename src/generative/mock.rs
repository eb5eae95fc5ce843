use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{GenerativeClient, GenerativeError, Prompt};

/// A scripted client for tests. Returns pre-defined replies in order; once
/// the script runs out the last reply repeats.
pub struct MockClient {
    replies: Vec<Result<String, GenerativeError>>,
    index: AtomicUsize,
    delay: Duration,
    prompts: Mutex<Vec<Prompt>>,
}

impl MockClient {
    pub fn new(replies: Vec<Result<String, GenerativeError>>) -> Self {
        Self {
            replies,
            index: AtomicUsize::new(0),
            delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    /// Always fail with `error`.
    pub fn failing(error: GenerativeError) -> Self {
        Self::new(vec![Err(error)])
    }

    /// Sleep this long before answering, simulating a slow provider.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }

    /// Every prompt received so far, in call order.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl GenerativeClient for MockClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String, GenerativeError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.clone());
        }
        let i = self.index.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .get(i)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or(Err(GenerativeError::EmptyResponse))
    }
}
