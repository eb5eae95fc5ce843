pub mod http;
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// A single-turn request to the text service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone, Error)]
pub enum GenerativeError {
    #[error("generative service credentials are not configured")]
    MissingCredentials,
    #[error("no generative model configured")]
    MissingModel,
    #[error("generative service timed out")]
    Timeout,
    #[error("generative service rejected credentials ({status})")]
    Unauthorized { status: u16 },
    #[error("generative service rate limit hit")]
    RateLimited,
    #[error("generative service error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("generative service unreachable: {0}")]
    Transport(String),
    #[error("generative service returned no text")]
    EmptyResponse,
}

/// The interpreter behind every reading. Slow (seconds) and rate limited;
/// callers pace themselves with [`OutboundThrottle`](crate::throttle::OutboundThrottle).
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, GenerativeError>;
}
