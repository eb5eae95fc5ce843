use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{GenerativeClient, GenerativeError, Prompt};

pub const DEFAULT_BASE_URL: &str = "https://qianfan.baidubce.com";
const COMPLETIONS_PATH: &str = "/v2/chat/completions";

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct ChatCompletionsClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl ChatCompletionsClient {
    pub fn new(
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GenerativeError> {
        if model.trim().is_empty() {
            return Err(GenerativeError::MissingModel);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerativeError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            api_key: api_key.filter(|k| !k.is_empty()),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, COMPLETIONS_PATH)
    }

    fn build_request<'a>(&'a self, prompt: &'a Prompt) -> ApiRequest<'a> {
        ApiRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
        }
    }
}

fn classify_status(status: StatusCode, body: String) -> GenerativeError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerativeError::Unauthorized {
            status: status.as_u16(),
        },
        StatusCode::TOO_MANY_REQUESTS => GenerativeError::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => GenerativeError::Timeout,
        _ => GenerativeError::Api {
            status: status.as_u16(),
            body,
        },
    }
}

fn transport_error(e: reqwest::Error) -> GenerativeError {
    if e.is_timeout() {
        GenerativeError::Timeout
    } else {
        GenerativeError::Transport(e.to_string())
    }
}

#[async_trait]
impl GenerativeClient for ChatCompletionsClient {
    async fn complete(&self, prompt: &Prompt) -> Result<String, GenerativeError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GenerativeError::MissingCredentials)?;

        let resp = self
            .http
            .post(self.endpoint())
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {api_key}"))
            .json(&self.build_request(prompt))
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let parsed: ApiResponse = resp.json().await.map_err(transport_error)?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(GenerativeError::EmptyResponse);
        }
        Ok(text)
    }
}

// --- API types ---

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}
