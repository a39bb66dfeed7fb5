//! HTTP attempt API client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use examsession_core::error::ApiError;
use examsession_core::model::{
    AttemptRecord, Checkpoint, NewAttempt, Question, SubmitRequest, SubmitResponse,
};
use examsession_core::traits::AttemptApi;

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Attempt API over HTTP/JSON.
///
/// | call | request |
/// |---|---|
/// | create | `POST {base}/attempts` |
/// | get | `GET {base}/attempts/{id}` |
/// | questions | `GET {base}/tests/{id}/questions` |
/// | checkpoint | `PUT {base}/attempts/{id}/checkpoint` |
/// | submit | `POST {base}/attempts/{id}/submit` |
/// | cleanup | `POST {base}/attempts/{id}/cleanup` |
pub struct HttpAttemptApi {
    base_url: String,
    token: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl HttpAttemptApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            timeout_secs: timeout.as_secs(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(self.timeout_secs)
            } else {
                ApiError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status < 400 {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(ErrorBody::into_message)
            .unwrap_or(body);
        Err(match status {
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            _ => ApiError::Http { status, message },
        })
    }

    async fn json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ApiError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[derive(Serialize)]
struct CreateAttemptBody<'a> {
    test_id: &'a str,
    user_id: &'a str,
    start_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Nested { error: ErrorDetail },
    Flat { message: String },
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

impl ErrorBody {
    fn into_message(self) -> String {
        match self {
            ErrorBody::Nested { error } => error.message,
            ErrorBody::Flat { message } => message,
        }
    }
}

#[async_trait]
impl AttemptApi for HttpAttemptApi {
    #[instrument(skip(self, start_time))]
    async fn create_attempt(
        &self,
        test_id: &str,
        user_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<NewAttempt, ApiError> {
        let body = CreateAttemptBody {
            test_id,
            user_id,
            start_time,
        };
        self.json(self.client.post(self.url("/attempts")).json(&body))
            .await
    }

    #[instrument(skip(self))]
    async fn get_attempt(&self, attempt_id: &str) -> Result<AttemptRecord, ApiError> {
        self.json(self.client.get(self.url(&format!("/attempts/{attempt_id}"))))
            .await
    }

    #[instrument(skip(self))]
    async fn fetch_questions(&self, test_id: &str) -> Result<Vec<Question>, ApiError> {
        self.json(self.client.get(self.url(&format!("/tests/{test_id}/questions"))))
            .await
    }

    #[instrument(skip(self, checkpoint), fields(index = checkpoint.current_index))]
    async fn save_checkpoint(
        &self,
        attempt_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), ApiError> {
        self.send(
            self.client
                .put(self.url(&format!("/attempts/{attempt_id}/checkpoint")))
                .json(checkpoint),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(answers = request.final_answers.len()))]
    async fn submit_attempt(
        &self,
        attempt_id: &str,
        request: &SubmitRequest,
    ) -> Result<SubmitResponse, ApiError> {
        self.json(
            self.client
                .post(self.url(&format!("/attempts/{attempt_id}/submit")))
                .json(request),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn cleanup(&self, attempt_id: &str) -> Result<(), ApiError> {
        self.send(
            self.client
                .post(self.url(&format!("/attempts/{attempt_id}/cleanup"))),
        )
        .await?;
        Ok(())
    }
}
