use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::action::ActionKind;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum FieldbookError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct FieldbookClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl FieldbookClient {
    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, FieldbookError> {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    /// Every request carries `timeout`; a hung call must not block the queue.
    pub fn with_timeout(
        base_url: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FieldbookError> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lightweight liveness probe telling "interface up" apart from "API reachable".
    pub async fn ping(&self) -> Result<(), FieldbookError> {
        let url = self.endpoint("/v1/health")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    /// Sends a queued action's payload to the endpoint for its kind.
    ///
    /// Returns the resource the server created or updated, or `None` when the
    /// endpoint answers `204 No Content`.
    pub async fn deliver(
        &self,
        kind: ActionKind,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<Option<Value>, FieldbookError> {
        let (method, path) = kind.endpoint();
        let url = self.endpoint(path)?;
        let response = self
            .http
            .request(method, url)
            .header("Authorization", self.auth_header_value())
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(payload)
            .send()
            .await?;
        Self::handle_optional_response(response).await
    }

    pub async fn list_clients(&self) -> Result<Vec<Value>, FieldbookError> {
        self.list("/v1/clients").await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Value>, FieldbookError> {
        self.list("/v1/sessions").await
    }

    pub async fn list_invoices(&self) -> Result<Vec<Value>, FieldbookError> {
        self.list("/v1/invoices").await
    }

    pub async fn get_active_session(&self) -> Result<Option<Value>, FieldbookError> {
        let url = self.endpoint("/v1/sessions/active")?;
        let response = self
            .http
            .request(Method::GET, url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_optional_response(response).await
    }

    async fn list(&self, path: &str) -> Result<Vec<Value>, FieldbookError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let page: ItemList = Self::handle_response(response).await?;
        Ok(page.items)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, FieldbookError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, FieldbookError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn handle_optional_response(
        response: reqwest::Response,
    ) -> Result<Option<Value>, FieldbookError> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    async fn api_error(response: reqwest::Response) -> FieldbookError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        FieldbookError::Api { status, body }
    }
}

impl FieldbookError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            FieldbookError::Api { status, .. } => classify_api_status(*status),
            // Network, timeout and body decode failures say nothing about the
            // action itself, so they are retried with the same idempotency key.
            FieldbookError::Request(err) if err.is_builder() => ApiErrorClass::Permanent,
            FieldbookError::Request(_) => ApiErrorClass::Transient,
            FieldbookError::Url(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.classification(), ApiErrorClass::Permanent)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FieldbookError::Request(err) if err.is_timeout())
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<Value>,
}
