//! HTTP implementation of [`RemoteService`].

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::protocol::{
    ChangesResponse, ErrorBody, PushRequest, PushResponse, CHANGES_PATH, HEALTH_PATH,
    MUTATIONS_PATH,
};
use super::{RemoteService, SyncError};
use crate::models::MutationRecord;

/// Per-request timeout used when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sync server client over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    server_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(
        server_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Protocol(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            server_url: server_url.into(),
            api_key,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SyncError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, error_message(response).await));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid response body: {}", e)))
    }
}

impl RemoteService for HttpRemote {
    async fn fetch_changes(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ChangesResponse, SyncError> {
        let mut request = self.client.get(build_http_url(&self.server_url, CHANGES_PATH));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339_opts(SecondsFormat::Micros, true))]);
        }
        self.send(request).await
    }

    async fn push_mutations(
        &self,
        mutations: Vec<MutationRecord>,
    ) -> Result<PushResponse, SyncError> {
        let request = self
            .client
            .post(build_http_url(&self.server_url, MUTATIONS_PATH))
            .json(&PushRequest { mutations });
        self.send(request).await
    }
}

/// Returns true if the server answers its health endpoint.
pub async fn check_server(server_url: &str) -> bool {
    let client = match Client::builder().timeout(Duration::from_secs(5)).build() {
        Ok(client) => client,
        Err(_) => return false,
    };

    client
        .get(build_http_url(server_url, HEALTH_PATH))
        .send()
        .await
        .map(|response| response.status().is_success())
        .unwrap_or(false)
}

/// Joins a server URL and a path, defaulting to `http://` when no scheme
/// is given.
pub fn build_http_url(server_url: &str, path: &str) -> String {
    let base_url = if server_url.starts_with("http://") || server_url.starts_with("https://") {
        server_url.to_string()
    } else {
        format!("http://{}", server_url)
    };

    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn request_error(e: reqwest::Error) -> SyncError {
    if e.is_builder() {
        SyncError::Protocol(e.to_string())
    } else {
        SyncError::Transient(e.to_string())
    }
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => format!("server returned status {}", status),
    }
}

/// Maps an HTTP status to the error taxonomy.
pub fn status_error(status: StatusCode, message: String) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(message),
        StatusCode::GONE => SyncError::CursorExpired,
        StatusCode::CONFLICT => SyncError::Conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::Transient(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => SyncError::Validation(message),
        s if s.is_server_error() => SyncError::Transient(message),
        _ => SyncError::Protocol(message),
    }
}
