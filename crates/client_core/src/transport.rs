use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::error::ApiError;
use tracing::{debug, warn};

use crate::{
    error::{ClientError, Result},
    token_manager::TokenManager,
};

/// An outgoing API call. `requires_auth` decides whether the authorization layer attaches a
/// bearer token and applies the refresh-and-retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub requires_auth: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            requires_auth: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn unauthenticated(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        let body = serde_json::to_value(body)
            .map_err(|err| ClientError::MalformedRemoteData(format!("request body: {err}")))?;
        self.body = Some(body);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED.as_u16()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ClientError::MalformedRemoteData(err.to_string()))
    }

    pub fn into_error(self) -> ClientError {
        let message = match serde_json::from_slice::<ApiError>(&self.body) {
            Ok(api_error) => api_error.message,
            Err(_) => String::from_utf8_lossy(&self.body).trim().to_string(),
        };
        ClientError::Api {
            status: self.status,
            message,
        }
    }

    fn into_success(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_error())
        }
    }
}

/// Executes one HTTP exchange. Only transport failures are errors; every status code is
/// returned to the caller.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse>;
}

pub struct ReqwestExecutor {
    http: Client,
    base_url: String,
}

impl ReqwestExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        debug!(method = %request.method, path = %request.path, status, "api call completed");
        Ok(ApiResponse { status, body })
    }
}

pub struct AuthorizingTransport {
    executor: Arc<dyn HttpExecutor>,
    tokens: Arc<TokenManager>,
}

impl AuthorizingTransport {
    pub fn new(executor: Arc<dyn HttpExecutor>, tokens: Arc<TokenManager>) -> Self {
        Self { executor, tokens }
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Sends the request and returns the raw response. 401 on an authorized request never
    /// reaches the caller: it becomes a retry or `SessionExpired`.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        if !request.requires_auth {
            return self.executor.execute(request, None).await;
        }

        let token = self.tokens.get_valid_token().await?;
        let response = self.executor.execute(request, Some(&token)).await?;
        if !response.is_unauthorized() {
            return Ok(response);
        }

        debug!(path = %request.path, "access token rejected; refreshing once");
        let renewed = self.tokens.refresh_after_rejection(&token).await?;
        let retried = self.executor.execute(request, Some(&renewed)).await?;
        if retried.is_unauthorized() {
            warn!(path = %request.path, "refreshed token rejected; session expired");
            self.tokens.notify_session_expired();
            return Err(ClientError::SessionExpired);
        }
        Ok(retried)
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T> {
        self.send(request).await?.into_success()?.json()
    }

    pub async fn send_unit(&self, request: &ApiRequest) -> Result<()> {
        self.send(request).await?.into_success()?;
        Ok(())
    }
}

pub(crate) async fn execute_json<T: DeserializeOwned>(
    executor: &dyn HttpExecutor,
    request: &ApiRequest,
) -> Result<T> {
    executor.execute(request, None).await?.into_success()?.json()
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
