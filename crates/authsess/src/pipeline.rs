// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request pipeline: bearer attachment and refresh-on-401 with one retry.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::coordinator::{RefreshCoordinator, REFRESH_PATH};
use crate::error::{extract_api_error, ApiError, TransportError};
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, ApiResponse, Transport};

pub const LOGIN_PATH: &str = "/api/v1/auth/login";
pub const REGISTER_PATH: &str = "/api/v1/auth/register";

/// Endpoints that never carry a bearer and never trigger a refresh.
pub const AUTH_ENDPOINTS: [&str; 3] = [LOGIN_PATH, REGISTER_PATH, REFRESH_PATH];

pub fn is_auth_endpoint(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    AUTH_ENDPOINTS.contains(&path)
}

/// Authenticated API client. Cheap to clone.
#[derive(Clone)]
pub struct ApiClient {
    coordinator: Arc<RefreshCoordinator>,
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(coordinator: Arc<RefreshCoordinator>, transport: Arc<dyn Transport>) -> Self {
        Self { coordinator, transport }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send `request` through the pipeline.
    ///
    /// A 401 on a non-auth endpoint gets at most one retry. If the refresh
    /// fails the original 401 response is returned.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, TransportError> {
        if is_auth_endpoint(&request.path) {
            return self.transport.send(request).await;
        }

        let sent_with = self.store().access_token();
        if let Some(token) = &sent_with {
            request.set_bearer(token);
        }
        let mut retry = request.clone();
        let resp = self.transport.send(request).await?;
        if resp.status != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let token = match self.store().access_token() {
            // Someone else already replaced the token this request carried.
            Some(current) if sent_with.as_ref() != Some(&current) => {
                debug!(path = %retry.path, "401 with a superseded token, retrying with current");
                current
            }
            _ => match self.coordinator.ensure_fresh_token().await {
                Ok(token) => token,
                Err(e) => {
                    debug!(path = %retry.path, err = %e, "refresh failed, returning original 401");
                    return Ok(resp);
                }
            },
        };

        retry.set_bearer(&token);
        self.transport.send(retry).await
    }

    /// Send and map non-2xx statuses to [`ApiError::Status`].
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let resp = self.send(request).await?;
        if resp.is_success() {
            return Ok(resp);
        }
        let fallback = resp.status.canonical_reason().unwrap_or("request failed");
        Err(ApiError::Status {
            status: resp.status.as_u16(),
            message: extract_api_error(&resp.body, fallback),
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        Ok(self.execute(ApiRequest::get(path)).await?.json()?)
    }

    pub async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        Ok(self.execute(ApiRequest::post(path).json(body)).await?.json()?)
    }

    pub async fn patch_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        Ok(self.execute(ApiRequest::new(Method::PATCH, path).json(body)).await?.json()?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.execute(ApiRequest::new(Method::DELETE, path)).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
