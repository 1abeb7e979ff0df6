//! The authenticated API client.
//!
//! Every request goes out with the current auth header. A 401 is handed to
//! the [`RefreshCoordinator`] and the request is replayed at most
//! [`MAX_AUTH_RETRIES`] times with the header it hands back. Every other
//! failure is classified into a [`SessionApiError`].

use std::sync::Arc;

use http::{Method, StatusCode};
use pesaloop_api_core::{
    error::{CommonApiError, SessionApiError},
    models::ApiResponse,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    auth_header::AuthHeader,
    refresh::RefreshCoordinator,
    transport::{
        DELETE, GET, HttpTransport, PATCH, POST, PUT, PendingRequest,
        RawResponse,
    },
};

/// How many times a request is replayed after a refresh.
pub const MAX_AUTH_RETRIES: usize = 1;

/// Clone to share; all clones use the same session and coordinator.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    auth_header: Arc<AuthHeader>,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        auth_header: Arc<AuthHeader>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            transport,
            auth_header,
            coordinator,
        }
    }

    /// Send `req`, recovering from one expired access token.
    ///
    /// Returns the raw response for any 2xx status.
    pub async fn send(
        &self,
        req: PendingRequest,
    ) -> Result<RawResponse, SessionApiError> {
        let mut header = self.auth_header.current();
        let mut retries = 0;

        loop {
            let mut attempt = req.clone();
            self.auth_header.apply(&mut attempt.headers, header.as_ref());

            let resp = self.transport.send(attempt).await?;
            let status = resp.status;
            if status.is_success() {
                return Ok(resp);
            }
            if status != StatusCode::UNAUTHORIZED || !req.refresh_on_401 {
                let err = SessionApiError::from_response(status, &resp.body);
                debug!(method = %req.method, path = %req.path, "{err}");
                return Err(err);
            }

            if retries >= MAX_AUTH_RETRIES {
                // The coordinator already handled the session on the first
                // 401; a second one just fails this request.
                warn!(
                    method = %req.method, path = %req.path,
                    "Rejected again after refreshing",
                );
                return Err(SessionApiError {
                    status: Some(status),
                    ..SessionApiError::session_expired(
                        "Rejected after refreshing the access token",
                    )
                });
            }

            let refreshed =
                self.coordinator.on_unauthorized(header.as_ref()).await?;
            header = Some(refreshed);
            retries += 1;
        }
    }

    /// Send `req` and decode the JSON body.
    ///
    /// An empty body decodes as JSON `null`, so `T = ()` works for
    /// endpoints that return nothing.
    pub async fn request<T: DeserializeOwned>(
        &self,
        req: PendingRequest,
    ) -> Result<ApiResponse<T>, SessionApiError> {
        let resp = self.send(req).await?;
        let value = if resp.body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&resp.body).map_err(CommonApiError::from)?
        };
        let resp =
            ApiResponse::from_json(value).map_err(CommonApiError::from)?;
        Ok(resp)
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<ApiResponse<T>, SessionApiError> {
        self.request(PendingRequest::new(GET, path)).await
    }

    pub async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, SessionApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(POST, path, body).await
    }

    pub async fn put<B, T>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, SessionApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(PUT, path, body).await
    }

    pub async fn patch<B, T>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, SessionApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.with_body(PATCH, path, body).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<ApiResponse<T>, SessionApiError> {
        self.request(PendingRequest::new(DELETE, path)).await
    }

    async fn with_body<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, SessionApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = PendingRequest::json(method, path, body)?;
        self.request(req).await
    }
}
