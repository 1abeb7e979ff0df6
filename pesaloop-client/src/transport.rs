//! The seam between the request pipeline and the network.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap, Method, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use pesaloop_api_core::error::{CommonApiError, CommonErrorKind};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ApiConfig;

// Avoid `Method::` prefix. Associated constants can't be imported
pub const GET: Method = Method::GET;
pub const PUT: Method = Method::PUT;
pub const POST: Method = Method::POST;
pub const PATCH: Method = Method::PATCH;
pub const DELETE: Method = Method::DELETE;

/// An outbound request, kept around so it can be replayed with a fresh
/// auth header.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    pub method: Method,
    /// Relative to the API base URL, e.g. `/wallets/`.
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: HeaderMap,
    /// Whether a 401 means the session expired and should be refreshed. Off
    /// for the unauthenticated `/auth` endpoints, where a 401 just means the
    /// credentials were wrong.
    pub refresh_on_401: bool,
}

impl PendingRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
            refresh_on_401: true,
        }
    }

    /// A request with a JSON body.
    pub fn json<T: Serialize + ?Sized>(
        method: Method,
        path: impl Into<String>,
        body: &T,
    ) -> Result<Self, CommonApiError> {
        let bytes = serde_json::to_vec(body).map_err(|e| {
            let msg = format!("Failed to serialize request body: {e:#}");
            CommonApiError::new(CommonErrorKind::Building, msg)
        })?;
        let mut req = Self::new(method, path);
        req.body = Some(Bytes::from(bytes));
        Ok(req)
    }

    /// Don't treat a 401 response as an expired session.
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_401 = false;
        self
    }
}

/// A response of any status with its body fully read.
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Sends a [`PendingRequest`] and reads the whole response.
///
/// Only transport failures (no response at all) are `Err`. Every status,
/// including 4xx/5xx, comes back as `Ok` for the caller to classify.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn send(
        &self,
        req: PendingRequest,
    ) -> Result<RawResponse, CommonApiError>;
}

/// The production [`HttpTransport`].
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: ApiConfig,
}

impl ReqwestTransport {
    pub fn new(config: ApiConfig) -> Result<Self, CommonApiError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, config.content_type.clone());
        default_headers.insert(ACCEPT, config.accept.clone());

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(default_headers)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        req: PendingRequest,
    ) -> Result<RawResponse, CommonApiError> {
        let PendingRequest {
            method,
            path,
            body,
            headers,
            refresh_on_401: _,
        } = req;
        let start = Instant::now();
        debug!(%method, %path, "New client request");

        let mut builder = self
            .client
            .request(method.clone(), self.config.url(&path))
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.inspect_err(|e| {
            let req_ms = start.elapsed().as_millis() as u64;
            warn!(%method, %path, req_ms, "Done (error)(sending): {e:#}");
        })?;

        let status = resp.status();
        let body = resp.bytes().await.inspect_err(|e| {
            let req_ms = start.elapsed().as_millis() as u64;
            warn!(
                %method, %path, req_ms, %status,
                "Done (error)(receiving): {e:#}",
            );
        })?;

        let req_ms = start.elapsed().as_millis() as u64;
        if status.is_success() {
            debug!(%method, %path, req_ms, %status, "Done (success)");
        } else {
            debug!(%method, %path, req_ms, %status, "Done (error)(response)");
        }
        Ok(RawResponse { status, body })
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_request() {
        let req =
            PendingRequest::json(POST, "/auth/token/create/", &json!({"a": 1}))
                .unwrap();
        assert_eq!(req.method, POST);
        assert_eq!(req.body.unwrap(), Bytes::from_static(br#"{"a":1}"#));
        assert!(req.refresh_on_401);

        let req = PendingRequest::new(GET, "/wallets/").without_refresh();
        assert!(!req.refresh_on_401);
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn connect_failure_is_a_connect_error() {
        let mut config = ApiConfig::default();
        // Nothing listens on port 9 (discard) on loopback in CI.
        config.base_url = "http://127.0.0.1:9".to_owned();
        let transport = ReqwestTransport::new(config).unwrap();

        let err = transport
            .send(PendingRequest::new(GET, "/ping/"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, CommonErrorKind::Connect);
    }
}
