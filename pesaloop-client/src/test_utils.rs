//! A scripted in-memory backend for exercising the request pipeline without
//! a network.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, header::AUTHORIZATION};
use pesaloop_api_core::{
    auth::{AccessToken, RefreshToken, TokenPair, path},
    error::{CommonApiError, CommonErrorKind},
};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::transport::{HttpTransport, PendingRequest, RawResponse};

/// What the refresh endpoint does with a well-formed request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefreshOutcome {
    /// Mint and return a new pair, invalidating the old one.
    Rotate,
    /// Mint a new access token but keep the current refresh token.
    AccessOnly,
    /// Respond with this status.
    Reject(StatusCode),
    /// Fail without a response.
    Disconnect,
}

/// A request as the backend saw it.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    /// The raw `Authorization` header, if any.
    pub auth: Option<String>,
    pub body: Option<Value>,
}

struct FakeState {
    valid_access: Option<String>,
    valid_refresh: Option<String>,
    next_token: u64,
    refresh_outcome: RefreshOutcome,
    revoke_status: StatusCode,
    disconnected: bool,
    refresh_calls: usize,
    revoke_calls: usize,
    calls: Vec<RecordedCall>,
    scripted: HashMap<(Method, String), VecDeque<(StatusCode, Value)>>,
}

/// Accepts exactly one access token at a time, like the real backend once
/// the previous one expires.
///
/// Protected routes answer `200 {"path": .., "token": ..}` with a valid
/// token, or `401` otherwise. Responses queued with [`script`] replace the
/// `200` for authorized requests.
///
/// [`script`]: Self::script
pub struct FakeBackend {
    state: Mutex<FakeState>,
    refresh_gate: watch::Sender<bool>,
    refresh_path: String,
    revoke_path: String,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::with_paths(path::REFRESH, path::REVOKE)
    }
}

impl FakeBackend {
    /// The password [`path::LOGIN`] accepts.
    pub const PASSWORD: &'static str = "correct horse";
    /// The OTP [`path::VERIFY_OTP`] accepts.
    pub const OTP: &'static str = "123456";

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_paths(
        refresh_path: impl Into<String>,
        revoke_path: impl Into<String>,
    ) -> Self {
        Self {
            state: Mutex::new(FakeState {
                valid_access: None,
                valid_refresh: None,
                next_token: 1,
                refresh_outcome: RefreshOutcome::Rotate,
                revoke_status: StatusCode::OK,
                disconnected: false,
                refresh_calls: 0,
                revoke_calls: 0,
                calls: Vec::new(),
                scripted: HashMap::new(),
            }),
            refresh_gate: watch::Sender::new(true),
            refresh_path: refresh_path.into(),
            revoke_path: revoke_path.into(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Mint a pair the backend accepts, as if the user just logged in.
    pub fn issue_tokens(&self) -> TokenPair {
        self.lock().mint(true)
    }

    /// The current access token stops being accepted.
    pub fn expire_access(&self) {
        self.lock().valid_access = None;
    }

    pub fn set_refresh_outcome(&self, outcome: RefreshOutcome) {
        self.lock().refresh_outcome = outcome;
    }

    pub fn set_revoke_status(&self, status: StatusCode) {
        self.lock().revoke_status = status;
    }

    /// Every call fails with a connect error while set.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.lock().disconnected = disconnected;
    }

    /// Refresh calls block until [`release_refreshes`].
    ///
    /// [`release_refreshes`]: Self::release_refreshes
    pub fn hold_refreshes(&self) {
        self.refresh_gate.send_replace(false);
    }

    pub fn release_refreshes(&self) {
        self.refresh_gate.send_replace(true);
    }

    /// Queue a one-off response for the next authorized call to this route.
    pub fn script(
        &self,
        method: Method,
        path: impl Into<String>,
        status: StatusCode,
        body: Value,
    ) {
        self.lock()
            .scripted
            .entry((method, path.into()))
            .or_default()
            .push_back((status, body));
    }

    pub fn refresh_calls(&self) -> usize {
        self.lock().refresh_calls
    }

    pub fn revoke_calls(&self) -> usize {
        self.lock().revoke_calls
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Recorded calls to `path`, in order.
    pub fn calls_to(&self, path: &str) -> Vec<RecordedCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.path == path)
            .cloned()
            .collect()
    }

    async fn handle_refresh(&self, body: &Value) -> Response {
        let mut gate = self.refresh_gate.subscribe();
        // The sender lives in `self`, so this can't fail.
        let _ = gate.wait_for(|open| *open).await;

        let mut state = self.lock();
        match state.refresh_outcome {
            RefreshOutcome::Disconnect => Err(disconnected()),
            RefreshOutcome::Reject(status) =>
                ok(status, json!({ "detail": "Token is invalid or expired" })),
            outcome => {
                let presented = body.get("refresh").and_then(Value::as_str);
                let valid = state.valid_refresh.as_deref();
                if presented.is_none() || presented != valid {
                    return ok(
                        StatusCode::UNAUTHORIZED,
                        json!({ "detail": "Token is invalid or expired" }),
                    );
                }
                let rotate = outcome == RefreshOutcome::Rotate;
                let pair = state.mint(rotate);
                if rotate {
                    ok(StatusCode::OK, json!(pair))
                } else {
                    ok(StatusCode::OK, json!({ "access": pair.access }))
                }
            }
        }
    }

    fn handle_revoke(&self) -> Response {
        let mut state = self.lock();
        state.valid_access = None;
        state.valid_refresh = None;
        ok(state.revoke_status, json!({}))
    }

    fn handle_login(&self, body: &Value) -> Response {
        let password = body.get("password").and_then(Value::as_str);
        if password != Some(Self::PASSWORD) {
            return ok(
                StatusCode::UNAUTHORIZED,
                json!({ "message": "No active account found" }),
            );
        }
        let identifier = body.get("identifier").and_then(Value::as_str);
        let pair = self.lock().mint(true);
        ok(
            StatusCode::OK,
            json!({
                "access": pair.access,
                "refresh": pair.refresh,
                "message": "Login successful",
                "success": true,
                "user": {
                    "account_number": "PL0001",
                    "email": identifier.unwrap_or_default(),
                    "first_name": "Amina",
                    "last_name": "Otieno",
                    "phone_number": "+254700000001",
                    "is_email_verified": true,
                    "is_phone_verified": true,
                    "is_active": true,
                },
                "customerProfile": {
                    "id": "cp1",
                    "verification_status": "pending",
                },
            }),
        )
    }

    fn handle_verify_otp(body: &Value) -> Response {
        if body.get("otp").and_then(Value::as_str) != Some(Self::OTP) {
            let body = json!({ "error": "Invalid OTP" });
            return ok(StatusCode::BAD_REQUEST, body);
        }
        ok(
            StatusCode::OK,
            json!({
                "message": "Account verified",
                "user_verified": {
                    "is_email_verified": true,
                    "is_phone_verified": true,
                },
            }),
        )
    }

    fn handle_protected(
        &self,
        req: &PendingRequest,
        auth: Option<&str>,
    ) -> Response {
        let mut state = self.lock();
        let authorized = match (&state.valid_access, auth) {
            (Some(valid), Some(auth)) =>
                auth.strip_prefix("Bearer ") == Some(valid.as_str()),
            _ => false,
        };
        if !authorized {
            return ok(
                StatusCode::UNAUTHORIZED,
                json!({
                    "detail": "Given token not valid for any token type",
                    "code": "token_not_valid",
                }),
            );
        }

        let route = (req.method.clone(), req.path.clone());
        if let Some((status, body)) = state
            .scripted
            .get_mut(&route)
            .and_then(VecDeque::pop_front)
        {
            return ok(status, body);
        }
        ok(
            StatusCode::OK,
            json!({ "path": req.path, "token": state.valid_access }),
        )
    }
}

impl FakeState {
    fn mint(&mut self, rotate_refresh: bool) -> TokenPair {
        let n = self.next_token;
        self.next_token += 1;
        let access = format!("access-{n}");
        self.valid_access = Some(access.clone());
        if rotate_refresh || self.valid_refresh.is_none() {
            self.valid_refresh = Some(format!("refresh-{n}"));
        }
        TokenPair {
            access: AccessToken::new(access),
            refresh: RefreshToken::new(
                self.valid_refresh.clone().unwrap_or_default(),
            ),
        }
    }
}

type Response = Result<RawResponse, CommonApiError>;

fn ok(status: StatusCode, body: Value) -> Response {
    Ok(RawResponse {
        status,
        body: Bytes::from(body.to_string()),
    })
}

fn disconnected() -> CommonApiError {
    CommonApiError::new(CommonErrorKind::Connect, "connection refused")
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn send(&self, req: PendingRequest) -> Response {
        let auth = req
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let body = req
            .body
            .as_ref()
            .and_then(|body| serde_json::from_slice::<Value>(body).ok());

        {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                method: req.method.clone(),
                path: req.path.clone(),
                auth: auth.clone(),
                body: body.clone(),
            });
            if req.path == self.refresh_path {
                state.refresh_calls += 1;
            } else if req.path == self.revoke_path {
                state.revoke_calls += 1;
            }
            if state.disconnected {
                return Err(disconnected());
            }
        }

        let body = body.unwrap_or(Value::Null);
        match req.path.as_str() {
            p if p == self.refresh_path => self.handle_refresh(&body).await,
            p if p == self.revoke_path => self.handle_revoke(),
            path::LOGIN => self.handle_login(&body),
            path::VERIFY_OTP => Self::handle_verify_otp(&body),
            path::REGISTER => ok(
                StatusCode::CREATED,
                json!({ "message": "Account created" }),
            ),
            path::RESEND_OTP =>
                ok(StatusCode::OK, json!({ "message": "OTP sent" })),
            path::FORGOT_PASSWORD => ok(
                StatusCode::OK,
                json!({ "message": "Password reset link sent" }),
            ),
            _ => self.handle_protected(&req, auth.as_deref()),
        }
    }
}
