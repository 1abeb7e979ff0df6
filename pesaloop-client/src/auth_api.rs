//! Calls to the `/auth` endpoints.
//!
//! None of these ever trigger a refresh: a 401 from them means bad
//! credentials, not an expired session. Session bookkeeping around login and
//! logout lives in [`SessionManager`](crate::session::SessionManager).

use pesaloop_api_core::{
    auth::{
        IdentifierRequest, LoginRequest, LoginResponse, MessageResponse,
        RefreshRequest, RefreshToken, SignupRequest, VerifyOtpRequest,
        VerifyOtpResponse, path,
    },
    error::SessionApiError,
    models::ApiResponse,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    client::ApiClient,
    config::ApiConfig,
    transport::{POST, PendingRequest},
};

#[derive(Clone)]
pub struct AuthApi {
    client: ApiClient,
    revoke_path: String,
}

impl AuthApi {
    pub fn new(client: ApiClient, config: &ApiConfig) -> Self {
        Self {
            client,
            revoke_path: config.revoke_path.clone(),
        }
    }

    async fn post<B, T>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse<T>, SessionApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = PendingRequest::json(POST, path, body)?.without_refresh();
        self.client.request(req).await
    }

    pub async fn signup(
        &self,
        req: &SignupRequest,
    ) -> Result<ApiResponse<MessageResponse>, SessionApiError> {
        self.post(path::REGISTER, req).await
    }

    pub async fn verify_otp(
        &self,
        req: &VerifyOtpRequest,
    ) -> Result<ApiResponse<VerifyOtpResponse>, SessionApiError> {
        self.post(path::VERIFY_OTP, req).await
    }

    pub async fn resend_otp(
        &self,
        req: &IdentifierRequest,
    ) -> Result<ApiResponse<MessageResponse>, SessionApiError> {
        self.post(path::RESEND_OTP, req).await
    }

    pub async fn forgot_password(
        &self,
        req: &IdentifierRequest,
    ) -> Result<ApiResponse<MessageResponse>, SessionApiError> {
        self.post(path::FORGOT_PASSWORD, req).await
    }

    /// Exchange credentials for a token pair. Doesn't touch the session.
    pub async fn login(
        &self,
        req: &LoginRequest,
    ) -> Result<ApiResponse<LoginResponse>, SessionApiError> {
        self.post(path::LOGIN, req).await
    }

    /// Ask the server to invalidate `refresh`.
    pub async fn revoke(
        &self,
        refresh: &RefreshToken,
    ) -> Result<(), SessionApiError> {
        let body = RefreshRequest {
            refresh: refresh.clone(),
        };
        self.post::<_, serde_json::Value>(&self.revoke_path, &body)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use http::StatusCode;
    use pesaloop_api_core::error::SessionErrorKind;

    use super::*;
    use crate::{
        auth_header::AuthHeader, events::SessionEvents,
        refresh::RefreshCoordinator, secret_store::SecretStore,
        session_store::SessionStore, test_utils::FakeBackend,
    };

    fn auth_api(backend: &Arc<FakeBackend>) -> AuthApi {
        let config = ApiConfig::default();
        let (secrets, _) = SecretStore::memory();
        let header = Arc::new(AuthHeader::from_config(&config));
        let session = Arc::new(SessionStore::new(secrets, header.clone()));
        let coordinator = RefreshCoordinator::new(
            session,
            backend.clone(),
            &config,
            SessionEvents::new(),
        );
        let client = ApiClient::new(backend.clone(), header, coordinator);
        AuthApi::new(client, &config)
    }

    fn login_req(password: &str) -> LoginRequest {
        LoginRequest {
            identifier: "amina@example.com".to_owned(),
            password: password.to_owned(),
            send_otp: true,
            with_profile: true,
        }
    }

    #[tokio::test]
    async fn login_returns_tokens_and_profile() {
        let backend = FakeBackend::new();
        let api = auth_api(&backend);

        let resp = api.login(&login_req(FakeBackend::PASSWORD)).await.unwrap();
        assert_eq!(resp.message, "Login successful");
        let login = resp.data;
        assert_eq!(login.tokens.access.as_str(), "access-1");
        assert_eq!(login.user.unwrap().email, "amina@example.com");
        assert_eq!(login.customer_profile.unwrap().id, "cp1");
    }

    #[tokio::test]
    async fn bad_password_never_refreshes() {
        let backend = FakeBackend::new();
        let api = auth_api(&backend);

        let err = api.login(&login_req("hunter2")).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Unauthenticated);
        assert_eq!(err.user_msg(), "No active account found");
        assert!(!err.is_session_ended());
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn otp_endpoints() {
        let backend = FakeBackend::new();
        let api = auth_api(&backend);

        let verify = |otp: &str| VerifyOtpRequest {
            identifier: "amina@example.com".to_owned(),
            otp: otp.to_owned(),
        };
        let resp = api.verify_otp(&verify(FakeBackend::OTP)).await.unwrap();
        assert!(resp.data.user_verified.unwrap().is_fully_verified());

        let err = api.verify_otp(&verify("000000")).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Validation);
        assert_eq!(err.user_msg(), "Invalid OTP");

        let req = IdentifierRequest {
            identifier: "+254700000001".to_owned(),
        };
        let resp = api.resend_otp(&req).await.unwrap();
        assert_eq!(resp.message, "OTP sent");
        let resp = api.forgot_password(&req).await.unwrap();
        assert_eq!(resp.data.message, "Password reset link sent");
    }

    #[tokio::test]
    async fn signup_and_revoke() {
        let backend = FakeBackend::new();
        let api = auth_api(&backend);

        let req = SignupRequest {
            first_name: "Amina".to_owned(),
            last_name: "Otieno".to_owned(),
            country_code: "KE".to_owned(),
            phone_number: "+254700000001".to_owned(),
            email: "amina@example.com".to_owned(),
            password: FakeBackend::PASSWORD.to_owned(),
        };
        let resp = api.signup(&req).await.unwrap();
        assert_eq!(resp.message, "Account created");

        let tokens = backend.issue_tokens();
        api.revoke(&tokens.refresh).await.unwrap();
        let calls = backend.calls_to(path::REVOKE);
        assert_eq!(calls.len(), 1);
        let body = calls[0].body.clone().unwrap();
        assert_eq!(body["refresh"], "refresh-1");

        backend.set_revoke_status(StatusCode::BAD_GATEWAY);
        let err = api.revoke(&tokens.refresh).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::UnexpectedStatus);
    }
}
