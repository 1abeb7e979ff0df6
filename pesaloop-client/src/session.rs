//! The [`SessionManager`] owns every piece of session state and wires the
//! request pipeline together. Construct one at startup and share it.

use std::sync::Arc;

use pesaloop_api_core::{
    auth::{
        LoginRequest, LoginResponse, RefreshToken, VerifyOtpRequest,
        VerifyOtpResponse,
    },
    error::{CommonApiError, SessionApiError},
    models::ApiResponse,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    app_data::AppData,
    auth_api::AuthApi,
    auth_header::AuthHeader,
    client::ApiClient,
    config::ApiConfig,
    events::{SessionEvent, SessionEvents, SessionEventsRx},
    lifecycle::{AppState, BackgroundSafeGuard, LifecycleTrigger},
    refresh::RefreshCoordinator,
    secret_store::SecretStore,
    session_store::{Session, SessionStore},
    transport::{HttpTransport, ReqwestTransport},
};

/// Clone to share; clones refer to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ApiConfig,
    session: Arc<SessionStore>,
    client: ApiClient,
    auth_api: AuthApi,
    app_data: AppData,
    lifecycle: LifecycleTrigger,
    events: SessionEvents,
}

impl SessionManager {
    pub fn new(
        config: ApiConfig,
        secrets: SecretStore,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let events = SessionEvents::new();
        let auth_header = Arc::new(AuthHeader::from_config(&config));
        let session =
            Arc::new(SessionStore::new(secrets.clone(), auth_header.clone()));
        let coordinator = RefreshCoordinator::new(
            session.clone(),
            transport.clone(),
            &config,
            events.clone(),
        );
        let client = ApiClient::new(transport, auth_header, coordinator);
        let auth_api = AuthApi::new(client.clone(), &config);

        Self {
            inner: Arc::new(Inner {
                config,
                session,
                client,
                auth_api,
                app_data: AppData::new(secrets),
                lifecycle: LifecycleTrigger::default(),
                events,
            }),
        }
    }

    /// A manager talking to the real backend.
    pub fn with_reqwest(
        config: ApiConfig,
        secrets: SecretStore,
    ) -> Result<Self, CommonApiError> {
        let transport = Arc::new(ReqwestTransport::new(config.clone())?);
        Ok(Self::new(config, secrets, transport))
    }

    /// Restore the persisted session and cached data. Call once at startup
    /// before making requests.
    ///
    /// Fails with a `Storage` error if the session can't be read. Cached
    /// data falls back to defaults instead.
    pub async fn load(&self) -> Result<Session, SessionApiError> {
        let (session, _) = tokio::join!(
            self.inner.session.load(),
            self.inner.app_data.load(),
        );
        let session = session.map_err(|e| {
            error!("Failed to restore session: {e:#}");
            SessionApiError::storage(format!("{e:#}"))
        })?;
        info!(active = session.active, "Session manager loaded");
        Ok(session)
    }

    #[inline]
    pub fn config(&self) -> &ApiConfig {
        &self.inner.config
    }

    /// The authenticated client for every non-auth endpoint.
    #[inline]
    pub fn client(&self) -> &ApiClient {
        &self.inner.client
    }

    #[inline]
    pub fn auth_api(&self) -> &AuthApi {
        &self.inner.auth_api
    }

    #[inline]
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    #[inline]
    pub fn session(&self) -> &SessionStore {
        &self.inner.session
    }

    pub fn subscribe(&self) -> SessionEventsRx {
        self.inner.events.subscribe()
    }

    /// Log in with a password and start a session.
    ///
    /// With `send_otp` the session stays inactive until [`verify_otp`]
    /// confirms it. Without (a passcode re-login from the lock screen) it's
    /// active right away.
    ///
    /// [`verify_otp`]: Self::verify_otp
    pub async fn login(
        &self,
        req: &LoginRequest,
    ) -> Result<ApiResponse<LoginResponse>, SessionApiError> {
        let resp = self.inner.auth_api.login(req).await?;
        let login = &resp.data;

        let activate = !req.send_otp;
        self.inner
            .session
            .begin(login.tokens.clone(), activate)
            .await?;
        self.inner.events.send(SessionEvent::Started);

        let app_data = &self.inner.app_data;
        if let Some(user) = &login.user
            && let Err(e) = app_data.set_user(user.clone()).await
        {
            warn!("Failed to cache user: {e:#}");
        }
        if let Some(profile) = &login.customer_profile
            && let Err(e) =
                app_data.set_customer_profile(profile.clone()).await
        {
            warn!("Failed to cache customer profile: {e:#}");
        }

        if activate {
            self.inner.events.send(SessionEvent::Activated);
        }
        Ok(resp)
    }

    /// Verify an OTP. If it completes verification of both email and phone
    /// and there's a pending login, the session becomes active.
    pub async fn verify_otp(
        &self,
        req: &VerifyOtpRequest,
    ) -> Result<ApiResponse<VerifyOtpResponse>, SessionApiError> {
        let resp = self.inner.auth_api.verify_otp(req).await?;

        let verified = resp
            .data
            .user_verified
            .as_ref()
            .is_some_and(|status| status.is_fully_verified());
        // Signup verifies without a session; the user logs in afterwards.
        let has_session = self.inner.session.access_token().is_some();
        if verified && has_session {
            self.inner.session.activate().await?;
            let app_data = &self.inner.app_data;
            if let Err(e) = app_data.set_session_verified(true).await {
                warn!("Failed to persist session verification: {e:#}");
            }
            self.inner.events.send(SessionEvent::Activated);
        }
        Ok(resp)
    }

    /// End the session but keep the cached user data, e.g. when the app is
    /// backgrounded. The refresh token is revoked on a best-effort basis.
    pub async fn session_logout(&self) {
        let refresh = self.inner.session.refresh_token();
        self.inner.session.teardown().await;
        self.inner.events.send(SessionEvent::LoggedOut { full: false });
        info!("Session logout complete");

        self.revoke(refresh).await;
    }

    /// End the session and clear every piece of user-scoped data.
    pub async fn logout(&self) {
        let refresh = self.inner.session.refresh_token();
        let (_, cleared) = tokio::join!(
            self.inner.session.teardown(),
            self.inner.app_data.clear_user_scoped(),
        );
        if let Err(e) = cleared {
            warn!("{e:#}");
        }
        self.inner.events.send(SessionEvent::LoggedOut { full: true });
        info!("Full logout complete");

        self.revoke(refresh).await;
    }

    async fn revoke(&self, refresh: Option<RefreshToken>) {
        let Some(refresh) = refresh else { return };
        match self.inner.auth_api.revoke(&refresh).await {
            Ok(()) => debug!("Revoked refresh token"),
            Err(e) => warn!("Failed to revoke refresh token: {e}"),
        }
    }

    /// Feed a platform app state transition. Returns whether it ended the
    /// session.
    pub async fn on_app_state_change(&self, next: AppState) -> bool {
        if !self.inner.lifecycle.observe(next) {
            return false;
        }
        let session = self.inner.session.snapshot();
        if session.access_token.is_none() && session.refresh_token.is_none() {
            return false;
        }
        info!("App backgrounded unsafely; ending session");
        self.session_logout().await;
        true
    }

    /// Keep the session alive across backgrounding until the guard drops.
    pub fn background_safe(&self) -> BackgroundSafeGuard {
        self.inner.lifecycle.background_safe()
    }

    /// Feed every state published on `app_state_rx` to
    /// [`on_app_state_change`]. The task ends when the sender is dropped.
    ///
    /// [`on_app_state_change`]: Self::on_app_state_change
    pub fn spawn_lifecycle_watcher(
        &self,
        mut app_state_rx: watch::Receiver<AppState>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let task = async move {
            while app_state_rx.changed().await.is_ok() {
                let next = *app_state_rx.borrow_and_update();
                debug!(%next, "App state changed");
                manager.on_app_state_change(next).await;
            }
            debug!("App state sender dropped; shutting down");
        };
        tokio::spawn(task.instrument(info_span!("(lifecycle)")))
    }
}
