//! The in-memory [`Session`] and its persisted copy.
//!
//! Every mutation updates memory and the [`AuthHeader`] together, then
//! persists. A persistence failure is logged and leaves memory as-is: the app
//! keeps working for this run and the user may have to log in again after a
//! restart.
//!
//! Writes to storage are serialized, and each carries the epoch of the
//! session it belongs to. Logging in, loading and tearing down start a new
//! epoch, so a write still queued for an ended session is dropped instead of
//! resurrecting it.

use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Context;
use http::HeaderValue;
use pesaloop_api_core::{
    auth::{AccessToken, RefreshToken, TokenPair},
    error::SessionApiError,
};
use tracing::{debug, info, warn};

use crate::{
    auth_header::AuthHeader,
    secret_store::{SecretStore, StoreKey},
};

/// Keys owned by the session itself, cleared on any teardown.
pub const SESSION_KEYS: [StoreKey; 3] = [
    StoreKey::AccessToken,
    StoreKey::RefreshToken,
    StoreKey::SessionActive,
];

/// Invariant: `active` implies `access_token.is_some()`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Session {
    pub access_token: Option<AccessToken>,
    pub refresh_token: Option<RefreshToken>,
    /// Login has been fully confirmed (OTP verified, or passcode re-login).
    pub active: bool,
}

struct State {
    session: Session,
    /// Bumped whenever the session is replaced or ended.
    epoch: u64,
}

/// Owns the [`Session`] and keeps the [`AuthHeader`] bound to its access
/// token.
pub struct SessionStore {
    secrets: SecretStore,
    auth_header: Arc<AuthHeader>,
    // Never held across an await. The header only changes while it's held.
    state: Mutex<State>,
    /// Held across every write to storage.
    persist_lock: tokio::sync::Mutex<()>,
}

impl SessionStore {
    pub fn new(secrets: SecretStore, auth_header: Arc<AuthHeader>) -> Self {
        Self {
            secrets,
            auth_header,
            state: Mutex::new(State {
                session: Session::default(),
                epoch: 0,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Critical sections don't panic, so poisoning is benign.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[inline]
    pub fn auth_header(&self) -> &AuthHeader {
        &self.auth_header
    }

    pub fn snapshot(&self) -> Session {
        self.lock().session.clone()
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.lock().session.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.lock().session.refresh_token.clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().session.active
    }

    /// Restore the persisted session at startup and bind its access token.
    ///
    /// A persisted `active` flag without an access token is repaired to
    /// inactive. An access token that can't be bound is dropped.
    pub async fn load(&self) -> anyhow::Result<Session> {
        let (access, refresh, active) = {
            let _persist = self.persist_lock.lock().await;
            tokio::try_join!(
                self.secrets.get(StoreKey::AccessToken),
                self.secrets.get(StoreKey::RefreshToken),
                self.secrets.get_json::<bool>(StoreKey::SessionActive),
            )
            .context("Failed to load session")?
        };

        let mut session = Session {
            access_token: access.map(AccessToken::new),
            refresh_token: refresh.map(RefreshToken::new),
            active: active.unwrap_or(false),
        };
        if let Some(token) = &session.access_token
            && let Err(e) = self.auth_header.value_for(token)
        {
            warn!("Discarding unusable stored access token: {e}");
            session.access_token = None;
        }
        if session.active && session.access_token.is_none() {
            warn!("Stored session was active without an access token");
            session.active = false;
        }

        {
            let mut state = self.lock();
            // Checked above.
            self.auth_header.bind(session.access_token.as_ref())?;
            state.session = session.clone();
            state.epoch += 1;
        }
        debug!(
            has_access = session.access_token.is_some(),
            has_refresh = session.refresh_token.is_some(),
            active = session.active,
            "Loaded session",
        );
        Ok(session)
    }

    /// Store the tokens from a successful login and bind the access token.
    pub async fn begin(
        &self,
        tokens: TokenPair,
        active: bool,
    ) -> Result<(), SessionApiError> {
        let epoch = {
            let mut state = self.lock();
            self.auth_header.bind(Some(&tokens.access))?;
            state.session = Session {
                access_token: Some(tokens.access.clone()),
                refresh_token: Some(tokens.refresh.clone()),
                active,
            };
            state.epoch += 1;
            state.epoch
        };
        info!(active, "Session started");

        let write = async {
            tokio::try_join!(
                self.persist_tokens(&tokens),
                self.secrets.set_json(StoreKey::SessionActive, &active),
            )
            .map(|_| ())
        };
        self.persist_if_current(epoch, "new session", write).await;
        Ok(())
    }

    /// Mark the session active. Fails if there's no access token.
    pub async fn activate(&self) -> Result<(), SessionApiError> {
        let epoch = {
            let mut state = self.lock();
            if state.session.access_token.is_none() {
                return Err(SessionApiError::auth_required(
                    "Can't activate a session without an access token",
                ));
            }
            state.session.active = true;
            state.epoch
        };
        info!("Session activated");

        let write = self.secrets.set_json(StoreKey::SessionActive, &true);
        self.persist_if_current(epoch, "session activation", write)
            .await;
        Ok(())
    }

    /// Replace both tokens after a refresh and rebind the header. Returns
    /// the new header value.
    ///
    /// `used` is the refresh token the new pair was obtained with. If the
    /// session moved on before or while the new pair is stored (logout, or a
    /// new login), the pair belongs to a dead session and is discarded.
    pub async fn rotate(
        &self,
        used: &RefreshToken,
        tokens: TokenPair,
    ) -> Result<HeaderValue, SessionApiError> {
        let superseded = || {
            SessionApiError::session_expired("Session ended while refreshing")
        };

        let epoch = {
            let mut state = self.lock();
            if state.session.refresh_token.as_ref() != Some(used) {
                return Err(superseded());
            }
            self.auth_header.bind(Some(&tokens.access))?;
            state.session.access_token = Some(tokens.access.clone());
            state.session.refresh_token = Some(tokens.refresh.clone());
            state.epoch
        };

        let write = self.persist_tokens(&tokens);
        self.persist_if_current(epoch, "refreshed tokens", write).await;

        let state = self.lock();
        match self.auth_header.current() {
            Some(header) if state.epoch == epoch => Ok(header),
            _ => Err(superseded()),
        }
    }

    /// [`teardown`](Self::teardown), but only if the session still holds
    /// `used`. Returns whether anything was torn down.
    pub async fn teardown_if_current(&self, used: &RefreshToken) -> bool {
        {
            let mut state = self.lock();
            if state.session.refresh_token.as_ref() != Some(used) {
                return false;
            }
            self.end(&mut state);
        }
        self.remove_stored().await;
        true
    }

    /// Clear the session everywhere and strip the header. Safe to call on an
    /// already-empty session.
    ///
    /// Memory and the header are cleared before this first yields. Storage
    /// is cleared after any write already in progress.
    pub async fn teardown(&self) {
        self.end(&mut self.lock());
        self.remove_stored().await;
    }

    fn end(&self, state: &mut State) {
        state.session = Session::default();
        state.epoch += 1;
        // `bind(None)` can't fail.
        let _ = self.auth_header.bind(None);
    }

    async fn remove_stored(&self) {
        let _persist = self.persist_lock.lock().await;
        if let Err(e) = self.secrets.remove_all(&SESSION_KEYS).await {
            warn!("Failed to clear stored session: {e:#}");
        }
    }

    /// Run `write` in turn with every other write, unless the session has
    /// left `epoch` by the time it's this write's turn.
    async fn persist_if_current(
        &self,
        epoch: u64,
        what: &str,
        write: impl Future<Output = anyhow::Result<()>>,
    ) {
        let _persist = self.persist_lock.lock().await;
        if self.lock().epoch != epoch {
            debug!("Session ended; not persisting {what}");
            return;
        }
        if let Err(e) = write.await {
            warn!("Failed to persist {what}: {e:#}");
        }
    }

    async fn persist_tokens(&self, tokens: &TokenPair) -> anyhow::Result<()> {
        tokio::try_join!(
            self.secrets.set(StoreKey::AccessToken, tokens.access.as_str()),
            self.secrets.set(StoreKey::RefreshToken, tokens.refresh.as_str()),
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use http::header::AUTHORIZATION;
    use pesaloop_api_core::error::SessionErrorKind;

    use super::*;
    use crate::secret_store::mock::OutageSwitch;

    fn pair(access: &str, refresh: &str) -> TokenPair {
        TokenPair {
            access: AccessToken::new(access),
            refresh: RefreshToken::new(refresh),
        }
    }

    fn store() -> (SessionStore, SecretStore, OutageSwitch) {
        let (secrets, outage) = SecretStore::memory();
        let header = Arc::new(AuthHeader::new(AUTHORIZATION, "Bearer"));
        (SessionStore::new(secrets.clone(), header), secrets, outage)
    }

    #[tokio::test]
    async fn begin_activate_teardown() {
        let (session, secrets, _) = store();

        session.begin(pair("a1", "r1"), false).await.unwrap();
        assert!(!session.is_active());
        assert_eq!(session.auth_header().current().unwrap(), "Bearer a1");
        let stored = secrets.get(StoreKey::RefreshToken).await.unwrap();
        assert_eq!(stored.as_deref(), Some("r1"));

        session.activate().await.unwrap();
        assert!(session.is_active());
        let active = secrets.get_json::<bool>(StoreKey::SessionActive).await;
        assert_eq!(active.unwrap(), Some(true));

        session.teardown().await;
        assert_eq!(session.snapshot(), Session::default());
        assert_eq!(session.auth_header().current(), None);
        for key in SESSION_KEYS {
            assert_eq!(secrets.get(key).await.unwrap(), None);
        }

        // idempotent
        session.teardown().await;
    }

    #[tokio::test]
    async fn activate_requires_access_token() {
        let (session, _, _) = store();
        let err = session.activate().await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::AuthRequired);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn load_restores_and_repairs() {
        let (session, secrets, _) = store();
        secrets.set(StoreKey::AccessToken, "a1").await.unwrap();
        secrets.set(StoreKey::RefreshToken, "r1").await.unwrap();
        secrets.set_json(StoreKey::SessionActive, &true).await.unwrap();

        let loaded = session.load().await.unwrap();
        assert!(loaded.active);
        assert_eq!(session.auth_header().current().unwrap(), "Bearer a1");

        // active without an access token
        let (session, secrets, _) = store();
        secrets.set(StoreKey::RefreshToken, "r1").await.unwrap();
        secrets.set_json(StoreKey::SessionActive, &true).await.unwrap();
        let loaded = session.load().await.unwrap();
        assert!(!loaded.active);
        assert_eq!(loaded.refresh_token, Some(RefreshToken::new("r1")));
        assert_eq!(session.auth_header().current(), None);

        // an access token that can't go in a header is dropped
        let (session, secrets, _) = store();
        secrets.set(StoreKey::AccessToken, "bad\ntoken").await.unwrap();
        secrets.set_json(StoreKey::SessionActive, &true).await.unwrap();
        let loaded = session.load().await.unwrap();
        assert_eq!(loaded.access_token, None);
        assert!(!loaded.active);
        assert_eq!(session.auth_header().current(), None);
    }

    #[tokio::test]
    async fn persistence_failure_keeps_memory() {
        let (session, _, outage) = store();
        session.begin(pair("a1", "r1"), true).await.unwrap();

        outage.set_unavailable(true);
        let used = RefreshToken::new("r1");
        let header = session.rotate(&used, pair("a2", "r2")).await.unwrap();
        assert_eq!(header, "Bearer a2");
        assert_eq!(session.access_token(), Some(AccessToken::new("a2")));
        assert_eq!(session.refresh_token(), Some(RefreshToken::new("r2")));

        // teardown still clears memory even though storage is down
        session.teardown().await;
        assert_eq!(session.snapshot(), Session::default());

        // and loading surfaces the storage error
        assert!(session.load().await.is_err());
    }

    #[tokio::test]
    async fn rotate_rejects_superseded_session() {
        let (session, _, _) = store();
        session.begin(pair("a1", "r1"), true).await.unwrap();
        let used = RefreshToken::new("r1");

        // a new login replaced the session while the refresh was in flight
        session.begin(pair("b1", "s1"), true).await.unwrap();
        let err = session.rotate(&used, pair("a2", "r2")).await.unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::AuthExpired);
        assert_eq!(session.auth_header().current().unwrap(), "Bearer b1");

        // and a late failure doesn't tear the new session down
        assert!(!session.teardown_if_current(&used).await);
        assert!(session.is_active());
        assert!(session.teardown_if_current(&RefreshToken::new("s1")).await);
        assert_eq!(session.snapshot(), Session::default());
    }

    /// Wait until a spawned teardown has cleared memory.
    async fn wait_for_teardown(session: &SessionStore) {
        while session.refresh_token().is_some() {
            tokio::task::yield_now().await;
        }
    }

    async fn assert_nothing_stored(secrets: &SecretStore) {
        for key in SESSION_KEYS {
            assert_eq!(secrets.get(key).await.unwrap(), None, "{key:?}");
        }
    }

    #[tokio::test]
    async fn teardown_during_rotate_write_wins() {
        let (session, secrets, outage) = store();
        let session = Arc::new(session);
        session.begin(pair("a1", "r1"), true).await.unwrap();

        outage.hold_writes();
        let rotate = tokio::spawn({
            let session = session.clone();
            async move {
                let used = RefreshToken::new("r1");
                session.rotate(&used, pair("a2", "r2")).await
            }
        });
        outage.wait_for_held_writes(1).await;
        // bound before the write started
        assert_eq!(session.auth_header().current().unwrap(), "Bearer a2");

        let teardown = tokio::spawn({
            let session = session.clone();
            async move { session.teardown().await }
        });
        wait_for_teardown(&session).await;
        assert_eq!(session.auth_header().current(), None);

        outage.release_writes();
        let err = rotate.await.unwrap().unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::AuthExpired);
        teardown.await.unwrap();

        assert_eq!(session.auth_header().current(), None);
        assert_eq!(session.snapshot(), Session::default());
        assert_nothing_stored(&secrets).await;
    }

    #[tokio::test]
    async fn teardown_during_login_write_wins() {
        let (session, secrets, outage) = store();
        let session = Arc::new(session);

        outage.hold_writes();
        let begin = tokio::spawn({
            let session = session.clone();
            async move { session.begin(pair("a1", "r1"), true).await }
        });
        outage.wait_for_held_writes(1).await;
        assert_eq!(session.auth_header().current().unwrap(), "Bearer a1");

        let teardown = tokio::spawn({
            let session = session.clone();
            async move { session.teardown().await }
        });
        wait_for_teardown(&session).await;

        outage.release_writes();
        begin.await.unwrap().unwrap();
        teardown.await.unwrap();
        // nothing left to activate
        assert!(session.activate().await.is_err());

        assert_eq!(session.auth_header().current(), None);
        assert_eq!(session.snapshot(), Session::default());
        assert_nothing_stored(&secrets).await;

        // a later login persists as usual
        session.begin(pair("b1", "s1"), true).await.unwrap();
        let stored = secrets.get(StoreKey::AccessToken).await.unwrap();
        assert_eq!(stored.as_deref(), Some("b1"));
    }
}
