//! Single-flight access token refresh.
//!
//! The first 401 moves the coordinator from `Idle` to `Refreshing` and spawns
//! the refresh. Every 401 that arrives while a refresh is in flight waits on
//! that same refresh instead of starting another. When it resolves, waiters
//! are resolved in the order they arrived and the coordinator goes back to
//! `Idle`.

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use http::HeaderValue;
use pesaloop_api_core::{
    auth::{RefreshRequest, RefreshResponse, RefreshToken, TokenPair},
    error::{CommonApiError, SessionApiError, SessionErrorKind},
};
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    config::ApiConfig,
    events::{SessionEvent, SessionEvents},
    session_store::SessionStore,
    transport::{HttpTransport, POST, PendingRequest},
};

/// What each waiter receives: the header to replay its request with.
pub type RefreshResult = Result<HeaderValue, SessionApiError>;

enum State {
    Idle,
    Refreshing {
        waiters: VecDeque<oneshot::Sender<RefreshResult>>,
    },
}

/// Ensures at most one refresh is in flight at a time. Clone to share.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    // Never held across an await.
    state: Mutex<State>,
    session: Arc<SessionStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_path: String,
    timeout: Duration,
    events: SessionEvents,
}

impl RefreshCoordinator {
    pub fn new(
        session: Arc<SessionStore>,
        transport: Arc<dyn HttpTransport>,
        config: &ApiConfig,
        events: SessionEvents,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Idle),
                session,
                transport,
                refresh_path: config.refresh_path.clone(),
                timeout: config.timeout,
                events,
            }),
        }
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock(), State::Refreshing { .. })
    }

    /// The number of callers waiting on the in-flight refresh.
    pub fn pending_waiters(&self) -> usize {
        match &*self.inner.lock() {
            State::Idle => 0,
            State::Refreshing { waiters } => waiters.len(),
        }
    }

    /// Handle a 401 for a request that was sent with `sent_with`.
    ///
    /// Returns the header to replay the request with. If the session moved
    /// to a newer token since the request was sent, that token is returned
    /// right away. Otherwise this waits for a refresh, starting one if none
    /// is in flight.
    ///
    /// Dropping the returned future only discards this caller's waiter.
    pub async fn on_unauthorized(
        &self,
        sent_with: Option<&HeaderValue>,
    ) -> RefreshResult {
        let waiter_rx = {
            let mut state = self.inner.lock();
            let (waiter_tx, waiter_rx) = oneshot::channel();
            match &mut *state {
                State::Refreshing { waiters } => {
                    waiters.push_back(waiter_tx);
                    debug!(num_waiters = waiters.len(), "Joined refresh");
                }
                State::Idle => {
                    let current = self.inner.session.auth_header().current();
                    if let Some(current) = current
                        && sent_with != Some(&current)
                    {
                        debug!("401 for a superseded token; replaying");
                        return Ok(current);
                    }

                    *state = State::Refreshing {
                        waiters: VecDeque::from([waiter_tx]),
                    };
                    let inner = self.inner.clone();
                    tokio::spawn(
                        inner.run_refresh().instrument(info_span!("(refresh)")),
                    );
                }
            }
            waiter_rx
        };

        // The refresh task always resolves every waiter unless it panicked.
        waiter_rx.await.unwrap_or_else(|_| {
            Err(SessionApiError::session_expired("Refresh task was dropped"))
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Critical sections don't panic, so poisoning is benign.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_refresh(self: Arc<Self>) {
        let result = self.refresh().await;

        let waiters = match mem::replace(&mut *self.lock(), State::Idle) {
            State::Refreshing { waiters } => waiters,
            State::Idle => VecDeque::new(),
        };
        debug!(num_waiters = waiters.len(), ok = result.is_ok(), "Resolving");

        // In enqueue order. A waiter whose caller went away is skipped.
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn refresh(&self) -> RefreshResult {
        let Some(refresh) = self.session.refresh_token() else {
            warn!("Got a 401 with no refresh token; ending session");
            self.session.teardown().await;
            self.events.send(SessionEvent::Expired);
            return Err(SessionApiError::auth_required("No refresh token"));
        };

        let result = async {
            let tokens = self.request_tokens(&refresh).await?;
            self.session.rotate(&refresh, tokens).await
        }
        .await;

        match result {
            Ok(header) => {
                info!("Refreshed access token");
                self.events.send(SessionEvent::Refreshed);
                Ok(header)
            }
            Err(e) => {
                warn!("Token refresh failed: {e}");
                // A logout or new login during the refresh owns the session
                // now; leave it alone.
                if self.session.teardown_if_current(&refresh).await {
                    self.events.send(SessionEvent::Expired);
                }
                Err(SessionApiError::session_expired(format!(
                    "Token refresh failed: {e}"
                )))
            }
        }
    }

    /// Exchange `refresh` for a new pair. Sent without an auth header.
    async fn request_tokens(
        &self,
        refresh: &RefreshToken,
    ) -> Result<TokenPair, SessionApiError> {
        let body = RefreshRequest {
            refresh: refresh.clone(),
        };
        let req = PendingRequest::json(POST, self.refresh_path.clone(), &body)?
            .without_refresh();

        let resp = tokio::time::timeout(self.timeout, self.transport.send(req))
            .await
            .map_err(|_| {
                SessionApiError::new(
                    SessionErrorKind::Timeout,
                    "Refresh request timed out",
                )
            })??;
        if !resp.status.is_success() {
            return Err(SessionApiError::from_response(resp.status, &resp.body));
        }

        let resp = serde_json::from_slice::<RefreshResponse>(&resp.body)
            .map_err(CommonApiError::from)?;
        Ok(resp.into_pair(refresh.clone()))
    }
}
