use tokio::sync::broadcast;

/// Session transitions the UI layer reacts to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// Tokens were stored after login. The session may not be active yet.
    Started,
    /// Login was fully confirmed.
    Activated,
    /// A refresh succeeded and requests continue with the new token.
    Refreshed,
    /// The session ended without the user asking, i.e. the refresh failed or
    /// there was nothing to refresh with. Navigate back to login.
    Expired,
    /// Local teardown finished. `full` is set for an explicit logout, which
    /// also cleared user-scoped cached data.
    LoggedOut { full: bool },
}

const EVENT_CHANNEL_SIZE: usize = 64;

/// Fans out [`SessionEvent`]s to any number of subscribers. Clone to get
/// another handle. Sending with no subscribers is a no-op, and events sent
/// before [`subscribe`] are not seen by that subscriber.
///
/// [`subscribe`]: Self::subscribe
#[derive(Clone)]
pub struct SessionEvents {
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            event_tx: broadcast::channel(EVENT_CHANNEL_SIZE).0,
        }
    }

    pub fn send(&self, event: SessionEvent) {
        // Only errors if there are no receivers.
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> SessionEventsRx {
        SessionEventsRx {
            event_tx: self.event_tx.clone(),
            event_rx: self.event_tx.subscribe(),
        }
    }
}

pub struct SessionEventsRx {
    // Keeps the channel open while we wait.
    #[allow(dead_code)]
    event_tx: broadcast::Sender<SessionEvent>,
    event_rx: broadcast::Receiver<SessionEvent>,
}

impl SessionEventsRx {
    /// Wait for the next event. Waits indefinitely.
    pub async fn recv(&mut self) -> SessionEvent {
        self.recv_filtered(|_| true).await
    }

    /// Wait for the next event matching `filter`. Waits indefinitely.
    pub async fn recv_filtered(
        &mut self,
        filter: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        use broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) =>
                    if filter(&event) {
                        return event;
                    },
                // We hold a sender, so the channel can't close. On lag, the
                // missed events are gone; keep going.
                Err(RecvError::Closed | RecvError::Lagged(_)) => (),
            }
        }
    }

    /// The next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        use broadcast::error::TryRecvError;
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_after_subscribing() {
        let events = SessionEvents::new();
        events.send(SessionEvent::Started);

        let mut rx = events.subscribe();
        events.send(SessionEvent::Refreshed);
        events.send(SessionEvent::LoggedOut { full: true });

        assert_eq!(rx.recv().await, SessionEvent::Refreshed);
        let event = rx
            .recv_filtered(|e| matches!(e, SessionEvent::LoggedOut { .. }))
            .await;
        assert_eq!(event, SessionEvent::LoggedOut { full: true });
        assert_eq!(rx.try_recv(), None);
    }
}
