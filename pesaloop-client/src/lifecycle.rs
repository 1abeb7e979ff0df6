//! Ends the session when the app is backgrounded, unless a flow that
//! legitimately leaves the app (camera capture, the share sheet) has marked
//! backgrounding as safe.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::anyhow;
use tracing::debug;

/// The host platform's foreground state.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AppState {
    #[default]
    Active,
    /// Transient: the app is visible but not receiving input, e.g. the app
    /// switcher or a system dialog. iOS passes through this on the way to
    /// `Background`.
    Inactive,
    Background,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Background => "background",
        }
    }
}

impl FromStr for AppState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "background" => Ok(Self::Background),
            _ => Err(anyhow!("Unrecognized app state: '{s}'")),
        }
    }
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which transitions end the session.
pub struct LifecycleTrigger {
    /// The last state other than `Inactive`.
    settled: Mutex<AppState>,
    /// Outstanding [`BackgroundSafeGuard`]s.
    background_safe: Arc<AtomicUsize>,
}

impl Default for LifecycleTrigger {
    fn default() -> Self {
        Self::new(AppState::Active)
    }
}

impl LifecycleTrigger {
    pub fn new(initial: AppState) -> Self {
        Self {
            settled: Mutex::new(initial),
            background_safe: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record a transition to `next`. Returns `true` if the session should
    /// be torn down: the app went from `Active` to `Background` (possibly
    /// via `Inactive`) while no [`BackgroundSafeGuard`] was held.
    pub fn observe(&self, next: AppState) -> bool {
        if next == AppState::Inactive {
            return false;
        }

        let mut settled =
            self.settled.lock().unwrap_or_else(|poison| poison.into_inner());
        let prev = *settled;
        *settled = next;
        drop(settled);

        let backgrounded =
            prev == AppState::Active && next == AppState::Background;
        if !backgrounded {
            return false;
        }
        if self.is_background_safe() {
            debug!("Backgrounded during a background-safe flow");
            return false;
        }
        true
    }

    /// Mark backgrounding as safe until the guard is dropped. Guards nest.
    pub fn background_safe(&self) -> BackgroundSafeGuard {
        self.background_safe.fetch_add(1, Ordering::SeqCst);
        BackgroundSafeGuard {
            count: self.background_safe.clone(),
        }
    }

    pub fn is_background_safe(&self) -> bool {
        self.background_safe.load(Ordering::SeqCst) > 0
    }
}

/// Returned by [`LifecycleTrigger::background_safe`].
#[must_use]
pub struct BackgroundSafeGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for BackgroundSafeGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use AppState::*;

    use super::*;

    #[test]
    fn backgrounding_tears_down() {
        let trigger = LifecycleTrigger::default();
        assert!(trigger.observe(Background));
        // already backgrounded
        assert!(!trigger.observe(Background));
        assert!(!trigger.observe(Active));
        assert!(trigger.observe(Background));
    }

    #[test]
    fn inactive_is_transparent() {
        let trigger = LifecycleTrigger::default();

        // iOS: active -> inactive -> background
        assert!(!trigger.observe(Inactive));
        assert!(trigger.observe(Background));

        // app switcher peek: active -> inactive -> active
        assert!(!trigger.observe(Active));
        assert!(!trigger.observe(Inactive));
        assert!(!trigger.observe(Active));
    }

    #[test]
    fn guard_suppresses_teardown_while_held() {
        let trigger = LifecycleTrigger::default();

        let outer = trigger.background_safe();
        let inner = trigger.background_safe();
        assert!(!trigger.observe(Background));
        assert!(!trigger.observe(Active));

        drop(inner);
        assert!(trigger.is_background_safe());
        assert!(!trigger.observe(Background));
        assert!(!trigger.observe(Active));

        drop(outer);
        assert!(!trigger.is_background_safe());
        assert!(trigger.observe(Background));
    }

    #[test]
    fn app_state_from_platform_strings() {
        for state in [Active, Inactive, Background] {
            assert_eq!(AppState::from_str(state.as_str()).unwrap(), state);
        }
        assert!(AppState::from_str("unknown").is_err());
    }
}
