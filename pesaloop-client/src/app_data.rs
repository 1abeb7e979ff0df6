//! User-scoped data cached on device, alongside the session in the
//! [`SecretStore`].
//!
//! Reads come from memory. Writes update memory, then persist; the returned
//! error only says the write didn't reach storage. Writes reach storage one
//! at a time, and each stores the value in memory when its turn comes, so
//! storage never ends up behind memory.

use std::{
    fmt,
    str::FromStr,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, anyhow};
use pesaloop_api_core::models::{Contact, CustomerProfile, SessionUser};
use rust_decimal::Decimal;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, error};

use crate::secret_store::{SecretStore, StoreKey};

/// Shown until the backend tells us the wallet's currency.
pub const DEFAULT_CURRENCY: &str = "USD";
/// How many recent payees to remember.
pub const MAX_FREQUENT_CONTACTS: usize = 15;

/// Everything except the session itself. Cleared on a full logout.
pub const USER_SCOPED_KEYS: [StoreKey; 8] = [
    StoreKey::UserData,
    StoreKey::CustomerProfile,
    StoreKey::SessionVerified,
    StoreKey::Currency,
    StoreKey::Balance,
    StoreKey::FrequentContacts,
    StoreKey::BiometricEnabled,
    StoreKey::Theme,
];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

impl FromStr for Theme {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            _ => Err(anyhow!("Unrecognized theme: '{s}'")),
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory copy of the cached data.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedData {
    pub user: Option<SessionUser>,
    pub customer_profile: Option<CustomerProfile>,
    /// The user confirmed their login by OTP this session.
    pub session_verified: bool,
    pub balance: Decimal,
    pub currency: String,
    /// Most recent first, unique by [`Contact::id`].
    pub frequent_contacts: Vec<Contact>,
    pub biometric_enabled: bool,
    pub theme: Theme,
}

impl Default for CachedData {
    fn default() -> Self {
        Self {
            user: None,
            customer_profile: None,
            session_verified: false,
            balance: Decimal::ZERO,
            currency: DEFAULT_CURRENCY.to_owned(),
            frequent_contacts: Vec::new(),
            biometric_enabled: false,
            theme: Theme::default(),
        }
    }
}

pub struct AppData {
    secrets: SecretStore,
    // Never held across an await.
    state: Mutex<CachedData>,
    /// Held across every write to storage.
    persist_lock: tokio::sync::Mutex<()>,
}

impl AppData {
    pub fn new(secrets: SecretStore) -> Self {
        Self {
            secrets,
            state: Mutex::new(CachedData::default()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CachedData> {
        // Critical sections don't panic, so poisoning is benign.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> CachedData {
        self.lock().clone()
    }

    /// Load everything from storage. Values that are missing or fail to load
    /// fall back to their defaults.
    pub async fn load(&self) -> CachedData {
        let defaults = CachedData::default();
        let (
            user,
            customer_profile,
            session_verified,
            balance,
            currency,
            frequent_contacts,
            biometric_enabled,
            theme,
        ) = tokio::join!(
            self.load_json::<SessionUser>(StoreKey::UserData),
            self.load_json::<CustomerProfile>(StoreKey::CustomerProfile),
            self.load_json::<bool>(StoreKey::SessionVerified),
            self.load_json::<Decimal>(StoreKey::Balance),
            self.load_str(StoreKey::Currency),
            self.load_json::<Vec<Contact>>(StoreKey::FrequentContacts),
            self.load_json::<bool>(StoreKey::BiometricEnabled),
            self.load_str(StoreKey::Theme),
        );

        let theme = theme.and_then(|s| {
            Theme::from_str(&s)
                .inspect_err(|e| error!("app data: {e:#}"))
                .ok()
        });
        let data = CachedData {
            user,
            customer_profile,
            session_verified: session_verified.unwrap_or(false),
            balance: balance.unwrap_or(defaults.balance),
            currency: currency.unwrap_or(defaults.currency),
            frequent_contacts: frequent_contacts.unwrap_or_default(),
            biometric_enabled: biometric_enabled.unwrap_or(false),
            theme: theme.unwrap_or(defaults.theme),
        };
        *self.lock() = data.clone();
        debug!("Loaded app data");
        data
    }

    async fn load_json<T: DeserializeOwned>(&self, key: StoreKey) -> Option<T> {
        self.secrets
            .get_json(key)
            .await
            .inspect_err(|e| error!("app data: failed to load {key}: {e:#}"))
            .ok()
            .flatten()
    }

    async fn load_str(&self, key: StoreKey) -> Option<String> {
        self.secrets
            .get(key)
            .await
            .inspect_err(|e| error!("app data: failed to load {key}: {e:#}"))
            .ok()
            .flatten()
    }

    /// Write the current in-memory value for `key`.
    async fn persist(&self, key: StoreKey) -> anyhow::Result<()> {
        let _persist = self.persist_lock.lock().await;
        match self.encode(key)? {
            Some(value) => self.secrets.set(key, value).await,
            None => self.secrets.remove(key).await,
        }
    }

    /// The stored form of `key`'s value. `None` if it shouldn't be stored.
    fn encode(&self, key: StoreKey) -> anyhow::Result<Option<String>> {
        let state = self.lock();
        let value = match key {
            StoreKey::UserData => state.user.as_ref().map(to_json).transpose()?,
            StoreKey::CustomerProfile =>
                state.customer_profile.as_ref().map(to_json).transpose()?,
            StoreKey::SessionVerified =>
                Some(to_json(&state.session_verified)?),
            StoreKey::Balance => Some(to_json(&state.balance)?),
            StoreKey::Currency => Some(state.currency.clone()),
            StoreKey::FrequentContacts =>
                Some(to_json(&state.frequent_contacts)?),
            StoreKey::BiometricEnabled =>
                Some(to_json(&state.biometric_enabled)?),
            StoreKey::Theme => Some(state.theme.as_str().to_owned()),
            StoreKey::AccessToken
            | StoreKey::RefreshToken
            | StoreKey::SessionActive =>
                return Err(anyhow!("{key} isn't cached app data")),
        };
        Ok(value)
    }

    // --- User --- //

    pub fn user(&self) -> Option<SessionUser> {
        self.lock().user.clone()
    }

    pub async fn set_user(&self, user: SessionUser) -> anyhow::Result<()> {
        self.lock().user = Some(user);
        self.persist(StoreKey::UserData).await
    }

    /// Merge the fields in `patch` (a JSON object) onto the cached user.
    /// Fields absent from `patch` keep their current values.
    pub async fn merge_user(
        &self,
        patch: serde_json::Value,
    ) -> anyhow::Result<SessionUser> {
        let serde_json::Value::Object(patch) = patch else {
            return Err(anyhow!("User update must be a JSON object"));
        };

        let current = self.user().unwrap_or_default();
        let mut merged = serde_json::to_value(current)
            .context("Failed to serialize cached user")?;
        if let serde_json::Value::Object(fields) = &mut merged {
            fields.extend(patch);
        }
        let user = serde_json::from_value::<SessionUser>(merged)
            .context("Invalid user update")?;

        self.set_user(user.clone()).await?;
        Ok(user)
    }

    pub fn customer_profile(&self) -> Option<CustomerProfile> {
        self.lock().customer_profile.clone()
    }

    pub async fn set_customer_profile(
        &self,
        profile: CustomerProfile,
    ) -> anyhow::Result<()> {
        self.lock().customer_profile = Some(profile);
        self.persist(StoreKey::CustomerProfile).await
    }

    pub fn is_session_verified(&self) -> bool {
        self.lock().session_verified
    }

    pub async fn set_session_verified(
        &self,
        verified: bool,
    ) -> anyhow::Result<()> {
        self.lock().session_verified = verified;
        self.persist(StoreKey::SessionVerified).await
    }

    // --- Balance --- //

    pub fn balance(&self) -> (Decimal, String) {
        let state = self.lock();
        (state.balance, state.currency.clone())
    }

    pub async fn set_balance(&self, balance: Decimal) -> anyhow::Result<()> {
        self.lock().balance = balance;
        self.persist(StoreKey::Balance).await
    }

    pub async fn set_currency(&self, currency: &str) -> anyhow::Result<()> {
        self.lock().currency = currency.to_owned();
        self.persist(StoreKey::Currency).await
    }

    // --- Frequent contacts --- //

    pub fn frequent_contacts(&self) -> Vec<Contact> {
        self.lock().frequent_contacts.clone()
    }

    /// Move `contact` to the front, dropping the oldest beyond
    /// [`MAX_FREQUENT_CONTACTS`].
    pub async fn add_frequent_contact(
        &self,
        contact: Contact,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.lock();
            let contacts = &mut state.frequent_contacts;
            contacts.retain(|c| c.id != contact.id);
            contacts.insert(0, contact);
            contacts.truncate(MAX_FREQUENT_CONTACTS);
        }
        self.persist(StoreKey::FrequentContacts).await
    }

    pub async fn set_frequent_contacts(
        &self,
        mut contacts: Vec<Contact>,
    ) -> anyhow::Result<()> {
        contacts.truncate(MAX_FREQUENT_CONTACTS);
        self.lock().frequent_contacts = contacts;
        self.persist(StoreKey::FrequentContacts).await
    }

    // --- Device preferences --- //

    pub fn is_biometric_enabled(&self) -> bool {
        self.lock().biometric_enabled
    }

    pub async fn set_biometric_enabled(
        &self,
        enabled: bool,
    ) -> anyhow::Result<()> {
        self.lock().biometric_enabled = enabled;
        self.persist(StoreKey::BiometricEnabled).await
    }

    pub fn theme(&self) -> Theme {
        self.lock().theme
    }

    pub async fn set_theme(&self, theme: Theme) -> anyhow::Result<()> {
        self.lock().theme = theme;
        self.persist(StoreKey::Theme).await
    }

    /// Switch between light and dark. Returns the new theme.
    pub async fn toggle_theme(&self) -> anyhow::Result<Theme> {
        let theme = {
            let mut state = self.lock();
            state.theme = state.theme.toggled();
            state.theme
        };
        self.persist(StoreKey::Theme).await?;
        Ok(theme)
    }

    /// Reset to defaults and remove every [`USER_SCOPED_KEYS`] entry. Memory
    /// is reset even if storage fails.
    pub async fn clear_user_scoped(&self) -> anyhow::Result<()> {
        *self.lock() = CachedData::default();
        let _persist = self.persist_lock.lock().await;
        self.secrets
            .remove_all(&USER_SCOPED_KEYS)
            .await
            .context("Failed to clear cached user data")
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string(value).context("Failed to serialize app data")
}
