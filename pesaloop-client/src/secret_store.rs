//! The [`SecretStore`] persists tokens and user-scoped cached state in each
//! platform's sandboxed secret storage.
//!
//! * **macOS+iOS** (with the `keychain` feature): Keychain, one generic
//!   password item per [`StoreKey`] under the service `app.pesaloop.<env>`.
//! * **Linux** (with the `keychain` feature): the desktop secret-service via
//!   dbus.
//! * **Android**, or without the `keychain` feature: one owner-only (`0600`)
//!   file per key in the app data directory. App data is sandboxed, so this is
//!   no weaker than what the platform offers without going through the JVM.
//!
//! There's no plaintext fallback: if the chosen backend fails, the operation
//! fails.
//!
//! All [`keyring`] calls block, so every op runs on the blocking pool.

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, anyhow};
use cfg_if::cfg_if;
use futures::future;
use keyring::credential::CredentialApi;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::DeployEnv;

type Credential = Arc<dyn CredentialApi + Send + Sync>;

/// Everything we persist. Each key is stored as a separate secret.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StoreKey {
    AccessToken = 0,
    RefreshToken = 1,
    /// Whether the session is active, i.e. login has been fully confirmed.
    SessionActive = 2,
    UserData = 3,
    SessionVerified = 4,
    Currency = 5,
    Balance = 6,
    FrequentContacts = 7,
    BiometricEnabled = 8,
    Theme = 9,
    CustomerProfile = 10,
}

impl StoreKey {
    /// In discriminant order.
    pub const ALL: [Self; 11] = [
        Self::AccessToken,
        Self::RefreshToken,
        Self::SessionActive,
        Self::UserData,
        Self::SessionVerified,
        Self::Currency,
        Self::Balance,
        Self::FrequentContacts,
        Self::BiometricEnabled,
        Self::Theme,
        Self::CustomerProfile,
    ];

    /// The storage name for this key. Changing these orphans existing
    /// installs' data.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "platform_access_token",
            Self::RefreshToken => "platform_refresh_token",
            Self::SessionActive => "platform_session",
            Self::UserData => "platform_user_data",
            Self::SessionVerified => "platform_sessionVerified",
            Self::Currency => "platform_currency",
            Self::Balance => "platform_balance",
            Self::FrequentContacts => "frequent_contacts",
            Self::BiometricEnabled => "biometric_enabled",
            Self::Theme => "theme",
            Self::CustomerProfile => "platform_customer_profile",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Async key-value access to platform secret storage. Cheaply cloneable.
#[derive(Clone)]
pub struct SecretStore {
    /// Indexed by `StoreKey as usize`.
    creds: Arc<[Credential]>,
}

impl SecretStore {
    #[cfg_attr(not(feature = "keychain"), allow(dead_code))]
    fn service_name(deploy_env: DeployEnv) -> String {
        format!("app.pesaloop.{deploy_env}")
    }

    /// The platform's default store. Uses the OS keychain when built with the
    /// `keychain` feature (except on Android), otherwise files in
    /// `app_data_dir`.
    pub fn new(
        use_file_store: bool,
        deploy_env: DeployEnv,
        app_data_dir: &Path,
    ) -> anyhow::Result<Self> {
        if use_file_store {
            return Ok(Self::file(app_data_dir));
        }

        cfg_if! {
            if #[cfg(all(feature = "keychain", not(target_os = "android")))] {
                Self::keychain(deploy_env)
            } else {
                let _ = deploy_env;
                Ok(Self::file(app_data_dir))
            }
        }
    }

    #[cfg(all(feature = "keychain", not(target_os = "android")))]
    fn keychain(deploy_env: DeployEnv) -> anyhow::Result<Self> {
        let service = Self::service_name(deploy_env);
        Self::from_creds(|key| keychain_cred(&service, key.as_str()))
    }

    /// One owner-only file per key under `dir`.
    pub fn file(dir: &Path) -> Self {
        let creds = StoreKey::ALL
            .iter()
            .map(|key| {
                let cred = FileCredential {
                    path: dir.join(key.as_str()),
                };
                Arc::new(cred) as Credential
            })
            .collect();
        Self { creds }
    }

    /// A volatile store with a switch to simulate storage outages.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn memory() -> (Self, mock::OutageSwitch) {
        let switch = mock::OutageSwitch::default();
        let creds = StoreKey::ALL
            .iter()
            .map(|_| Arc::new(switch.credential()) as Credential)
            .collect();
        (Self { creds }, switch)
    }

    #[cfg_attr(not(feature = "keychain"), allow(dead_code))]
    fn from_creds(
        mut make_cred: impl FnMut(StoreKey) -> anyhow::Result<Credential>,
    ) -> anyhow::Result<Self> {
        let creds = StoreKey::ALL
            .iter()
            .map(|key| make_cred(*key))
            .collect::<anyhow::Result<_>>()?;
        Ok(Self { creds })
    }

    fn cred(&self, key: StoreKey) -> Credential {
        self.creds[key as usize].clone()
    }

    /// Run a blocking credential op on the blocking pool.
    async fn run<T, F>(&self, key: StoreKey, op: F) -> keyring::Result<T>
    where
        F: FnOnce(&dyn CredentialApi) -> keyring::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cred = self.cred(key);
        tokio::task::spawn_blocking(move || op(cred.as_ref()))
            .await
            .map_err(|join_err| {
                keyring::Error::PlatformFailure(Box::new(join_err))
            })?
    }

    /// Read a value. A missing entry is `Ok(None)`.
    pub async fn get(&self, key: StoreKey) -> anyhow::Result<Option<String>> {
        match self.run(key, |cred| cred.get_password()).await {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to read {key}"))),
        }
    }

    pub async fn set(
        &self,
        key: StoreKey,
        value: impl Into<String>,
    ) -> anyhow::Result<()> {
        let value = value.into();
        self.run(key, move |cred| cred.set_password(&value))
            .await
            .with_context(|| format!("Failed to write {key}"))
    }

    /// Delete a value. Deleting a missing entry succeeds.
    pub async fn remove(&self, key: StoreKey) -> anyhow::Result<()> {
        match self.run(key, |cred| cred.delete_password()).await {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("Failed to delete {key}"))),
        }
    }

    /// Delete several values concurrently. Every deletion is attempted even if
    /// some fail; the failures are joined into one error.
    pub async fn remove_all(&self, keys: &[StoreKey]) -> anyhow::Result<()> {
        let results =
            future::join_all(keys.iter().map(|key| self.remove(*key))).await;
        join_results(results)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: StoreKey,
    ) -> anyhow::Result<Option<T>> {
        match self.get(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .with_context(|| format!("Corrupt value for {key}")),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: StoreKey,
        value: &T,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize {key}"))?;
        self.set(key, json).await
    }
}

/// Joins any errors into one, separated by semicolons.
pub(crate) fn join_results(
    results: Vec<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    let errors = results
        .into_iter()
        .filter_map(Result::err)
        .map(|err| format!("{err:#}"))
        .collect::<Vec<_>>();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{}", errors.join("; ")))
    }
}

#[cfg(all(feature = "keychain", not(target_os = "android")))]
fn keychain_cred(service: &str, user: &str) -> anyhow::Result<Credential> {
    let target = None;

    cfg_if! {
        if #[cfg(target_os = "ios")] {
            use keyring::ios::IosCredential;
            let cred = IosCredential::new_with_target(target, service, user)
                .context("Failed to open iOS keychain entry")?;
            Ok(Arc::new(cred))
        } else if #[cfg(target_os = "macos")] {
            use keyring::macos::MacCredential;
            let cred = MacCredential::new_with_target(target, service, user)
                .context("Failed to open macOS keychain entry")?;
            Ok(Arc::new(cred))
        } else if #[cfg(target_os = "linux")] {
            use keyring::secret_service::SsCredential;
            let cred = SsCredential::new_with_target(target, service, user)
                .context("Failed to open secret-service entry")?;
            Ok(Arc::new(cred))
        } else {
            compile_error!("Configure a keychain backend for this OS")
        }
    }
}

// --- File backend --- //

/// Stores one value in an owner-only file.
struct FileCredential {
    path: PathBuf,
}

fn io_to_keyring(err: io::Error) -> keyring::Error {
    match err.kind() {
        io::ErrorKind::NotFound => keyring::Error::NoEntry,
        io::ErrorKind::PermissionDenied =>
            keyring::Error::NoStorageAccess(Box::new(err)),
        _ => keyring::Error::PlatformFailure(Box::new(err)),
    }
}

impl FileCredential {
    /// Write to a sibling temp file, then rename over the target, so a crash
    /// mid-write can't leave a truncated token behind.
    fn write_atomic(&self, contents: &[u8]) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp_path = self.path.with_extension("tmp");

        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o600);

        let mut file = opts.open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

impl CredentialApi for FileCredential {
    fn set_password(&self, password: &str) -> keyring::Result<()> {
        self.write_atomic(password.as_bytes()).map_err(io_to_keyring)
    }

    fn get_password(&self) -> keyring::Result<String> {
        let bytes = std::fs::read(&self.path).map_err(io_to_keyring)?;
        String::from_utf8(bytes)
            .map_err(|err| keyring::Error::BadEncoding(err.into_bytes()))
    }

    fn delete_password(&self) -> keyring::Result<()> {
        std::fs::remove_file(&self.path).map_err(io_to_keyring)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// --- In-memory backend --- //

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    };

    use keyring::credential::CredentialApi;

    /// Controls every credential of a [`SecretStore::memory`] store. Flips
    /// them between working and failing with
    /// [`keyring::Error::NoStorageAccess`], and can hold writes to model a
    /// slow keychain.
    ///
    /// [`SecretStore::memory`]: super::SecretStore::memory
    #[derive(Clone, Default)]
    pub struct OutageSwitch(Arc<Switches>);

    #[derive(Default)]
    struct Switches {
        unavailable: AtomicBool,
        write_gate: Mutex<WriteGate>,
        write_gate_changed: Condvar,
    }

    #[derive(Default)]
    struct WriteGate {
        held: bool,
        /// Writers currently blocked on the gate.
        waiting: usize,
    }

    impl OutageSwitch {
        pub fn set_unavailable(&self, unavailable: bool) {
            self.0.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Block every write until [`release_writes`](Self::release_writes).
        pub fn hold_writes(&self) {
            self.write_gate().held = true;
        }

        pub fn release_writes(&self) {
            self.write_gate().held = false;
            self.0.write_gate_changed.notify_all();
        }

        /// How many writes are blocked right now.
        pub fn held_writes(&self) -> usize {
            self.write_gate().waiting
        }

        /// Wait until at least `n` writes are blocked.
        pub async fn wait_for_held_writes(&self, n: usize) {
            while self.held_writes() < n {
                tokio::task::yield_now().await;
            }
        }

        pub(super) fn credential(&self) -> MemoryCredential {
            MemoryCredential {
                value: Mutex::new(None),
                outage: self.clone(),
            }
        }

        fn write_gate(&self) -> MutexGuard<'_, WriteGate> {
            self.0
                .write_gate
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Runs on the blocking pool, so blocking here is fine.
        fn pass_write_gate(&self) {
            let mut gate = self.write_gate();
            if !gate.held {
                return;
            }
            gate.waiting += 1;
            while gate.held {
                gate = self
                    .0
                    .write_gate_changed
                    .wait(gate)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            gate.waiting -= 1;
        }

        fn check(&self) -> keyring::Result<()> {
            if self.0.unavailable.load(Ordering::SeqCst) {
                let err = std::io::Error::other("storage offline");
                Err(keyring::Error::NoStorageAccess(Box::new(err)))
            } else {
                Ok(())
            }
        }
    }

    pub struct MemoryCredential {
        value: Mutex<Option<String>>,
        outage: OutageSwitch,
    }

    impl MemoryCredential {
        fn with_value<T>(
            &self,
            f: impl FnOnce(&mut Option<String>) -> T,
        ) -> T {
            let mut value = match self.value.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut value)
        }
    }

    impl CredentialApi for MemoryCredential {
        fn set_password(&self, password: &str) -> keyring::Result<()> {
            self.outage.pass_write_gate();
            self.outage.check()?;
            self.with_value(|value| *value = Some(password.to_owned()));
            Ok(())
        }

        fn get_password(&self) -> keyring::Result<String> {
            self.outage.check()?;
            self.with_value(|value| value.clone())
                .ok_or(keyring::Error::NoEntry)
        }

        fn delete_password(&self) -> keyring::Result<()> {
            self.outage.check()?;
            self.with_value(|value| value.take())
                .map(|_| ())
                .ok_or(keyring::Error::NoEntry)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn exercise(store: &SecretStore) {
        let key = StoreKey::RefreshToken;
        assert_eq!(store.get(key).await.unwrap(), None);

        store.set(key, "r1").await.unwrap();
        assert_eq!(store.get(key).await.unwrap().as_deref(), Some("r1"));

        store.set(key, "r2").await.unwrap();
        assert_eq!(store.get(key).await.unwrap().as_deref(), Some("r2"));

        // keys don't alias
        assert_eq!(store.get(StoreKey::AccessToken).await.unwrap(), None);

        store.remove(key).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), None);
        // removing twice is fine
        store.remove(key).await.unwrap();
    }

    #[tokio::test]
    async fn file_store() {
        let tempdir = tempfile::tempdir().unwrap();
        let store = SecretStore::file(tempdir.path());
        exercise(&store).await;

        // nothing left behind
        store.set(StoreKey::Theme, "dark").await.unwrap();
        let names = std::fs::read_dir(tempdir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect::<Vec<_>>();
        assert_eq!(names, vec![std::ffi::OsString::from("theme")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tempdir = tempfile::tempdir().unwrap();
        let store = SecretStore::file(&tempdir.path().join("nested"));
        store.set(StoreKey::AccessToken, "a1").await.unwrap();

        let path = tempdir.path().join("nested/platform_access_token");
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn memory_store_outage() {
        let (store, outage) = SecretStore::memory();
        exercise(&store).await;

        store.set(StoreKey::AccessToken, "a1").await.unwrap();
        outage.set_unavailable(true);
        assert!(store.get(StoreKey::AccessToken).await.is_err());
        assert!(store.set(StoreKey::AccessToken, "a2").await.is_err());
        assert!(store.remove(StoreKey::AccessToken).await.is_err());

        outage.set_unavailable(false);
        let value = store.get(StoreKey::AccessToken).await.unwrap();
        assert_eq!(value.as_deref(), Some("a1"));
    }

    #[tokio::test]
    async fn held_writes_land_on_release() {
        let (store, switch) = SecretStore::memory();
        switch.hold_writes();

        let write = {
            let store = store.clone();
            tokio::spawn(
                async move { store.set(StoreKey::Theme, "light").await },
            )
        };
        switch.wait_for_held_writes(1).await;
        // reads aren't held
        assert_eq!(store.get(StoreKey::Theme).await.unwrap(), None);

        switch.release_writes();
        write.await.unwrap().unwrap();
        assert_eq!(switch.held_writes(), 0);
        let theme = store.get(StoreKey::Theme).await.unwrap();
        assert_eq!(theme.as_deref(), Some("light"));
    }

    #[tokio::test]
    async fn remove_all_reports_every_failure() {
        let (store, outage) = SecretStore::memory();
        store.set(StoreKey::UserData, "{}").await.unwrap();
        store
            .remove_all(&[StoreKey::UserData, StoreKey::Balance])
            .await
            .unwrap();
        assert_eq!(store.get(StoreKey::UserData).await.unwrap(), None);

        outage.set_unavailable(true);
        let err = store
            .remove_all(&[StoreKey::UserData, StoreKey::Balance])
            .await
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("platform_user_data"), "{msg}");
        assert!(msg.contains("platform_balance"), "{msg}");
    }

    #[tokio::test]
    async fn json_values() {
        let (store, _) = SecretStore::memory();
        store.set_json(StoreKey::SessionVerified, &true).await.unwrap();
        let verified = store.get_json::<bool>(StoreKey::SessionVerified).await;
        assert_eq!(verified.unwrap(), Some(true));

        store.set(StoreKey::Balance, "not json").await.unwrap();
        assert!(store.get_json::<u64>(StoreKey::Balance).await.is_err());
    }

    #[test]
    fn store_keys_index_in_order() {
        for (idx, key) in StoreKey::ALL.iter().enumerate() {
            assert_eq!(*key as usize, idx);
        }
    }
}
