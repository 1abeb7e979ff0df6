//! Client configuration: where the API lives and how requests authenticate.

use std::{fmt, str::FromStr, time::Duration};

use anyhow::{Context, anyhow, ensure};
use http::{HeaderName, HeaderValue, header};
use pesaloop_api_core::auth::path;

pub const DEFAULT_AUTH_SCHEME: &str = "Bearer";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
/// Some onboarding calls (KYC uploads) take a while on slow mobile links.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const USER_AGENT: &str =
    concat!("pesaloop-client/", env!("CARGO_PKG_VERSION"));

/// Env var names read by [`ApiConfig::from_env`].
pub mod var {
    pub const DEPLOY_ENV: &str = "PESALOOP_ENV";
    pub const BASE_URL: &str = "PESALOOP_API_BASE_URL";
    pub const REFRESH_PATH: &str = "PESALOOP_API_REFRESH_PATH";
    pub const REVOKE_PATH: &str = "PESALOOP_API_REVOKE_PATH";
    pub const AUTH_HEADER: &str = "PESALOOP_AUTH_HEADER";
    pub const AUTH_SCHEME: &str = "PESALOOP_AUTH_SCHEME";
    pub const TIMEOUT_SECS: &str = "PESALOOP_API_TIMEOUT_SECS";
}

/// Which backend deployment the app talks to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DeployEnv {
    /// "dev"
    Dev,
    /// "staging"
    Staging,
    /// "prod"
    #[default]
    Prod,
}

impl DeployEnv {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }

    /// The API base URL for this deployment.
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Dev => "http://localhost:8000/api",
            Self::Staging => "https://staging-api.pesaloop.app/api",
            Self::Prod => "https://api.pesaloop.app/api",
        }
    }
}

impl FromStr for DeployEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            _ => Err(anyhow!(
                "Unrecognized {} '{s}': must be 'dev', 'staging', or 'prod'",
                var::DEPLOY_ENV,
            )),
        }
    }
}

impl fmt::Display for DeployEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub deploy_env: DeployEnv,
    /// Base URL without a trailing slash, e.g. `https://api.pesaloop.app/api`.
    pub base_url: String,
    pub refresh_path: String,
    pub revoke_path: String,
    /// The header carrying the access token, normally `Authorization`.
    pub auth_header: HeaderName,
    /// Prefix before the token in [`Self::auth_header`], normally `Bearer`.
    pub auth_scheme: String,
    pub content_type: HeaderValue,
    pub accept: HeaderValue,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::for_env(DeployEnv::default())
    }
}

impl ApiConfig {
    /// The stock config for a deployment.
    pub fn for_env(deploy_env: DeployEnv) -> Self {
        Self {
            deploy_env,
            base_url: deploy_env.base_url().to_owned(),
            refresh_path: path::REFRESH.to_owned(),
            revoke_path: path::REVOKE.to_owned(),
            auth_header: header::AUTHORIZATION,
            auth_scheme: DEFAULT_AUTH_SCHEME.to_owned(),
            content_type: HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
            accept: HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
            timeout: API_REQUEST_TIMEOUT,
            user_agent: USER_AGENT.to_owned(),
        }
    }

    /// Read the config from the process env, falling back to a `.env` file.
    /// Keys found in `.env` are not loaded into the process env.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(env_or_dotenv)
    }

    /// Build a config from a key lookup. Unset keys keep their defaults.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let deploy_env = match lookup(var::DEPLOY_ENV) {
            Some(s) => DeployEnv::from_str(&s)?,
            None => DeployEnv::default(),
        };
        let mut config = Self::for_env(deploy_env);

        if let Some(base_url) = lookup(var::BASE_URL) {
            config.base_url = base_url.trim_end_matches('/').to_owned();
        }
        if let Some(refresh_path) = lookup(var::REFRESH_PATH) {
            config.refresh_path = refresh_path;
        }
        if let Some(revoke_path) = lookup(var::REVOKE_PATH) {
            config.revoke_path = revoke_path;
        }
        if let Some(auth_header) = lookup(var::AUTH_HEADER) {
            config.auth_header = HeaderName::from_str(&auth_header)
                .with_context(|| format!("Invalid {}", var::AUTH_HEADER))?;
        }
        if let Some(auth_scheme) = lookup(var::AUTH_SCHEME) {
            config.auth_scheme = auth_scheme;
        }
        if let Some(timeout_secs) = lookup(var::TIMEOUT_SECS) {
            let secs = u64::from_str(&timeout_secs)
                .with_context(|| format!("Invalid {}", var::TIMEOUT_SECS))?;
            ensure!(secs > 0, "{} must be at least 1", var::TIMEOUT_SECS);
            config.timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// The absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        let base_url = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base_url}/{path}")
    }
}

/// Like [`dotenvy::var`], but doesn't load anything into the process env.
fn env_or_dotenv(key: &str) -> Option<String> {
    if let Ok(value) = std::env::var(key) {
        return Some(value);
    }

    // No .env file is fine.
    let iter = dotenvy::dotenv_iter().ok()?;
    iter.filter_map(Result::ok)
        .find(|(k, _)| k == key)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;

    fn lookup(
        pairs: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> + use<> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ApiConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.deploy_env, DeployEnv::Prod);
        assert_eq!(config.auth_header, header::AUTHORIZATION);
        assert_eq!(config.auth_scheme, "Bearer");
        assert_eq!(config.refresh_path, "/auth/token/refresh/");
        assert_eq!(config.revoke_path, "/auth/token/logout/");
        assert_eq!(config.timeout, API_REQUEST_TIMEOUT);
    }

    #[test]
    fn overrides() {
        let config = ApiConfig::from_lookup(lookup(&[
            (var::DEPLOY_ENV, "dev"),
            (var::BASE_URL, "http://10.0.2.2:8000/api/"),
            (var::REFRESH_PATH, "/auth/jwt/refresh/"),
            (var::AUTH_HEADER, "X-Auth"),
            (var::AUTH_SCHEME, "JWT"),
            (var::TIMEOUT_SECS, "5"),
        ]))
        .unwrap();
        assert_eq!(config.deploy_env, DeployEnv::Dev);
        assert_eq!(config.base_url, "http://10.0.2.2:8000/api");
        assert_eq!(config.refresh_path, "/auth/jwt/refresh/");
        assert_eq!(config.auth_header.as_str(), "x-auth");
        assert_eq!(config.auth_scheme, "JWT");
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(ApiConfig::from_lookup(lookup(&[(var::DEPLOY_ENV, "qa")]))
            .is_err());
        assert!(
            ApiConfig::from_lookup(lookup(&[(var::AUTH_HEADER, "bad header")]))
                .is_err()
        );
        assert!(
            ApiConfig::from_lookup(lookup(&[(var::TIMEOUT_SECS, "soon")]))
                .is_err()
        );
        // every request would time out immediately
        let err = ApiConfig::from_lookup(lookup(&[(var::TIMEOUT_SECS, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains(var::TIMEOUT_SECS), "{err:#}");
    }

    #[test]
    fn url_joining() {
        let mut config = ApiConfig::default();
        config.base_url = "https://api.pesaloop.app/api".to_owned();
        assert_eq!(
            config.url("/auth/token/refresh/"),
            "https://api.pesaloop.app/api/auth/token/refresh/"
        );
        assert_eq!(
            config.url("wallets/"),
            "https://api.pesaloop.app/api/wallets/"
        );
    }
}
