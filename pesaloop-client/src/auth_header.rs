//! Binds the current access token to outbound requests.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use http::{HeaderMap, HeaderName, HeaderValue};
use pesaloop_api_core::{
    auth::AccessToken,
    error::{CommonApiError, CommonErrorKind},
};

use crate::config::ApiConfig;

/// The `<auth_header>: <scheme> <token>` header attached to every request.
///
/// Read on every request and written only on login, refresh and logout, so
/// the current value lives in an [`ArcSwapOption`].
pub struct AuthHeader {
    name: HeaderName,
    scheme: String,
    value: ArcSwapOption<HeaderValue>,
}

impl AuthHeader {
    pub fn new(name: HeaderName, scheme: impl Into<String>) -> Self {
        Self {
            name,
            scheme: scheme.into(),
            value: ArcSwapOption::empty(),
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.auth_header.clone(), config.auth_scheme.clone())
    }

    #[inline]
    pub fn name(&self) -> &HeaderName {
        &self.name
    }

    /// Bind `token` to all subsequent requests, or strip the header with
    /// `None`. Idempotent. Only a token that can't be made into a header
    /// value fails, and then the current binding is left as-is.
    ///
    /// This is the only way the header changes.
    pub fn bind(
        &self,
        token: Option<&AccessToken>,
    ) -> Result<(), CommonApiError> {
        let value = token.map(|token| self.value_for(token)).transpose()?;
        self.value.store(value.map(Arc::new));
        Ok(())
    }

    /// The header value for `token`. Fails if the token contains characters
    /// that can't appear in a header.
    pub fn value_for(
        &self,
        token: &AccessToken,
    ) -> Result<HeaderValue, CommonApiError> {
        let raw = if self.scheme.is_empty() {
            token.as_str().to_owned()
        } else {
            format!("{} {}", self.scheme, token.as_str())
        };
        let mut value = HeaderValue::try_from(raw).map_err(|_| {
            CommonApiError::new(
                CommonErrorKind::Building,
                "Access token is not a valid header value",
            )
        })?;
        // Keep it out of `Debug` output.
        value.set_sensitive(true);
        Ok(value)
    }

    /// The currently bound value, if any.
    pub fn current(&self) -> Option<HeaderValue> {
        self.value.load_full().map(|value| (*value).clone())
    }

    /// Set `value` on `headers`, or remove the header entirely for `None`.
    pub fn apply(&self, headers: &mut HeaderMap, value: Option<&HeaderValue>) {
        match value {
            Some(value) => {
                headers.insert(self.name.clone(), value.clone());
            }
            None => {
                headers.remove(&self.name);
            }
        }
    }
}
