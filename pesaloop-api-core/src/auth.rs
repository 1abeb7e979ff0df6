//! Auth tokens and the request/response types for the `/auth` endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{CustomerProfile, SessionUser};

/// Endpoint paths, relative to the API base URL.
pub mod path {
    pub const REGISTER: &str = "/auth/register/";
    pub const VERIFY_OTP: &str = "/auth/account/activation/otp/activate/";
    pub const RESEND_OTP: &str = "/auth/account/activation/resend/otp/";
    pub const FORGOT_PASSWORD: &str = "/auth/password/forgot/";
    pub const LOGIN: &str = "/auth/token/create/";
    /// Default; the deployed path is configurable.
    pub const REFRESH: &str = "/auth/token/refresh/";
    /// Default; the deployed path is configurable.
    pub const REVOKE: &str = "/auth/token/logout/";
}

// --- Tokens --- //

/// Defines an opaque token newtype whose `Debug` impl doesn't leak the value.
macro_rules! token_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(token: impl Into<String>) -> Self {
                Self(token.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

token_newtype! {
    /// A short-lived bearer credential attached to every request.
    AccessToken
}

token_newtype! {
    /// A longer-lived credential exchanged for a new [`TokenPair`].
    RefreshToken
}

/// Returned by both the login and refresh endpoints.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Returned by the refresh endpoint. The backend only rotates the refresh
/// token when rotation is enabled server-side; otherwise `refresh` is absent
/// and the current one stays valid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: AccessToken,
    #[serde(default)]
    pub refresh: Option<RefreshToken>,
}

impl RefreshResponse {
    /// The token pair to use from now on.
    pub fn into_pair(self, current_refresh: RefreshToken) -> TokenPair {
        TokenPair {
            access: self.access,
            refresh: self.refresh.unwrap_or(current_refresh),
        }
    }
}

/// Body for both the refresh and revoke endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: RefreshToken,
}

// --- Account creation / verification --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignupRequest {
    pub first_name: String,
    pub last_name: String,
    pub country_code: String,
    pub phone_number: String,
    pub email: String,
    pub password: String,
}

/// Identifies a user by email or phone number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentifierRequest {
    pub identifier: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyOtpRequest {
    pub identifier: String,
    pub otp: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserVerificationStatus {
    pub is_email_verified: bool,
    pub is_phone_verified: bool,
}

impl UserVerificationStatus {
    /// Both channels verified; the session may be activated.
    pub fn is_fully_verified(&self) -> bool {
        self.is_email_verified && self.is_phone_verified
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerifyOtpResponse {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user_verified: Option<UserVerificationStatus>,
}

/// The generic `{"message": ..}` acknowledgement.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub message: String,
}

// --- Login --- //

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub password: String,
    /// `true` for a fresh login that must be confirmed by OTP. `false` for a
    /// passcode re-login from the lock screen, which activates immediately.
    pub send_otp: bool,
    pub with_profile: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    #[serde(default)]
    pub user: Option<SessionUser>,
    #[serde(default, rename = "customerProfile")]
    pub customer_profile: Option<CustomerProfile>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub success: bool,
}
