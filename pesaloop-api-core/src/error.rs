//! Error kinds surfaced by the authenticated request pipeline, and the
//! classification of raw HTTP error responses into them.

// Deny suspicious match names that are probably non-existent variants.
#![deny(non_snake_case)]

use std::fmt;

use http::status::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- User-facing messages --- //

pub const NETWORK_ERROR_MSG: &str =
    "Network error. Please check your connection.";
pub const SESSION_EXPIRED_MSG: &str = "Session expired. Please log in again.";
pub const AUTH_REQUIRED_MSG: &str = "Authentication required.";
pub const INVALID_CREDENTIALS_MSG: &str =
    "Invalid credentials. Please try again.";
pub const INVALID_REQUEST_MSG: &str = "Invalid request.";
pub const NOT_FOUND_MSG: &str = "The requested resource was not found.";
pub const INTERNAL_SERVER_MSG: &str =
    "Internal server error. Please try again later.";
pub const UNKNOWN_ERROR_MSG: &str = "An unknown error occurred";
pub const STORAGE_ERROR_MSG: &str =
    "Secure storage is unavailable. Please restart the app.";

/// The stable numeric representation of a [`SessionErrorKind`].
pub type ErrorCode = u16;

/// The fields we look at in a non-2xx response body. The backend is not
/// consistent here: some views send `{"message": ..}`, validation failures
/// sometimes only send `{"error": ..}`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorBody {
    /// Decode an error body, ignoring anything that doesn't fit.
    ///
    /// Non-JSON bodies, non-object bodies, non-string fields and empty strings
    /// all decode to "absent", so classification never fails on a weird body.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let value = match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value) => value,
            Err(_) => return Self::default(),
        };
        let field = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Self {
            message: field("message"),
            error: field("error"),
        }
    }
}

// --- error_kind! macro --- //

/// Generates an error kind enum from a declaration where each variant carries
/// a fixed [`ErrorCode`] and a doc string. The doc string doubles as the
/// kind's developer-facing message.
///
/// * The `Unknown(ErrorCode)` variant must come first. It catches codes this
///   version doesn't recognize and preserves them.
/// * Duplicate codes, or a variant using code 0, fail to compile.
macro_rules! error_kind {
    {
        $(#[$enum_meta:meta])*
        pub enum $kind:ident {
            $( #[doc = $unknown_msg:literal] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg:literal] )*
                $item_name:ident = $item_code:literal
            ),*

            $(,)?
        }
    } => {
        $(#[$enum_meta])*
        pub enum $kind {
            $( #[doc = $unknown_msg] )*
            Unknown(ErrorCode),

            $(
                $( #[doc = $item_msg] )*
                $item_name
            ),*
        }

        impl $kind {
            /// Every known variant, excluding `Unknown(_)`.
            pub const KINDS: &'static [Self] = &[ $( Self::$item_name, )* ];

            #[inline]
            pub fn is_unknown(&self) -> bool {
                matches!(self, Self::Unknown(_))
            }

            /// The variant's doc string.
            pub fn to_msg(self) -> &'static str {
                let msg = match self {
                    $( Self::$item_name => concat!($( $item_msg, )*), )*
                    Self::Unknown(_) => concat!($( $unknown_msg, )*),
                };
                msg.trim_start()
            }

            pub fn to_code(self) -> ErrorCode {
                match self {
                    $( Self::$item_name => $item_code, )*
                    Self::Unknown(code) => code,
                }
            }

            pub fn from_code(code: ErrorCode) -> Self {
                // Duplicate codes become unreachable patterns.
                #[deny(unreachable_patterns)]
                match code {
                    0 => Self::Unknown(0),
                    $( $item_code => Self::$item_name, )*
                    _ => Self::Unknown(code),
                }
            }
        }

        impl Default for $kind {
            fn default() -> Self {
                Self::Unknown(0)
            }
        }

        impl fmt::Display for $kind {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", (*self).to_msg())
            }
        }

        impl From<ErrorCode> for $kind {
            #[inline]
            fn from(code: ErrorCode) -> Self {
                Self::from_code(code)
            }
        }

        impl From<$kind> for ErrorCode {
            #[inline]
            fn from(kind: $kind) -> ErrorCode {
                kind.to_code()
            }
        }

        impl From<CommonErrorKind> for $kind {
            #[inline]
            fn from(common: CommonErrorKind) -> Self {
                // `error_kind_invariants` checks every common code maps to a
                // known variant.
                Self::from_code(common.to_code())
            }
        }

        // Deriving would generate `Unknown(code)` with codes that are
        // actually valid variants.
        #[cfg(test)]
        impl proptest::arbitrary::Arbitrary for $kind {
            type Parameters = ();
            type Strategy = proptest::strategy::BoxedStrategy<Self>;

            fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
                use proptest::{
                    arbitrary::any, prop_oneof, sample, strategy::Strategy,
                };

                prop_oneof![
                    9 => sample::select(Self::KINDS),
                    1 => any::<ErrorCode>().prop_map(Self::from_code),
                ]
                .boxed()
            }
        }
    };
}

// --- Common errors --- //

/// Transport-level failures that happen before we have a response to
/// classify. Used by the transport layer, which doesn't know about session
/// semantics.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {msg}")]
pub struct CommonApiError {
    pub kind: CommonErrorKind,
    pub msg: String,
}

/// Error variants shared by every layer of the pipeline.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum CommonErrorKind {
    /// Unknown Reqwest client error
    UnknownReqwest = 1,
    /// Error building the HTTP request
    Building = 2,
    /// Error connecting to the API server
    Connect = 3,
    /// Request timed out
    Timeout = 4,
    /// Error decoding the HTTP response body
    Decode = 5,
    // NOTE: If adding a variant, be sure to also update Self::KINDS!
}

impl CommonApiError {
    pub fn new(kind: CommonErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    #[inline]
    pub fn to_code(&self) -> ErrorCode {
        self.kind.to_code()
    }
}

impl CommonErrorKind {
    #[cfg(test)]
    const KINDS: &'static [Self] = &[
        Self::UnknownReqwest,
        Self::Building,
        Self::Connect,
        Self::Timeout,
        Self::Decode,
    ];

    #[inline]
    pub fn to_code(self) -> ErrorCode {
        self as ErrorCode
    }
}

impl From<serde_json::Error> for CommonApiError {
    fn from(err: serde_json::Error) -> Self {
        let msg = format!("Failed to deserialize response as json: {err:#}");
        Self::new(CommonErrorKind::Decode, msg)
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for CommonApiError {
    fn from(err: reqwest::Error) -> Self {
        // The `Display` impl drops the source chain (e.g. TLS or DNS errors),
        // so use `Debug`.
        let msg = format!("{err:?}");
        let kind = if err.is_builder() {
            CommonErrorKind::Building
        } else if err.is_connect() {
            CommonErrorKind::Connect
        } else if err.is_timeout() {
            CommonErrorKind::Timeout
        } else if err.is_decode() {
            CommonErrorKind::Decode
        } else {
            CommonErrorKind::UnknownReqwest
        };
        Self { kind, msg }
    }
}

// --- Session errors --- //

error_kind! {
    /// Every way an authenticated request can fail.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub enum SessionErrorKind {
        /// Unknown error
        Unknown(ErrorCode),

        // --- Common --- //

        /// Unknown Reqwest client error
        UnknownReqwest = 1,
        /// Error building the HTTP request
        Building = 2,
        /// Error connecting to the API server
        Connect = 3,
        /// Request timed out
        Timeout = 4,
        /// Error decoding the HTTP response body
        Decode = 5,

        // --- Session --- //

        /// Session expired
        AuthExpired = 100,
        /// No session to authenticate with
        AuthRequired = 101,
        /// Server rejected the request as invalid
        Validation = 102,
        /// Resource not found
        NotFound = 103,
        /// Internal server error
        InternalServer = 104,
        /// Unexpected response status
        UnexpectedStatus = 105,
        /// Secure storage failure
        Storage = 106,
        /// Server rejected the credentials
        Unauthenticated = 107,
    }
}

impl SessionErrorKind {
    /// No response was received at all.
    pub fn is_network(self) -> bool {
        use SessionErrorKind::*;
        matches!(self, UnknownReqwest | Connect | Timeout)
    }

    /// The session is gone and the user has to log in again.
    pub fn is_session_ended(self) -> bool {
        matches!(self, Self::AuthExpired | Self::AuthRequired)
    }

    /// Whether a message sent by the server should be shown in place of
    /// [`Self::default_user_msg`].
    fn shows_server_msg(self) -> bool {
        use SessionErrorKind::*;
        matches!(
            self,
            Validation
                | NotFound
                | InternalServer
                | UnexpectedStatus
                | Unauthenticated
        )
    }

    /// The toast text for this kind when the server didn't send a usable
    /// message.
    pub fn default_user_msg(self) -> &'static str {
        use SessionErrorKind::*;
        match self {
            UnknownReqwest | Connect | Timeout => NETWORK_ERROR_MSG,
            AuthExpired => SESSION_EXPIRED_MSG,
            AuthRequired => AUTH_REQUIRED_MSG,
            Unauthenticated => INVALID_CREDENTIALS_MSG,
            Validation => INVALID_REQUEST_MSG,
            NotFound => NOT_FOUND_MSG,
            InternalServer => INTERNAL_SERVER_MSG,
            Storage => STORAGE_ERROR_MSG,
            Unknown(_) | Building | Decode | UnexpectedStatus =>
                UNKNOWN_ERROR_MSG,
        }
    }
}

/// The error returned by every authenticated request.
#[derive(Clone, Debug, Default, Eq, PartialEq, Error)]
pub struct SessionApiError {
    pub kind: SessionErrorKind,
    /// Detail about the failure. For classified responses, this is the
    /// message the server sent (possibly empty).
    pub msg: String,
    /// The response status, if we got that far.
    pub status: Option<StatusCode>,
}

impl SessionApiError {
    pub fn new(kind: SessionErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            status: None,
        }
    }

    /// The refresh failed, or the server rejected a request replayed with a
    /// freshly refreshed token.
    pub fn session_expired(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::AuthExpired, msg)
    }

    /// A 401 arrived but there's no refresh token to recover with.
    pub fn auth_required(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::AuthRequired, msg)
    }

    /// Secure storage couldn't be read, e.g. restoring the session at
    /// startup.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Storage, msg)
    }

    /// Classify a non-2xx response.
    ///
    /// | status | kind               | message source                  |
    /// |--------|--------------------|---------------------------------|
    /// | 400    | `Validation`       | body `message`, then `error`    |
    /// | 401    | `Unauthenticated`  | body `message`                  |
    /// | 404    | `NotFound`         | body `message`                  |
    /// | 500    | `InternalServer`   | body `message`                  |
    /// | other  | `UnexpectedStatus` | body `message`                  |
    ///
    /// A 401 classified here is a plain credentials rejection (e.g. a wrong
    /// password). Recovering an expired session is the interceptor's job and
    /// never reaches this fn.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        use SessionErrorKind::*;
        let ErrorBody { message, error } = ErrorBody::from_bytes(body);
        let (kind, server_msg) = match status.as_u16() {
            400 => (Validation, message.or(error)),
            401 => (Unauthenticated, message),
            404 => (NotFound, message),
            500 => (InternalServer, message),
            _ => (UnexpectedStatus, message),
        };
        Self {
            kind,
            msg: server_msg.unwrap_or_default(),
            status: Some(status),
        }
    }

    /// The text to show the user for this error.
    pub fn user_msg(&self) -> &str {
        if self.kind.shows_server_msg() && !self.msg.is_empty() {
            &self.msg
        } else {
            self.kind.default_user_msg()
        }
    }

    /// The UI should navigate back to the login screen.
    #[inline]
    pub fn is_session_ended(&self) -> bool {
        self.kind.is_session_ended()
    }
}

impl fmt::Display for SessionApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind_msg = self.kind.to_msg();
        match (self.status, self.msg.as_str()) {
            (Some(status), "") => write!(f, "{kind_msg} ({status})"),
            (Some(status), msg) => write!(f, "{kind_msg} ({status}): {msg}"),
            (None, "") => write!(f, "{kind_msg}"),
            (None, msg) => write!(f, "{kind_msg}: {msg}"),
        }
    }
}

impl From<CommonApiError> for SessionApiError {
    fn from(CommonApiError { kind, msg }: CommonApiError) -> Self {
        Self::new(SessionErrorKind::from(kind), msg)
    }
}

// --- Tests --- //

#[cfg(test)]
mod test {
    use proptest::{arbitrary::any, prop_assert, prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn client_error_kinds_non_zero() {
        for kind in CommonErrorKind::KINDS {
            assert_ne!(kind.to_code(), 0);
        }
    }

    #[test]
    fn error_kind_invariants() {
        // code 0 and the default kind must be unknown
        assert!(SessionErrorKind::from_code(0).is_unknown());
        assert!(SessionErrorKind::default().is_unknown());

        // every common kind has a matching session kind with the same code
        for common_kind in CommonErrorKind::KINDS {
            let kind = SessionErrorKind::from(*common_kind);
            assert!(!kind.is_unknown(), "missing common kind {common_kind:?}");
            assert_eq!(kind.to_code(), common_kind.to_code());
        }

        // kind -> code -> kind
        for kind in SessionErrorKind::KINDS {
            assert_eq!(*kind, SessionErrorKind::from_code(kind.to_code()));
        }

        // code -> kind -> code
        for code in 0_u16..200 {
            assert_eq!(code, SessionErrorKind::from_code(code).to_code());
        }

        proptest!(|(kind in any::<SessionErrorKind>())| {
            prop_assert_eq!(kind, SessionErrorKind::from_code(kind.to_code()));
            // Display is "<kind msg>: <detail>", so no trailing '.' and
            // never empty.
            prop_assert!(!kind.to_msg().is_empty());
            prop_assert!(!kind.to_msg().ends_with('.'));
            prop_assert!(!kind.default_user_msg().is_empty());
        });
    }

    #[test]
    fn error_body_decoding_is_lenient() {
        let body = ErrorBody::from_bytes(br#"{"message":"Bad OTP"}"#);
        assert_eq!(body.message.as_deref(), Some("Bad OTP"));
        assert_eq!(body.error, None);

        // wrong types and empty strings are treated as absent
        let body =
            ErrorBody::from_bytes(br#"{"message":{"otp":["x"]},"error":""}"#);
        assert_eq!(body, ErrorBody::default());

        for junk in [&b"<html>502</html>"[..], b"[1,2]", b"null", b""] {
            assert_eq!(ErrorBody::from_bytes(junk), ErrorBody::default());
        }
    }

    #[test]
    fn classify_bad_request() {
        let status = StatusCode::BAD_REQUEST;

        let err = SessionApiError::from_response(
            status,
            br#"{"message":"Phone number taken","error":"dup"}"#,
        );
        assert_eq!(err.kind, SessionErrorKind::Validation);
        assert_eq!(err.user_msg(), "Phone number taken");

        let err =
            SessionApiError::from_response(status, br#"{"error":"Bad OTP"}"#);
        assert_eq!(err.user_msg(), "Bad OTP");

        let err = SessionApiError::from_response(status, b"");
        assert_eq!(err.user_msg(), INVALID_REQUEST_MSG);
    }

    #[test]
    fn classify_other_statuses() {
        let cases = [
            (404, SessionErrorKind::NotFound, NOT_FOUND_MSG),
            (500, SessionErrorKind::InternalServer, INTERNAL_SERVER_MSG),
            (503, SessionErrorKind::UnexpectedStatus, UNKNOWN_ERROR_MSG),
            (418, SessionErrorKind::UnexpectedStatus, UNKNOWN_ERROR_MSG),
            (401, SessionErrorKind::Unauthenticated, INVALID_CREDENTIALS_MSG),
        ];
        for (status, kind, fallback) in cases {
            let status = StatusCode::from_u16(status).unwrap();

            let err = SessionApiError::from_response(status, b"{}");
            assert_eq!(err.kind, kind);
            assert_eq!(err.status, Some(status));
            assert_eq!(err.user_msg(), fallback);

            // `error` is only consulted for 400s
            let err = SessionApiError::from_response(
                status,
                br#"{"error":"ignored"}"#,
            );
            assert_eq!(err.user_msg(), fallback);
        }

        let err = SessionApiError::from_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            br#"{"message":"Ledger offline"}"#,
        );
        assert_eq!(err.user_msg(), "Ledger offline");
    }

    #[test]
    fn network_errors_hide_transport_detail() {
        for kind in [
            CommonErrorKind::Connect,
            CommonErrorKind::Timeout,
            CommonErrorKind::UnknownReqwest,
        ] {
            let common = CommonApiError::new(kind, "dns error: no such host");
            let err = SessionApiError::from(common);
            assert!(err.kind.is_network());
            assert_eq!(err.user_msg(), NETWORK_ERROR_MSG);
            assert!(err.to_string().contains("no such host"));
        }
    }

    #[test]
    fn session_ended_errors() {
        let err = SessionApiError::session_expired("refresh rejected (401)");
        assert!(err.is_session_ended());
        assert_eq!(err.user_msg(), SESSION_EXPIRED_MSG);

        let err = SessionApiError::auth_required("no refresh token");
        assert!(err.is_session_ended());
        assert_eq!(err.user_msg(), AUTH_REQUIRED_MSG);

        let err = SessionApiError::from_response(StatusCode::NOT_FOUND, b"");
        assert!(!err.is_session_ended());
    }

    #[test]
    fn display_includes_status_and_detail() {
        let err = SessionApiError::from_response(
            StatusCode::NOT_FOUND,
            br#"{"message":"No such wallet"}"#,
        );
        assert_eq!(
            err.to_string(),
            "Resource not found (404 Not Found): No such wallet"
        );

        let err = SessionApiError::storage("");
        assert_eq!(err.to_string(), "Secure storage failure");
        assert_eq!(err.user_msg(), STORAGE_ERROR_MSG);
    }
}
