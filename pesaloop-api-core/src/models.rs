//! User-scoped data returned by the API and cached on device.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Shown when a successful response doesn't carry its own `message`.
pub const REQUEST_SUCCESSFUL_MSG: &str = "Request successful";

/// The logged-in user, as returned by login with `with_profile`.
///
/// All fields default so that partially-populated payloads (and partial
/// updates merged on top of the cached user) still decode.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionUser {
    pub account_number: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: String,
    pub is_email_verified: bool,
    pub is_phone_verified: bool,
    pub is_active: bool,
    pub is_verified: bool,
    pub is_loan_qualified: bool,
}

/// KYC state attached to the user.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerProfile {
    pub id: String,
    pub id_type: String,
    pub id_number: String,
    pub selfie_image_url: String,
    pub is_id_front_uploaded: bool,
    pub is_id_back_uploaded: bool,
    pub is_face_uploaded: bool,
    pub is_address_proof_image_uploaded: bool,
    pub is_selfie_image_verified: bool,
    pub is_id_front_verified: bool,
    pub is_id_back_verified: bool,
    pub is_address_proof_image_verified: bool,
    pub verification_status: String,
    pub customer_verified: bool,
    pub verification_date: String,
    pub remarks: String,
    pub created_at: String,
    pub updated_at: String,
}

/// A payee the user recently sent money to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
    #[serde(default, rename = "phoneNumbers")]
    pub phone_numbers: Vec<String>,
}

/// A successful response, decoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    /// The body's `message` field, or [`REQUEST_SUCCESSFUL_MSG`].
    pub message: String,
}

impl<T: DeserializeOwned> ApiResponse<T> {
    pub fn from_json(
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        let message = value
            .get("message")
            .and_then(serde_json::Value::as_str)
            .filter(|msg| !msg.is_empty())
            .unwrap_or(REQUEST_SUCCESSFUL_MSG)
            .to_owned();
        let data = serde_json::from_value(value)?;
        Ok(Self { data, message })
    }
}
