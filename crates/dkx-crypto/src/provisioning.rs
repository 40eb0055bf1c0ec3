//! Signed public-key registration payload.
//!
//! A device announces its public key to the backend as
//!
//! ```json
//! {"pubKeyInfo":{...},"signature":"<b64>","previousPubKeySignature":""}
//! ```
//!
//! where `signature` covers the exact `pubKeyInfo` bytes as sent. The object
//! is embedded verbatim so the receiver can check the signature without
//! re-serializing it.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::codec;
use crate::error::{CryptoError, KeyHalf};
use crate::facade::DeviceCrypto;
use crate::keys::{KeyPair, Signature};

pub const ALGORITHM: &str = "ECC_ED25519";

/// Validity window of a registered key.
pub const VALIDITY: Months = Months::new(60);

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("json error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timestamp out of range: {0}")]
    Timestamp(String),
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Public key description signed by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubKeyInfo {
    pub hw_device_id: String,
    pub pub_key: String,
    pub pub_key_id: String,
    pub algorithm: String,
    pub previous_pub_key_id: String,
    pub created: String,
    pub valid_not_before: String,
    pub valid_not_after: String,
}

impl PubKeyInfo {
    /// Describe `crypto`'s own public key, valid from `created` for
    /// [`VALIDITY`].
    pub fn new(
        crypto: &DeviceCrypto,
        hw_device_id: &str,
        created: DateTime<Utc>,
    ) -> Result<Self, ProvisioningError> {
        let public_key = crypto
            .my_public_key()
            .ok_or(CryptoError::MissingKeyMaterial(KeyHalf::Public))?;
        let not_after = created
            .checked_add_months(VALIDITY)
            .ok_or_else(|| ProvisioningError::Timestamp(format_timestamp(created)))?;

        Ok(Self {
            hw_device_id: hw_device_id.to_string(),
            pub_key: crypto.encode_message_base64(public_key.as_bytes()),
            pub_key_id: String::new(),
            algorithm: ALGORITHM.to_string(),
            previous_pub_key_id: String::new(),
            created: format_timestamp(created),
            valid_not_before: format_timestamp(created),
            valid_not_after: format_timestamp(not_after),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationOut<'a> {
    pub_key_info: &'a RawValue,
    signature: String,
    previous_pub_key_signature: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationIn<'a> {
    #[serde(borrow)]
    pub_key_info: &'a RawValue,
    signature: String,
}

/// Build the signed registration payload for `crypto`'s own key.
pub fn key_registration(
    crypto: &DeviceCrypto,
    hw_device_id: &str,
    created: DateTime<Utc>,
) -> Result<String, ProvisioningError> {
    let info = PubKeyInfo::new(crypto, hw_device_id, created)?;
    let info_json = serde_json::to_string(&info)?;
    let signature = crypto.sign_message_encoded(info_json.as_bytes())?;
    let info_raw = RawValue::from_string(info_json)?;

    let payload = RegistrationOut {
        pub_key_info: &info_raw,
        signature,
        previous_pub_key_signature: "",
    };
    Ok(serde_json::to_string(&payload)?)
}

/// Registration payload stamped with the current time.
pub fn key_registration_now(
    crypto: &DeviceCrypto,
    hw_device_id: &str,
) -> Result<String, ProvisioningError> {
    key_registration(crypto, hw_device_id, Utc::now())
}

/// Parse a registration payload and check its signature under the public
/// key it announces. This proves possession of the private key only; it
/// says nothing about who the device is.
pub fn verify_registration(payload: &str) -> Result<PubKeyInfo, ProvisioningError> {
    let registration: RegistrationIn<'_> = serde_json::from_str(payload)?;
    let info_json = registration.pub_key_info.get();
    let info: PubKeyInfo = serde_json::from_str(info_json)?;

    let public_key = codec::decode(&info.pub_key).map_err(CryptoError::from)?;
    let signer = KeyPair::from_public_key(&public_key)?;
    let signature = codec::decode(&registration.signature).map_err(CryptoError::from)?;
    signer.verify(info_json.as_bytes(), &Signature::from_slice(&signature)?)?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device() -> DeviceCrypto {
        let mut crypto = DeviceCrypto::new();
        crypto.create_key_pair().unwrap();
        crypto
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap()
            + chrono::Duration::milliseconds(42)
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(fixed_time()), "2024-02-29T13:05:09.042Z");
    }

    #[test]
    fn test_pub_key_info_fields() {
        let crypto = device();
        let info = PubKeyInfo::new(&crypto, "device-01", fixed_time()).unwrap();

        assert_eq!(info.hw_device_id, "device-01");
        assert_eq!(info.algorithm, "ECC_ED25519");
        assert_eq!(info.pub_key_id, "");
        assert_eq!(info.previous_pub_key_id, "");
        assert_eq!(info.created, info.valid_not_before);
        // Leap day rolls back to the last day of February.
        assert_eq!(info.valid_not_after, "2029-02-28T13:05:09.042Z");
        assert_eq!(
            codec::decode(&info.pub_key).unwrap(),
            crypto.my_public_key().unwrap().as_bytes()
        );
    }

    #[test]
    fn test_registration_signature_verifies() {
        let crypto = device();
        let payload = key_registration(&crypto, "device-01", fixed_time()).unwrap();

        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["previousPubKeySignature"], "");
        assert_eq!(value["pubKeyInfo"]["algorithm"], "ECC_ED25519");

        let info = verify_registration(&payload).unwrap();
        assert_eq!(info.hw_device_id, "device-01");
    }

    #[test]
    fn test_tampered_registration_rejected() {
        let crypto = device();
        let payload = key_registration(&crypto, "device-01", fixed_time()).unwrap();
        let tampered = payload.replace("device-01", "device-02");

        assert!(matches!(
            verify_registration(&tampered),
            Err(ProvisioningError::Crypto(CryptoError::SignatureRejected))
        ));
    }

    #[test]
    fn test_registration_requires_identity() {
        let crypto = DeviceCrypto::new();
        assert!(matches!(
            key_registration(&crypto, "device-01", fixed_time()),
            Err(ProvisioningError::Crypto(CryptoError::MissingKeyMaterial(_)))
        ));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            verify_registration("{\"pubKeyInfo\":1}"),
            Err(ProvisioningError::Serialization(_))
        ));
    }
}
