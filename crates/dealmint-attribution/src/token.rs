use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dealmint_core::AttributionError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION_V1: &str = "a1";
const MAX_TOKEN_LEN: usize = 512;
const MIN_SECRET_LEN: usize = 32;

/// The capsule a visitor carries from click to conversion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttributionToken {
    #[serde(rename = "l")]
    pub link_id: Uuid,
    #[serde(rename = "t")]
    pub token_id: Uuid,
    #[serde(rename = "i")]
    pub issued_at_epoch_secs: i64,
}

impl AttributionToken {
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.issued_at_epoch_secs, 0)
    }
}

#[derive(Clone)]
pub struct TokenSigner {
    keyed: HmacSha256,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, String> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(format!(
                "attribution secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }
        let keyed = HmacSha256::new_from_slice(&secret).map_err(|err| err.to_string())?;
        Ok(Self { keyed })
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    pub fn issue(&self, link_id: Uuid, now: DateTime<Utc>) -> (AttributionToken, String) {
        let token = AttributionToken {
            link_id,
            token_id: Uuid::new_v4(),
            issued_at_epoch_secs: now.timestamp(),
        };
        let encoded = self.encode(&token);
        (token, encoded)
    }

    pub fn encode(&self, token: &AttributionToken) -> String {
        let payload = serde_json::to_vec(token).unwrap_or_default();
        let payload_part = URL_SAFE_NO_PAD.encode(payload);
        let mut mac = self.mac();
        mac.update(TOKEN_VERSION_V1.as_bytes());
        mac.update(payload_part.as_bytes());
        let sig_part = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{TOKEN_VERSION_V1}.{payload_part}.{sig_part}")
    }

    /// Checks format and signature only; expiry is the caller's policy.
    pub fn verify(&self, raw: &str) -> Result<AttributionToken, AttributionError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > MAX_TOKEN_LEN {
            return Err(AttributionError::InvalidToken);
        }

        let parts: Vec<&str> = raw.split('.').collect();
        let [version, payload_part, sig_part] = parts.as_slice() else {
            return Err(AttributionError::InvalidToken);
        };
        if *version != TOKEN_VERSION_V1 {
            return Err(AttributionError::InvalidToken);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig_part)
            .map_err(|_| AttributionError::InvalidToken)?;
        let mut mac = self.mac();
        mac.update(version.as_bytes());
        mac.update(payload_part.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AttributionError::InvalidToken)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| AttributionError::InvalidToken)?;
        serde_json::from_slice(&payload).map_err(|_| AttributionError::InvalidToken)
    }

    /// Keyed digest of a visitor identifier, so click logs never hold the raw value.
    pub fn anonymize_visitor(&self, visitor_id: &str) -> String {
        let mut mac = self.mac();
        mac.update(b"visitor:");
        mac.update(visitor_id.trim().as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}
