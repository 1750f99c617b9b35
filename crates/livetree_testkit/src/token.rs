//! Signed session tokens.
//!
//! A token is `<claims>.<signature>`, both hex encoded. The claims are JSON,
//! the signature is HMAC-SHA256 over the claim bytes.

use hmac::{Hmac, Mac};
use livetree_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// What a token asserts about its holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub uid: String,
    /// Provider that authenticated the user.
    pub provider: String,
    /// Expiry in milliseconds since the Unix epoch.
    pub expires: u64,
    /// Account email, for password sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Issues and verifies tokens with a shared secret.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Creates an issuer.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signs `claims` into a token.
    pub fn issue(&self, claims: &Claims) -> String {
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let signature = self.sign(&payload);
        format!("{}.{}", hex_encode(&payload), hex_encode(&signature))
    }

    /// Checks a token's signature and expiry at `now_ms`.
    pub fn verify(&self, token: &str, now_ms: u64) -> Result<Claims, ErrorCode> {
        let (payload, signature) = token.split_once('.').ok_or(ErrorCode::InvalidToken)?;
        let payload = hex_decode(payload).ok_or(ErrorCode::InvalidToken)?;
        let signature = hex_decode(signature).ok_or(ErrorCode::InvalidToken)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| ErrorCode::InvalidToken)?;

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| ErrorCode::InvalidToken)?;
        if now_ms >= claims.expires {
            return Err(ErrorCode::ExpiredToken);
        }
        Ok(claims)
    }

    /// Whether `token` is the raw shared secret.
    pub fn is_secret(&self, token: &str) -> bool {
        token.as_bytes() == self.secret.as_slice()
    }

    fn sign(&self, data: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
