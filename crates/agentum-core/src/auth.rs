//! Bearer-token issuance and validation.
//!
//! Tokens are compact three-part strings — `base64url(header) "." `
//! `base64url(claims) "." base64url(mac)` — signed with HMAC-SHA256. The
//! signing secret lives in `secrets.yaml` under the config directory and is
//! generated (256-bit random) on first run when absent. There is no refresh
//! flow and no revocation list.

use std::path::PathBuf;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime: 7 days.
const TOKEN_TTL_SECONDS: i64 = 7 * 24 * 3600;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("invalid token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("failed to access secret store: {0}")]
    SecretStore(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
    #[serde(rename = "type")]
    token_type: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    token_secret: Option<String>,
}

/// Issues and validates access tokens.
pub struct AuthService {
    secret: Vec<u8>,
}

impl AuthService {
    /// Load the signing secret from `secrets_file`, generating and persisting
    /// a fresh one when the file or key is missing.
    pub fn open(secrets_file: PathBuf) -> Result<Self, AuthError> {
        let mut doc: SecretsFile = match std::fs::read_to_string(&secrets_file) {
            Ok(text) => serde_yaml::from_str(&text)
                .map_err(|e| AuthError::SecretStore(format!("parse secrets.yaml: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SecretsFile::default(),
            Err(e) => return Err(AuthError::SecretStore(e.to_string())),
        };

        let secret = match doc.token_secret.as_deref() {
            Some(encoded) => URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| AuthError::SecretStore(format!("decode token_secret: {e}")))?,
            None => {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                doc.token_secret = Some(URL_SAFE_NO_PAD.encode(bytes));

                if let Some(parent) = secrets_file.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| AuthError::SecretStore(e.to_string()))?;
                }
                let yaml = serde_yaml::to_string(&doc)
                    .map_err(|e| AuthError::SecretStore(e.to_string()))?;
                std::fs::write(&secrets_file, yaml)
                    .map_err(|e| AuthError::SecretStore(e.to_string()))?;
                log::info!("generated new token signing secret");
                bytes.to_vec()
            }
        };

        Ok(Self { secret })
    }

    /// Service with an explicit secret (tests).
    pub fn with_secret(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Issue an access token for `user_id`. Returns the token and its
    /// lifetime in seconds.
    pub fn issue(&self, user_id: &str) -> Result<(String, i64), AuthError> {
        let now = Utc::now().timestamp();
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECONDS,
            token_type: "access".to_string(),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header).map_err(|_| AuthError::Malformed)?,
        );
        let claims_b64 = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).map_err(|_| AuthError::Malformed)?,
        );
        let signing_input = format!("{header_b64}.{claims_b64}");
        let mac = self.sign(signing_input.as_bytes());
        let token = format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(mac));
        Ok((token, TOKEN_TTL_SECONDS))
    }

    /// Validate a token and return the subject user id.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(mac_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        let signing_input = format!("{header_b64}.{claims_b64}");
        let mac_bytes = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| AuthError::BadSignature)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&mac_bytes)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(claims_b64)
                .map_err(|_| AuthError::Malformed)?,
        )
        .map_err(|_| AuthError::Malformed)?;

        if claims.token_type != "access" {
            return Err(AuthError::Malformed);
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims.sub)
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}
