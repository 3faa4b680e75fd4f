//! Plugin bearer tokens.
//!
//! A token is an ES256-signed compact JWS wrapped in an AES-256-GCM
//! envelope:
//!
//! ```text
//! b64(header) . b64(nonce) . b64(ciphertext)
//! ```
//!
//! where the envelope header is `{"alg":"dir","enc":"A256GCM","cty":"JWT"}`
//! and doubles as the AEAD associated data. All segments are base64url
//! without padding.
//!
//! The claims bind the token to one resource (the plugin's own discovery
//! path) and one subject (the plugin id). Any mismatch fails validation.

use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::{PluginsConfig, ServerConfig};
use crate::error::DiscoveryError;

const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    Signature,

    #[error("token envelope cannot be decrypted")]
    Decryption,

    #[error("token was not issued for this resource")]
    ResourceMismatch,

    #[error("token was not issued for this plugin")]
    SubjectMismatch,

    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    /// Plugin id.
    pub sub: String,
    /// SHA-256 of the Authorization header the plugin registered with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<String>,
    /// Absolute URL of the one resource this token grants access to.
    pub resource: String,
    pub realm: String,
}

/// What a new token is issued for.
#[derive(Debug, Clone)]
pub struct TokenGrant<'a> {
    pub plugin_id: &'a str,
    pub realm: &'a str,
    /// Resolved address of the registering client.
    pub client_address: &'a str,
    pub authorization: Option<&'a str>,
    /// Request path, e.g. `/api/v4/discovery/<id>`.
    pub resource_path: &'a str,
}

#[derive(Serialize, Deserialize)]
struct SignatureHeader {
    alg: String,
    typ: String,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeHeader {
    alg: String,
    enc: String,
    cty: String,
}

pub struct TokenService {
    issuer: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    cipher: Aes256Gcm,
    lifetime: chrono::Duration,
    skew: chrono::Duration,
}

impl TokenService {
    pub fn new(
        issuer: impl Into<String>,
        signing_key: SigningKey,
        encryption_key: &[u8; 32],
        lifetime: Duration,
        skew: Duration,
    ) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        Self {
            issuer: issuer.into().trim_end_matches('/').to_string(),
            signing_key,
            verifying_key,
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(encryption_key)),
            lifetime: to_chrono(lifetime),
            skew: to_chrono(skew),
        }
    }

    /// Fresh random keys. Tokens issued by a previous process stop
    /// validating.
    pub fn generate(issuer: impl Into<String>, lifetime: Duration, skew: Duration) -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::new(issuer, signing_key, &random_key(), lifetime, skew)
    }

    /// Keys from configuration, generating whichever is absent. Tokens live
    /// for two ping periods.
    pub fn from_config(server: &ServerConfig, plugins: &PluginsConfig) -> crate::error::Result<Self> {
        let lifetime = plugins.ping_period().checked_mul(2).ok_or_else(|| {
            DiscoveryError::InvalidArgument(format!(
                "plugin ping period of {}s is too large",
                plugins.ping_period_secs
            ))
        })?;
        let skew = Duration::from_secs(plugins.token_clock_skew_secs);

        let signing_key = match &plugins.signing_key_pem {
            Some(pem) => SigningKey::from_pkcs8_pem(pem)
                .map_err(|e| DiscoveryError::InvalidArgument(format!("signing key: {}", e)))?,
            None => {
                warn!("no plugin signing key configured, generating one");
                SigningKey::random(&mut OsRng)
            }
        };
        let encryption_key: [u8; 32] = match &plugins.encryption_key {
            Some(encoded) => STANDARD
                .decode(encoded.trim())
                .map_err(|e| DiscoveryError::InvalidArgument(format!("encryption key: {}", e)))?
                .try_into()
                .map_err(|_| {
                    DiscoveryError::InvalidArgument("encryption key must be 32 bytes".to_string())
                })?,
            None => {
                warn!("no plugin encryption key configured, generating one");
                random_key()
            }
        };
        Ok(Self::new(
            server.base_url.clone(),
            signing_key,
            &encryption_key,
            lifetime,
            skew,
        ))
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime.to_std().unwrap_or_default()
    }

    fn resource_url(&self, path: &str) -> String {
        format!("{}{}", self.issuer, path)
    }

    /// Sign and encrypt a token for `grant`, valid from `now`.
    pub fn issue(&self, grant: &TokenGrant<'_>, now: DateTime<Utc>) -> Result<String, TokenError> {
        let iat = now.timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: vec![self.issuer.clone(), grant.client_address.to_string()],
            iat,
            nbf: iat,
            exp: now
                .checked_add_signed(self.lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .timestamp(),
            sub: grant.plugin_id.to_string(),
            authz: grant.authorization.map(|h| hex::encode(Sha256::digest(h.as_bytes()))),
            resource: self.resource_url(grant.resource_path),
            realm: grant.realm.to_string(),
        };
        let jws = self.sign(&claims)?;
        self.encrypt(jws.as_bytes())
    }

    /// Decrypt, verify and check a token presented for `resource` by
    /// `subject`. `resource` may be an absolute URL or a path. Time claims
    /// are checked only when `now` is given.
    pub fn validate(
        &self,
        token: &str,
        resource: &str,
        subject: &str,
        now: Option<DateTime<Utc>>,
    ) -> Result<Claims, TokenError> {
        let jws = self.decrypt(token)?;
        let claims = self.verify(&jws)?;

        let matches_resource = if resource.starts_with('/') {
            claims.resource == self.resource_url(resource)
        } else {
            claims.resource == resource
        };
        if !matches_resource {
            return Err(TokenError::ResourceMismatch);
        }
        if claims.sub != subject {
            return Err(TokenError::SubjectMismatch);
        }
        if let Some(now) = now {
            let now = now.timestamp();
            let skew = self.skew.num_seconds();
            if now > claims.exp + skew {
                return Err(TokenError::Expired);
            }
            if now + skew < claims.nbf {
                return Err(TokenError::NotYetValid);
            }
        }
        Ok(claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = SignatureHeader {
            alg: "ES256".to_string(),
            typ: "JWT".to_string(),
        };
        let signing_input = format!("{}.{}", encode_json(&header)?, encode_json(claims)?);
        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    fn verify(&self, jws: &str) -> Result<Claims, TokenError> {
        let (signing_input, signature) = jws
            .rsplit_once('.')
            .ok_or_else(|| TokenError::Malformed("signed token has no signature".to_string()))?;
        let (header, claims) = signing_input
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("signed token has no claims".to_string()))?;

        let header: SignatureHeader = decode_json(header)?;
        if header.alg != "ES256" {
            return Err(TokenError::Malformed(format!("unsupported alg {}", header.alg)));
        }
        let signature = Signature::from_slice(&decode(signature)?).map_err(|_| TokenError::Signature)?;
        self.verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::Signature)?;
        decode_json(claims)
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<String, TokenError> {
        let header = encode_json(&EnvelopeHeader {
            alg: "dir".to_string(),
            enc: "A256GCM".to_string(),
            cty: "JWT".to_string(),
        })?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: header.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Decryption)?;
        Ok(format!(
            "{}.{}.{}",
            header,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    fn decrypt(&self, token: &str) -> Result<String, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(header), Some(nonce), Some(ciphertext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed("expected three envelope segments".to_string()));
        };

        let envelope: EnvelopeHeader = decode_json(header)?;
        if envelope.alg != "dir" || envelope.enc != "A256GCM" {
            return Err(TokenError::Malformed(format!(
                "unsupported envelope {}/{}",
                envelope.alg, envelope.enc
            )));
        }
        let nonce = decode(nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(TokenError::Malformed("bad nonce length".to_string()));
        }
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &decode(ciphertext)?,
                    aad: header.as_bytes(),
                },
            )
            .map_err(|_| TokenError::Decryption)?;
        String::from_utf8(plaintext).map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Aes256Gcm::generate_key(&mut OsRng));
    key
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn decode(segment: &str) -> Result<Vec<u8>, TokenError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| TokenError::Malformed(e.to_string()))
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Malformed(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_json<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    serde_json::from_slice(&decode(segment)?).map_err(|e| TokenError::Malformed(e.to_string()))
}
