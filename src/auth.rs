//! Password hashing, session tokens and the authenticated-user extractor.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{
        HeaderMap, HeaderValue,
        header::AUTHORIZATION,
        request::Parts,
    },
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ApiError, ApiErrorWithMeta, E_UNAUTHORIZED};
use crate::responses::RequestMeta;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed password hash")]
    MalformedHash,
    #[error("malformed token")]
    MalformedToken,
    #[error("token signature mismatch")]
    BadSignature,
}

fn mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC takes keys of any size")
}

/// Hashes `password` under a fresh random salt: `salt$hex(hmac(salt, password))`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let mut m = mac(salt.as_bytes());
    m.update(password.as_bytes());
    format!("{salt}${}", hex::encode(m.finalize().into_bytes()))
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let (salt, digest) = stored.split_once('$').ok_or(AuthError::MalformedHash)?;
    let digest = hex::decode(digest).map_err(|_| AuthError::MalformedHash)?;
    let mut m = mac(salt.as_bytes());
    m.update(password.as_bytes());
    Ok(m.verify_slice(&digest).is_ok())
}

/// Issues and checks `login:signature` session tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Arc<[u8]>,
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    pub fn issue(&self, login: &str) -> String {
        let mut m = mac(&self.secret);
        m.update(login.as_bytes());
        format!("{login}:{}", hex::encode(m.finalize().into_bytes()))
    }

    /// Returns the login the token was issued for.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let (login, sig) = token.rsplit_once(':').ok_or(AuthError::MalformedToken)?;
        if login.is_empty() {
            return Err(AuthError::MalformedToken);
        }
        let sig = hex::decode(sig).map_err(|_| AuthError::MalformedToken)?;
        let mut m = mac(&self.secret);
        m.update(login.as_bytes());
        m.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;
        Ok(login.to_string())
    }

    /// The `Authorization` header handed back after register/login.
    pub fn auth_headers(&self, login: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.issue(login))) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

/// The caller, as proven by a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenSigner: FromRef<S>,
{
    type Rejection = ApiErrorWithMeta;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let meta = parts
            .extensions
            .get::<RequestMeta>()
            .cloned()
            .unwrap_or_else(RequestMeta::now);
        let reject = |why: &str| {
            ApiError::Unauthorized(why.to_string())
                .with_meta(meta.clone())
                .with_code(E_UNAUTHORIZED)
        };

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| reject("missing authorization"))?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();

        let signer = TokenSigner::from_ref(state);
        match signer.verify(token) {
            Ok(login) => Ok(AuthUser(login)),
            Err(e) => {
                warn!(error = %e, "rejected authorization");
                Err(reject("invalid authorization"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored).unwrap());
        assert!(!verify_password("hunter3", &stored).unwrap());
    }

    #[test]
    fn same_password_different_salt() {
        assert_ne!(hash_password("pw"), hash_password("pw"));
    }

    #[test]
    fn garbage_hash_is_an_error() {
        assert_eq!(verify_password("pw", "nodollar"), Err(AuthError::MalformedHash));
        assert_eq!(verify_password("pw", "salt$zz"), Err(AuthError::MalformedHash));
    }

    #[test]
    fn token_names_its_login() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue("alice");
        assert_eq!(signer.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn tampered_or_foreign_tokens_fail() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue("alice");
        let forged = token.replacen("alice", "bob", 1);
        assert_eq!(signer.verify(&forged), Err(AuthError::BadSignature));
        assert_eq!(TokenSigner::new("other").verify(&token), Err(AuthError::BadSignature));
        assert_eq!(signer.verify("alice"), Err(AuthError::MalformedToken));
    }

    #[test]
    fn login_may_contain_colons() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue("a:b");
        assert_eq!(signer.verify(&token).unwrap(), "a:b");
    }
}
