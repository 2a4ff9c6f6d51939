/*
 * auth.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of mailcore, a self-hosted multi-tenant mail server.
 *
 * mailcore is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * mailcore is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with mailcore.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Password hashing, account-lockout state machine, and JWT/refresh token
//! issuance (§4.C).

use crate::clock::Clock;
use crate::store::{Store, StoreError, UserRepo, UserWithDomain};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const PBKDF2_ITERATIONS: u32 = 10_000;
const HASH_LEN: usize = 32;
const SALT_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("account disabled")]
    AccountDisabled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Every external caller sees the same rejection regardless of which
    /// internal variant fired (§4.C step 2: "do not reveal why").
    pub fn is_rejection(&self) -> bool {
        !matches!(self, AuthError::Store(_))
    }
}

pub fn hash_password(password: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Hashes a fresh password for storage, returning (hash_b64, salt_b64).
pub fn hash_new_password(password: &str) -> (String, String) {
    let salt = generate_salt();
    let hash = hash_password(password, &salt);
    (STANDARD.encode(hash), STANDARD.encode(salt))
}

/// Constant-time compare: accumulates XOR differences without early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn verify_password(password: &str, hash_b64: &str, salt_b64: &str) -> bool {
    let (Ok(expected), Ok(salt)) = (STANDARD.decode(hash_b64), STANDARD.decode(salt_b64)) else {
        return false;
    };
    let actual = hash_password(password, &salt);
    constant_time_eq(&actual, &expected)
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub max_failed_attempts: i64,
    pub lockout_duration: Duration,
    pub reset_window: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration: Duration::minutes(15),
            reset_window: Duration::minutes(60),
        }
    }
}

pub struct Authenticator {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    policy: LockoutPolicy,
}

impl Authenticator {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, policy: LockoutPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Implements §4.C `authenticate` exactly: lockout check, password
    /// verify, failure-counter/reset-window bookkeeping, all persisted in
    /// one transaction regardless of outcome.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserWithDomain, AuthError> {
        let now = self.clock.now();
        let policy = self.policy;
        let email = email.to_string();
        let password = password.to_string();
        self.store
            .with_tx(move |tx| {
                let email = email.clone();
                let password = password.clone();
                Box::pin(async move {
                    let Some(with_domain) = UserRepo::find_user_with_domain_by_email(tx, &email).await? else {
                        return Ok(Err(AuthError::InvalidCredentials));
                    };
                    if !with_domain.user.can_login {
                        return Ok(Err(AuthError::AccountDisabled));
                    }
                    let user = with_domain.user.clone();
                    if let Some(lockout_end) = user.lockout_end {
                        if lockout_end > now {
                            return Ok(Err(AuthError::AccountLocked));
                        }
                    }
                    // lockout_end in the past (or never set): proceed with a
                    // clean counter unless this attempt fails again below.
                    let mut failed_attempts = if user.lockout_end.is_some() { 0 } else { user.failed_login_attempts };

                    if verify_password(&password, &user.password_hash, &user.password_salt) {
                        UserRepo::record_login_outcome(tx, user.id, 0, None, user.last_failed_login, Some(now)).await?;
                        return Ok(Ok(with_domain));
                    }

                    if let Some(last_failed) = user.last_failed_login {
                        if now - last_failed > policy.reset_window {
                            failed_attempts = 0;
                        }
                    }
                    failed_attempts += 1;
                    let lockout_end = if failed_attempts >= policy.max_failed_attempts {
                        Some(now + policy.lockout_duration)
                    } else {
                        None
                    };
                    UserRepo::record_login_outcome(tx, user.id, failed_attempts, lockout_end, Some(now), None).await?;
                    Ok(Err(AuthError::InvalidCredentials))
                })
            })
            .await?
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub email: String,
    pub role: String,
    pub domain_id: i64,
    pub can_receive: bool,
    pub can_login: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    pub exp: i64,
}

type HmacSha256 = Hmac<Sha256>;

pub struct JwtCodec {
    secret: Vec<u8>,
}

impl JwtCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Encodes `claims` as a two-segment HMAC-SHA256 token: the wire form
    /// is `base64url(header).base64url(claims).base64url(signature)`, the
    /// same shape as JWT without pulling in the `jsonwebtoken` crate.
    pub fn encode(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = serde_json::to_vec(claims).map_err(|e| AuthError::Store(StoreError::Internal(e.to_string())))?;
        let payload = URL_SAFE_NO_PAD.encode(body);
        let signing_input = format!("{header}.{payload}");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(signing_input.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signing_input}.{sig}"))
    }

    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(sig)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AuthError::InvalidCredentials);
        };
        if parts.next().is_some() {
            return Err(AuthError::InvalidCredentials);
        }
        let signing_input = format!("{header}.{payload}");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(signing_input.as_bytes());
        let expected = mac.finalize().into_bytes();
        let actual = URL_SAFE_NO_PAD.decode(sig).map_err(|_| AuthError::InvalidCredentials)?;
        if !constant_time_eq(&expected, &actual) {
            return Err(AuthError::InvalidCredentials);
        }
        let body = URL_SAFE_NO_PAD.decode(payload).map_err(|_| AuthError::InvalidCredentials)?;
        let claims: Claims = serde_json::from_slice(&body).map_err(|_| AuthError::InvalidCredentials)?;
        if claims.exp < Utc::now().timestamp() {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(claims)
    }
}

pub const TOKEN_LIFETIME_DEFAULT: Duration = Duration::hours(8);
pub const TOKEN_LIFETIME_REMEMBER_ME: Duration = Duration::days(30);
pub const REFRESH_TOKEN_LIFETIME: Duration = Duration::days(30);

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub user_id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Process-wide refresh-token registry (§9: "explicit process-wide state...
/// behind an interface" rather than a DI-managed singleton). Single-use:
/// `rotate` removes the old token as it issues the new one.
#[derive(Default)]
pub struct RefreshTokenStore {
    tokens: RwLock<HashMap<String, RefreshToken>>,
}

impl RefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn generate_token_string() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        STANDARD.encode(bytes)
    }

    pub async fn issue(&self, user_id: i64, email: &str, now: DateTime<Utc>) -> String {
        let token = Self::generate_token_string();
        let record = RefreshToken {
            user_id,
            email: email.to_string(),
            created_at: now,
            expires_at: now + REFRESH_TOKEN_LIFETIME,
        };
        self.tokens.write().await.insert(token.clone(), record);
        token
    }

    /// Consumes `old_token` and issues a fresh one for the same user, or
    /// `None` if the token is unknown or expired.
    pub async fn rotate(&self, old_token: &str, now: DateTime<Utc>) -> Option<(String, RefreshToken)> {
        let mut guard = self.tokens.write().await;
        let existing = guard.remove(old_token)?;
        if existing.expires_at < now {
            return None;
        }
        drop(guard);
        let new_token = self.issue(existing.user_id, &existing.email, now).await;
        Some((new_token, existing))
    }

    /// Revokes every outstanding token for `user_id` (logout, §4.C).
    pub async fn revoke_all_for_user(&self, user_id: i64) {
        self.tokens.write().await.retain(|_, t| t.user_id != user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let (hash, salt) = hash_new_password("hunter2hunter2");
        assert!(verify_password("hunter2hunter2", &hash, &salt));
        assert!(!verify_password("wrong", &hash, &salt));
    }

    #[test]
    fn jwt_roundtrip() {
        let codec = JwtCodec::new(b"test-secret".to_vec());
        let claims = Claims {
            sub: 1,
            email: "a@b.com".into(),
            role: "User".into(),
            domain_id: 1,
            can_receive: true,
            can_login: true,
            full_name: None,
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let token = codec.encode(&claims).unwrap();
        let decoded = codec.decode(&token).unwrap();
        assert_eq!(decoded.sub, 1);
        assert_eq!(decoded.email, "a@b.com");
    }

    #[test]
    fn jwt_rejects_tampered_signature() {
        let codec = JwtCodec::new(b"test-secret".to_vec());
        let claims = Claims {
            sub: 1,
            email: "a@b.com".into(),
            role: "User".into(),
            domain_id: 1,
            can_receive: true,
            can_login: true,
            full_name: None,
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let mut token = codec.encode(&claims).unwrap();
        token.push('x');
        assert!(codec.decode(&token).is_err());
    }

    #[tokio::test]
    async fn refresh_token_rotation_is_single_use() {
        let store = RefreshTokenStore::new();
        let now = Utc::now();
        let token = store.issue(1, "a@b.com", now).await;
        let (new_token, _old) = store.rotate(&token, now).await.unwrap();
        assert!(store.rotate(&token, now).await.is_none());
        assert!(store.rotate(&new_token, now).await.is_some());
    }
}
