//! Auth Service — enrollment token issuance/redemption and device
//! credential lifecycle.
//!
//! Random generation uses `ring::rand::{SystemRandom, SecureRandom}` to
//! mint opaque tokens and keys; there's no persisted-credential store to
//! encrypt at rest, so state lives entirely in memory behind `DashMap`s.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_protocol::{new_id, DeviceCredentialInfo};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

const TOKEN_BYTES: usize = 16; // 128 bits
const KEY_BYTES: usize = 32; // 256 bits

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown credential or token")]
    Unknown,
    #[error("enrollment token already consumed")]
    AlreadyConsumed,
    #[error("token or credential expired")]
    Expired,
    #[error("credential revoked")]
    Revoked,
}

struct EnrollmentToken {
    expires_at: DateTime<Utc>,
    consumed: bool,
}

#[derive(Clone)]
struct DeviceCredential {
    device_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
    revoked: bool,
}

impl From<&DeviceCredential> for DeviceCredentialInfo {
    fn from(c: &DeviceCredential) -> Self {
        DeviceCredentialInfo {
            device_id: c.device_id.clone(),
            issued_at: c.issued_at,
            expires_at: c.expires_at,
            last_used_at: c.last_used_at,
            revoked: c.revoked,
        }
    }
}

/// A freshly issued enrollment token, returned to the HTTP layer for
/// rendering as a QR payload.
pub struct IssuedEnrollment {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A freshly minted device credential, returned once (the mobile client is
/// expected to store the key — it is never retrievable again).
pub struct MintedCredential {
    pub device_id: String,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Broadcast to every connection manager when a credential is revoked, so
/// sockets authenticated with it can be closed promptly.
#[derive(Debug, Clone)]
pub struct RevocationEvent {
    pub key: String,
}

pub struct AuthService {
    rng: SystemRandom,
    enrollments: DashMap<String, EnrollmentToken>,
    credentials: DashMap<String, DeviceCredential>,
    enrollment_ttl: Duration,
    credential_ttl: Duration,
    revocations: broadcast::Sender<RevocationEvent>,
}

impl AuthService {
    pub fn new(enrollment_ttl: Duration, credential_ttl: Duration) -> Self {
        let (revocations, _) = broadcast::channel(64);
        Self {
            rng: SystemRandom::new(),
            enrollments: DashMap::new(),
            credentials: DashMap::new(),
            enrollment_ttl,
            credential_ttl,
            revocations,
        }
    }

    pub fn subscribe_revocations(&self) -> broadcast::Receiver<RevocationEvent> {
        self.revocations.subscribe()
    }

    fn random_token(&self, len: usize) -> String {
        let mut buf = vec![0u8; len];
        self.rng.fill(&mut buf).expect("secure rng failure");
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Issue a new short-lived enrollment token.
    pub fn issue_enrollment(&self) -> IssuedEnrollment {
        let token = self.random_token(TOKEN_BYTES);
        let expires_at = Utc::now() + self.enrollment_ttl;
        self.enrollments.insert(
            token.clone(),
            EnrollmentToken {
                expires_at,
                consumed: false,
            },
        );
        info!(component = "auth", event = "auth.enrollment_issued");
        IssuedEnrollment { token, expires_at }
    }

    /// Redeem an enrollment token, minting a device credential bound to
    /// `device_id`. All redemption funnels through this one atomic path —
    /// no HTTP handler is allowed to verify-then-flip the `consumed` flag
    /// itself (spec §9 OQ2).
    ///
    /// Atomic per-token: the consumed flag is flipped under the DashMap
    /// shard lock for this key, so two concurrent redemptions of the same
    /// token can never both succeed.
    pub fn redeem_enrollment(&self, token: &str, device_id: Option<String>) -> Result<MintedCredential, AuthError> {
        {
            let mut entry = self.enrollments.get_mut(token).ok_or(AuthError::Unknown)?;
            if entry.consumed {
                return Err(AuthError::AlreadyConsumed);
            }
            if Utc::now() > entry.expires_at {
                return Err(AuthError::Expired);
            }
            entry.consumed = true;
        }

        let device_id = device_id.unwrap_or_else(new_id);
        let key = self.random_token(KEY_BYTES);
        let now = Utc::now();
        let expires_at = now + self.credential_ttl;
        self.credentials.insert(
            key.clone(),
            DeviceCredential {
                device_id: device_id.clone(),
                issued_at: now,
                expires_at,
                last_used_at: None,
                revoked: false,
            },
        );
        info!(
            component = "auth",
            event = "auth.credential_minted",
            device_id = %device_id,
        );
        Ok(MintedCredential {
            device_id,
            key,
            expires_at,
        })
    }

    /// Validate a device credential key, updating `last_used_at` on success.
    pub fn validate(&self, key: &str) -> Result<DeviceCredentialInfo, AuthError> {
        let mut entry = self.credentials.get_mut(key).ok_or(AuthError::Unknown)?;
        if entry.revoked {
            return Err(AuthError::Revoked);
        }
        if Utc::now() > entry.expires_at {
            return Err(AuthError::Expired);
        }
        entry.last_used_at = Some(Utc::now());
        Ok(DeviceCredentialInfo::from(&*entry))
    }

    /// Extend a credential's expiry by the configured TTL.
    pub fn refresh(&self, key: &str) -> Result<DeviceCredentialInfo, AuthError> {
        let mut entry = self.credentials.get_mut(key).ok_or(AuthError::Unknown)?;
        if entry.revoked {
            return Err(AuthError::Revoked);
        }
        if Utc::now() > entry.expires_at {
            return Err(AuthError::Expired);
        }
        entry.expires_at = Utc::now() + self.credential_ttl;
        Ok(DeviceCredentialInfo::from(&*entry))
    }

    /// Revoke a credential, broadcasting so live connections can be closed.
    pub fn revoke(&self, key: &str) -> Result<(), AuthError> {
        let mut entry = self.credentials.get_mut(key).ok_or(AuthError::Unknown)?;
        entry.revoked = true;
        drop(entry);
        let _ = self.revocations.send(RevocationEvent {
            key: key.to_string(),
        });
        info!(component = "auth", event = "auth.credential_revoked");
        Ok(())
    }

    pub fn info(&self, key: &str) -> Result<DeviceCredentialInfo, AuthError> {
        let entry = self.credentials.get(key).ok_or(AuthError::Unknown)?;
        Ok(DeviceCredentialInfo::from(&*entry))
    }

    /// Delete every enrollment token / credential past its TTL. Intended to
    /// run on a periodic tick from `main`.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.enrollments.retain(|_, v| v.expires_at > now);
        self.credentials.retain(|_, v| v.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new(Duration::from_secs(30), Duration::from_secs(2_592_000))
    }

    #[test]
    fn redeem_mints_a_usable_credential() {
        let auth = service();
        let issued = auth.issue_enrollment();
        let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        assert!(auth.validate(&minted.key).is_ok());
    }

    #[test]
    fn redeem_twice_fails_the_second_time() {
        let auth = service();
        let issued = auth.issue_enrollment();
        auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        let err = auth.redeem_enrollment(&issued.token, None).unwrap_err();
        assert_eq!(err, AuthError::AlreadyConsumed);
    }

    #[test]
    fn unknown_token_is_unknown() {
        let auth = service();
        let err = auth.redeem_enrollment("nope", None).unwrap_err();
        assert_eq!(err, AuthError::Unknown);
    }

    #[test]
    fn revoked_credential_fails_validation() {
        let auth = service();
        let issued = auth.issue_enrollment();
        let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        auth.revoke(&minted.key).unwrap();
        assert_eq!(auth.validate(&minted.key).unwrap_err(), AuthError::Revoked);
    }

    #[test]
    fn expired_enrollment_token_cannot_be_redeemed() {
        let auth = AuthService::new(Duration::from_secs(0), Duration::from_secs(60));
        let issued = auth.issue_enrollment();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            auth.redeem_enrollment(&issued.token, None).unwrap_err(),
            AuthError::Expired
        );
    }

    #[test]
    fn refresh_rejects_an_expired_credential() {
        let auth = AuthService::new(Duration::from_secs(30), Duration::from_millis(5));
        let issued = auth.issue_enrollment();
        let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(auth.refresh(&minted.key).unwrap_err(), AuthError::Expired);
    }

    #[test]
    fn refresh_extends_expiry() {
        let auth = service();
        let issued = auth.issue_enrollment();
        let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        let before = auth.info(&minted.key).unwrap().expires_at;
        let after = auth.refresh(&minted.key).unwrap().expires_at;
        assert!(after >= before);
    }

    #[test]
    fn sweep_deletes_expired_credentials_even_if_not_revoked() {
        let auth = AuthService::new(Duration::from_secs(30), Duration::from_millis(5));
        let issued = auth.issue_enrollment();
        let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        auth.sweep();
        assert_eq!(auth.info(&minted.key).unwrap_err(), AuthError::Unknown);
    }

    #[test]
    fn tokens_are_not_trivially_guessable() {
        let auth = service();
        let a = auth.issue_enrollment();
        let b = auth.issue_enrollment();
        assert_ne!(a.token, b.token);
        assert!(a.token.len() >= 20);
    }
}
