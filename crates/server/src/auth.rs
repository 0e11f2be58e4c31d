use std::fmt::Write;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use linewatch_transit::{CredentialStore, TransitError};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential store unavailable: {0}")]
    Store(#[from] TransitError),

    #[error("hashing key rejected")]
    InvalidKey,
}

fn keyed(key: &[u8], secret: &[u8]) -> Result<HmacSha256, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuthError::InvalidKey)?;
    mac.update(secret);
    Ok(mac)
}

/// Hex HMAC-SHA256 of `secret` under `key`, the form credential files store
pub fn hash_secret(key: &[u8], secret: &[u8]) -> Result<String, AuthError> {
    let digest = keyed(key, secret)?.finalize().into_bytes();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Checks CONNECT credentials against the credential store
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    hashing_key: Vec<u8>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, hashing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            hashing_key: hashing_key.into(),
        }
    }

    pub fn verify(&self, username: &str, password: &[u8]) -> Result<bool, AuthError> {
        let Some(pair) = self.store.credential(username)? else {
            debug!(username, "unknown key");
            return Ok(false);
        };
        let Some(expected) = decode_hex(&pair.secret_hash) else {
            debug!(username, "stored hash is not hex");
            return Ok(false);
        };
        Ok(keyed(&self.hashing_key, password)?
            .verify_slice(&expected)
            .is_ok())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use linewatch_transit::{CredentialPair, MemoryStore, TopologySnapshot};

    pub(crate) const HASHING_KEY: &[u8] = b"pepper";

    pub(crate) fn authenticator() -> Authenticator {
        let store = MemoryStore::from_snapshot(TopologySnapshot {
            credentials: vec![
                CredentialPair {
                    key: "kiosk".into(),
                    secret_hash: hash_secret(HASHING_KEY, b"s3cret").unwrap().into(),
                },
                CredentialPair {
                    key: "broken".into(),
                    secret_hash: "zz".into(),
                },
            ],
            ..Default::default()
        });
        Authenticator::new(Arc::new(store), HASHING_KEY)
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_secret(b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            hash,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify() {
        let auth = authenticator();
        assert!(auth.verify("kiosk", b"s3cret").unwrap());
        assert!(!auth.verify("kiosk", b"guess").unwrap());
        assert!(!auth.verify("nobody", b"s3cret").unwrap());
        assert!(!auth.verify("broken", b"").unwrap());
    }

    #[test]
    fn test_hash_depends_on_key() {
        assert_ne!(
            hash_secret(b"a", b"secret").unwrap(),
            hash_secret(b"b", b"secret").unwrap()
        );
    }
}
