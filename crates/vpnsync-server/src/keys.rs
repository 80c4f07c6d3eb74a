//! Key material and bearer tokens.
//!
//! WireGuard key pairs are X25519 and travel base64-encoded. Bearer tokens
//! (client, gateway, provisioning) are 32 random bytes rendered as hex with a
//! kind prefix; only an HMAC-SHA256 of the token under the server salt is ever
//! stored, so the stored hash doubles as the lookup key.

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 32;
const TOKEN_BYTES: usize = 32;

/// A freshly generated WireGuard key pair. The private half is wiped on drop.
pub struct KeyPair {
    pub public_key: String,
    pub private_key: Zeroizing<String>,
}

/// Generate a Curve25519 key pair from the OS CSPRNG.
pub fn generate_keypair() -> Result<KeyPair> {
    let mut seed = [0u8; 32];
    fill_random(&mut seed)?;
    let secret = StaticSecret::from(seed);
    seed.zeroize();

    let public = PublicKey::from(&secret);
    Ok(KeyPair {
        public_key: STANDARD.encode(public.as_bytes()),
        private_key: Zeroizing::new(STANDARD.encode(secret.to_bytes())),
    })
}

/// Check that `b64` is a base64 WireGuard public key (32 bytes).
pub fn validate_public_key(b64: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(b64.trim())
        .map_err(|_| Error::Validation("public key is not valid base64".into()))?;
    if bytes.len() != 32 {
        return Err(Error::Validation(format!(
            "public key must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::Internal(format!("entropy source failure: {e}")))
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    Client,
    Gateway,
    Provisioning,
}

impl TokenKind {
    fn prefix(self) -> &'static str {
        match self {
            TokenKind::Client => "vct_",
            TokenKind::Gateway => "vgt_",
            TokenKind::Provisioning => "vps_",
        }
    }
}

/// A token as handed out once: the plaintext for the caller and the hash for
/// the store.
pub struct IssuedToken {
    pub token: Zeroizing<String>,
    pub hash: String,
}

/// Issues bearer tokens and hashes presented ones under the server salt.
#[derive(Clone)]
pub struct TokenService {
    salt: Arc<Zeroizing<[u8; SALT_LEN]>>,
}

impl TokenService {
    pub fn new(salt: [u8; SALT_LEN]) -> Self {
        Self {
            salt: Arc::new(Zeroizing::new(salt)),
        }
    }

    /// Fresh random salt, for tests and first start.
    pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
        let mut salt = [0u8; SALT_LEN];
        fill_random(&mut salt)?;
        Ok(salt)
    }

    pub fn issue_client_token(&self, peer_id: &str) -> Result<IssuedToken> {
        let issued = self.issue(TokenKind::Client)?;
        debug!(peer_id, "issued client token");
        Ok(issued)
    }

    pub fn issue_gateway_token(&self) -> Result<IssuedToken> {
        self.issue(TokenKind::Gateway)
    }

    pub fn issue_provisioning_secret(&self) -> Result<IssuedToken> {
        self.issue(TokenKind::Provisioning)
    }

    fn issue(&self, kind: TokenKind) -> Result<IssuedToken> {
        let mut raw = Zeroizing::new([0u8; TOKEN_BYTES]);
        fill_random(&mut raw[..])?;
        let token = Zeroizing::new(format!("{}{}", kind.prefix(), hex::encode(&raw[..])));
        let hash = self.hash(&token)?;
        Ok(IssuedToken { token, hash })
    }

    /// Keyed hash of a presented token. Unknown tokens simply hash to a value
    /// nothing is indexed under.
    pub fn hash(&self, token: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.salt[..])
            .map_err(|e| Error::Internal(format!("hmac key: {e}")))?;
        mac.update(token.trim().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Load the token salt from `path`, creating it on first start.
pub fn load_or_create_salt(path: &Path) -> anyhow::Result<[u8; SALT_LEN]> {
    use anyhow::Context;

    if path.exists() {
        let bytes = std::fs::read(path).context("read token salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "{} is corrupt (expected {SALT_LEN} bytes, got {})",
                path.display(),
                bytes.len()
            )
        })
    } else {
        let salt = TokenService::generate_salt()?;
        write_owner_only(path, &salt).context("write token salt")?;
        info!(path = %path.display(), "generated new token salt");
        Ok(salt)
    }
}

/// Create `path` readable and writable by the owner only.
fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_public_matches_private() {
        let kp = generate_keypair().unwrap();
        let private: [u8; 32] = STANDARD
            .decode(kp.private_key.as_str())
            .unwrap()
            .try_into()
            .unwrap();
        let derived = PublicKey::from(&StaticSecret::from(private));
        assert_eq!(STANDARD.encode(derived.as_bytes()), kp.public_key);
        validate_public_key(&kp.public_key).unwrap();
    }

    #[test]
    fn keypairs_are_unique() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn rejects_short_or_garbage_public_keys() {
        assert!(validate_public_key("not base64!!").is_err());
        assert!(validate_public_key(&STANDARD.encode([7u8; 16])).is_err());
    }

    #[test]
    fn token_hash_is_stable_and_salted() {
        let a = TokenService::new([1u8; SALT_LEN]);
        let b = TokenService::new([2u8; SALT_LEN]);
        let issued = a.issue_client_token("peer").unwrap();
        assert_eq!(a.hash(&issued.token).unwrap(), issued.hash);
        assert_ne!(b.hash(&issued.token).unwrap(), issued.hash);
        assert!(!issued.hash.contains(issued.token.as_str()));
    }

    #[test]
    fn token_prefixes_identify_kind() {
        let svc = TokenService::new([3u8; SALT_LEN]);
        assert!(svc.issue_client_token("p").unwrap().token.starts_with("vct_"));
        assert!(svc.issue_gateway_token().unwrap().token.starts_with("vgt_"));
        let secret = svc.issue_provisioning_secret().unwrap();
        assert!(secret.token.starts_with("vps_"));
        assert_eq!(secret.token.len(), 4 + TOKEN_BYTES * 2);
    }

    #[test]
    fn salt_file_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnsync.salt");
        let first = load_or_create_salt(&path).unwrap();
        let second = load_or_create_salt(&path).unwrap();
        assert_eq!(first, second);
    }

    #[cfg(unix)]
    #[test]
    fn salt_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnsync.salt");
        load_or_create_salt(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
