//! Versioned one-way derivations of API key secrets.
//!
//! Three stored formats exist in the wild:
//!
//! - unversioned hex: `sha256(secret || server_secret)`, the original format
//! - `v1:<hex>`: the same derivation with a version tag
//! - `v2:<saltHex>:<digestHex>`: PBKDF2-HMAC-SHA512 over the secret with a
//!   salt derived deterministically from the secret and the server secret
//!
//! Only `v2` is ever produced for new keys. The weak forms are computed solely
//! to find and verify rows that were written before `v2` existed.

use anyhow::bail;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const CURRENT_VERSION_TAG: &str = "v2";

/// Default PBKDF2 iteration count for `v2` hashes.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Domain separation for salt derivation. Changing this orphans every v2 hash.
const SALT_CONTEXT: &[u8] = b"keygate/api-key-salt/v2";

const SALT_LEN: usize = 32;
const DIGEST_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HashVersion {
    Legacy,
    V1,
    V2,
}

impl HashVersion {
    /// Classify a stored hash by its version tag.
    pub fn of(stored: &str) -> Self {
        if stored.starts_with("v2:") {
            HashVersion::V2
        } else if stored.starts_with("v1:") {
            HashVersion::V1
        } else {
            HashVersion::Legacy
        }
    }

    pub fn is_current(self) -> bool {
        self == HashVersion::V2
    }
}

/// Computes and verifies secret hashes. Cheap to share behind an `Arc`.
pub struct HashEngine {
    server_secret: Zeroizing<Vec<u8>>,
    salt_mac: HmacSha256,
    iterations: u32,
}

impl HashEngine {
    pub fn new(server_secret: &str, iterations: u32) -> anyhow::Result<Self> {
        if server_secret.is_empty() {
            bail!("server secret must not be empty");
        }
        if iterations == 0 {
            bail!("KDF iteration count must be positive");
        }
        let salt_mac = HmacSha256::new_from_slice(server_secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid server secret: {}", e))?;
        Ok(Self {
            server_secret: Zeroizing::new(server_secret.as_bytes().to_vec()),
            salt_mac,
            iterations,
        })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Current-format hash. Deterministic: the same secret always maps to the
    /// same string, which is what makes the hash index usable.
    pub fn hash(&self, secret: &str) -> String {
        let salt = self.derive_salt(secret);
        let digest = self.derive_digest(secret, &salt);
        format!(
            "{}:{}:{}",
            CURRENT_VERSION_TAG,
            hex::encode(salt),
            hex::encode(digest.as_slice())
        )
    }

    /// Unversioned single-pass hash used by rows written before `v2`.
    pub fn legacy_hash(&self, secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(self.server_secret.as_slice());
        hex::encode(hasher.finalize())
    }

    /// Every stored form a legacy row for `secret` could have.
    pub fn legacy_candidates(&self, secret: &str) -> [String; 2] {
        let plain = self.legacy_hash(secret);
        let tagged = format!("v1:{}", plain);
        [plain, tagged]
    }

    /// Check `secret` against a stored hash of any known version.
    pub fn verify(&self, secret: &str, stored: &str) -> bool {
        match HashVersion::of(stored) {
            HashVersion::V2 => self.verify_v2(secret, stored),
            HashVersion::V1 => {
                let expected = self.legacy_hash(secret);
                constant_time_eq(expected.as_bytes(), stored[3..].as_bytes())
            }
            HashVersion::Legacy => {
                let expected = self.legacy_hash(secret);
                constant_time_eq(expected.as_bytes(), stored.as_bytes())
            }
        }
    }

    /// Same answer as `verify`, but reuses `current` (this engine's `hash` of
    /// `secret`) when `stored` carries the same derived salt. That only
    /// happens for the row that matches; every other `v2` row still costs a
    /// full KDF run.
    pub fn verify_precomputed(&self, secret: &str, current: &str, stored: &str) -> bool {
        if HashVersion::of(stored).is_current() && salt_segment(stored) == salt_segment(current) {
            return constant_time_eq(current.as_bytes(), stored.as_bytes());
        }
        self.verify(secret, stored)
    }

    fn verify_v2(&self, secret: &str, stored: &str) -> bool {
        let mut parts = stored.splitn(3, ':');
        let (Some(_), Some(salt_hex), Some(digest_hex)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Ok(salt) = hex::decode(salt_hex) else {
            return false;
        };
        if salt.is_empty() {
            return false;
        }
        let digest = self.derive_digest(secret, &salt);
        let computed = Zeroizing::new(hex::encode(digest.as_slice()));
        constant_time_eq(computed.as_bytes(), digest_hex.as_bytes())
    }

    fn derive_salt(&self, secret: &str) -> [u8; SALT_LEN] {
        let mut mac = self.salt_mac.clone();
        mac.update(SALT_CONTEXT);
        mac.update(secret.as_bytes());
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&mac.finalize().into_bytes());
        salt
    }

    fn derive_digest(&self, secret: &str, salt: &[u8]) -> Zeroizing<[u8; DIGEST_LEN]> {
        let mut out = Zeroizing::new([0u8; DIGEST_LEN]);
        pbkdf2_hmac::<Sha512>(secret.as_bytes(), salt, self.iterations, &mut out[..]);
        out
    }
}

fn salt_segment(hash: &str) -> Option<&str> {
    hash.split(':').nth(1)
}

/// Length check first, then a constant-time comparison over equal lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
