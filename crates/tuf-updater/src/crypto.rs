//! Keys, signature checks and digests.
//!
//! Only `ed25519` keys are verified. Keys of any other type stay in the
//! metadata (so signatures over it remain valid) but are left out of the
//! [`KeyDb`], and their signatures are reported as unknown schemes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use ed25519_dalek::{Signature as Ed25519Signature, VerifyingKey};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::warn;

use crate::canonical::to_canonical_bytes;

/// Key type / signing scheme supported by the verifier.
pub const ED25519: &str = "ed25519";

/// Hash algorithm → lowercase hex digest.
pub type Hashes = BTreeMap<String, String>;

/// Public key as it appears in root and delegation metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    /// Key family, e.g. `ed25519`.
    pub keytype: String,
    /// Signing scheme used with this key.
    pub scheme: String,
    /// Public key material.
    pub keyval: KeyVal,
}

/// Public half of a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyVal {
    /// Hex encoded public key.
    pub public: String,
}

impl Key {
    /// Builds an ed25519 key from raw public key bytes.
    pub fn ed25519(public: &[u8; 32]) -> Self {
        Self {
            keytype: ED25519.to_string(),
            scheme: ED25519.to_string(),
            keyval: KeyVal {
                public: hex_encode(public),
            },
        }
    }

    /// Computes the conventional key id: hex SHA-256 of the canonical key JSON.
    pub fn key_id(&self) -> Result<String, serde_json::Error> {
        let canonical = to_canonical_bytes(self)?;
        Ok(hex_encode(Sha256::digest(&canonical)))
    }

    /// Decodes the verifying key when the key type and scheme are supported.
    fn verifying_key(&self) -> Option<VerifyingKey> {
        if self.keytype != ED25519 || self.scheme != ED25519 {
            return None;
        }
        let raw = hex::decode(&self.keyval.public).ok()?;
        let bytes: [u8; 32] = raw.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }
}

/// Key id plus hex encoded signature bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Id of the key that produced the signature.
    pub keyid: String,
    /// Hex encoded signature over the canonical `signed` bytes.
    pub sig: String,
}

/// Threshold and key ids authorized for a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    /// Authorized key ids, in declared order.
    pub keyids: Vec<String>,
    /// Number of distinct authorized keys that must sign.
    pub threshold: std::num::NonZeroU64,
}

/// Keys declared by a root or delegations block, indexed by key id.
///
/// Every declared id is remembered so signatures can be told apart as
/// "unknown key" or "unsupported scheme"; only supported keys can verify.
#[derive(Debug, Clone, Default)]
pub struct KeyDb {
    declared: BTreeSet<String>,
    keys: BTreeMap<String, VerifyingKey>,
}

impl KeyDb {
    /// Indexes the supported keys of a key map, skipping the rest.
    pub fn from_keys(keys: &BTreeMap<String, Key>) -> Self {
        let mut indexed = BTreeMap::new();
        for (keyid, key) in keys {
            match key.verifying_key() {
                Some(verifying) => {
                    indexed.insert(keyid.clone(), verifying);
                }
                None => warn!(
                    keyid = %keyid,
                    keytype = %key.keytype,
                    scheme = %key.scheme,
                    "tuf: skipping unsupported or invalid key"
                ),
            }
        }
        Self {
            declared: keys.keys().cloned().collect(),
            keys: indexed,
        }
    }

    /// Whether `keyid` was declared, supported or not.
    pub fn is_declared(&self, keyid: &str) -> bool {
        self.declared.contains(keyid)
    }

    /// Returns the verifying key registered under `keyid`.
    pub fn get(&self, keyid: &str) -> Option<&VerifyingKey> {
        self.keys.get(keyid)
    }

    /// Number of usable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` when no usable key was indexed.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Per-signature breakdown of a threshold check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureStatus {
    /// Threshold the role requires.
    pub threshold: u64,
    /// Key ids whose signature verified (repeats are listed each time).
    pub good_sigs: Vec<String>,
    /// Key ids whose signature did not verify.
    pub bad_sigs: Vec<String>,
    /// Key ids absent from the key map.
    pub unknown_sigs: Vec<String>,
    /// Key ids present in the key map but not authorized for the role.
    pub untrusted_sigs: Vec<String>,
    /// Key ids whose key type or scheme is unsupported.
    pub unknown_signing_schemes: Vec<String>,
    valid_keys: usize,
}

impl SignatureStatus {
    /// Number of distinct authorized keys with a valid signature.
    pub fn valid_keys(&self) -> usize {
        self.valid_keys
    }

    /// Whether enough distinct keys signed.
    pub fn is_satisfied(&self) -> bool {
        self.threshold > 0 && self.valid_keys as u64 >= self.threshold
    }
}

/// Checks `signatures` over `message` for `role`.
///
/// A key counts once towards the threshold, whether it signs twice under the
/// same key id or appears under several key ids.
pub fn signature_status(
    message: &[u8],
    signatures: &[Signature],
    role: &RoleKeys,
    keydb: &KeyDb,
) -> SignatureStatus {
    let authorized: BTreeSet<&str> = role.keyids.iter().map(String::as_str).collect();
    let mut status = SignatureStatus {
        threshold: role.threshold.get(),
        ..SignatureStatus::default()
    };
    let mut counted: HashSet<[u8; 32]> = HashSet::new();

    for signature in signatures {
        let keyid = signature.keyid.clone();
        if !keydb.is_declared(&signature.keyid) {
            status.unknown_sigs.push(keyid);
            continue;
        }
        if !authorized.contains(signature.keyid.as_str()) {
            status.untrusted_sigs.push(keyid);
            continue;
        }
        let Some(verifying) = keydb.get(&signature.keyid) else {
            status.unknown_signing_schemes.push(keyid);
            continue;
        };
        if verify_ed25519(verifying, message, &signature.sig) {
            counted.insert(verifying.to_bytes());
            status.good_sigs.push(keyid);
        } else {
            status.bad_sigs.push(keyid);
        }
    }

    status.valid_keys = counted.len();
    status
}

fn verify_ed25519(key: &VerifyingKey, message: &[u8], sig_hex: &str) -> bool {
    let Ok(raw) = hex::decode(sig_hex) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(raw.as_slice()) else {
        return false;
    };
    key.verify_strict(message, &Ed25519Signature::from_bytes(&bytes))
        .is_ok()
}

/// Computes the hex digest of `bytes` for a supported algorithm.
pub fn digest(algorithm: &str, bytes: &[u8]) -> Option<String> {
    match algorithm {
        "sha256" => Some(hex_encode(Sha256::digest(bytes))),
        "sha512" => Some(hex_encode(Sha512::digest(bytes))),
        _ => None,
    }
}

/// Returns the first algorithm whose digest does not match, if any.
///
/// Unsupported algorithms count as mismatches.
pub fn first_hash_mismatch<'a>(bytes: &[u8], expected: &'a Hashes) -> Option<&'a str> {
    expected.iter().find_map(|(algorithm, value)| {
        match digest(algorithm, bytes) {
            Some(actual) if actual.eq_ignore_ascii_case(value) => None,
            _ => Some(algorithm.as_str()),
        }
    })
}

/// Hex SHA-256 of a target path, used by `path_hash_prefixes` delegations.
pub fn path_hash(path: &str) -> String {
    hex_encode(Sha256::digest(path.as_bytes()))
}
