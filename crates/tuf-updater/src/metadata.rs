//! Typed metadata model for the four top-level roles and delegations.
//!
//! Metadata travels as an envelope `{"signed": <payload>, "signatures": [...]}`.
//! The payload is dispatched on its `_type` field into [`Payload`], while the
//! exact `signed` object received is kept alongside so that signatures are
//! checked over (and re-serialized from) the bytes the producer signed,
//! unknown fields included.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU64;

use chrono::{DateTime, Utc};
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::canonical::to_canonical_bytes;
use crate::crypto::{
    first_hash_mismatch, path_hash, signature_status, Hashes, Key, KeyDb, RoleKeys, Signature,
    SignatureStatus,
};
use crate::error::{Result, TrustError};

/// Name of the root role.
pub const ROOT: &str = "root";
/// Name of the timestamp role.
pub const TIMESTAMP: &str = "timestamp";
/// Name of the snapshot role.
pub const SNAPSHOT: &str = "snapshot";
/// Name of the top-level targets role.
pub const TARGETS: &str = "targets";

/// Metadata format version written by [`Metadata::from_payload`] callers.
pub const SPEC_VERSION: &str = "1.0.0";
/// Major specification version this client understands.
const SUPPORTED_SPEC_MAJOR: &str = "1";

/// Returns the metadata file name a role is listed under (`<role>.json`).
pub fn metadata_file_name(role: &str) -> String {
    format!("{role}.json")
}

/// Declared type of a metadata payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleType {
    Root,
    Timestamp,
    Snapshot,
    Targets,
}

impl RoleType {
    /// The `_type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            RoleType::Root => ROOT,
            RoleType::Timestamp => TIMESTAMP,
            RoleType::Snapshot => SNAPSHOT,
            RoleType::Targets => TARGETS,
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root payload: the key store and the keys/threshold of every top-level role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootPayload {
    pub spec_version: String,
    #[serde(default)]
    pub consistent_snapshot: bool,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: BTreeMap<String, Key>,
    pub roles: RootRoles,
}

/// Key assignments for the four top-level roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRoles {
    pub root: RoleKeys,
    pub timestamp: RoleKeys,
    pub snapshot: RoleKeys,
    pub targets: RoleKeys,
}

impl RootRoles {
    /// Returns the keys authorized for a top-level role.
    pub fn get(&self, role: RoleType) -> &RoleKeys {
        match role {
            RoleType::Root => &self.root,
            RoleType::Timestamp => &self.timestamp,
            RoleType::Snapshot => &self.snapshot,
            RoleType::Targets => &self.targets,
        }
    }
}

impl RootPayload {
    /// Returns the keys authorized for `role` resolved against the key store.
    ///
    /// Used to detect key rotations: two roots authorize the same signers for
    /// a role when both the threshold and the resolved keys are equal.
    pub fn role_signers(&self, role: RoleType) -> (u64, BTreeSet<&Key>) {
        let role_keys = self.roles.get(role);
        let keys = role_keys
            .keyids
            .iter()
            .filter_map(|keyid| self.keys.get(keyid))
            .collect();
        (role_keys.threshold.get(), keys)
    }
}

/// Pinned reference to a metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,
}

impl MetaFile {
    /// Checks raw metadata bytes against the pinned length and hashes.
    ///
    /// Returns a human readable reason on mismatch.
    pub fn check_bytes(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        if let Some(length) = self.length {
            if bytes.len() as u64 != length {
                return Err(format!("length {} differs from pinned {length}", bytes.len()));
            }
        }
        if let Some(hashes) = &self.hashes {
            if let Some(algorithm) = first_hash_mismatch(bytes, hashes) {
                return Err(format!("{algorithm} hash differs from pinned value"));
            }
        }
        Ok(())
    }
}

/// Timestamp payload: pins the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPayload {
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
}

impl TimestampPayload {
    /// The pinned snapshot reference.
    pub fn snapshot_meta(&self) -> Result<&MetaFile> {
        self.meta
            .get(&metadata_file_name(SNAPSHOT))
            .ok_or_else(|| TrustError::malformed(TIMESTAMP, "missing snapshot.json reference"))
    }
}

/// Snapshot payload: pins every targets role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, MetaFile>,
}

impl SnapshotPayload {
    /// The pinned reference for a targets role (top-level or delegated).
    pub fn role_meta(&self, role: &str) -> Option<&MetaFile> {
        self.meta.get(&metadata_file_name(role))
    }
}

/// Length, hashes and custom data of a target as listed by a targets role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescription {
    pub length: u64,
    pub hashes: Hashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

/// Targets payload: target descriptions plus optional delegations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetsPayload {
    pub spec_version: String,
    pub version: u64,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,
}

impl TargetsPayload {
    /// Looks up `path` among the targets listed directly by this role.
    pub fn target_file(&self, path: &str) -> Option<TargetFile> {
        self.targets
            .get(path)
            .map(|description| TargetFile::new(path, description))
    }

    /// Delegated roles in declared (priority) order.
    pub fn delegated_roles(&self) -> &[DelegatedRole] {
        self.delegations
            .as_ref()
            .map(|delegations| delegations.roles.as_slice())
            .unwrap_or_default()
    }

    /// Finds the delegation entry for `name`.
    pub fn delegated_role(&self, name: &str) -> Option<&DelegatedRole> {
        self.delegated_roles().iter().find(|role| role.name == name)
    }
}

/// Keys and ordered roles delegated to by a targets role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegations {
    pub keys: BTreeMap<String, Key>,
    pub roles: Vec<DelegatedRole>,
}

/// A single delegation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedRole {
    pub name: String,
    pub keyids: Vec<String>,
    pub threshold: NonZeroU64,
    #[serde(flatten)]
    pub paths: PathSet,
    #[serde(default)]
    pub terminating: bool,
}

impl DelegatedRole {
    /// Key ids and threshold the delegated metadata must satisfy.
    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
        }
    }

    /// Whether this delegation's authority covers `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.paths.matches(path)
    }
}

/// Paths a delegation is trusted for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSet {
    /// Shell-style glob patterns; `*` also matches `/`.
    #[serde(rename = "paths")]
    Paths(Vec<String>),
    /// Hex prefixes of the SHA-256 of the target path.
    #[serde(rename = "path_hash_prefixes")]
    PathHashPrefixes(Vec<String>),
}

impl PathSet {
    /// Whether any pattern or prefix covers `path`.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathSet::Paths(patterns) => patterns.iter().any(|pattern| glob_matches(pattern, path)),
            PathSet::PathHashPrefixes(prefixes) => {
                let digest = path_hash(path);
                prefixes
                    .iter()
                    .any(|prefix| digest.starts_with(&prefix.to_ascii_lowercase()))
            }
        }
    }
}

fn glob_matches(pattern: &str, path: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(err) => {
            warn!(pattern, error = %err, "tuf: ignoring invalid delegation path pattern");
            false
        }
    }
}

/// A resolved target: the path it was requested under plus its description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFile {
    pub path: String,
    pub length: u64,
    pub hashes: Hashes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<Value>,
}

impl TargetFile {
    /// Builds a target file from a listing entry.
    pub fn new(path: impl Into<String>, description: &TargetDescription) -> Self {
        Self {
            path: path.into(),
            length: description.length,
            hashes: description.hashes.clone(),
            custom: description.custom.clone(),
        }
    }

    /// Verifies downloaded bytes against the exact length and every hash.
    pub fn verify_bytes(&self, bytes: &[u8]) -> Result<()> {
        let actual = bytes.len() as u64;
        if actual != self.length {
            return Err(TrustError::DownloadLengthMismatch {
                path: self.path.clone(),
                expected: self.length,
                actual,
            });
        }
        if self.hashes.is_empty() {
            return Err(TrustError::DownloadHashMismatch {
                path: self.path.clone(),
                algorithm: "none declared".to_string(),
            });
        }
        match first_hash_mismatch(bytes, &self.hashes) {
            Some(algorithm) => Err(TrustError::DownloadHashMismatch {
                path: self.path.clone(),
                algorithm: algorithm.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Payload of any role, dispatched on `_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Payload {
    Root(RootPayload),
    Timestamp(TimestampPayload),
    Snapshot(SnapshotPayload),
    Targets(TargetsPayload),
}

impl Payload {
    /// The declared role type.
    pub fn role_type(&self) -> RoleType {
        match self {
            Payload::Root(_) => RoleType::Root,
            Payload::Timestamp(_) => RoleType::Timestamp,
            Payload::Snapshot(_) => RoleType::Snapshot,
            Payload::Targets(_) => RoleType::Targets,
        }
    }

    fn header(&self) -> (&str, u64) {
        match self {
            Payload::Root(p) => (&p.spec_version, p.version),
            Payload::Timestamp(p) => (&p.spec_version, p.version),
            Payload::Snapshot(p) => (&p.spec_version, p.version),
            Payload::Targets(p) => (&p.spec_version, p.version),
        }
    }

    /// Structural checks serde cannot express.
    fn validate(&self) -> Result<()> {
        let role = self.role_type().as_str();
        let (spec_version, version) = self.header();
        if spec_version.split('.').next() != Some(SUPPORTED_SPEC_MAJOR) {
            return Err(TrustError::malformed(
                role,
                format!("unsupported spec_version '{spec_version}'"),
            ));
        }
        if version == 0 {
            return Err(TrustError::malformed(role, "version must be at least 1"));
        }
        match self {
            Payload::Root(_) => Ok(()),
            Payload::Timestamp(timestamp) => {
                timestamp.snapshot_meta()?;
                validate_meta(role, &timestamp.meta)
            }
            Payload::Snapshot(snapshot) => {
                if snapshot.role_meta(TARGETS).is_none() {
                    return Err(TrustError::malformed(role, "missing targets.json reference"));
                }
                validate_meta(role, &snapshot.meta)
            }
            Payload::Targets(targets) => {
                for (path, description) in &targets.targets {
                    if description.hashes.is_empty() {
                        return Err(TrustError::malformed(
                            role,
                            format!("target '{path}' declares no hashes"),
                        ));
                    }
                }
                let mut names = BTreeSet::new();
                for delegated in targets.delegated_roles() {
                    if !names.insert(delegated.name.as_str()) {
                        return Err(TrustError::malformed(
                            role,
                            format!("delegated role '{}' declared twice", delegated.name),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

fn validate_meta(role: &str, meta: &BTreeMap<String, MetaFile>) -> Result<()> {
    for (file, entry) in meta {
        if entry.version == 0 {
            return Err(TrustError::malformed(role, format!("'{file}' pins version 0")));
        }
        if entry.hashes.as_ref().is_some_and(BTreeMap::is_empty) {
            return Err(TrustError::malformed(role, format!("'{file}' pins an empty hash set")));
        }
    }
    Ok(())
}

/// Typed payloads that can be narrowed out of a [`Payload`].
pub trait RolePayload: Sized {
    /// Role type this payload must declare.
    const ROLE: RoleType;

    fn version(&self) -> u64;

    fn expires(&self) -> DateTime<Utc>;

    /// Narrows a payload, handing it back unchanged on type mismatch.
    fn from_payload(payload: Payload) -> std::result::Result<Self, Payload>;
}

macro_rules! role_payload {
    ($payload:ty, $variant:ident) => {
        impl RolePayload for $payload {
            const ROLE: RoleType = RoleType::$variant;

            fn version(&self) -> u64 {
                self.version
            }

            fn expires(&self) -> DateTime<Utc> {
                self.expires
            }

            fn from_payload(payload: Payload) -> std::result::Result<Self, Payload> {
                match payload {
                    Payload::$variant(inner) => Ok(inner),
                    other => Err(other),
                }
            }
        }
    };
}

role_payload!(RootPayload, Root);
role_payload!(TimestampPayload, Timestamp);
role_payload!(SnapshotPayload, Snapshot);
role_payload!(TargetsPayload, Targets);

/// Metadata envelope carrying a payload of type `T` and its signatures.
#[derive(Debug, Clone, PartialEq)]
pub struct Signed<T> {
    signed: T,
    signatures: Vec<Signature>,
    canonical: Vec<u8>,
    raw: Value,
}

/// Envelope whose payload type has not been narrowed yet.
pub type Metadata = Signed<Payload>;

#[derive(Deserialize)]
struct RawEnvelope {
    signed: Value,
    signatures: Vec<Signature>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    signatures: &'a [Signature],
    signed: &'a Value,
}

impl Metadata {
    /// Decodes an envelope, failing with [`TrustError::MalformedMetadata`] on
    /// any structural problem.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let envelope: RawEnvelope =
            serde_json::from_slice(bytes).map_err(|err| TrustError::malformed("unknown", err))?;
        let declared = envelope
            .signed
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let canonical = to_canonical_bytes(&envelope.signed)
            .map_err(|err| TrustError::malformed(declared.as_str(), err))?;
        let payload = Payload::deserialize(&envelope.signed)
            .map_err(|err| TrustError::malformed(declared.as_str(), err))?;
        payload.validate()?;
        Ok(Signed {
            signed: payload,
            signatures: envelope.signatures,
            canonical,
            raw: envelope.signed,
        })
    }

    /// Wraps a payload in an unsigned envelope.
    pub fn from_payload(payload: Payload) -> Result<Self> {
        payload.validate()?;
        let role = payload.role_type();
        let raw = serde_json::to_value(&payload)
            .map_err(|err| TrustError::malformed(role.as_str(), err))?;
        let canonical =
            to_canonical_bytes(&raw).map_err(|err| TrustError::malformed(role.as_str(), err))?;
        Ok(Signed {
            signed: payload,
            signatures: Vec::new(),
            canonical,
            raw,
        })
    }

    /// The declared role type.
    pub fn role_type(&self) -> RoleType {
        self.signed.role_type()
    }

    /// Narrows the envelope to role `T`.
    pub fn into_role<T: RolePayload>(self) -> Result<Signed<T>> {
        let Signed {
            signed,
            signatures,
            canonical,
            raw,
        } = self;
        match T::from_payload(signed) {
            Ok(typed) => Ok(Signed {
                signed: typed,
                signatures,
                canonical,
                raw,
            }),
            Err(other) => Err(TrustError::malformed(
                T::ROLE.as_str(),
                format!("expected {} metadata, found {}", T::ROLE, other.role_type()),
            )),
        }
    }
}

impl<T> Signed<T> {
    /// The decoded payload.
    pub fn signed(&self) -> &T {
        &self.signed
    }

    /// Signatures attached to the envelope.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Canonical bytes of the `signed` object; the message every signature covers.
    pub fn canonical_signed(&self) -> &[u8] {
        &self.canonical
    }

    /// Returns a copy of this envelope with one more signature.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signatures.push(signature);
        self
    }

    /// Detailed per-signature report for `role`.
    pub fn signature_status(&self, role: &RoleKeys, keys: &KeyDb) -> SignatureStatus {
        signature_status(&self.canonical, &self.signatures, role, keys)
    }

    /// Whether a threshold of distinct authorized keys signed this envelope.
    pub fn verify(&self, role: &RoleKeys, keys: &KeyDb) -> bool {
        self.signature_status(role, keys).is_satisfied()
    }

    /// Serializes the envelope as canonical JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let envelope = EnvelopeRef {
            signatures: &self.signatures,
            signed: &self.raw,
        };
        to_canonical_bytes(&envelope).map_err(|err| TrustError::malformed("envelope", err))
    }
}

impl<T: RolePayload> Signed<T> {
    pub fn version(&self) -> u64 {
        self.signed.version()
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.signed.expires()
    }

    /// Expiry must be strictly after `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.signed.expires() <= now
    }
}
