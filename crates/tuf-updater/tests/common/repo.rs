// Deterministic signed repositories shared across tests.
//
// Keys are derived from one-byte seeds so key ids are stable between runs.
// `TestRepo::publish` signs a complete metadata chain and `MemoryFetcher`
// serves the published files without a network.
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use ed25519_dalek::{Signer, SigningKey};
use tuf_updater::crypto::{digest, Hashes, Key, RoleKeys, Signature};
use tuf_updater::fetch::{FetchError, Fetcher};
use tuf_updater::metadata::{
    DelegatedRole, Delegations, MetaFile, Metadata, PathSet, Payload, RootPayload, RootRoles,
    SnapshotPayload, TargetDescription, TargetsPayload, TimestampPayload, SPEC_VERSION,
};

/// Ed25519 key pair with its conventional key id.
#[derive(Clone)]
pub struct TestKey {
    signing: SigningKey,
    pub keyid: String,
    pub key: Key,
}

impl TestKey {
    pub fn from_seed(seed: u8) -> Self {
        let signing = SigningKey::from_bytes(&[seed; 32]);
        let key = Key::ed25519(&signing.verifying_key().to_bytes());
        let keyid = key.key_id().expect("key id");
        Self {
            signing,
            keyid,
            key,
        }
    }
}

pub fn test_keys(seeds: &[u8]) -> Vec<TestKey> {
    seeds.iter().copied().map(TestKey::from_seed).collect()
}

/// Wraps `payload` in an envelope signed by every key in `signers`.
pub fn sign_payload(payload: Payload, signers: &[&TestKey]) -> Vec<u8> {
    let mut metadata = Metadata::from_payload(payload).expect("valid payload");
    for signer in signers {
        let sig = signer.signing.sign(metadata.canonical_signed());
        metadata = metadata.with_signature(Signature {
            keyid: signer.keyid.clone(),
            sig: hex::encode(sig.to_bytes()),
        });
    }
    metadata.to_bytes().expect("serialize")
}

pub fn days_from_now(days: i64) -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0) + Duration::days(days)
}

pub fn hashes_of(bytes: &[u8]) -> Hashes {
    ["sha256", "sha512"]
        .into_iter()
        .map(|algorithm| {
            (
                algorithm.to_string(),
                digest(algorithm, bytes).expect("digest"),
            )
        })
        .collect()
}

/// Reference pinning exact bytes at `version`.
pub fn meta_for(bytes: &[u8], version: u64) -> MetaFile {
    MetaFile {
        version,
        length: Some(bytes.len() as u64),
        hashes: Some(hashes_of(bytes)),
    }
}

/// A delegated targets role and, recursively, the roles it delegates to.
#[derive(Clone)]
pub struct DelegationFixture {
    pub name: String,
    pub key: TestKey,
    pub paths: PathSet,
    pub terminating: bool,
    pub version: u64,
    pub targets: BTreeMap<String, Vec<u8>>,
    pub children: Vec<DelegationFixture>,
}

impl DelegationFixture {
    pub fn new(name: &str, seed: u8, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key: TestKey::from_seed(seed),
            paths: PathSet::Paths(patterns.iter().map(|p| p.to_string()).collect()),
            terminating: false,
            version: 1,
            targets: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn with_target(mut self, path: &str, bytes: &[u8]) -> Self {
        self.add_target(path, bytes);
        self
    }

    pub fn with_child(mut self, child: DelegationFixture) -> Self {
        self.children.push(child);
        self
    }

    pub fn add_target(&mut self, path: &str, bytes: &[u8]) {
        self.targets.insert(path.to_string(), bytes.to_vec());
    }
}

fn delegations_for(children: &[DelegationFixture]) -> Option<Delegations> {
    if children.is_empty() {
        return None;
    }
    Some(Delegations {
        keys: children
            .iter()
            .map(|child| (child.key.keyid.clone(), child.key.key.clone()))
            .collect(),
        roles: children
            .iter()
            .map(|child| DelegatedRole {
                name: child.name.clone(),
                keyids: vec![child.key.keyid.clone()],
                threshold: NonZeroU64::MIN,
                paths: child.paths.clone(),
                terminating: child.terminating,
            })
            .collect(),
    })
}

fn targets_payload(
    version: u64,
    expires: DateTime<Utc>,
    targets: &BTreeMap<String, Vec<u8>>,
    children: &[DelegationFixture],
) -> TargetsPayload {
    TargetsPayload {
        spec_version: SPEC_VERSION.to_string(),
        version,
        expires,
        targets: targets
            .iter()
            .map(|(path, bytes)| {
                (
                    path.clone(),
                    TargetDescription {
                        length: bytes.len() as u64,
                        hashes: hashes_of(bytes),
                        custom: None,
                    },
                )
            })
            .collect(),
        delegations: delegations_for(children),
    }
}

/// Everything a repository serves at one point in time.
#[derive(Clone)]
pub struct Published {
    pub consistent_snapshot: bool,
    pub roots: Vec<Vec<u8>>,
    pub timestamp: Vec<u8>,
    pub snapshot: Vec<u8>,
    pub snapshot_version: u64,
    pub targets: Vec<u8>,
    pub targets_version: u64,
    pub delegated: BTreeMap<String, Vec<u8>>,
    pub delegated_versions: BTreeMap<String, u64>,
    pub target_files: BTreeMap<String, Vec<u8>>,
}

impl Published {
    /// Served files keyed by path relative to a mirror prefix.
    pub fn files(&self) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        for (index, root) in self.roots.iter().enumerate() {
            files.insert(format!("metadata/{}.root.json", index + 1), root.clone());
        }
        files.insert("metadata/timestamp.json".to_string(), self.timestamp.clone());
        files.insert(
            self.metadata_path("snapshot", self.snapshot_version),
            self.snapshot.clone(),
        );
        files.insert(
            self.metadata_path("targets", self.targets_version),
            self.targets.clone(),
        );
        for (role, bytes) in &self.delegated {
            let version = self.delegated_versions.get(role).copied().unwrap_or(1);
            files.insert(self.metadata_path(role, version), bytes.clone());
        }
        for (path, bytes) in &self.target_files {
            files.insert(self.target_path(path, bytes), bytes.clone());
        }
        files
    }

    pub fn metadata_path(&self, role: &str, version: u64) -> String {
        let encoded = urlencoding::encode(role);
        if self.consistent_snapshot {
            format!("metadata/{version}.{encoded}.json")
        } else {
            format!("metadata/{encoded}.json")
        }
    }

    pub fn target_path(&self, path: &str, bytes: &[u8]) -> String {
        if !self.consistent_snapshot {
            return format!("targets/{path}");
        }
        let hash = digest("sha256", bytes).expect("digest");
        match path.rsplit_once('/') {
            Some((dir, name)) => format!("targets/{dir}/{hash}.{name}"),
            None => format!("targets/{hash}.{path}"),
        }
    }
}

/// Producer side of a repository with one key per top-level role.
#[derive(Clone)]
pub struct TestRepo {
    pub root_keys: Vec<TestKey>,
    pub root_threshold: u64,
    pub timestamp_key: TestKey,
    pub snapshot_key: TestKey,
    pub targets_key: TestKey,
    pub consistent_snapshot: bool,
    pub expires: DateTime<Utc>,
    pub timestamp_version: u64,
    pub snapshot_version: u64,
    pub targets_version: u64,
    pub targets: BTreeMap<String, Vec<u8>>,
    pub delegations: Vec<DelegationFixture>,
    roots: Vec<Vec<u8>>,
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRepo {
    pub fn new() -> Self {
        Self::with_root_keys(&[1], 1)
    }

    /// Repository whose root role uses `seeds` with a `threshold`.
    pub fn with_root_keys(seeds: &[u8], threshold: u64) -> Self {
        let mut repo = Self {
            root_keys: test_keys(seeds),
            root_threshold: threshold,
            timestamp_key: TestKey::from_seed(11),
            snapshot_key: TestKey::from_seed(12),
            targets_key: TestKey::from_seed(13),
            consistent_snapshot: false,
            expires: days_from_now(30),
            timestamp_version: 1,
            snapshot_version: 1,
            targets_version: 1,
            targets: BTreeMap::new(),
            delegations: Vec::new(),
            roots: Vec::new(),
        };
        repo.resign_root();
        repo
    }

    pub fn root_payload(&self, version: u64, keys: &[TestKey], threshold: u64) -> RootPayload {
        let mut all = BTreeMap::new();
        for key in keys
            .iter()
            .chain([&self.timestamp_key, &self.snapshot_key, &self.targets_key])
        {
            all.insert(key.keyid.clone(), key.key.clone());
        }
        let single = |key: &TestKey| RoleKeys {
            keyids: vec![key.keyid.clone()],
            threshold: NonZeroU64::MIN,
        };
        RootPayload {
            spec_version: SPEC_VERSION.to_string(),
            consistent_snapshot: self.consistent_snapshot,
            version,
            expires: self.expires,
            keys: all,
            roles: RootRoles {
                root: RoleKeys {
                    keyids: keys.iter().map(|key| key.keyid.clone()).collect(),
                    threshold: NonZeroU64::new(threshold).expect("non-zero threshold"),
                },
                timestamp: single(&self.timestamp_key),
                snapshot: single(&self.snapshot_key),
                targets: single(&self.targets_key),
            },
        }
    }

    pub fn root_version(&self) -> u64 {
        self.roots.len() as u64
    }

    /// Signed root at `version` (1-based).
    pub fn root(&self, version: u64) -> Vec<u8> {
        self.roots[version as usize - 1].clone()
    }

    pub fn latest_root(&self) -> Vec<u8> {
        self.root(self.root_version())
    }

    /// Re-signs the newest root version with the current settings, or signs
    /// version 1 for a fresh repository.
    pub fn resign_root(&mut self) {
        let version = self.root_version().max(1);
        self.roots.truncate(version as usize - 1);
        let payload = self.root_payload(version, &self.root_keys, self.root_threshold);
        let signers: Vec<&TestKey> = self
            .root_keys
            .iter()
            .take(self.root_threshold as usize)
            .collect();
        let signed = sign_payload(Payload::Root(payload), &signers);
        self.roots.push(signed);
    }

    /// Publishes the next root version, signed by a threshold of the current
    /// root keys and a threshold of the new ones.
    pub fn rotate_root(&mut self, seeds: &[u8], threshold: u64) {
        let next_keys = test_keys(seeds);
        let version = self.root_version() + 1;
        let payload = self.root_payload(version, &next_keys, threshold);
        let signers: Vec<&TestKey> = self
            .root_keys
            .iter()
            .take(self.root_threshold as usize)
            .chain(next_keys.iter().take(threshold as usize))
            .collect();
        let signed = sign_payload(Payload::Root(payload), &signers);
        self.roots.push(signed);
        self.root_keys = next_keys;
        self.root_threshold = threshold;
    }

    /// Replaces the timestamp key and publishes a root authorizing it.
    pub fn rotate_timestamp_key(&mut self, seed: u8) {
        self.timestamp_key = TestKey::from_seed(seed);
        let current_keys = self.root_keys.clone();
        let version = self.root_version() + 1;
        let payload = self.root_payload(version, &current_keys, self.root_threshold);
        let signers: Vec<&TestKey> = current_keys
            .iter()
            .take(self.root_threshold as usize)
            .collect();
        let signed = sign_payload(Payload::Root(payload), &signers);
        self.roots.push(signed);
    }

    pub fn add_target(&mut self, path: &str, bytes: &[u8]) {
        self.targets.insert(path.to_string(), bytes.to_vec());
    }

    pub fn add_delegation(&mut self, delegation: DelegationFixture) {
        self.delegations.push(delegation);
    }

    /// Bumps timestamp, snapshot and targets versions for a new release.
    pub fn bump_versions(&mut self) {
        self.timestamp_version += 1;
        self.snapshot_version += 1;
        self.targets_version += 1;
    }

    /// Signs the current state of the repository.
    pub fn publish(&self) -> Published {
        let mut delegated = BTreeMap::new();
        let mut delegated_versions = BTreeMap::new();
        let mut target_files = self.targets.clone();
        let mut meta = BTreeMap::new();
        collect_delegated(
            &self.delegations,
            self.expires,
            &mut delegated,
            &mut delegated_versions,
            &mut target_files,
            &mut meta,
        );

        let targets = sign_payload(
            Payload::Targets(targets_payload(
                self.targets_version,
                self.expires,
                &self.targets,
                &self.delegations,
            )),
            &[&self.targets_key],
        );
        meta.insert(
            "targets.json".to_string(),
            meta_for(&targets, self.targets_version),
        );

        let snapshot = sign_payload(
            Payload::Snapshot(SnapshotPayload {
                spec_version: SPEC_VERSION.to_string(),
                version: self.snapshot_version,
                expires: self.expires,
                meta,
            }),
            &[&self.snapshot_key],
        );
        let timestamp = sign_payload(
            Payload::Timestamp(TimestampPayload {
                spec_version: SPEC_VERSION.to_string(),
                version: self.timestamp_version,
                expires: self.expires,
                meta: BTreeMap::from([(
                    "snapshot.json".to_string(),
                    meta_for(&snapshot, self.snapshot_version),
                )]),
            }),
            &[&self.timestamp_key],
        );

        Published {
            consistent_snapshot: self.consistent_snapshot,
            roots: self.roots.clone(),
            timestamp,
            snapshot,
            snapshot_version: self.snapshot_version,
            targets,
            targets_version: self.targets_version,
            delegated,
            delegated_versions,
            target_files,
        }
    }
}

fn collect_delegated(
    children: &[DelegationFixture],
    expires: DateTime<Utc>,
    delegated: &mut BTreeMap<String, Vec<u8>>,
    versions: &mut BTreeMap<String, u64>,
    target_files: &mut BTreeMap<String, Vec<u8>>,
    meta: &mut BTreeMap<String, MetaFile>,
) {
    for child in children {
        let bytes = sign_payload(
            Payload::Targets(targets_payload(
                child.version,
                expires,
                &child.targets,
                &child.children,
            )),
            &[&child.key],
        );
        meta.insert(format!("{}.json", child.name), meta_for(&bytes, child.version));
        delegated.insert(child.name.clone(), bytes);
        versions.insert(child.name.clone(), child.version);
        for (path, content) in &child.targets {
            target_files
                .entry(path.clone())
                .or_insert_with(|| content.clone());
        }
        collect_delegated(&child.children, expires, delegated, versions, target_files, meta);
    }
}

/// In-memory [`Fetcher`] recording every request.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    files: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves every file of `published` under `base`.
    pub fn serve(&self, base: &str, published: &Published) {
        for (name, bytes) in published.files() {
            self.insert(&format!("{base}/{name}"), bytes);
        }
    }

    pub fn insert(&self, url: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(url.to_string(), bytes);
    }

    pub fn remove(&self, url: &str) {
        self.files.lock().expect("files lock").remove(url);
    }

    pub fn clear(&self) {
        self.files.lock().expect("files lock").clear();
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().expect("requests lock").clear();
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, resource: &str, max_length: u64) -> Result<Vec<u8>, FetchError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(resource.to_string());
        let bytes = self
            .files
            .lock()
            .expect("files lock")
            .get(resource)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(resource.to_string()))?;
        let received = bytes.len() as u64;
        if received > max_length {
            return Err(FetchError::LengthExceeded {
                max_length,
                received,
            });
        }
        Ok(bytes)
    }
}
