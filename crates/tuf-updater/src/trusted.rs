//! Trusted metadata state machine.
//!
//! [`TrustedMetadataStore`] holds the currently trusted object for each role
//! and is the only place metadata becomes trusted. Every candidate goes
//! through the same ordered checks:
//!
//! 1. declared type matches the expected role,
//! 2. version respects monotonicity, then the pinned reference matches exactly,
//! 3. expiry is in the future,
//! 4. a threshold of authorized keys signed it.
//!
//! A candidate replaces the stored object only after all four pass; a rejected
//! candidate leaves the store untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::crypto::{KeyDb, RoleKeys};
use crate::error::{Result, TrustError};
use crate::metadata::{
    Metadata, MetaFile, RoleType, RolePayload, RootPayload, Signed, SnapshotPayload,
    TargetsPayload, TimestampPayload, ROOT, SNAPSHOT, TARGETS, TIMESTAMP,
};

/// Progress of the store through the role chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustState {
    NoneLoaded,
    RootLoaded,
    TimestampLoaded,
    SnapshotLoaded,
    TargetsLoaded,
    DelegatedTargetsLoaded,
}

impl fmt::Display for TrustState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TrustState::NoneLoaded => "empty",
            TrustState::RootLoaded => "root-loaded",
            TrustState::TimestampLoaded => "timestamp-loaded",
            TrustState::SnapshotLoaded => "snapshot-loaded",
            TrustState::TargetsLoaded => "targets-loaded",
            TrustState::DelegatedTargetsLoaded => "delegated-targets-loaded",
        };
        f.write_str(label)
    }
}

/// Where candidate bytes came from.
///
/// Cached candidates were verified when they were saved; they are loaded as
/// rollback floors and skip the expiry check. Freshness is decided later by
/// the `is_*_current` helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Remote,
    Cache,
}

/// Metadata accepted into the store together with the bytes it arrived as.
#[derive(Debug)]
pub struct Verified<T> {
    metadata: Signed<T>,
    bytes: Vec<u8>,
}

impl<T> Verified<T> {
    pub(crate) fn new(metadata: Signed<T>, bytes: Vec<u8>) -> Trusted<T> {
        Arc::new(Self { metadata, bytes })
    }

    pub fn metadata(&self) -> &Signed<T> {
        &self.metadata
    }

    pub fn signed(&self) -> &T {
        self.metadata.signed()
    }

    /// Exact bytes the metadata was accepted from.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Shared handle to accepted metadata.
pub type Trusted<T> = Arc<Verified<T>>;

/// Currently trusted metadata of one updater.
#[derive(Debug, Clone)]
pub struct TrustedMetadataStore {
    reference_time: DateTime<Utc>,
    root: Option<Trusted<RootPayload>>,
    root_keys: KeyDb,
    timestamp: Option<Trusted<TimestampPayload>>,
    snapshot: Option<Trusted<SnapshotPayload>>,
    targets: Option<Trusted<TargetsPayload>>,
    delegated: BTreeMap<String, Trusted<TargetsPayload>>,
}

impl TrustedMetadataStore {
    /// Creates an empty store verifying expiry against `reference_time`.
    pub fn new(reference_time: DateTime<Utc>) -> Self {
        Self {
            reference_time,
            root: None,
            root_keys: KeyDb::default(),
            timestamp: None,
            snapshot: None,
            targets: None,
            delegated: BTreeMap::new(),
        }
    }

    /// Returns the same trusted state verifying against a new time.
    pub fn with_reference_time(mut self, reference_time: DateTime<Utc>) -> Self {
        self.reference_time = reference_time;
        self
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    /// Highest state reached.
    pub fn state(&self) -> TrustState {
        if !self.delegated.is_empty() {
            TrustState::DelegatedTargetsLoaded
        } else if self.targets.is_some() {
            TrustState::TargetsLoaded
        } else if self.snapshot.is_some() {
            TrustState::SnapshotLoaded
        } else if self.timestamp.is_some() {
            TrustState::TimestampLoaded
        } else if self.root.is_some() {
            TrustState::RootLoaded
        } else {
            TrustState::NoneLoaded
        }
    }

    pub fn root(&self) -> Option<&Trusted<RootPayload>> {
        self.root.as_ref()
    }

    pub fn timestamp(&self) -> Option<&Trusted<TimestampPayload>> {
        self.timestamp.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Trusted<SnapshotPayload>> {
        self.snapshot.as_ref()
    }

    pub fn targets(&self) -> Option<&Trusted<TargetsPayload>> {
        self.targets.as_ref()
    }

    /// Trusted metadata of a delegated targets role.
    pub fn delegated(&self, role: &str) -> Option<&Trusted<TargetsPayload>> {
        self.delegated.get(role)
    }

    /// Raw bytes of the trusted metadata for any role name.
    pub fn trusted(&self, role: &str) -> Option<&[u8]> {
        match role {
            ROOT => self.root.as_deref().map(Verified::bytes),
            TIMESTAMP => self.timestamp.as_deref().map(Verified::bytes),
            SNAPSHOT => self.snapshot.as_deref().map(Verified::bytes),
            TARGETS => self.targets.as_deref().map(Verified::bytes),
            other => self.delegated.get(other).map(|meta| meta.bytes()),
        }
    }

    /// Bootstraps trust from an out-of-band root.
    ///
    /// The root only needs to satisfy its own root role; its expiry is
    /// checked after rotation by [`Self::check_root_expiry`].
    pub fn load_trusted_root(&mut self, bytes: &[u8]) -> Result<()> {
        if self.root.is_some() {
            return Err(self.invalid_transition(ROOT));
        }
        let candidate = parse_role::<RootPayload>(bytes)?;
        let keys = KeyDb::from_keys(&candidate.signed().keys);
        check_signatures(&candidate, &candidate.signed().roles.root, &keys, ROOT)?;
        debug!(version = candidate.version(), "tuf: loaded trusted root");
        self.root_keys = keys;
        self.root = Some(accept(candidate, bytes));
        Ok(())
    }

    /// Rotates to the next root version.
    ///
    /// The candidate must be exactly one version ahead and be signed by a
    /// threshold of both the trusted root's keys and its own keys. Metadata
    /// signed by keys the new root no longer trusts is dropped.
    pub fn update_root(&mut self, bytes: &[u8]) -> Result<()> {
        let trusted = self.require_root(ROOT)?;
        let candidate = parse_role::<RootPayload>(bytes)?;

        let current_version = trusted.metadata().version();
        let expected = current_version + 1;
        let version = candidate.version();
        if version < expected {
            return Err(TrustError::RollbackAttack {
                role: ROOT.to_string(),
                trusted: current_version,
                candidate: version,
            });
        }
        if version > expected {
            return Err(TrustError::BadVersionNumber {
                role: ROOT.to_string(),
                expected,
                actual: version,
            });
        }

        check_signatures(&candidate, &trusted.signed().roles.root, &self.root_keys, ROOT)?;
        let keys = KeyDb::from_keys(&candidate.signed().keys);
        check_signatures(&candidate, &candidate.signed().roles.root, &keys, ROOT)?;

        self.purge_rotated_roles(trusted.signed(), candidate.signed());
        debug!(version, "tuf: accepted root rotation");
        self.root_keys = keys;
        self.root = Some(accept(candidate, bytes));
        Ok(())
    }

    /// Fails if the trusted root has expired (freeze attack).
    pub fn check_root_expiry(&self) -> Result<()> {
        let root = self.require_root(ROOT)?;
        self.ensure_unexpired(ROOT, root.metadata())
    }

    /// Accepts a timestamp, pinning the snapshot it references.
    pub fn update_timestamp(&mut self, bytes: &[u8], origin: Origin) -> Result<()> {
        let root = self.require_root(TIMESTAMP)?;
        let candidate = parse_role::<TimestampPayload>(bytes)?;

        if let Some(current) = &self.timestamp {
            ensure_not_rolled_back(TIMESTAMP, current.metadata().version(), candidate.version())?;
            let trusted_snapshot = current.signed().snapshot_meta()?.version;
            let candidate_snapshot = candidate.signed().snapshot_meta()?.version;
            ensure_not_rolled_back(SNAPSHOT, trusted_snapshot, candidate_snapshot)?;
        }

        if origin == Origin::Remote {
            self.ensure_unexpired(TIMESTAMP, &candidate)?;
        }

        check_signatures(&candidate, &root.signed().roles.timestamp, &self.root_keys, TIMESTAMP)?;

        debug!(version = candidate.version(), ?origin, "tuf: accepted timestamp");
        self.timestamp = Some(accept(candidate, bytes));
        Ok(())
    }

    /// Accepts the snapshot pinned by the trusted timestamp.
    pub fn update_snapshot(&mut self, bytes: &[u8], origin: Origin) -> Result<()> {
        let root = self.require_root(SNAPSHOT)?;
        let timestamp = self
            .timestamp
            .clone()
            .ok_or_else(|| self.invalid_transition(SNAPSHOT))?;
        let candidate = parse_role::<SnapshotPayload>(bytes)?;

        let trusted_version = self.snapshot.as_ref().map(|s| s.metadata().version());
        check_against_pin(
            SNAPSHOT,
            candidate.version(),
            bytes,
            trusted_version,
            Some(timestamp.signed().snapshot_meta()?),
        )?;
        if let Some(current) = &self.snapshot {
            for (file, trusted_meta) in &current.signed().meta {
                let role = file.strip_suffix(".json").unwrap_or(file);
                let candidate_version = candidate
                    .signed()
                    .meta
                    .get(file)
                    .map(|meta| meta.version)
                    .unwrap_or(0);
                ensure_not_rolled_back(role, trusted_meta.version, candidate_version)?;
            }
        }

        if origin == Origin::Remote {
            self.ensure_unexpired(TIMESTAMP, timestamp.metadata())?;
            self.ensure_unexpired(SNAPSHOT, &candidate)?;
        }

        check_signatures(&candidate, &root.signed().roles.snapshot, &self.root_keys, SNAPSHOT)?;

        debug!(version = candidate.version(), ?origin, "tuf: accepted snapshot");
        self.snapshot = Some(accept(candidate, bytes));
        self.delegated.clear();
        Ok(())
    }

    /// Accepts the top-level targets pinned by the trusted snapshot.
    pub fn update_targets(&mut self, bytes: &[u8], origin: Origin) -> Result<()> {
        let root = self.require_root(TARGETS)?;
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| self.invalid_transition(TARGETS))?;
        let candidate = parse_role::<TargetsPayload>(bytes)?;

        let trusted_version = self.targets.as_ref().map(|t| t.metadata().version());
        check_against_pin(
            TARGETS,
            candidate.version(),
            bytes,
            trusted_version,
            snapshot.signed().role_meta(TARGETS),
        )?;

        if origin == Origin::Remote {
            self.ensure_unexpired(SNAPSHOT, snapshot.metadata())?;
            self.ensure_unexpired(TARGETS, &candidate)?;
        }

        check_signatures(&candidate, &root.signed().roles.targets, &self.root_keys, TARGETS)?;

        debug!(version = candidate.version(), ?origin, "tuf: accepted targets");
        self.targets = Some(accept(candidate, bytes));
        self.delegated.clear();
        Ok(())
    }

    /// Accepts metadata for `role`, delegated to by the trusted `delegator`.
    pub fn update_delegated_targets(
        &mut self,
        bytes: &[u8],
        role: &str,
        delegator: &str,
        origin: Origin,
    ) -> Result<()> {
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| self.invalid_transition(role))?;
        let parent = if delegator == TARGETS {
            self.targets.clone()
        } else {
            self.delegated.get(delegator).cloned()
        }
        .ok_or_else(|| self.invalid_transition(role))?;
        let (delegation, keys) = match (
            parent.signed().delegated_role(role),
            parent.signed().delegations.as_ref(),
        ) {
            (Some(delegation), Some(delegations)) => {
                (delegation.role_keys(), KeyDb::from_keys(&delegations.keys))
            }
            _ => {
                return Err(TrustError::malformed(
                    role,
                    format!("role is not delegated by '{delegator}'"),
                ))
            }
        };
        let candidate = parse_role::<TargetsPayload>(bytes)?;

        let trusted_version = self.delegated.get(role).map(|t| t.metadata().version());
        check_against_pin(
            role,
            candidate.version(),
            bytes,
            trusted_version,
            snapshot.signed().role_meta(role),
        )?;

        if origin == Origin::Remote {
            self.ensure_unexpired(SNAPSHOT, snapshot.metadata())?;
            self.ensure_unexpired(role, &candidate)?;
        }

        check_signatures(&candidate, &delegation, &keys, role)?;

        debug!(
            role,
            delegator,
            version = candidate.version(),
            ?origin,
            "tuf: accepted delegated targets"
        );
        self.delegated.insert(role.to_string(), accept(candidate, bytes));
        Ok(())
    }

    /// Whether the trusted snapshot is unexpired and still the one the
    /// trusted timestamp pins.
    pub fn is_snapshot_current(&self) -> bool {
        match (&self.timestamp, &self.snapshot) {
            (Some(timestamp), Some(snapshot)) => timestamp
                .signed()
                .snapshot_meta()
                .map(|pin| self.is_current(snapshot, pin))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Whether the trusted top-level targets are unexpired and still pinned.
    pub fn is_targets_current(&self) -> bool {
        match (&self.snapshot, &self.targets) {
            (Some(snapshot), Some(targets)) => snapshot
                .signed()
                .role_meta(TARGETS)
                .is_some_and(|pin| self.is_current(targets, pin)),
            _ => false,
        }
    }

    /// Whether a trusted delegated role is unexpired and still pinned.
    pub fn is_delegated_current(&self, role: &str) -> bool {
        match (&self.snapshot, self.delegated.get(role)) {
            (Some(snapshot), Some(targets)) => snapshot
                .signed()
                .role_meta(role)
                .is_some_and(|pin| self.is_current(targets, pin)),
            _ => false,
        }
    }

    /// Confirms the top-level chain is complete, fresh and consistent.
    pub fn check_consistent(&self) -> Result<()> {
        self.check_root_expiry()?;
        let timestamp = self
            .timestamp
            .as_ref()
            .ok_or_else(|| self.invalid_transition(SNAPSHOT))?;
        self.ensure_unexpired(TIMESTAMP, timestamp.metadata())?;
        for (role, trusted) in [
            (SNAPSHOT, self.snapshot.as_ref().map(|s| s.metadata().expires())),
            (TARGETS, self.targets.as_ref().map(|t| t.metadata().expires())),
        ] {
            let Some(expires) = trusted else {
                return Err(self.invalid_transition(role));
            };
            if expires <= self.reference_time {
                return Err(TrustError::ExpiredMetadata {
                    role: role.to_string(),
                    expires,
                });
            }
        }
        if !self.is_snapshot_current() {
            return Err(TrustError::pin_mismatch(SNAPSHOT, "does not match the timestamp pin"));
        }
        if !self.is_targets_current() {
            return Err(TrustError::pin_mismatch(TARGETS, "does not match the snapshot pin"));
        }
        Ok(())
    }

    fn is_current<T: RolePayload>(&self, trusted: &Verified<T>, pin: &MetaFile) -> bool {
        trusted.metadata().version() == pin.version
            && pin.check_bytes(trusted.bytes()).is_ok()
            && !trusted.metadata().is_expired(self.reference_time)
    }

    fn require_root(&self, role: &str) -> Result<Trusted<RootPayload>> {
        self.root.clone().ok_or_else(|| self.invalid_transition(role))
    }

    fn invalid_transition(&self, role: &str) -> TrustError {
        TrustError::InvalidTransition {
            role: role.to_string(),
            state: self.state(),
        }
    }

    fn ensure_unexpired<T: RolePayload>(&self, role: &str, metadata: &Signed<T>) -> Result<()> {
        if metadata.is_expired(self.reference_time) {
            return Err(TrustError::ExpiredMetadata {
                role: role.to_string(),
                expires: metadata.expires(),
            });
        }
        Ok(())
    }

    /// Drops metadata whose signing keys changed between two roots.
    fn purge_rotated_roles(&mut self, previous: &RootPayload, next: &RootPayload) {
        let changed = |role: RoleType| previous.role_signers(role) != next.role_signers(role);
        if changed(RoleType::Timestamp) {
            debug!("tuf: timestamp keys rotated, forgetting timestamp and snapshot");
            self.timestamp = None;
            self.snapshot = None;
        }
        if changed(RoleType::Snapshot) {
            debug!("tuf: snapshot keys rotated, forgetting snapshot and targets");
            self.snapshot = None;
            self.targets = None;
            self.delegated.clear();
        }
        if changed(RoleType::Targets) {
            debug!("tuf: targets keys rotated, forgetting targets");
            self.targets = None;
            self.delegated.clear();
        }
    }
}

fn parse_role<T: RolePayload>(bytes: &[u8]) -> Result<Signed<T>> {
    Metadata::parse(bytes)?.into_role::<T>()
}

fn accept<T>(metadata: Signed<T>, bytes: &[u8]) -> Trusted<T> {
    Verified::new(metadata, bytes.to_vec())
}

fn check_signatures<T>(
    metadata: &Signed<T>,
    role_keys: &RoleKeys,
    keys: &KeyDb,
    role: &str,
) -> Result<()> {
    let status = metadata.signature_status(role_keys, keys);
    if status.is_satisfied() {
        return Ok(());
    }
    Err(TrustError::UnsignedMetadata {
        role: role.to_string(),
        valid: status.valid_keys(),
        threshold: status.threshold,
    })
}

fn ensure_not_rolled_back(role: &str, trusted: u64, candidate: u64) -> Result<()> {
    if candidate < trusted {
        return Err(TrustError::RollbackAttack {
            role: role.to_string(),
            trusted,
            candidate,
        });
    }
    Ok(())
}

/// Version step: monotonicity against the trusted copy, then exact equality
/// with the reference the parent role pinned.
fn check_against_pin(
    role: &str,
    version: u64,
    bytes: &[u8],
    trusted_version: Option<u64>,
    pin: Option<&MetaFile>,
) -> Result<()> {
    if let Some(trusted) = trusted_version {
        ensure_not_rolled_back(role, trusted, version)?;
    }
    let pin =
        pin.ok_or_else(|| TrustError::pin_mismatch(role, "role is not listed by its parent"))?;
    if version != pin.version {
        return Err(TrustError::pin_mismatch(
            role,
            format!("version {version} differs from pinned version {}", pin.version),
        ));
    }
    pin.check_bytes(bytes)
        .map_err(|reason| TrustError::pin_mismatch(role, reason))
}
