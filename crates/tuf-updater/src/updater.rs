//! Client-side update workflow.
//!
//! [`Updater::refresh`] walks the role chain (root rotations, timestamp,
//! snapshot, top-level targets) against a working copy of the trusted state
//! and commits it only once the whole chain is verified. Target lookups then
//! resolve delegations lazily, and downloads are verified before they are
//! exposed at their destination.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::delegation::{DelegationResolver, DelegationSource, ResolveOutcome};
use crate::error::{Result, TrustError};
use crate::fetch::{FetchError, Fetcher};
use crate::metadata::{
    DelegatedRole, MetaFile, Metadata, RootPayload, TargetFile, TargetsPayload, ROOT, SNAPSHOT,
    TARGETS, TIMESTAMP,
};
use crate::mirrors::{metadata_file, Mirror, RemoteRepository, Resource};
use crate::store::{FsMetadataStore, LocalStore, StoreError};
use crate::telemetry::{NoopTelemetry, UpdaterTelemetry};
use crate::trusted::{Origin, TrustState, Trusted, TrustedMetadataStore};

/// Trusted state being built by one refresh.
struct WorkingCopy {
    trusted: TrustedMetadataStore,
    cold_start: bool,
    persist_error: Option<StoreError>,
}

/// Secure update client for one repository.
pub struct Updater<F: Fetcher, S: LocalStore = FsMetadataStore> {
    initial_root: Vec<u8>,
    store: S,
    remote: RemoteRepository<F>,
    config: UpdaterConfig,
    telemetry: Arc<dyn UpdaterTelemetry>,
    trusted: Option<TrustedMetadataStore>,
}

impl<F: Fetcher> Updater<F, FsMetadataStore> {
    /// Creates an updater caching metadata as files in `local_dir`.
    ///
    /// `initial_root` is the out-of-band trusted root used when the cache
    /// holds no valid root.
    pub fn new(
        initial_root: impl Into<Vec<u8>>,
        local_dir: impl AsRef<Path>,
        mirrors: Vec<Mirror>,
        fetcher: F,
        config: UpdaterConfig,
    ) -> Result<Self> {
        let store = FsMetadataStore::open(local_dir)?;
        Self::with_store(initial_root, store, mirrors, fetcher, config)
    }
}

impl<F: Fetcher, S: LocalStore> Updater<F, S> {
    /// Creates an updater over any [`LocalStore`].
    pub fn with_store(
        initial_root: impl Into<Vec<u8>>,
        store: S,
        mirrors: Vec<Mirror>,
        fetcher: F,
        config: UpdaterConfig,
    ) -> Result<Self> {
        let initial_root = initial_root.into();
        Metadata::parse(&initial_root)?.into_role::<RootPayload>()?;
        let remote = RemoteRepository::new(fetcher, mirrors, config.fetch_timeout);
        Ok(Self {
            initial_root,
            store,
            remote,
            config,
            telemetry: Arc::new(NoopTelemetry),
            trusted: None,
        })
    }

    /// Routes updater events to `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn UpdaterTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn local_store(&self) -> &S {
        &self.store
    }

    pub fn remote(&self) -> &RemoteRepository<F> {
        &self.remote
    }

    /// Trusted state committed by the last successful refresh.
    pub fn trusted(&self) -> Option<&TrustedMetadataStore> {
        self.trusted.as_ref()
    }

    /// Brings trusted metadata up to date with the repository.
    ///
    /// On failure the previously committed state is kept unchanged. Cache
    /// write failures do not undo a verified refresh: the new state is
    /// committed first and the first write failure is returned afterwards.
    pub async fn refresh(&mut self) -> Result<()> {
        let started = Instant::now();
        match self.run_refresh().await {
            Ok(working) => {
                let elapsed = started.elapsed();
                let versions = chain_versions(&working.trusted);
                self.trusted = Some(working.trusted);
                self.telemetry.on_refresh_completed(elapsed);
                info!(
                    root = versions[0],
                    timestamp = versions[1],
                    snapshot = versions[2],
                    targets = versions[3],
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tuf: refresh completed"
                );
                match working.persist_error {
                    Some(err) => Err(err.into()),
                    None => Ok(()),
                }
            }
            Err(err) => {
                warn!(error = %err, "tuf: refresh failed");
                self.telemetry.on_refresh_failed(&err);
                Err(err)
            }
        }
    }

    async fn run_refresh(&self) -> Result<WorkingCopy> {
        let mut working = self.working_copy()?;
        self.update_root_chain(&mut working).await?;
        if working.cold_start {
            self.load_cached_floors(&mut working);
        }
        self.update_timestamp(&mut working).await?;
        self.update_snapshot(&mut working).await?;
        self.update_targets(&mut working).await?;
        working.trusted.check_consistent()?;
        Ok(working)
    }

    /// Starts from the committed state, or bootstraps from the cached root
    /// falling back to the initial root.
    fn working_copy(&self) -> Result<WorkingCopy> {
        let now = Utc::now();
        if let Some(trusted) = &self.trusted {
            return Ok(WorkingCopy {
                trusted: trusted.clone().with_reference_time(now),
                cold_start: false,
                persist_error: None,
            });
        }

        let mut working = WorkingCopy {
            trusted: TrustedMetadataStore::new(now),
            cold_start: true,
            persist_error: None,
        };
        if let Some(bytes) = self.load_cached(ROOT) {
            match working.trusted.load_trusted_root(&bytes) {
                Ok(()) => {
                    debug!("tuf: bootstrapped trust from cached root");
                    return Ok(working);
                }
                Err(err) => warn!(error = %err, "tuf: ignoring invalid cached root"),
            }
        }
        working.trusted.load_trusted_root(&self.initial_root)?;
        debug!("tuf: bootstrapped trust from initial root");
        self.persist(&mut working, ROOT, &self.initial_root);
        Ok(working)
    }

    /// Follows `{N+1}.root.json` until no newer root is served.
    async fn update_root_chain(&self, working: &mut WorkingCopy) -> Result<()> {
        for _ in 0..self.config.max_root_rotations {
            let next = working
                .trusted
                .root()
                .map_or(0, |root| root.metadata().version())
                + 1;
            let file = metadata_file(ROOT, Some(next));
            let trusted = &mut working.trusted;
            let fetched = self
                .remote
                .fetch_verified(Resource::Metadata(&file), self.config.root_size_cap, |bytes| {
                    trusted.update_root(bytes)
                })
                .await;
            match fetched {
                Ok(bytes) => {
                    info!(version = next, "tuf: accepted root rotation");
                    self.telemetry.on_metadata_accepted(ROOT, next);
                    self.telemetry.on_root_rotated(next);
                    self.persist(working, ROOT, &bytes);
                }
                Err(err) if err.is_transport() => {
                    debug!(version = next, error = %err, "tuf: no newer root available");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        working.trusted.check_root_expiry()
    }

    /// Loads cached top-level metadata as rollback floors.
    ///
    /// Each cached object is checked against the cached parent that pins it,
    /// so a consistent cached chain is loaded as a whole; anything that fails
    /// verification is skipped.
    fn load_cached_floors(&self, working: &mut WorkingCopy) {
        self.load_cached_floor(working, TIMESTAMP, |trusted, bytes| {
            trusted.update_timestamp(bytes, Origin::Cache)
        });
        self.load_cached_floor(working, SNAPSHOT, |trusted, bytes| {
            trusted.update_snapshot(bytes, Origin::Cache)
        });
        self.load_cached_floor(working, TARGETS, |trusted, bytes| {
            trusted.update_targets(bytes, Origin::Cache)
        });
    }

    fn load_cached_floor<L>(&self, working: &mut WorkingCopy, role: &str, load: L)
    where
        L: FnOnce(&mut TrustedMetadataStore, &[u8]) -> Result<()>,
    {
        let Some(bytes) = self.load_cached(role) else {
            return;
        };
        match load(&mut working.trusted, &bytes) {
            Ok(()) => debug!(role, "tuf: loaded cached metadata"),
            Err(err) => warn!(role, error = %err, "tuf: ignoring cached metadata"),
        }
    }

    /// Timestamp is always fetched: it is the freshness anchor.
    async fn update_timestamp(&self, working: &mut WorkingCopy) -> Result<()> {
        let file = metadata_file(TIMESTAMP, None);
        let trusted = &mut working.trusted;
        let bytes = self
            .remote
            .fetch_verified(
                Resource::Metadata(&file),
                self.config.timestamp_size_cap,
                |bytes| trusted.update_timestamp(bytes, Origin::Remote),
            )
            .await?;
        let version = working
            .trusted
            .timestamp()
            .map_or(0, |timestamp| timestamp.metadata().version());
        self.accepted(working, TIMESTAMP, version, &bytes);
        Ok(())
    }

    async fn update_snapshot(&self, working: &mut WorkingCopy) -> Result<()> {
        if working.trusted.is_snapshot_current() {
            debug!("tuf: trusted snapshot is current, skipping fetch");
            return Ok(());
        }
        let pin = match working.trusted.timestamp() {
            Some(timestamp) => timestamp.signed().snapshot_meta()?.clone(),
            None => return Err(invalid_transition(&working.trusted, SNAPSHOT)),
        };

        let file = metadata_file(SNAPSHOT, is_consistent(&working.trusted).then_some(pin.version));
        let max_length = pinned_cap(&pin, self.config.snapshot_size_cap);
        let trusted = &mut working.trusted;
        let bytes = self
            .remote
            .fetch_verified(Resource::Metadata(&file), max_length, |bytes| {
                trusted.update_snapshot(bytes, Origin::Remote)
            })
            .await
            .map_err(|err| length_exceeded_as_pin_mismatch(SNAPSHOT, &pin, err))?;
        self.accepted(working, SNAPSHOT, pin.version, &bytes);
        Ok(())
    }

    async fn update_targets(&self, working: &mut WorkingCopy) -> Result<()> {
        if working.trusted.is_targets_current() {
            debug!("tuf: trusted targets are current, skipping fetch");
            return Ok(());
        }
        let pin = match working.trusted.snapshot() {
            Some(snapshot) => snapshot
                .signed()
                .role_meta(TARGETS)
                .cloned()
                .ok_or_else(|| {
                    TrustError::pin_mismatch(TARGETS, "role is not listed by the snapshot")
                })?,
            None => return Err(invalid_transition(&working.trusted, TARGETS)),
        };

        let file = metadata_file(TARGETS, is_consistent(&working.trusted).then_some(pin.version));
        let max_length = pinned_cap(&pin, self.config.targets_size_cap);
        let trusted = &mut working.trusted;
        let bytes = self
            .remote
            .fetch_verified(Resource::Metadata(&file), max_length, |bytes| {
                trusted.update_targets(bytes, Origin::Remote)
            })
            .await
            .map_err(|err| length_exceeded_as_pin_mismatch(TARGETS, &pin, err))?;
        self.accepted(working, TARGETS, pin.version, &bytes);
        Ok(())
    }

    fn accepted(&self, working: &mut WorkingCopy, role: &str, version: u64, bytes: &[u8]) {
        debug!(role, version, "tuf: metadata accepted");
        self.telemetry.on_metadata_accepted(role, version);
        self.persist(working, role, bytes);
    }

    fn persist(&self, working: &mut WorkingCopy, role: &str, bytes: &[u8]) {
        if let Err(err) = self.store.save(role, bytes) {
            warn!(role, error = %err, "tuf: failed to persist metadata");
            if working.persist_error.is_none() {
                working.persist_error = Some(err);
            }
        }
    }

    fn load_cached(&self, role: &str) -> Option<Vec<u8>> {
        match self.store.load(role) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(role, error = %err, "tuf: failed to read cached metadata");
                None
            }
        }
    }

    /// Finds the trusted description of target `path`.
    ///
    /// Refreshes first when no refresh has succeeded yet, then searches the
    /// top-level targets and their delegations.
    pub async fn get_targetinfo(&mut self, path: &str) -> Result<TargetFile> {
        if self.trusted.is_none() {
            self.refresh().await?;
        }
        let Some(trusted) = self.trusted.as_mut() else {
            return Err(TrustError::InvalidTransition {
                role: TARGETS.to_string(),
                state: TrustState::NoneLoaded,
            });
        };
        let Some(top) = trusted.targets().cloned() else {
            return Err(invalid_transition(trusted, TARGETS));
        };

        let resolver =
            DelegationResolver::new(self.config.max_delegations, self.config.max_delegation_depth);
        let mut source = UpdaterSource {
            trusted,
            store: &self.store,
            remote: &self.remote,
            config: &self.config,
            telemetry: self.telemetry.as_ref(),
        };
        match resolver.resolve(path, top.signed(), &mut source).await? {
            ResolveOutcome::Found { role, target } => {
                debug!(path, role = %role, "tuf: resolved target");
                Ok(target)
            }
            ResolveOutcome::Exhausted { visited } => {
                debug!(path, visited, "tuf: no trusted role lists target");
                Err(TrustError::UnknownTarget {
                    path: path.to_string(),
                })
            }
            ResolveOutcome::BoundExceeded {
                role,
                depth,
                visited,
            } => Err(TrustError::DelegationLoopOrDepth {
                role,
                reason: format!(
                    "visited {visited} of {} roles at depth {depth} of {}",
                    self.config.max_delegations, self.config.max_delegation_depth
                ),
            }),
            ResolveOutcome::FetchFailed { role, error } => {
                warn!(path, role = %role, error = %error, "tuf: delegated metadata unavailable");
                Err(error)
            }
        }
    }

    /// Downloads `info` to `destination`.
    ///
    /// Bytes are verified against the declared length and every hash before
    /// the destination is atomically replaced; a failed download leaves it
    /// untouched.
    pub async fn download_target(
        &self,
        info: &TargetFile,
        destination: impl AsRef<Path>,
    ) -> Result<()> {
        let cap = self.config.target_size_cap_default;
        if info.length > cap {
            return Err(TrustError::TargetTooLarge {
                path: info.path.clone(),
                length: info.length,
                cap,
            });
        }

        let remote_name = self.remote_target_name(info);
        let resource = Resource::Target {
            path: &info.path,
            remote_name: &remote_name,
        };
        // One byte of slack so an overlong body is reported with its length.
        let bytes = self
            .remote
            .fetch_verified(resource, info.length.saturating_add(1), |bytes| {
                info.verify_bytes(bytes)
            })
            .await
            .map_err(|err| length_exceeded_as_mismatch(info, err))?;

        write_atomically(destination.as_ref(), &bytes)?;
        self.telemetry.on_target_downloaded(&info.path, info.length);
        info!(path = %info.path, length = info.length, "tuf: target downloaded");
        Ok(())
    }

    /// Whether `path` already holds bytes matching `info`.
    pub fn find_cached_target(&self, info: &TargetFile, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(meta) if meta.len() != info.length => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        let bytes = fs::read(path)?;
        let matches = info.verify_bytes(&bytes).is_ok();
        debug!(path = %path.display(), target = %info.path, matches, "tuf: checked cached target");
        Ok(matches)
    }

    /// Name the target is stored under on the mirrors.
    ///
    /// Consistent-snapshot repositories store `dir/<hash>.<name>`, using the
    /// first declared hash.
    fn remote_target_name(&self, info: &TargetFile) -> String {
        let consistent = self.trusted.as_ref().is_some_and(is_consistent);
        if !(consistent && self.config.prefix_targets_with_hash) {
            return info.path.clone();
        }
        let Some(hash) = info.hashes.values().next() else {
            return info.path.clone();
        };
        match info.path.rsplit_once('/') {
            Some((dir, name)) => format!("{dir}/{hash}.{name}"),
            None => format!("{hash}.{}", info.path),
        }
    }
}

/// Delegated metadata from trusted memory, then the cache, then the mirrors.
struct UpdaterSource<'a, F, S> {
    trusted: &'a mut TrustedMetadataStore,
    store: &'a S,
    remote: &'a RemoteRepository<F>,
    config: &'a UpdaterConfig,
    telemetry: &'a dyn UpdaterTelemetry,
}

impl<F: Fetcher, S: LocalStore> UpdaterSource<'_, F, S> {
    fn load_from_cache(&mut self, role: &str, delegator: &str) -> bool {
        let bytes = match self.store.load(role) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(err) => {
                warn!(role, error = %err, "tuf: failed to read cached metadata");
                return false;
            }
        };
        // Cached copies skip the expiry check, so only a current one is kept.
        let mut candidate = self.trusted.clone();
        match candidate.update_delegated_targets(&bytes, role, delegator, Origin::Cache) {
            Ok(()) if candidate.is_delegated_current(role) => {
                debug!(role, "tuf: loaded delegated role from cache");
                *self.trusted = candidate;
                true
            }
            Ok(()) => {
                debug!(role, "tuf: cached delegated role is not current");
                false
            }
            Err(err) => {
                warn!(role, error = %err, "tuf: ignoring cached delegated role");
                false
            }
        }
    }

    async fn load_from_remote(&mut self, role: &str, delegator: &str) -> Result<()> {
        let pin = self
            .trusted
            .snapshot()
            .and_then(|snapshot| snapshot.signed().role_meta(role).cloned())
            .ok_or_else(|| TrustError::pin_mismatch(role, "role is not listed by the snapshot"))?;
        let file = metadata_file(role, is_consistent(&*self.trusted).then_some(pin.version));
        let max_length = pinned_cap(&pin, self.config.targets_size_cap);

        let trusted = &mut *self.trusted;
        let bytes = self
            .remote
            .fetch_verified(Resource::Metadata(&file), max_length, |bytes| {
                trusted.update_delegated_targets(bytes, role, delegator, Origin::Remote)
            })
            .await
            .map_err(|err| length_exceeded_as_pin_mismatch(role, &pin, err))?;
        self.telemetry.on_metadata_accepted(role, pin.version);
        if let Err(err) = self.store.save(role, &bytes) {
            warn!(role, error = %err, "tuf: failed to persist metadata");
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, F: Fetcher, S: LocalStore> DelegationSource for UpdaterSource<'a, F, S> {
    async fn delegated_targets(
        &mut self,
        role: &DelegatedRole,
        delegator: &str,
    ) -> Result<Trusted<TargetsPayload>> {
        let name = role.name.as_str();
        if self.trusted.is_delegated_current(name) {
            debug!(role = name, "tuf: delegated role already trusted");
        } else if !self.load_from_cache(name, delegator) {
            self.load_from_remote(name, delegator).await?;
        }
        match self.trusted.delegated(name) {
            Some(metadata) => Ok(metadata.clone()),
            None => Err(invalid_transition(&*self.trusted, name)),
        }
    }
}

fn is_consistent(trusted: &TrustedMetadataStore) -> bool {
    trusted
        .root()
        .is_some_and(|root| root.signed().consistent_snapshot)
}

fn invalid_transition(trusted: &TrustedMetadataStore, role: &str) -> TrustError {
    TrustError::InvalidTransition {
        role: role.to_string(),
        state: trusted.state(),
    }
}

/// Versions of root, timestamp, snapshot and targets (0 when absent).
fn chain_versions(trusted: &TrustedMetadataStore) -> [u64; 4] {
    [
        trusted.root().map_or(0, |m| m.metadata().version()),
        trusted.timestamp().map_or(0, |m| m.metadata().version()),
        trusted.snapshot().map_or(0, |m| m.metadata().version()),
        trusted.targets().map_or(0, |m| m.metadata().version()),
    ]
}

/// Reports a download aborted by the length cap as a length mismatch.
fn length_exceeded_as_mismatch(info: &TargetFile, err: TrustError) -> TrustError {
    match err {
        TrustError::Fetch {
            source: FetchError::LengthExceeded { received, .. },
            ..
        } => TrustError::DownloadLengthMismatch {
            path: info.path.clone(),
            expected: info.length,
            actual: received,
        },
        TrustError::NoWorkingMirror { resource, errors } => TrustError::NoWorkingMirror {
            resource,
            errors: errors
                .into_iter()
                .map(|(mirror, err)| (mirror, length_exceeded_as_mismatch(info, err)))
                .collect(),
        },
        other => other,
    }
}

/// Largest body accepted for pinned metadata. One byte past the pinned
/// length lets an overlong copy reach the pin check.
fn pinned_cap(pin: &MetaFile, default: u64) -> u64 {
    pin.length.map_or(default, |length| length.saturating_add(1))
}

/// Reports metadata aborted past its pinned length as a pin mismatch.
fn length_exceeded_as_pin_mismatch(role: &str, pin: &MetaFile, err: TrustError) -> TrustError {
    let Some(pinned) = pin.length else {
        return err;
    };
    match err {
        TrustError::Fetch {
            source: FetchError::LengthExceeded { received, .. },
            ..
        } => TrustError::pin_mismatch(
            role,
            format!("received at least {received} bytes, pinned length is {pinned}"),
        ),
        TrustError::NoWorkingMirror { resource, errors } => TrustError::NoWorkingMirror {
            resource,
            errors: errors
                .into_iter()
                .map(|(mirror, err)| (mirror, length_exceeded_as_pin_mismatch(role, pin, err)))
                .collect(),
        },
        other => other,
    }
}

/// Writes `bytes` to a temporary file next to `destination`, then renames it.
fn write_atomically(destination: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut file = NamedTempFile::new_in(parent)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(destination).map_err(io::Error::from)?;
    Ok(())
}
