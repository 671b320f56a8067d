//! Secure software-update client for TUF-style repositories.
//!
//! The crate re-exports the building blocks needed to keep metadata trusted
//! (root rotation, timestamp, snapshot, targets and delegations) and to
//! download verified targets, without digging into the module layout.

pub mod canonical;
pub mod config;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod fetch;
pub mod metadata;
pub mod mirrors;
pub mod store;
pub mod telemetry;
pub mod trusted;
pub mod updater;

// Lets the shared signing fixture use crate paths inside unit tests.
#[cfg(test)]
extern crate self as tuf_updater;

pub use config::UpdaterConfig;
pub use crypto::{Key, KeyDb, RoleKeys, Signature, SignatureStatus};
pub use delegation::{DelegationResolver, DelegationSource, ResolveOutcome};
pub use error::{Result, TrustError};
pub use fetch::{FetchError, Fetcher, FileFetcher, HttpFetcher, HttpFetcherOptions};
pub use metadata::{
    DelegatedRole, Metadata, MetaFile, Payload, RoleType, RootPayload, Signed, SnapshotPayload,
    TargetFile, TargetsPayload, TimestampPayload,
};
pub use mirrors::{Mirror, RemoteRepository, Resource};
pub use store::{FsMetadataStore, LocalStore, SledMetadataStore, StoreError};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, TelemetryCounters, TelemetrySnapshot,
    UpdaterTelemetry,
};
pub use trusted::{Origin, TrustState, Trusted, TrustedMetadataStore, Verified};
pub use updater::Updater;
