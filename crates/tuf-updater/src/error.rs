//! Error taxonomy shared by every stage of the trust pipeline.
//!
//! Trust failures (bad signatures, rollbacks, expired or mismatched metadata)
//! are kept distinct from transport failures so callers can tell an attack
//! apart from an unreachable mirror.

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::fetch::FetchError;
use crate::store::StoreError;
use crate::trusted::TrustState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrustError>;

/// Errors emitted while establishing trust in metadata and targets.
#[derive(Debug, Error)]
pub enum TrustError {
    /// Metadata could not be decoded, or declared an unexpected role.
    #[error("malformed {role} metadata: {reason}")]
    MalformedMetadata { role: String, reason: String },
    /// Fewer than `threshold` distinct authorized keys produced a valid signature.
    #[error("{role} metadata signature threshold not met ({valid}/{threshold})")]
    UnsignedMetadata {
        role: String,
        valid: usize,
        threshold: u64,
    },
    /// A validly-shaped candidate is older than what is already trusted.
    ///
    /// `candidate == 0` means the role disappeared from the candidate listing.
    #[error(
        "rollback attack on {role}: candidate version {candidate} is below trusted version \
         {trusted}"
    )]
    RollbackAttack {
        role: String,
        trusted: u64,
        candidate: u64,
    },
    /// A root candidate skipped ahead of the next expected version.
    #[error("{role} version {actual} does not match expected version {expected}")]
    BadVersionNumber {
        role: String,
        expected: u64,
        actual: u64,
    },
    /// Metadata expired at or before the verification time.
    #[error("{role} metadata expired at {expires}")]
    ExpiredMetadata {
        role: String,
        expires: DateTime<Utc>,
    },
    /// Metadata bytes or version disagree with the reference pinned by the parent role.
    #[error("{role} metadata does not match its pinned reference: {reason}")]
    LengthOrHashMismatch { role: String, reason: String },
    /// A downloaded target does not have the declared length.
    #[error("target '{path}' length mismatch (expected {expected}, received {actual})")]
    DownloadLengthMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    /// A downloaded target does not match one of its declared hashes.
    #[error("target '{path}' failed '{algorithm}' hash verification")]
    DownloadHashMismatch { path: String, algorithm: String },
    /// The delegation search hit its visit or depth bound.
    #[error("delegation search stopped at '{role}': {reason}")]
    DelegationLoopOrDepth { role: String, reason: String },
    /// No trusted role lists the requested path.
    #[error("target '{path}' is not listed by any trusted targets role")]
    UnknownTarget { path: String },
    /// A target declares a length above the configured download ceiling.
    #[error("target '{path}' declares {length} bytes, above the {cap} byte ceiling")]
    TargetTooLarge { path: String, length: u64, cap: u64 },
    /// The trusted store was asked to load a role before its prerequisites.
    #[error("cannot load {role} metadata while the trusted store is {state}")]
    InvalidTransition { role: String, state: TrustState },
    /// Retrieving a resource failed at the transport level.
    #[error("failed to fetch '{resource}': {source}")]
    Fetch {
        resource: String,
        #[source]
        source: FetchError,
    },
    /// Every configured mirror failed for a resource.
    #[error("no working mirror for '{resource}': {}", MirrorErrors(errors))]
    NoWorkingMirror {
        resource: String,
        errors: Vec<(String, TrustError)>,
    },
    /// Local metadata cache failure.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),
    /// Filesystem failure while exposing a verified target.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrustError {
    /// Builds a [`TrustError::MalformedMetadata`] from any displayable reason.
    pub(crate) fn malformed(role: impl Into<String>, reason: impl fmt::Display) -> Self {
        TrustError::MalformedMetadata {
            role: role.into(),
            reason: reason.to_string(),
        }
    }

    /// Builds a [`TrustError::LengthOrHashMismatch`] from any displayable reason.
    pub(crate) fn pin_mismatch(role: impl Into<String>, reason: impl fmt::Display) -> Self {
        TrustError::LengthOrHashMismatch {
            role: role.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` when the failure came from moving bytes rather than from
    /// verifying them.
    ///
    /// Bounded loops (root rotation, delegation search) stop quietly on
    /// transport failures but surface every trust failure.
    pub fn is_transport(&self) -> bool {
        match self {
            TrustError::Fetch { .. } => true,
            TrustError::NoWorkingMirror { errors, .. } => {
                errors.iter().all(|(_, err)| err.is_transport())
            }
            _ => false,
        }
    }

    /// Returns `true` when the failure means "the resource does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            TrustError::Fetch { source, .. } => matches!(source, FetchError::NotFound(_)),
            TrustError::NoWorkingMirror { errors, .. } => {
                !errors.is_empty() && errors.iter().all(|(_, err)| err.is_not_found())
            }
            _ => false,
        }
    }
}

/// Display adapter listing per-mirror failures on one line.
struct MirrorErrors<'a>(&'a [(String, TrustError)]);

impl fmt::Display for MirrorErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no mirrors configured");
        }
        for (index, (url, err)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{url}: {err}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch_error(resource: &str, source: FetchError) -> TrustError {
        TrustError::Fetch {
            resource: resource.to_string(),
            source,
        }
    }

    #[test]
    fn transport_classification_looks_through_mirror_aggregates() {
        let transport = fetch_error("a", FetchError::NotFound("a".into()));
        assert!(transport.is_transport());
        assert!(transport.is_not_found());

        let mixed = TrustError::NoWorkingMirror {
            resource: "timestamp.json".into(),
            errors: vec![
                ("m1".into(), fetch_error("m1", FetchError::NotFound("m1".into()))),
                (
                    "m2".into(),
                    TrustError::UnsignedMetadata {
                        role: "timestamp".into(),
                        valid: 0,
                        threshold: 1,
                    },
                ),
            ],
        };
        assert!(!mixed.is_transport());
        assert!(!mixed.is_not_found());

        let empty = TrustError::NoWorkingMirror {
            resource: "timestamp.json".into(),
            errors: Vec::new(),
        };
        assert!(empty.is_transport());
        assert!(!empty.is_not_found());
    }

    #[test]
    fn no_working_mirror_lists_each_failure() {
        let err = TrustError::NoWorkingMirror {
            resource: "snapshot.json".into(),
            errors: vec![
                ("https://a".into(), fetch_error("https://a", FetchError::Status(500))),
                ("https://b".into(), fetch_error("https://b", FetchError::Status(502))),
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("https://a"));
        assert!(rendered.contains("https://b"));
    }
}
