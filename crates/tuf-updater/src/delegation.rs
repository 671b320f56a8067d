//! Bounded, priority-ordered search for the role authoritative over a path.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TrustError};
use crate::metadata::{DelegatedRole, TargetFile, TargetsPayload, TARGETS};
use crate::trusted::Trusted;

/// Supplies verified metadata for delegated roles during a search.
#[async_trait]
pub trait DelegationSource: Send {
    /// Returns verified metadata for `role`, delegated to by `delegator`.
    async fn delegated_targets(
        &mut self,
        role: &DelegatedRole,
        delegator: &str,
    ) -> Result<Trusted<TargetsPayload>>;
}

/// Result of a delegation search.
#[derive(Debug)]
pub enum ResolveOutcome {
    /// `role` lists the path.
    Found { role: String, target: TargetFile },
    /// Every reachable role was consulted without a match.
    Exhausted { visited: usize },
    /// Visiting `role` would exceed the visit or depth bound.
    BoundExceeded {
        role: String,
        depth: usize,
        visited: usize,
    },
    /// Metadata for `role` could not be retrieved.
    FetchFailed { role: String, error: TrustError },
}

#[derive(Debug)]
struct Pending {
    role: DelegatedRole,
    delegator: String,
    depth: usize,
}

/// Depth-first delegation walker with global bounds.
#[derive(Debug, Clone, Copy)]
pub struct DelegationResolver {
    max_visited: usize,
    max_depth: usize,
}

impl DelegationResolver {
    /// `max_visited` counts the top-level targets role.
    pub fn new(max_visited: usize, max_depth: usize) -> Self {
        Self {
            max_visited,
            max_depth,
        }
    }

    /// Searches `top` and its delegations for `path`.
    ///
    /// Trust failures loading a delegated role are returned as errors;
    /// transport failures end the search with [`ResolveOutcome::FetchFailed`].
    pub async fn resolve<S>(
        &self,
        path: &str,
        top: &TargetsPayload,
        source: &mut S,
    ) -> Result<ResolveOutcome>
    where
        S: DelegationSource + ?Sized,
    {
        if let Some(target) = top.target_file(path) {
            return Ok(ResolveOutcome::Found {
                role: TARGETS.to_string(),
                target,
            });
        }

        let mut visited: HashSet<String> = HashSet::from([TARGETS.to_string()]);
        let mut stack = Vec::new();
        push_candidates(path, TARGETS, top, 1, &mut stack);

        while let Some(pending) = stack.pop() {
            let name = pending.role.name.clone();
            if visited.contains(&name) {
                debug!(role = %name, "tuf: delegated role already visited, skipping");
                continue;
            }
            if visited.len() >= self.max_visited || pending.depth > self.max_depth {
                return Ok(ResolveOutcome::BoundExceeded {
                    role: name,
                    depth: pending.depth,
                    visited: visited.len(),
                });
            }
            visited.insert(name.clone());

            let metadata = match source
                .delegated_targets(&pending.role, &pending.delegator)
                .await
            {
                Ok(metadata) => metadata,
                Err(error) if error.is_transport() => {
                    debug!(role = %name, error = %error, "tuf: delegated role unavailable");
                    return Ok(ResolveOutcome::FetchFailed { role: name, error });
                }
                Err(error) => return Err(error),
            };

            if let Some(target) = metadata.signed().target_file(path) {
                return Ok(ResolveOutcome::Found { role: name, target });
            }
            push_candidates(path, &name, metadata.signed(), pending.depth + 1, &mut stack);
        }

        Ok(ResolveOutcome::Exhausted {
            visited: visited.len(),
        })
    }
}

/// Queues the delegations of `targets` covering `path`, highest priority on
/// top. Reaching a terminating delegation stops the sibling scan and drops
/// every lower-priority pending entry.
fn push_candidates(
    path: &str,
    delegator: &str,
    targets: &TargetsPayload,
    depth: usize,
    stack: &mut Vec<Pending>,
) {
    let mut candidates = Vec::new();
    for role in targets.delegated_roles() {
        if role.matches(path) {
            candidates.push(Pending {
                role: role.clone(),
                delegator: delegator.to_string(),
                depth,
            });
        }
        if role.terminating {
            debug!(role = %role.name, path, "tuf: terminating delegation reached");
            stack.clear();
            break;
        }
    }
    stack.extend(candidates.into_iter().rev());
}
