//! Base-layer resolver.

use crate::error::{Result, UpgraderError};
use crate::origin::{BaseRef, Origin};
use crate::progress::ProgressSink;
use crate::store::ObjectStore;

bitflags::bitflags! {
    /// Pull-behavior bitmask consumed by [`resolve_base`] (subset of the
    /// upgrader-wide flags relevant to base resolution).
    #[derive(Default)]
    pub struct PullFlags: u32 {
        const ALLOW_OLDER    = 0b0001;
        const SYNTHETIC_PULL = 0b0010;
    }
}

/// Result of resolving an origin's base reference to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBase {
    pub base_commit: String,
    /// Set for a layered container image base.
    pub merge_commit: Option<String>,
    pub changed: bool,
}

/// Resolve `origin`'s base reference against `store`, dispatching on
/// [`Origin::classify_base`].
///
/// `current_base` is the deployment's current base commit, used for the
/// timestamp-monotonicity check and as the override-commit pre-reset target.
pub fn resolve_base(
    store: &dyn ObjectStore,
    origin: &Origin,
    current_base: &str,
    flags: PullFlags,
    sink: &dyn ProgressSink,
) -> Result<ResolvedBase> {
    let allow_older = flags.contains(PullFlags::ALLOW_OLDER);
    let synthetic = flags.contains(PullFlags::SYNTHETIC_PULL);

    let resolved = match &origin.base {
        BaseRef::OstreeBranch { remote, refspec } => {
            let local_ref = format!("{remote}:{refspec}");
            if let Some(pin) = &origin.override_commit {
                // Work around the non-atomicity of commit pins vs tip
                // movement: reset the local ref to our current base first so
                // the timestamp check (if any) compares against us, not a
                // remote tip that may have moved further.
                store.transaction(&mut |txn| txn.set_ref(&local_ref, Some(current_base)))?;
                pin.clone()
            } else if synthetic {
                store
                    .resolve_rev(&local_ref, false)
                    .map_err(|e| e.with_phase(format!("resolving synthetic ref '{local_ref}'")))?
                    .ok_or_else(|| UpgraderError::resolution(format!("no local data for '{local_ref}'")))?
            } else {
                sink.message(&format!("Pulling {local_ref}"));
                let pulled = store
                    .pull(remote, &local_ref)
                    .map_err(|e| e.with_phase(format!("pulling '{local_ref}' from '{remote}'")))?;
                if !allow_older {
                    check_timestamp_monotonic(store, current_base, &pulled)?;
                }
                pulled
            }
        }
        BaseRef::Checksum(commit) => commit.clone(),
        BaseRef::ContainerImage(image_ref) => {
            if origin.override_commit.is_some() {
                return Err(UpgraderError::policy(
                    "override_commit is not permitted with a container-image origin",
                ));
            }
            let (base, merge) = store
                .pull_container_image(image_ref)
                .map_err(|e| e.with_phase(format!("pulling container image '{image_ref}'")))?;
            return Ok(ResolvedBase {
                changed: base != current_base,
                base_commit: base,
                merge_commit: merge,
            });
        }
    };

    // Post-dispatch re-check: catches cached/synthetic/local resolution
    // paths that skipped the pull-time check above.
    if resolved != current_base && !allow_older && origin.classify_base() != crate::origin::BaseKind::ContainerImage {
        check_timestamp_monotonic(store, current_base, &resolved)?;
    }

    Ok(ResolvedBase {
        changed: resolved != current_base,
        base_commit: resolved,
        merge_commit: None,
    })
}

fn check_timestamp_monotonic(store: &dyn ObjectStore, current_base: &str, candidate: &str) -> Result<()> {
    if current_base == candidate {
        return Ok(());
    }
    let current_ts = store.commit_timestamp(current_base);
    let candidate_ts = store.commit_timestamp(candidate);
    if let (Ok(cur), Ok(new)) = (current_ts, candidate_ts) {
        if new < cur {
            return Err(UpgraderError::integrity(format!(
                "candidate base {candidate} (timestamp {new}) predates current base {current_base} (timestamp {cur}); pass AllowOlder to override"
            )));
        }
    }
    Ok(())
}
