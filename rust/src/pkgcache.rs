//! Pkgcache & base-layer GC, grounded on the original
//! `generate_baselayer_refs`/`generate_pkgcache_refs`/`syscore_regenerate_refs`
//! trio. Unlike the original, this does not carry the legacy
//! `rpmostree/rojig` namespace GC — that remote-image predecessor has no
//! counterpart in this model and is a deliberate drop, not an oversight
//! (see DESIGN.md).

use crate::deployment::Deployment;
use crate::error::Result;
use crate::history::HistoryStore;
use crate::package::{base_ref_name, nevra_to_cache_branch, TMP_BASE_REF};
use crate::progress::ProgressSink;
use crate::store::{ObjectStore, PruneStats};
use std::collections::BTreeSet;

/// Summary of one regenerate-refs pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenerateStats {
    pub base_refs_written: usize,
    pub pkgcache_refs_dropped: usize,
    pub history_pruned: usize,
    pub prune: PruneStats,
}

/// Per-deployment view needed by the GC: the deployments themselves plus,
/// for layered ones, the resolved package list and any local replacement
/// overrides (derived from the checked-out rpmdb or commit metadata).
pub struct GcInput<'a> {
    pub deployments: &'a [Deployment],
    /// `deployment index -> resolved package list installed in that deployment`.
    pub installed_packages: &'a dyn Fn(usize) -> Vec<crate::package::Nevra>,
}

/// Atomic regenerate-refs transaction. Runs entirely inside one
/// [`ObjectStore::transaction`] call: either every ref mutation below is
/// applied, or none are.
pub fn regenerate_refs(
    store: &dyn ObjectStore,
    input: &GcInput,
    history: &dyn HistoryStore,
    sink: &dyn ProgressSink,
) -> Result<RegenerateStats> {
    let distinct_base_commits: BTreeSet<String> = input
        .deployments
        .iter()
        .map(|d| d.base_commit.clone())
        .collect();

    let mut referenced_branches: BTreeSet<String> = BTreeSet::new();
    for (i, dep) in input.deployments.iter().enumerate() {
        if !dep.is_layered() {
            continue;
        }
        for pkg in (input.installed_packages)(i) {
            referenced_branches.insert(nevra_to_cache_branch(&pkg));
        }
        for replacement in &dep.origin.overrides_replace_local {
            // `overrides_replace_local` entries are `sha256:nevra`; the
            // NEVRA portion is what maps to a cache branch.
            if let Some((_sha, nevra)) = replacement.split_once(':') {
                if let Ok(n) = crate::package::Nevra::parse(nevra) {
                    referenced_branches.insert(nevra_to_cache_branch(&n));
                }
            }
        }
    }

    let old_base_refs = store.list_refs("rpmostree/base/")?;
    let old_pkg_refs = store.list_refs("rpmostree/pkg/")?;

    let base_refs_written = distinct_base_commits.len();
    let dropped_pkg_refs: BTreeSet<String> = old_pkg_refs
        .iter()
        .filter(|r| !referenced_branches.contains(r.as_str()))
        .cloned()
        .collect();

    store.transaction(&mut |txn| {
        for old in &old_base_refs {
            txn.set_ref(old, None)?;
        }
        for (i, commit) in distinct_base_commits.iter().enumerate() {
            txn.set_ref(&base_ref_name(i), Some(commit))?;
        }
        for dropped in &dropped_pkg_refs {
            txn.set_ref(dropped, None)?;
        }
        txn.set_ref(TMP_BASE_REF, None)?;
        Ok(())
    })?;

    let prune = store.prune_refs_only()?;
    if prune.objects_pruned > 0 || prune.bytes_freed > 0 {
        sink.message(&format!(
            "Freed: {} objects, {} bytes (pkgcache branches: {})",
            prune.objects_pruned,
            prune.bytes_freed,
            dropped_pkg_refs.len()
        ));
    }

    let live_csums: Vec<String> = input.deployments.iter().map(|d| d.csum.clone()).collect();
    let history_pruned = history.prune_older_than(i64::MAX, &live_csums)?;

    Ok(RegenerateStats {
        base_refs_written,
        pkgcache_refs_dropped: dropped_pkg_refs.len(),
        history_pruned,
        prune,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::history::MemoryHistory;
    use crate::origin::Origin;
    use crate::package::Nevra;
    use crate::progress::SilentSink;
    use crate::store::MemoryStore;

    fn dep(osname: &str, base: &str, csum: &str) -> Deployment {
        Deployment {
            osname: osname.to_string(),
            base_commit: base.to_string(),
            deployserial: 0,
            csum: csum.to_string(),
            origin: Origin::new_ostree_branch("fedora", "fedora/38/x86_64/silverblue"),
            pinned: false,
        }
    }

    #[test]
    fn writes_exactly_distinct_base_commits() {
        let store = MemoryStore::new()
            .with_ref("rpmostree/base/0", "stale-base")
            .with_ref("rpmostree/pkg/git/2.40-1.x86__64", "stale-pkg-commit");

        let deployments = vec![dep("fedora", "baseA", "baseA"), dep("fedora", "baseA", "layeredB")];
        let installed = |i: usize| -> Vec<Nevra> {
            if i == 1 {
                vec![Nevra::new("vim", None, "9.0", "1", "x86_64")]
            } else {
                vec![]
            }
        };
        let input = GcInput {
            deployments: &deployments,
            installed_packages: &installed,
        };
        let history = MemoryHistory::new();

        let stats = regenerate_refs(&store, &input, &history, &SilentSink).unwrap();
        assert_eq!(stats.base_refs_written, 1);
        assert_eq!(stats.pkgcache_refs_dropped, 1);

        let refs = store.list_refs("rpmostree/base/").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(store.refs.lock().unwrap().get("rpmostree/base/0").unwrap(), "baseA");

        let pkg_refs = store.list_refs("rpmostree/pkg/").unwrap();
        assert!(pkg_refs.contains("rpmostree/pkg/vim/9.0-1.x86__64"));
        assert!(!pkg_refs.contains("rpmostree/pkg/git/2.40-1.x86__64"));
    }

    #[test]
    fn regenerate_is_idempotent() {
        let store = MemoryStore::new();
        let deployments = vec![dep("fedora", "baseA", "baseA")];
        let installed = |_: usize| vec![];
        let input = GcInput {
            deployments: &deployments,
            installed_packages: &installed,
        };
        let history = MemoryHistory::new();
        regenerate_refs(&store, &input, &history, &SilentSink).unwrap();
        let stats2 = regenerate_refs(&store, &input, &history, &SilentSink).unwrap();
        assert_eq!(stats2.pkgcache_refs_dropped, 0);
    }

    #[test]
    fn history_entries_for_live_csums_survive_regenerate() {
        let store = MemoryStore::new();
        let deployments = vec![dep("fedora", "baseA", "liveA")];
        let installed = |_: usize| vec![];
        let input = GcInput {
            deployments: &deployments,
            installed_packages: &installed,
        };
        let history = MemoryHistory::new();
        history
            .record(&crate::history::HistoryEntry::from_deployment(&deployments[0], 1))
            .unwrap();
        history
            .record(&crate::history::HistoryEntry::from_deployment(&dep("fedora", "baseA", "gone"), 2))
            .unwrap();

        let stats = regenerate_refs(&store, &input, &history, &SilentSink).unwrap();
        assert_eq!(stats.history_pruned, 1);
        let remaining = history.list().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].csum, "liveA");
    }
}
