//! Deployment data model and list rewriter, grounded in
//! `rpmostree_syscore_filter_deployments`'s filter semantics and the
//! insertion algorithm described alongside it.

use crate::origin::Origin;

/// An immutable record identifying an OS root checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub osname: String,
    pub base_commit: String,
    pub deployserial: u32,
    /// The commit actually checked out; may differ from `base_commit` when
    /// this deployment is layered.
    pub csum: String,
    pub origin: Origin,
    pub pinned: bool,
}

impl Deployment {
    /// A deployment is *layered* iff its checkout differs from its base.
    pub fn is_layered(&self) -> bool {
        self.csum != self.base_commit
    }

    /// Identity triple used for duplicate detection: no two entries in a
    /// deployment list may share `(osname, csum, deployserial)`.
    pub fn identity(&self) -> (&str, &str, u32) {
        (&self.osname, &self.csum, self.deployserial)
    }
}

/// Whether the booted deployment has been live-modified (package overlaid
/// without a reboot). Affects insertion conservatism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveApplyState {
    Unmodified,
    Modified,
}

/// Insert a new deployment into the current list.
///
/// Walks the current list once, classifying each entry as retained or
/// dropped, then splices in `new_deployment` at the required position.
/// `booted` and `merge` are identified by reference equality on
/// `(osname, csum, deployserial)` against entries of `current`.
pub fn insert_new_deployment(
    current: &[Deployment],
    booted: &Deployment,
    merge: &Deployment,
    new_deployment: Deployment,
    rollback_only: bool,
    live_apply: LiveApplyState,
) -> Vec<Deployment> {
    let mut out = Vec::with_capacity(current.len() + 1);
    let mut before_booted = true;
    let mut inserted = false;

    if !rollback_only {
        out.push(new_deployment.clone());
    }

    for entry in current {
        let is_booted = entry.identity() == booted.identity();
        let is_merge = entry.identity() == merge.identity();
        if is_booted {
            before_booted = false;
        }

        let retain = entry.osname != new_deployment.osname
            || is_booted
            || is_merge
            || live_apply == LiveApplyState::Modified && !before_booted
            || (rollback_only && before_booted);

        if retain {
            out.push(entry.clone());
        }

        if rollback_only && is_booted && !inserted {
            out.push(new_deployment.clone());
            inserted = true;
        }
    }

    out
}

/// Drop pending and/or rollback entries for `osname`. Pinned entries and
/// `booted` are never dropped; entries for other osnames pass through
/// untouched. Returns `None` when nothing changed, an explicit no-op signal
/// distinct from an empty-but-meaningful result.
pub fn filter_deployments(
    current: &[Deployment],
    booted: &Deployment,
    osname: &str,
    cleanup_pending: bool,
    cleanup_rollback: bool,
) -> Option<Vec<Deployment>> {
    if !cleanup_pending && !cleanup_rollback {
        return None;
    }

    let booted_pos = current
        .iter()
        .position(|d| d.identity() == booted.identity());

    let mut out = Vec::with_capacity(current.len());
    for (i, entry) in current.iter().enumerate() {
        let is_booted = Some(i) == booted_pos;
        let is_pending = booted_pos.map(|b| i < b).unwrap_or(false);
        let is_rollback = booted_pos.map(|b| i > b).unwrap_or(false);

        let drop_it = !is_booted
            && !entry.pinned
            && entry.osname == osname
            && ((cleanup_pending && is_pending) || (cleanup_rollback && is_rollback));

        if !drop_it {
            out.push(entry.clone());
        }
    }

    if out.len() == current.len() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::origin::Origin;

    fn dep(osname: &str, csum: &str, serial: u32, pinned: bool) -> Deployment {
        Deployment {
            osname: osname.to_string(),
            base_commit: csum.to_string(),
            deployserial: serial,
            csum: csum.to_string(),
            origin: Origin::new_ostree_branch("fedora", "fedora/38/x86_64/silverblue"),
            pinned,
        }
    }

    #[test]
    fn prepend_inserts_new_deployment_at_front_by_default() {
        let booted = dep("fedora", "b", 0, false);
        let merge = booted.clone();
        let current = vec![booted.clone(), dep("fedora", "old", 1, false)];
        let newdep = dep("fedora", "new", 2, false);

        let out = insert_new_deployment(
            &current,
            &booted,
            &merge,
            newdep.clone(),
            false,
            LiveApplyState::Unmodified,
        );
        assert_eq!(out[0].csum, "new");
        assert!(out.iter().any(|d| d.csum == "b"));
    }

    #[test]
    fn other_osname_entries_pass_through() {
        let booted = dep("fedora", "b", 0, false);
        let merge = booted.clone();
        let other = dep("other", "x", 0, false);
        let current = vec![booted.clone(), other.clone()];
        let newdep = dep("fedora", "new", 1, false);

        let out = insert_new_deployment(
            &current,
            &booted,
            &merge,
            newdep,
            false,
            LiveApplyState::Unmodified,
        );
        assert!(out.iter().any(|d| d.csum == "x"));
    }

    #[test]
    fn filter_returns_none_when_nothing_changes() {
        let booted = dep("fedora", "b", 0, false);
        let current = vec![booted.clone()];
        assert_eq!(
            filter_deployments(&current, &booted, "fedora", false, false),
            None
        );
    }

    #[test]
    fn filter_drops_pending_but_keeps_pinned_and_booted() {
        let pending = dep("fedora", "p", 0, false);
        let pinned_pending = dep("fedora", "pp", 1, true);
        let booted = dep("fedora", "b", 2, false);
        let rollback = dep("fedora", "r", 3, false);
        let current = vec![pending, pinned_pending.clone(), booted.clone(), rollback.clone()];

        let out = filter_deployments(&current, &booted, "fedora", true, false).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().any(|d| d.csum == "pp"));
        assert!(out.iter().any(|d| d.csum == "b"));
        assert!(out.iter().any(|d| d.csum == "r"));
        assert!(!out.iter().any(|d| d.csum == "p"));
    }

    #[test]
    fn filter_drops_rollback_for_target_osname_only() {
        let booted = dep("fedora", "b", 0, false);
        let rollback = dep("fedora", "r", 1, false);
        let other_rollback = dep("other", "or", 2, false);
        let current = vec![booted.clone(), rollback, other_rollback.clone()];

        let out = filter_deployments(&current, &booted, "fedora", false, true).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|d| d.csum == "or"));
    }
}
