//! Dependency solver abstraction (rpm-md-repos depsolve black box).
//!
//! Package resolution against an RPM-MD repo set is an external
//! collaborator; this crate models it as a trait so the layering engine can
//! be exercised without a real solver.

use crate::error::Result;
use crate::package::Nevra;

/// Outcome of resolving an origin's package requests against the base
/// rpmdb and configured repos.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepsolveResult {
    /// Packages to import, fully resolved to NEVRA.
    pub to_install: Vec<Nevra>,
    /// Requested patterns that resolved to a package already present in the
    /// base, i.e. demoted to an inactive request.
    pub inactive_requests: Vec<String>,
    /// State checksum over the depsolved set, written into a derived
    /// commit's metadata and checked against on redeploy.
    pub state_checksum: String,
}

/// A pinned dependency-solver collaborator.
pub trait Solver: Send + Sync {
    /// Resolve `patterns` against the base package list, returning the
    /// fully depsolved install set.
    fn depsolve(&self, patterns: &[String], base_packages: &[Nevra]) -> Result<DepsolveResult>;
}

/// A solver that resolves each pattern to itself verbatim, with no
/// transitive dependencies. Used by tests; a real adapter would shell out to
/// or link a package-manager library the way the original core links
/// `libdnf`.
#[derive(Default)]
pub struct TrivialSolver;

impl Solver for TrivialSolver {
    fn depsolve(&self, patterns: &[String], base_packages: &[Nevra]) -> Result<DepsolveResult> {
        let mut to_install = Vec::new();
        let mut inactive_requests = Vec::new();
        for pattern in patterns {
            if let Some(existing) = base_packages.iter().find(|p| &p.name == pattern) {
                let _ = existing;
                inactive_requests.push(pattern.clone());
                continue;
            }
            to_install.push(Nevra::new(pattern.clone(), None, "0", "0", "x86_64"));
        }
        let state_checksum = crate::package::package_list_checksum(&to_install);
        Ok(DepsolveResult {
            to_install,
            inactive_requests,
            state_checksum,
        })
    }
}
