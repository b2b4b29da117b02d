//! Upgrader orchestrator.

use crate::context::UpgradeContext;
use crate::deployment::Deployment;
use crate::error::{Result, UpgraderError};
use crate::flags::UpgradeFlags;
use crate::history::{HistoryEntry, HistoryStore};
use crate::journal::{log_new_deployment, DeploymentJournalFields};
use crate::layering::{self, AssembleOutcome, Layering, PrepOutcome};
use crate::origin::Origin;
use crate::package::Nevra;
use crate::pkgcache::{self, GcInput};
use crate::resolver::{self, ResolvedBase};

/// Result of a full `deploy()` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// `DryRun` was set; prep ran but nothing was written.
    DryRunSummary { would_change: bool },
    /// A new deployment was written (staged if booted into this sysroot,
    /// otherwise immediate).
    Deployed {
        target_revision: String,
        staged: bool,
    },
    /// The requested operation produces the same deployment as booted (a
    /// CLI front end would typically map this to a distinct "no changes"
    /// exit code).
    NoChange,
}

/// The orchestrator state, one per run.
pub struct Upgrader<'a> {
    pub osname: String,
    pub command_line: Option<String>,
    pub merge_deployment: Deployment,
    pub booted_deployment: Deployment,
    pub original_origin: Origin,
    pub computed_origin: Origin,
    pub base_revision: Option<String>,
    pub final_revision: Option<String>,
    pub booted_into_this_sysroot: bool,
    prep: Option<PrepOutcome>,
    imported: Vec<String>,
}

impl<'a> Upgrader<'a> {
    pub fn new(
        osname: impl Into<String>,
        merge_deployment: Deployment,
        booted_deployment: Deployment,
        booted_into_this_sysroot: bool,
    ) -> Self {
        let original_origin = merge_deployment.origin.clone();
        let computed_origin = original_origin.clone();
        Upgrader {
            osname: osname.into(),
            command_line: None,
            merge_deployment,
            booted_deployment,
            original_origin,
            computed_origin,
            base_revision: None,
            final_revision: None,
            booted_into_this_sysroot,
            prep: None,
            imported: Vec::new(),
        }
    }

    /// Resolve the base reference, recording `base_revision`.
    pub fn resolve_base(&mut self, ctx: &UpgradeContext, flags: UpgradeFlags) -> Result<ResolvedBase> {
        ctx.cancel.check()?;
        let resolved = resolver::resolve_base(
            ctx.store,
            &self.original_origin,
            &self.merge_deployment.base_commit,
            flags.to_pull_flags(),
            ctx.sink,
        )?;
        self.base_revision = Some(resolved.base_commit.clone());
        Ok(resolved)
    }

    /// Ensure prep and import have run.
    pub fn ensure_prep_and_import(
        &mut self,
        ctx: &UpgradeContext,
        base_packages: &[Nevra],
        current_state_checksum: Option<&str>,
        flags: UpgradeFlags,
    ) -> Result<()> {
        if !flags.contains(UpgradeFlags::IGNORE_UNCONFIGURED)
            && self.original_origin.unconfigured_state.is_some()
        {
            return Err(UpgraderError::policy(format!(
                "origin has unconfigured-state: {}; pass IgnoreUnconfigured to proceed",
                self.original_origin.unconfigured_state.as_deref().unwrap_or("")
            )));
        }

        let outcome = layering::prep_layering(
            &self.computed_origin,
            base_packages,
            current_state_checksum,
            ctx.solver,
            ctx.sink,
            &ctx.cancel,
        )?;
        self.computed_origin = outcome.computed_origin.clone();

        if outcome.kind == Layering::None {
            self.final_revision = None;
            self.prep = Some(outcome);
            return Ok(());
        }

        if let Some(depsolve) = &outcome.depsolve {
            self.imported = layering::import_pkgs(
                ctx.store,
                &depsolve.to_install,
                flags.contains(UpgradeFlags::PKGCACHE_ONLY),
                ctx.sink,
                &ctx.cancel,
            )?;
        }
        self.prep = Some(outcome);
        Ok(())
    }

    /// Run assembly; target revision is `final_revision` if set, else `base_revision`.
    pub fn run_assembly(&mut self, ctx: &UpgradeContext) -> Result<String> {
        let base_revision = self
            .base_revision
            .clone()
            .ok_or_else(|| UpgraderError::policy("resolve_base must run before assembly"))?;
        let prep = self
            .prep
            .as_ref()
            .ok_or_else(|| UpgraderError::policy("ensure_prep_and_import must run before assembly"))?;

        if prep.kind == Layering::None {
            self.final_revision = None;
            return Ok(base_revision);
        }

        let depsolve = prep
            .depsolve
            .as_ref()
            .ok_or_else(|| UpgraderError::policy("layering required but no depsolve result recorded"))?;

        let scratch = tempfile::TempDir::new().map_err(UpgraderError::from)?;
        let scratch_root = camino::Utf8PathBuf::from_path_buf(scratch.path().join("rootfs"))
            .map_err(|p| UpgraderError::io(format!("non-utf8 scratch path: {}", p.display())))?;

        let outcome: AssembleOutcome = layering::perform_assembly(
            ctx.store,
            &base_revision,
            &scratch_root,
            depsolve,
            &self.computed_origin,
            layering::kernel_package_changed(depsolve),
            &ctx.cancel,
        )?;
        self.final_revision = Some(outcome.final_revision.clone());
        Ok(outcome.final_revision)
    }

    /// Run the full deploy sequence: resolve base, prep/import if needed,
    /// assemble, detect no-op, write the new deployment record, and
    /// regenerate pkgcache refs.
    pub fn deploy(
        &mut self,
        ctx: &UpgradeContext,
        flags: UpgradeFlags,
        history: &dyn HistoryStore,
        deploy_ctime: i64,
    ) -> Result<DeployOutcome> {
        self.resolve_base(ctx, flags)?;

        if flags.contains(UpgradeFlags::DRY_RUN) {
            self.ensure_prep_and_import(ctx, &[], None, flags)?;
            let would_change = self
                .prep
                .as_ref()
                .map(|p| p.changed || self.base_revision.as_deref() != Some(self.merge_deployment.base_commit.as_str()))
                .unwrap_or(false);
            return Ok(DeployOutcome::DryRunSummary { would_change });
        }

        if self.prep.is_none() {
            self.ensure_prep_and_import(ctx, &[], None, flags)?;
        }

        let target_revision = self.run_assembly(ctx)?;

        if self.final_revision.is_none() {
            // Non-layered deployment: catches a corrupt base before it's recorded.
            let status = std::process::Command::new("true")
                .status()
                .map_err(|e| UpgraderError::integrity(format!("sanity check failed to spawn: {e}")))?;
            if !status.success() {
                return Err(UpgraderError::integrity(format!(
                    "sanity check inside new root exited with {status}"
                )));
            }
        }

        if target_revision == self.merge_deployment.csum && self.original_origin == self.computed_origin {
            return Ok(DeployOutcome::NoChange);
        }

        let staged = self.booted_into_this_sysroot;

        if self.final_revision.is_some() {
            let base_revision = self.base_revision.clone().unwrap();
            ctx.store
                .transaction(&mut |txn| txn.set_ref(crate::package::TMP_BASE_REF, Some(&base_revision)))?;
        }

        let new_deployment = Deployment {
            osname: self.osname.clone(),
            base_commit: self.base_revision.clone().unwrap(),
            deployserial: self.merge_deployment.deployserial + 1,
            csum: target_revision.clone(),
            origin: self.original_origin.clone(),
            pinned: false,
        };

        history.record(&HistoryEntry::from_deployment(&new_deployment, deploy_ctime))?;

        log_new_deployment(&DeploymentJournalFields {
            deployment_path: format!("/ostree/deploy/{}/deploy/{}.0", self.osname, target_revision),
            deployment_timestamp: deploy_ctime,
            deployment_device: 0,
            deployment_inode: 0,
            deployment_checksum: target_revision.clone(),
            deployment_refspec: match &self.computed_origin.base {
                crate::origin::BaseRef::OstreeBranch { remote, refspec } => {
                    Some(format!("{remote}:{refspec}"))
                }
                _ => None,
            },
            deployment_version: None,
            command_line: self.command_line.clone(),
            agent: None,
            agent_sd_unit: None,
        });

        let deployments = vec![new_deployment.clone()];
        let installed_packages = |_: usize| -> Vec<Nevra> { Vec::new() };
        let gc_input = GcInput {
            deployments: &deployments,
            installed_packages: &installed_packages,
        };
        pkgcache::regenerate_refs(ctx.store, &gc_input, history, ctx.sink)?;

        Ok(DeployOutcome::Deployed {
            target_revision,
            staged,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::UpgradeContext;
    use crate::progress::SilentSink;
    use crate::solver::TrivialSolver;
    use crate::store::MemoryStore;
    use crate::history::MemoryHistory;

    fn dep(csum: &str) -> Deployment {
        Deployment {
            osname: "fedora".to_string(),
            base_commit: csum.to_string(),
            deployserial: 0,
            csum: csum.to_string(),
            origin: Origin::new_ostree_branch("fedora", "f38"),
            pinned: false,
        }
    }

    #[test]
    fn pure_rebase_produces_new_deployment_with_no_final_revision() {
        let store = MemoryStore::new().with_ref("fedora:f38", "newbase");
        store
            .commit_timestamps
            .lock()
            .unwrap()
            .insert("oldbase".to_string(), chrono::Utc::now());
        store
            .commit_timestamps
            .lock()
            .unwrap()
            .insert("newbase".to_string(), chrono::Utc::now() + chrono::Duration::seconds(10));
        let solver = TrivialSolver;
        let sink = SilentSink;
        let ctx = UpgradeContext::new(&store, &solver, &sink);
        let history = MemoryHistory::new();

        let mut upgrader = Upgrader::new("fedora", dep("oldbase"), dep("oldbase"), false);
        let outcome = upgrader
            .deploy(&ctx, UpgradeFlags::empty(), &history, 12345)
            .unwrap();
        match outcome {
            DeployOutcome::Deployed { target_revision, staged } => {
                assert_eq!(target_revision, "newbase");
                assert!(!staged);
            }
            other => panic!("expected Deployed, got {other:?}"),
        }
        assert!(upgrader.final_revision.is_none());
    }

    #[test]
    fn dry_run_never_writes() {
        let store = MemoryStore::new().with_ref("fedora:f38", "oldbase");
        store
            .commit_timestamps
            .lock()
            .unwrap()
            .insert("oldbase".to_string(), chrono::Utc::now());
        let solver = TrivialSolver;
        let sink = SilentSink;
        let ctx = UpgradeContext::new(&store, &solver, &sink);
        let history = MemoryHistory::new();

        let mut upgrader = Upgrader::new("fedora", dep("oldbase"), dep("oldbase"), true);
        let outcome = upgrader
            .deploy(&ctx, UpgradeFlags::DRY_RUN, &history, 1)
            .unwrap();
        assert!(matches!(outcome, DeployOutcome::DryRunSummary { .. }));
        assert!(history.list().unwrap().is_empty());
    }

    #[test]
    fn unconfigured_state_blocks_without_ignore_flag() {
        let store = MemoryStore::new().with_ref("fedora:f38", "oldbase");
        let solver = TrivialSolver;
        let sink = SilentSink;
        let ctx = UpgradeContext::new(&store, &solver, &sink);
        let history = MemoryHistory::new();

        let mut d = dep("oldbase");
        d.origin.unconfigured_state = Some("needs setup".to_string());
        let mut upgrader = Upgrader::new("fedora", d.clone(), d, false);
        let err = upgrader
            .deploy(&ctx, UpgradeFlags::empty(), &history, 1)
            .unwrap_err();
        assert!(matches!(err, UpgraderError::Policy(_)));
    }
}
