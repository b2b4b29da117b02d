//! Origin descriptor: the declarative "what this deployment should be"
//! document owned by each deployment.

/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

//! The on-disk form is a keyed document grouped into sections `origin`,
//! `packages`, `overrides`, `rpmostree`, parsed and serialized via
//! `glib::KeyFile`, mirroring the original `origin_to_treefile_inner`/
//! `treefile_to_origin_inner` pair but operating directly on the fields of
//! [`Origin`] rather than an intermediate treefile representation.

use crate::error::{Result, UpgraderError};
use ostree_ext::glib;
use std::collections::BTreeSet;
use std::fmt;

const ORIGIN: &str = "origin";
const PACKAGES: &str = "packages";
const OVERRIDES: &str = "overrides";
const RPMOSTREE: &str = "rpmostree";

/// Which keys hold *unordered* lists, i.e. for diffing/round-trip purposes
/// the set of elements matters but not their written order. All other list
/// keys are treated as significant-order.
static UNORDERED_LIST_KEYS: phf::Set<&'static str> = phf::phf_set! {
    "packages/requested",
    "packages/requested-local",
    "packages/requested-local-fileoverride",
    "overrides/remove",
    "overrides/replace-local",
};

/// The base reference a deployment derives from. A tagged enum rather than
/// an untyped string: dispatch on this tag, never re-parse the underlying
/// reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// `remote:ref`, e.g. `fedora:fedora/38/x86_64/silverblue`.
    OstreeBranch { remote: String, refspec: String },
    /// An immutable commit checksum pin.
    Checksum(String),
    /// A container image reference, e.g. `ostree-remote-image:fedora:registry.example/image:tag`.
    ContainerImage(String),
}

/// Dispatch tag returned by [`Origin::classify_base`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseKind {
    OstreeBranch,
    Checksum,
    ContainerImage,
}

/// The canonical in-memory model of an origin document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub base: BaseRef,
    pub override_commit: Option<String>,
    pub packages: BTreeSet<String>,
    pub local_packages: BTreeSet<String>,
    pub local_fileoverride_packages: BTreeSet<String>,
    pub overrides_remove: BTreeSet<String>,
    pub overrides_replace_local: BTreeSet<String>,
    pub initramfs_regenerate: bool,
    pub initramfs_args: Vec<String>,
    pub initramfs_etc_files: BTreeSet<String>,
    pub cliwrap: bool,
    pub unconfigured_state: Option<String>,
    pub custom_origin_url: Option<String>,
    pub custom_origin_description: Option<String>,
}

impl Origin {
    /// A bare origin pinned to an ostree branch, no layering.
    pub fn new_ostree_branch(remote: impl Into<String>, refspec: impl Into<String>) -> Self {
        Origin {
            base: BaseRef::OstreeBranch {
                remote: remote.into(),
                refspec: refspec.into(),
            },
            override_commit: None,
            packages: BTreeSet::new(),
            local_packages: BTreeSet::new(),
            local_fileoverride_packages: BTreeSet::new(),
            overrides_remove: BTreeSet::new(),
            overrides_replace_local: BTreeSet::new(),
            initramfs_regenerate: false,
            initramfs_args: Vec::new(),
            initramfs_etc_files: BTreeSet::new(),
            cliwrap: false,
            unconfigured_state: None,
            custom_origin_url: None,
            custom_origin_description: None,
        }
    }

    /// Deterministic dispatch on the base reference form.
    pub fn classify_base(&self) -> BaseKind {
        match &self.base {
            BaseRef::OstreeBranch { .. } => BaseKind::OstreeBranch,
            BaseRef::Checksum(_) => BaseKind::Checksum,
            BaseRef::ContainerImage(_) => BaseKind::ContainerImage,
        }
    }

    /// True iff any layering/override/initramfs request is non-empty.
    pub fn may_require_local_assembly(&self) -> bool {
        !self.packages.is_empty()
            || !self.local_packages.is_empty()
            || !self.local_fileoverride_packages.is_empty()
            || !self.overrides_remove.is_empty()
            || !self.overrides_replace_local.is_empty()
            || self.initramfs_regenerate
            || !self.initramfs_etc_files.is_empty()
    }

    /// Add package patterns to `packages`. `allow_existing=false` rejects a
    /// pattern already present. Returns whether anything changed.
    pub fn add_packages<I, S>(&mut self, pkgs: I, allow_existing: bool) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for p in pkgs {
            let p = p.into();
            if self.packages.contains(&p) {
                if !allow_existing {
                    return Err(UpgraderError::config(format!(
                        "package '{p}' is already requested"
                    )));
                }
                continue;
            }
            self.packages.insert(p);
            changed = true;
        }
        Ok(changed)
    }

    /// Remove package patterns from `packages`. `allow_noent=false` rejects
    /// removing a pattern not present. Returns whether anything changed.
    pub fn remove_packages<I, S>(&mut self, pkgs: I, allow_noent: bool) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for p in pkgs {
            let p = p.into();
            if !self.packages.remove(&p) {
                if !allow_noent {
                    return Err(UpgraderError::config(format!(
                        "package '{p}' is not currently requested"
                    )));
                }
                continue;
            }
            changed = true;
        }
        Ok(changed)
    }

    /// Add names to `overrides_remove`. Idempotent: re-adding an existing
    /// name is a no-op, never an error (mirrors the original's override
    /// semantics, which is friendlier than package add/remove).
    pub fn add_overrides_remove<I, S>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for n in names {
            changed |= self.overrides_remove.insert(n.into());
        }
        changed
    }

    /// Remove names from `overrides_remove`. `allow_noent=false` rejects
    /// removing a name not present.
    pub fn remove_overrides_remove<I, S>(&mut self, names: I, allow_noent: bool) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for n in names {
            let n = n.into();
            if !self.overrides_remove.remove(&n) {
                if !allow_noent {
                    return Err(UpgraderError::config(format!(
                        "override removal '{n}' is not currently requested"
                    )));
                }
                continue;
            }
            changed = true;
        }
        Ok(changed)
    }

    /// Set `override_commit`. Returns whether it changed. Rejected when the
    /// base is a container image.
    pub fn set_override_commit(&mut self, commit: Option<String>) -> Result<bool> {
        if commit.is_some() && self.classify_base() == BaseKind::ContainerImage {
            return Err(UpgraderError::policy(
                "override_commit is not permitted with a container-image origin",
            ));
        }
        let changed = self.override_commit != commit;
        self.override_commit = commit;
        Ok(changed)
    }

    /// Reassign the base reference, clearing any `override_commit`.
    pub fn rebase(&mut self, new_base: BaseRef) -> bool {
        let changed = self.base != new_base || self.override_commit.is_some();
        self.base = new_base;
        self.override_commit = None;
        changed
    }

    /// Track an additional `/etc` file for initramfs embedding. Returns
    /// whether anything changed.
    pub fn track_initramfs_etc_file(&mut self, path: impl Into<String>) -> bool {
        self.initramfs_etc_files.insert(path.into())
    }

    /// Untrack an `/etc` file. `allow_noent=false` rejects untracking a path
    /// not present.
    pub fn untrack_initramfs_etc_file(&mut self, path: &str, allow_noent: bool) -> Result<bool> {
        if self.initramfs_etc_files.remove(path) {
            Ok(true)
        } else if allow_noent {
            Ok(false)
        } else {
            Err(UpgraderError::config(format!(
                "initramfs /etc file '{path}' is not currently tracked"
            )))
        }
    }

    /// Set initramfs regeneration on/off with an argument list. Regeneration
    /// together with a non-empty `/etc` overlay is rejected.
    pub fn set_initramfs_regenerate(&mut self, regenerate: bool, args: Vec<String>) -> Result<bool> {
        if regenerate && !self.initramfs_etc_files.is_empty() {
            return Err(UpgraderError::policy(
                "initramfs regeneration is incompatible with tracked /etc overlay files",
            ));
        }
        let changed = self.initramfs_regenerate != regenerate || self.initramfs_args != args;
        self.initramfs_regenerate = regenerate;
        self.initramfs_args = args;
        Ok(changed)
    }

    pub fn set_custom_origin(&mut self, url: Option<String>, description: Option<String>) -> bool {
        let changed = self.custom_origin_url != url || self.custom_origin_description != description;
        self.custom_origin_url = url;
        self.custom_origin_description = description;
        changed
    }

    /// Clears any live-overlay bookkeeping. Invoked exactly once before
    /// assembly. The only transient-looking state this model tracks is the
    /// `unconfigured_state` note, which is actually persisted rather than
    /// transient; this is a no-op placeholder kept as a distinct step so
    /// call sites still have somewhere to put that clearing.
    pub fn remove_transient_state(&mut self) {}

    /// Parse from the on-disk keyed document form.
    pub fn parse(document: &str) -> Result<Origin> {
        let kf = glib::KeyFile::new();
        kf.load_from_data(document, glib::KeyFileFlags::NONE)
            .map_err(|e| UpgraderError::config(format!("invalid origin document: {e}")))?;
        origin_from_keyfile(&kf)
    }

    /// Serialize to the canonical on-disk form. Equal origins serialize
    /// byte-identically.
    pub fn serialize(&self) -> String {
        let kf = glib::KeyFile::new();
        origin_to_keyfile(self, &kf);
        kf.to_data().to_string()
    }

    /// Parse-then-serialize self-check: `parse(serialize(O)) == O`.
    /// A development/testing aid, not something the hot path should pay for
    /// on every deploy.
    pub fn validate_roundtrip(&self) -> Result<()> {
        let doc = self.serialize();
        let reparsed = Origin::parse(&doc)?;
        if &reparsed != self {
            return Err(UpgraderError::config(
                "origin failed round-trip validation: parse(serialize(O)) != O",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for BaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseRef::OstreeBranch { remote, refspec } => write!(f, "{remote}:{refspec}"),
            BaseRef::Checksum(c) => write!(f, "{c}"),
            BaseRef::ContainerImage(i) => write!(f, "{i}"),
        }
    }
}

fn kf_set_stringlist(kf: &glib::KeyFile, group: &str, key: &str, values: &BTreeSet<String>) {
    if values.is_empty() {
        return;
    }
    let v: Vec<&str> = values.iter().map(|s| s.as_str()).collect();
    kf.set_string_list(group, key, &v);
}

fn kf_get_stringlist(kf: &glib::KeyFile, group: &str, key: &str) -> BTreeSet<String> {
    kf.string_list(group, key)
        .map(|v| v.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn kf_get_ordered_stringlist(kf: &glib::KeyFile, group: &str, key: &str) -> Vec<String> {
    kf.string_list(group, key)
        .map(|v| v.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn kf_get_opt_string(kf: &glib::KeyFile, group: &str, key: &str) -> Option<String> {
    kf.string(group, key).ok().map(|s| s.to_string())
}

fn kf_get_bool(kf: &glib::KeyFile, group: &str, key: &str) -> bool {
    kf.boolean(group, key).unwrap_or(false)
}

fn origin_to_keyfile(origin: &Origin, kf: &glib::KeyFile) {
    match &origin.base {
        BaseRef::OstreeBranch { remote, refspec } => {
            kf.set_string(ORIGIN, "refspec", &format!("{remote}:{refspec}"));
        }
        BaseRef::Checksum(c) => {
            kf.set_string(ORIGIN, "checksum", c);
        }
        BaseRef::ContainerImage(i) => {
            kf.set_string(ORIGIN, "container-image-reference", i);
        }
    }
    if let Some(oc) = &origin.override_commit {
        kf.set_string(ORIGIN, "override-commit", oc);
    }
    if let Some(s) = &origin.unconfigured_state {
        kf.set_string(ORIGIN, "unconfigured-state", s);
    }
    if let Some(u) = &origin.custom_origin_url {
        kf.set_string(ORIGIN, "custom-url", u);
    }
    if let Some(d) = &origin.custom_origin_description {
        kf.set_string(ORIGIN, "custom-description", d);
    }

    kf_set_stringlist(kf, PACKAGES, "requested", &origin.packages);
    kf_set_stringlist(kf, PACKAGES, "requested-local", &origin.local_packages);
    kf_set_stringlist(
        kf,
        PACKAGES,
        "requested-local-fileoverride",
        &origin.local_fileoverride_packages,
    );

    kf_set_stringlist(kf, OVERRIDES, "remove", &origin.overrides_remove);
    kf_set_stringlist(kf, OVERRIDES, "replace-local", &origin.overrides_replace_local);

    if origin.initramfs_regenerate {
        kf.set_boolean(RPMOSTREE, "initramfs-regenerate", true);
        if !origin.initramfs_args.is_empty() {
            let v: Vec<&str> = origin.initramfs_args.iter().map(|s| s.as_str()).collect();
            kf.set_string_list(RPMOSTREE, "initramfs-args", &v);
        }
    }
    if !origin.initramfs_etc_files.is_empty() {
        kf_set_stringlist(kf, RPMOSTREE, "initramfs-etc", &origin.initramfs_etc_files);
    }
    if origin.cliwrap {
        kf.set_boolean(RPMOSTREE, "cliwrap", true);
    }
}

fn origin_from_keyfile(kf: &glib::KeyFile) -> Result<Origin> {
    let refspec = kf_get_opt_string(kf, ORIGIN, "refspec");
    let checksum = kf_get_opt_string(kf, ORIGIN, "checksum");
    let image = kf_get_opt_string(kf, ORIGIN, "container-image-reference");

    let present = [refspec.is_some(), checksum.is_some(), image.is_some()]
        .iter()
        .filter(|b| **b)
        .count();
    if present == 0 {
        return Err(UpgraderError::config(
            "origin document has no base reference (refspec, checksum, or container image)",
        ));
    }
    if present > 1 {
        return Err(UpgraderError::config(
            "origin document has contradictory base references",
        ));
    }

    let base = if let Some(r) = refspec {
        let (remote, refspec) = r.split_once(':').ok_or_else(|| {
            UpgraderError::config(format!("malformed refspec '{r}': expected 'remote:ref'"))
        })?;
        BaseRef::OstreeBranch {
            remote: remote.to_string(),
            refspec: refspec.to_string(),
        }
    } else if let Some(c) = checksum {
        BaseRef::Checksum(c)
    } else {
        BaseRef::ContainerImage(image.unwrap())
    };

    let override_commit = kf_get_opt_string(kf, ORIGIN, "override-commit");
    if override_commit.is_some() && matches!(base, BaseRef::ContainerImage(_)) {
        return Err(UpgraderError::policy(
            "override_commit is not permitted with a container-image origin",
        ));
    }

    let initramfs_regenerate = kf_get_bool(kf, RPMOSTREE, "initramfs-regenerate");
    let initramfs_etc_files = kf_get_stringlist(kf, RPMOSTREE, "initramfs-etc");
    if initramfs_regenerate && !initramfs_etc_files.is_empty() {
        return Err(UpgraderError::policy(
            "initramfs regeneration is incompatible with tracked /etc overlay files",
        ));
    }

    Ok(Origin {
        base,
        override_commit,
        packages: kf_get_stringlist(kf, PACKAGES, "requested"),
        local_packages: kf_get_stringlist(kf, PACKAGES, "requested-local"),
        local_fileoverride_packages: kf_get_stringlist(kf, PACKAGES, "requested-local-fileoverride"),
        overrides_remove: kf_get_stringlist(kf, OVERRIDES, "remove"),
        overrides_replace_local: kf_get_stringlist(kf, OVERRIDES, "replace-local"),
        initramfs_regenerate,
        initramfs_args: kf_get_ordered_stringlist(kf, RPMOSTREE, "initramfs-args"),
        initramfs_etc_files,
        cliwrap: kf_get_bool(kf, RPMOSTREE, "cliwrap"),
        unconfigured_state: kf_get_opt_string(kf, ORIGIN, "unconfigured-state"),
        custom_origin_url: kf_get_opt_string(kf, ORIGIN, "custom-url"),
        custom_origin_description: kf_get_opt_string(kf, ORIGIN, "custom-description"),
    })
}

/// Diff two origin documents key-by-key, treating keys in
/// [`UNORDERED_LIST_KEYS`] as sets. Used by tests and by introspection
/// tooling to explain *why* two origins aren't equal; not on the hot path.
pub fn kf_diff(a: &Origin, b: &Origin) -> Vec<String> {
    let mut diffs = Vec::new();
    macro_rules! check {
        ($field:ident, $label:expr) => {
            if a.$field != b.$field {
                diffs.push($label.to_string());
            }
        };
    }
    check!(base, "origin/base");
    check!(override_commit, "origin/override-commit");
    check!(packages, "packages/requested");
    check!(local_packages, "packages/requested-local");
    check!(
        local_fileoverride_packages,
        "packages/requested-local-fileoverride"
    );
    check!(overrides_remove, "overrides/remove");
    check!(overrides_replace_local, "overrides/replace-local");
    check!(initramfs_regenerate, "rpmostree/initramfs-regenerate");
    check!(initramfs_args, "rpmostree/initramfs-args");
    check!(initramfs_etc_files, "rpmostree/initramfs-etc");
    check!(cliwrap, "rpmostree/cliwrap");
    check!(unconfigured_state, "origin/unconfigured-state");
    check!(custom_origin_url, "origin/custom-url");
    check!(custom_origin_description, "origin/custom-description");
    diffs
}
