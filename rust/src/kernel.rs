//! Kernel/initramfs finalizer, grounded on `rpmostree-kernel.cxx`'s
//! search-and-finalize strategy.

use crate::error::{Result, UpgraderError};
use openssl::sha::Sha256;
use std::path::{Path, PathBuf};

/// Where finalized boot artifacts should be hardlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationPolicy {
    /// Copy only into a destination that already contained a kernel.
    Auto,
    UsrLibOstreeBoot,
    SlashBoot,
}

/// A located kernel, the result of the three-tier search below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLocation {
    pub kver: String,
    pub kernel_path: PathBuf,
    pub found_in: SearchTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTier {
    UsrLibOstreeBoot,
    SlashBoot,
    UsrLibModules,
}

/// Strip a 64-hex-character digest suffix from a kernel version string, as
/// done for kernels discovered under `usr/lib/ostree-boot` or `/boot`.
pub fn strip_digest_suffix(kver: &str) -> &str {
    if let Some((rest, suffix)) = kver.rsplit_once('-') {
        if suffix.len() == 64 && suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return rest;
        }
    }
    kver
}

/// A minimal read-only view over a root filesystem for search purposes,
/// abstracting over `cap_std::fs::Dir`/the real filesystem so searches can
/// be unit-tested without touching disk.
pub trait RootFsView {
    /// Subdirectory names directly under `dir` that contain at least one
    /// `vmlinuz*` entry.
    fn subdirs_with_vmlinuz(&self, dir: &str) -> Result<Vec<String>>;
    fn exists(&self, path: &str) -> bool;
}

/// Search strategy: try `usr/lib/ostree-boot/`, then `/boot`, then the
/// single `usr/lib/modules/<kver>` subdirectory containing a `vmlinuz`.
/// Multiple candidates at a level is an error.
pub fn find_kernel(fs: &dyn RootFsView) -> Result<KernelLocation> {
    for (tier, dir) in [
        (SearchTier::UsrLibOstreeBoot, "usr/lib/ostree-boot"),
        (SearchTier::SlashBoot, "boot"),
    ] {
        if !fs.exists(dir) {
            continue;
        }
        let candidates = fs.subdirs_with_vmlinuz(dir)?;
        match candidates.len() {
            0 => continue,
            1 => {
                let kver = strip_digest_suffix(&candidates[0]).to_string();
                return Ok(KernelLocation {
                    kernel_path: Path::new(dir).join(format!("vmlinuz-{}", candidates[0])),
                    kver,
                    found_in: tier,
                });
            }
            _ => {
                return Err(UpgraderError::resolution(format!(
                    "multiple kernel candidates found under {dir}"
                )))
            }
        }
    }

    let modules_candidates = fs.subdirs_with_vmlinuz("usr/lib/modules")?;
    match modules_candidates.len() {
        0 => Err(UpgraderError::resolution(
            "no kernel found in usr/lib/ostree-boot, /boot, or usr/lib/modules",
        )),
        1 => {
            let kver = modules_candidates[0].clone();
            Ok(KernelLocation {
                kernel_path: Path::new("usr/lib/modules").join(&kver).join("vmlinuz"),
                kver,
                found_in: SearchTier::UsrLibModules,
            })
        }
        _ => Err(UpgraderError::resolution(
            "multiple subdirectories of usr/lib/modules contain a vmlinuz; ambiguous kernel version",
        )),
    }
}

/// `SHA-256(kernel || initramfs)` as a lowercase hex string, used to name
/// the finalized boot artifact pair.
pub fn boot_checksum(kernel: &[u8], initramfs: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kernel);
    hasher.update(initramfs);
    hasher
        .finish()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn vmlinuz_filename(kver: &str, bootcksum: &str) -> String {
    format!("vmlinuz-{kver}-{bootcksum}")
}

pub fn initramfs_filename(kver: &str, bootcksum: &str) -> String {
    format!("initramfs-{kver}.img-{bootcksum}")
}

/// Destinations that [`finalize`] should hardlink the boot-checksum-named
/// pair into, per `destination_policy`.
pub fn finalize_destinations(
    policy: DestinationPolicy,
    usr_lib_ostree_boot_has_kernel: bool,
    slash_boot_has_kernel: bool,
) -> Vec<&'static str> {
    match policy {
        DestinationPolicy::UsrLibOstreeBoot => vec!["usr/lib/ostree-boot"],
        DestinationPolicy::SlashBoot => vec!["boot"],
        DestinationPolicy::Auto => {
            let mut out = Vec::new();
            if usr_lib_ostree_boot_has_kernel {
                out.push("usr/lib/ostree-boot");
            }
            if slash_boot_has_kernel {
                out.push("boot");
            }
            out
        }
    }
}

/// [`RootFsView`] over a real checked-out rootfs, used by assembly once a
/// base (plus any layered packages) has actually been materialized on disk.
pub struct OpenatRootFs<'a>(pub &'a openat::Dir);

impl<'a> RootFsView for OpenatRootFs<'a> {
    fn subdirs_with_vmlinuz(&self, dir: &str) -> Result<Vec<String>> {
        let sub = match self.0.sub_dir(dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpgraderError::io(format!("opening '{dir}': {e}"))),
        };
        let entries = sub
            .list_dir(".")
            .map_err(|e| UpgraderError::io(format!("listing '{dir}': {e}")))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| UpgraderError::io(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let has_vmlinuz = sub
                .sub_dir(name.as_str())
                .ok()
                .and_then(|d| d.list_dir(".").ok())
                .map(|it| {
                    it.filter_map(|e| e.ok())
                        .any(|e| e.file_name().to_string_lossy().starts_with("vmlinuz"))
                })
                .unwrap_or(false);
            if has_vmlinuz {
                out.push(name);
            }
        }
        Ok(out)
    }

    fn exists(&self, path: &str) -> bool {
        self.0.metadata(path).is_ok()
    }
}

/// Depmod/boot artifact filenames to delete when a kernel RPM is replaced
/// as an override. `usr/lib/modules/<kver>/vmlinuz` is deliberately
/// excluded: it remains in place to be overwritten by the new install.
pub fn kernel_removal_artifacts(kver: &str, bootcksum: &str) -> Vec<String> {
    vec![
        format!("usr/lib/modules/{kver}/System.map"),
        format!("usr/lib/modules/{kver}/config"),
        format!("usr/lib/ostree-boot/{}", vmlinuz_filename(kver, bootcksum)),
        format!("usr/lib/ostree-boot/{}", initramfs_filename(kver, bootcksum)),
        format!("boot/{}", vmlinuz_filename(kver, bootcksum)),
        format!("boot/{}", initramfs_filename(kver, bootcksum)),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    struct FakeFs(BTreeMap<String, Vec<String>>);

    impl RootFsView for FakeFs {
        fn subdirs_with_vmlinuz(&self, dir: &str) -> Result<Vec<String>> {
            Ok(self.0.get(dir).cloned().unwrap_or_default())
        }
        fn exists(&self, path: &str) -> bool {
            self.0.contains_key(path)
        }
    }

    #[test]
    fn strips_64_hex_digest_suffix() {
        let digest = "a".repeat(64);
        let kver = format!("5.14.0-1.fc35.x86_64-{digest}");
        assert_eq!(strip_digest_suffix(&kver), "5.14.0-1.fc35.x86_64");
        assert_eq!(strip_digest_suffix("5.14.0-1.fc35.x86_64"), "5.14.0-1.fc35.x86_64");
    }

    #[test]
    fn search_prefers_ostree_boot_over_slash_boot() {
        let mut map = BTreeMap::new();
        map.insert("usr/lib/ostree-boot".to_string(), vec!["5.14.0-1.fc35.x86_64".to_string()]);
        map.insert("boot".to_string(), vec!["5.10.0-1.fc34.x86_64".to_string()]);
        let fs = FakeFs(map);
        let loc = find_kernel(&fs).unwrap();
        assert_eq!(loc.found_in, SearchTier::UsrLibOstreeBoot);
        assert_eq!(loc.kver, "5.14.0-1.fc35.x86_64");
    }

    #[test]
    fn falls_back_to_modules_dir() {
        let mut map = BTreeMap::new();
        map.insert("usr/lib/modules".to_string(), vec!["5.14.0-1.fc35.x86_64".to_string()]);
        let fs = FakeFs(map);
        let loc = find_kernel(&fs).unwrap();
        assert_eq!(loc.found_in, SearchTier::UsrLibModules);
    }

    #[test]
    fn multiple_candidates_is_ambiguous() {
        let mut map = BTreeMap::new();
        map.insert(
            "usr/lib/ostree-boot".to_string(),
            vec!["5.14.0-1.fc35.x86_64".to_string(), "5.10.0-1.fc34.x86_64".to_string()],
        );
        let fs = FakeFs(map);
        assert!(find_kernel(&fs).is_err());
    }

    #[test]
    fn boot_checksum_is_deterministic() {
        let a = boot_checksum(b"kernel-bytes", b"initramfs-bytes");
        let b = boot_checksum(b"kernel-bytes", b"initramfs-bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn auto_policy_only_copies_into_existing_destinations() {
        let dests = finalize_destinations(DestinationPolicy::Auto, true, false);
        assert_eq!(dests, vec!["usr/lib/ostree-boot"]);
    }

    #[test]
    fn removal_artifacts_exclude_modules_vmlinuz() {
        let artifacts = kernel_removal_artifacts("5.14.0-1.fc35.x86_64", "abc123");
        assert!(!artifacts.iter().any(|a| a.ends_with("/vmlinuz")));
        assert!(artifacts.iter().any(|a| a.contains("vmlinuz-5.14.0")));
    }
}
