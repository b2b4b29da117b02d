//! Base checkout subroutine: hardlink a base commit's content into a
//! private scratch directory before assembly, caching already-linked
//! (device, inode) pairs so the same content object backing multiple rpmdb
//! entries is only linked once.

use crate::error::{Result, UpgraderError};
use camino::Utf8PathBuf;
use cap_std::fs::Dir;
use fn_error_context::context;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;

/// Identifies a unique on-disk content object by (device, inode), used to
/// detect when two checkout entries are hardlinks of the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevIno {
    pub dev: u64,
    pub ino: u64,
}

impl DevIno {
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        DevIno {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// One file to materialize in the checkout.
#[derive(Debug, Clone)]
pub struct CheckoutEntry {
    pub relpath: Utf8PathBuf,
    pub source: Utf8PathBuf,
}

/// A private, freshly-created checkout scratch directory, plus the
/// content-id cache used to dedupe hardlinks performed into it.
pub struct Checkout {
    root: Dir,
    path: Utf8PathBuf,
    seen: HashMap<DevIno, Utf8PathBuf>,
}

impl Checkout {
    /// Open (and privatize) a scratch directory at `path`, which the caller
    /// has already created fresh (e.g. via `tempfile::TempDir::new_in`
    /// under the sysroot's tmp). Mode 0700: the checkout may contain
    /// root-owned content with no execute bit for other users.
    #[context("opening checkout scratch directory '{path}'")]
    pub fn open(path: Utf8PathBuf) -> Result<Self> {
        let root = Dir::open_ambient_dir(path.as_std_path(), cap_std::ambient_authority())
            .map_err(|e| UpgraderError::io(format!("opening checkout dir '{path}': {e}")))?;
        set_private_mode(&root)?;
        Ok(Checkout {
            root,
            path,
            seen: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }

    /// Hardlink `entries` into the checkout. Returns the count of distinct
    /// content objects actually linked (vs. reused from the cache).
    pub fn link_entries(&mut self, entries: &[CheckoutEntry]) -> Result<usize> {
        let mut linked = 0usize;
        for entry in entries {
            if let Some(parent) = entry.relpath.parent() {
                if !parent.as_str().is_empty() {
                    self.root.create_dir_all(parent).map_err(|e| {
                        UpgraderError::io(format!("creating checkout directory '{parent}': {e}"))
                    })?;
                }
            }

            let meta = std::fs::symlink_metadata(entry.source.as_std_path())
                .map_err(|e| UpgraderError::io(format!("stat '{}': {e}", entry.source)))?;
            let key = DevIno::from_metadata(&meta);

            let target = self.path.join(&entry.relpath);
            if let Some(existing_rel) = self.seen.get(&key) {
                let existing = self.path.join(existing_rel);
                std::fs::hard_link(existing.as_std_path(), target.as_std_path()).map_err(|e| {
                    UpgraderError::io(format!(
                        "hardlinking already-checked-out '{existing}' to '{target}': {e}"
                    ))
                })?;
                continue;
            }

            std::fs::hard_link(entry.source.as_std_path(), target.as_std_path()).map_err(|e| {
                UpgraderError::io(format!(
                    "hardlinking '{}' to '{target}': {e}",
                    entry.source
                ))
            })?;
            self.seen.insert(key, entry.relpath.clone());
            linked += 1;
        }
        Ok(linked)
    }
}

fn set_private_mode(dir: &Dir) -> Result<()> {
    use rustix::fs::{fchmod, Mode};
    fchmod(dir, Mode::from_raw_mode(0o700))
        .map_err(|e| UpgraderError::io(format!("chmod 0700 on checkout directory: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_content_object_is_linked_once() {
        let scratch = tempfile::TempDir::new().unwrap();
        let checkout_path = Utf8PathBuf::from_path_buf(scratch.path().join("co")).unwrap();
        std::fs::create_dir(&checkout_path).unwrap();

        let src_dir = tempfile::TempDir::new().unwrap();
        let src_file = src_dir.path().join("shared");
        std::fs::write(&src_file, b"payload").unwrap();
        let src = Utf8PathBuf::from_path_buf(src_file).unwrap();

        let mut co = Checkout::open(checkout_path).unwrap();
        let entries = vec![
            CheckoutEntry {
                relpath: Utf8PathBuf::from("usr/bin/a"),
                source: src.clone(),
            },
            CheckoutEntry {
                relpath: Utf8PathBuf::from("usr/bin/b"),
                source: src,
            },
        ];
        let linked = co.link_entries(&entries).unwrap();
        assert_eq!(linked, 1);

        let meta_a = std::fs::metadata(co.path().join("usr/bin/a")).unwrap();
        let meta_b = std::fs::metadata(co.path().join("usr/bin/b")).unwrap();
        assert_eq!(meta_a.ino(), meta_b.ino());
    }
}
