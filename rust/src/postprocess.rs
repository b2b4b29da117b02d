/*
 * Copyright (C) 2018 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 *
 */

//! Filesystem-tree post-processing run as step 3 of assembly: canonicalize
//! rpmdb layout, write tmpfiles snippets for /var, produce passwd/group
//! migration, and so on.
//!
//! Adapted from the original compose-side postprocessing pass: the
//! individual fixups (`useradd` HOME rewriting, ostree-remount presets, the
//! rpmdb-location macro, SELinux subs_dist, and nsswitch altfiles
//! injection) are unchanged in substance, just re-targeted at a real
//! `openat::Dir` rootfs handle instead of an FFI `i32` fd, since this crate
//! has no C core to bridge to. The treefile-driven sandboxed
//! postprocess-script and add-files steps have no counterpart in this
//! model's origin descriptor and are dropped.

use crate::error::{Result, UpgraderError};
use anyhow::Result as AResult;
use openat_ext::OpenatDirExt;
use rayon::prelude::*;
use std::io::{BufRead, Write};
use std::path::Path;
use std::{borrow::Cow, io};

const RPMOSTREE_RPMDB_LOCATION: &str = "usr/share/rpm";

/// rpm-ostree uses `/home` → `/var/home` by default; fix up `useradd`'s
/// default `HOME=` so `~` resolves as expected in shells.
fn postprocess_useradd(rootfs_dfd: &openat::Dir) -> AResult<()> {
    let path = Path::new("usr/etc/default/useradd");
    if let Some(f) = rootfs_dfd.open_file_optional(path)? {
        rootfs_dfd.write_file_with(&path, 0o644, |bufw| -> AResult<_> {
            let f = io::BufReader::new(&f);
            for line in f.lines() {
                let line = line?;
                if !line.starts_with("HOME=") {
                    bufw.write_all(line.as_bytes())?;
                } else {
                    bufw.write_all(b"HOME=/var/home")?;
                }
                bufw.write_all(b"\n")?;
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Ensure `ostree-remount.service`/`ostree-finalize-staged.path` are
/// enabled regardless of whether the package's own presets landed right.
fn postprocess_presets(rootfs_dfd: &openat::Dir) -> AResult<()> {
    let wantsdir = "usr/lib/systemd/system/multi-user.target.wants";
    rootfs_dfd.ensure_dir_all(wantsdir, 0o755)?;
    for service in &["ostree-remount.service", "ostree-finalize-staged.path"] {
        let target = format!("../{service}");
        let loc = Path::new(wantsdir).join(service);
        rootfs_dfd.symlink(&loc, target)?;
    }
    Ok(())
}

/// Pin the rpmdb location rpm macro to the canonicalized in-tree path.
fn postprocess_rpm_macro(rootfs_dfd: &openat::Dir) -> AResult<()> {
    let rpm_macros_dir = "usr/lib/rpm/macros.d";
    rootfs_dfd.ensure_dir_all(rpm_macros_dir, 0o755)?;
    let rpm_macros_dfd = rootfs_dfd.sub_dir(rpm_macros_dir)?;
    rpm_macros_dfd.write_file_with("macros.rpm-ostree", 0o644, |w| -> AResult<()> {
        w.write_all(b"%_dbpath /")?;
        w.write_all(RPMOSTREE_RPMDB_LOCATION.as_bytes())?;
        Ok(())
    })?;
    Ok(())
}

/// Make sure there is a `/home` → `/var/home` substitution rule, and that
/// there isn't a `/var/home` → `/home` one.
fn postprocess_subs_dist(rootfs_dfd: &openat::Dir) -> AResult<()> {
    let path = Path::new("usr/etc/selinux/targeted/contexts/files/file_contexts.subs_dist");
    if let Some(f) = rootfs_dfd.open_file_optional(path)? {
        rootfs_dfd.write_file_with(&path, 0o644, |w| -> AResult<()> {
            let f = io::BufReader::new(&f);
            for line in f.lines() {
                let line = line?;
                if line.starts_with("/var/home ") {
                    w.write_all(b"# superseded by a direct /home -> /var/home rule below\n")?;
                    w.write_all(b"# ")?;
                }
                w.write_all(line.as_bytes())?;
                w.write_all(b"\n")?;
            }
            w.write_all(b"/home /var/home\n")?;
            Ok(())
        })?;
    }
    Ok(())
}

/// Run all four rootfs fixups in parallel.
pub fn postprocess_final(rootfs_dfd: &openat::Dir) -> Result<()> {
    let tasks: [fn(&openat::Dir) -> AResult<()>; 4] = [
        postprocess_useradd,
        postprocess_presets,
        postprocess_subs_dist,
        postprocess_rpm_macro,
    ];
    tasks
        .par_iter()
        .try_for_each(|f| f(rootfs_dfd))
        .map_err(|e| UpgraderError::store(format!("{e:#}")))
}

/// Given a string and a set of possible prefixes, return the split prefix
/// and remaining string, or `None` if no matches.
fn strip_any_prefix<'a, 'b>(s: &'a str, prefixes: &[&'b str]) -> Option<(&'b str, &'a str)> {
    prefixes.iter().find_map(|&p| s.strip_prefix(p).map(|r| (p, r)))
}

/// Inject `altfiles` after `files` for `passwd:`/`group:` lines. If any such
/// line already names `altfiles`, the buffer is returned unmodified (the
/// whole file is assumed already migrated).
fn add_altfiles(buf: &str) -> String {
    let mut r = String::with_capacity(buf.len());
    for line in buf.lines() {
        let (prefix, rest) = match strip_any_prefix(line, &["passwd:", "group:"]) {
            Some(p) => p,
            None => {
                r.push_str(line);
                r.push('\n');
                continue;
            }
        };
        r.push_str(prefix);

        let mut inserted = false;
        for elt in rest.split_whitespace() {
            if elt == "altfiles" {
                return buf.to_string();
            }
            if !inserted && elt == "files" {
                r.push_str(" files altfiles");
                inserted = true;
            } else {
                r.push(' ');
                r.push_str(elt);
            }
        }
        if !inserted {
            r.push_str(" altfiles");
        }
        r.push('\n');
    }
    r
}

/// rpm-ostree depends on `altfiles`; ensure `/etc/nsswitch.conf` names it.
pub fn nsswitch_altfiles(rootfs_dfd: &openat::Dir) -> Result<()> {
    let path = "usr/etc/nsswitch.conf";
    let nsswitch = {
        let mut f = rootfs_dfd
            .open_file(path)
            .map_err(|e| UpgraderError::store(format!("opening {path}: {e}")))?;
        use std::io::Read;
        let mut buf = String::new();
        f.read_to_string(&mut buf)
            .map_err(|e| UpgraderError::store(e.to_string()))?;
        buf
    };
    let nsswitch = add_altfiles(&nsswitch);
    rootfs_dfd
        .write_file_contents(path, 0o644, nsswitch.as_bytes())
        .map_err(|e| UpgraderError::store(format!("writing {path}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stripany() {
        let s = "foo: bar";
        assert!(strip_any_prefix(s, &[]).is_none());
        assert_eq!(strip_any_prefix(s, &["baz:", "foo:", "bar:"]).unwrap(), ("foo:", " bar"));
    }

    #[test]
    fn altfiles_replaced() {
        let orig = r##"# blah blah nss stuff
# more blah blah

# passwd: db files
# shadow: db files
# shadow: db files

passwd:     sss files systemd
shadow:     files
group:      sss files systemd
hosts:      files resolve [!UNAVAIL=return] myhostname dns
automount:  files sss
"##;
        let expected = r##"# blah blah nss stuff
# more blah blah

# passwd: db files
# shadow: db files
# shadow: db files

passwd: sss files altfiles systemd
shadow:     files
group: sss files altfiles systemd
hosts:      files resolve [!UNAVAIL=return] myhostname dns
automount:  files sss
"##;
        let replaced = add_altfiles(orig);
        assert_eq!(replaced.as_str(), expected);
        let replaced2 = add_altfiles(replaced.as_str());
        assert_eq!(replaced2.as_str(), expected);
    }
}
