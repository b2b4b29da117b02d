//! Package reference model.
//!
//! Canonical NEVRA handling, cache-branch naming (a reversible encoding of
//! `(type, name, evr, arch)` under `rpmostree/pkg/...`), and the linear
//! package-list diff used to decide whether a layered commit needs
//! rebuilding. The escaping scheme and diff algorithm are grounded byte-for-
//! byte on `rpmostree-util.c`/`rpmostree-package.c` and their test fixtures
//! in `tests/check/cache_branch_to_nevra.c`.

use crate::error::{Result, UpgraderError};
use once_cell::sync::Lazy;
use openssl::sha::Sha256;
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

/// Valid rpm arch tokens: alphanumerics plus `_`, matching what appears
/// after the final `.` in a NEVRA and in cache-branch component escaping.
static ARCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").unwrap());

/// `(name, epoch, version, release, arch)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nevra {
    pub name: String,
    /// `None` and `Some(0)` both render without an epoch prefix.
    pub epoch: Option<u64>,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nevra {
    pub fn new(
        name: impl Into<String>,
        epoch: Option<u64>,
        version: impl Into<String>,
        release: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Nevra {
            name: name.into(),
            epoch,
            version: version.into(),
            release: release.into(),
            arch: arch.into(),
        }
    }

    /// `epoch:version-release`, omitting the epoch when it's `0`/unset.
    pub fn evr(&self) -> String {
        match self.epoch {
            Some(e) if e > 0 => format!("{e}:{}-{}", self.version, self.release),
            _ => format!("{}-{}", self.version, self.release),
        }
    }

    /// Full `name-epoch:version-release.arch` rendering.
    pub fn nevra(&self) -> String {
        format!("{}-{}.{}", self.name, self.evr(), self.arch)
    }

    /// Parse a `name-[epoch:]version-release.arch` string, as produced by
    /// [`Nevra::nevra`] or by `cache_branch_to_nevra`.
    pub fn parse(s: &str) -> Result<Nevra> {
        let (rest, arch) = s
            .rsplit_once('.')
            .ok_or_else(|| UpgraderError::config(format!("invalid nevra '{s}': missing arch")))?;
        if !ARCH_RE.is_match(arch) {
            return Err(UpgraderError::config(format!(
                "invalid nevra '{s}': malformed arch '{arch}'"
            )));
        }
        // rest = name-[epoch:]version-release; release is the last '-' component,
        // version (possibly epoch-prefixed) is the one before that.
        let (name_version, release) = rest
            .rsplit_once('-')
            .ok_or_else(|| UpgraderError::config(format!("invalid nevra '{s}': missing release")))?;
        let (name, version_part) = name_version
            .rsplit_once('-')
            .ok_or_else(|| UpgraderError::config(format!("invalid nevra '{s}': missing version")))?;
        let (epoch, version) = match version_part.split_once(':') {
            Some((e, v)) => (
                Some(e.parse::<u64>().map_err(|_| {
                    UpgraderError::config(format!("invalid nevra '{s}': bad epoch '{e}'"))
                })?),
                v,
            ),
            None => (None, version_part),
        };
        Ok(Nevra::new(name, epoch, version, release, arch))
    }

    /// rpmvercmp-style ordering restricted to the EVR portion, used by
    /// [`diff_package_lists`]. A full rpm version comparator treats runs of
    /// digits and runs of letters as separately-ordered segments; this is a
    /// faithful but minimal reimplementation sufficient for our diff
    /// purposes (it does not need to match rpm's tilde/caret release
    /// qualifiers beyond straightforward numeric/alpha segment comparison).
    pub fn evr_cmp(&self, other: &Nevra) -> Ordering {
        rpmvercmp(&self.evr(), &other.evr())
    }
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nevra())
    }
}

/// A minimal `rpmvercmp` reimplementation: split into alternating
/// digit/non-digit segments and compare segment-wise, numerically when both
/// segments are numeric, lexicographically otherwise. Missing trailing
/// segments sort before present ones.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    fn segments(s: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let bytes = s.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let start = i;
            let is_digit = bytes[i].is_ascii_digit();
            while i < bytes.len() && bytes[i].is_ascii_digit() == is_digit {
                i += 1;
            }
            out.push(&s[start..i]);
        }
        out
    }
    let (sa, sb) = (segments(a), segments(b));
    for i in 0..sa.len().max(sb.len()) {
        match (sa.get(i), sb.get(i)) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let cmp = match (
                    x.chars().next().map(|c| c.is_ascii_digit()),
                    y.chars().next().map(|c| c.is_ascii_digit()),
                ) {
                    (Some(true), Some(true)) => {
                        let xn: u128 = x.trim_start_matches('0').parse().unwrap_or(0);
                        let yn: u128 = y.trim_start_matches('0').parse().unwrap_or(0);
                        xn.cmp(&yn)
                    }
                    _ => x.cmp(y),
                };
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
        }
    }
    Ordering::Equal
}

/// Escape a single byte per the cache-branch scheme: bytes outside
/// `[A-Za-z0-9.-]` become `_HH` (uppercase hex); literal `_` doubles.
fn escape_cache_branch_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'_' => out.push_str("__"),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("_{b:02X}")),
        }
    }
    out
}

fn unescape_cache_branch_component(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                if bytes.get(i + 1) == Some(&b'_') {
                    out.push(b'_');
                    i += 2;
                } else if i + 2 < bytes.len() {
                    let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                        .map_err(|_| UpgraderError::config("invalid cache branch escape"))?;
                    let byte = u8::from_str_radix(hex, 16)
                        .map_err(|_| UpgraderError::config("invalid cache branch escape"))?;
                    out.push(byte);
                    i += 3;
                } else {
                    return Err(UpgraderError::config("truncated cache branch escape"));
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| UpgraderError::config("invalid utf-8 in cache branch"))
}

/// `rpmostree/pkg/<name>/<evr>.<arch>`, with a leading `0:` in the EVR
/// stripped before encoding (so `epoch=0` and unset epoch are indistinguishable,
/// matching [`Nevra::evr`]).
pub fn nevra_to_cache_branch(n: &Nevra) -> String {
    let evr = n.evr();
    format!(
        "rpmostree/pkg/{}/{}.{}",
        escape_cache_branch_component(&n.name),
        escape_cache_branch_component(&evr),
        escape_cache_branch_component(&n.arch)
    )
}

/// Inverse of [`nevra_to_cache_branch`].
pub fn cache_branch_to_nevra(branch: &str) -> Result<Nevra> {
    let rest = branch
        .strip_prefix("rpmostree/pkg/")
        .ok_or_else(|| UpgraderError::config(format!("not a pkgcache branch: {branch}")))?;
    let mut parts = rest.splitn(2, '/');
    let name = parts
        .next()
        .ok_or_else(|| UpgraderError::config("missing name component"))?;
    let evr_arch = parts
        .next()
        .ok_or_else(|| UpgraderError::config("missing evr.arch component"))?;
    let (evr, arch) = evr_arch
        .rsplit_once('.')
        .ok_or_else(|| UpgraderError::config("missing arch component"))?;
    let name = unescape_cache_branch_component(name)?;
    let evr = unescape_cache_branch_component(evr)?;
    let arch = unescape_cache_branch_component(arch)?;
    // evr is either "version-release" or "epoch:version-release"
    let (epoch, vr) = match evr.split_once(':') {
        Some((e, vr)) => (
            Some(e.parse::<u64>().map_err(|_| {
                UpgraderError::config(format!("invalid epoch in cache branch evr '{evr}'"))
            })?),
            vr,
        ),
        None => (None, evr.as_str()),
    };
    let (version, release) = vr
        .rsplit_once('-')
        .ok_or_else(|| UpgraderError::config(format!("invalid evr '{evr}': missing release")))?;
    Ok(Nevra::new(name, epoch, version, release, arch))
}

/// `rpmostree/base/{n}` refs pin the base commit of every layered
/// deployment so the object store's own GC can't reap it.
pub fn base_ref_name(index: usize) -> String {
    format!("rpmostree/base/{index}")
}

pub const TMP_BASE_REF: &str = "rpmostree/base/tmp";

/// Result of a three-way merge over two name-sorted package lists (spec
/// §4.2 / §8): the sets are mutually disjoint, and `|common| + |unique_a| +
/// |modified| == |a|` (symmetrically for `b`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageListDiff {
    pub unique_a: Vec<Nevra>,
    pub unique_b: Vec<Nevra>,
    pub modified_a: Vec<Nevra>,
    pub modified_b: Vec<Nevra>,
    pub common: Vec<Nevra>,
}

/// `comm(1)`-like merge of two package lists, sorted by `name`. Packages
/// with the same name but different arches are multilib unless *exactly*
/// one instance of that name exists on each side, in which case an arch
/// change is reported as a modification (matching yum/dnf UX); this mirrors
/// `_rpm_ostree_diff_package_lists`'s `next_pkg_has_different_name`
/// lookahead.
///
/// Callers must pass lists pre-sorted by `name` (ties broken by `arch`);
/// this function does not sort internally, keeping the merge O(n+m).
pub fn diff_package_lists(a: &[Nevra], b: &[Nevra]) -> PackageListDiff {
    let mut diff = PackageListDiff::default();
    let (mut ia, mut ib) = (0usize, 0usize);

    let next_has_different_name = |list: &[Nevra], name: &str, cur: usize| -> bool {
        match list.get(cur + 1) {
            Some(p) => p.name != name,
            None => true,
        }
    };

    while ia < a.len() && ib < b.len() {
        let (pa, pb) = (&a[ia], &b[ib]);
        match pa.name.cmp(&pb.name) {
            Ordering::Less => {
                diff.unique_a.push(pa.clone());
                ia += 1;
            }
            Ordering::Greater => {
                diff.unique_b.push(pb.clone());
                ib += 1;
            }
            Ordering::Equal => match pa.arch.cmp(&pb.arch) {
                Ordering::Equal => {
                    if pa.evr_cmp(pb) == Ordering::Equal {
                        diff.common.push(pa.clone());
                    } else {
                        diff.modified_a.push(pa.clone());
                        diff.modified_b.push(pb.clone());
                    }
                    ia += 1;
                    ib += 1;
                }
                arch_cmp => {
                    let single_a = next_has_different_name(a, &pa.name, ia);
                    let single_b = next_has_different_name(b, &pb.name, ib);
                    if single_a && single_b {
                        diff.modified_a.push(pa.clone());
                        diff.modified_b.push(pb.clone());
                        ia += 1;
                        ib += 1;
                    } else if arch_cmp == Ordering::Less {
                        diff.unique_a.push(pa.clone());
                        ia += 1;
                    } else {
                        diff.unique_b.push(pb.clone());
                        ib += 1;
                    }
                }
            },
        }
    }
    diff.unique_a.extend_from_slice(&a[ia..]);
    diff.unique_b.extend_from_slice(&b[ib..]);
    diff
}

/// SHA-256 over the concatenation of canonical `epoch:name-version-release.arch`
/// strings of a stably-sorted package list; used as an rpmdb version
/// identifier.
pub fn package_list_checksum(list: &[Nevra]) -> String {
    let mut sorted: Vec<&Nevra> = list.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.arch.cmp(&b.arch)));
    let mut hasher = Sha256::new();
    for n in sorted {
        hasher.update(n.nevra().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finish())
}

/// Minimal local hex encoder so we don't pull in the `hex` crate solely for
/// this one call site; kept private to the module.
mod hex {
    pub fn encode(bytes: [u8; 32]) -> String {
        let mut s = String::with_capacity(64);
        for b in bytes {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn evr_rendering_skips_zero_epoch() {
        let n = Nevra::new("foo", Some(0), "1.0", "1", "x86_64");
        assert_eq!(n.evr(), "1.0-1");
        assert_eq!(n.nevra(), "foo-1.0-1.x86_64");
        let n2 = Nevra::new("foo", None, "1.0", "1", "x86_64");
        assert_eq!(n2.evr(), n.evr());
    }

    #[test]
    fn evr_rendering_keeps_nonzero_epoch() {
        let n = Nevra::new("perl", Some(4), "5.16.3", "291.el7", "x86_64");
        assert_eq!(n.nevra(), "perl-4:5.16.3-291.el7.x86_64");
    }

    // Fixtures lifted verbatim from tests/check/cache_branch_to_nevra.c.
    #[test]
    fn cache_branch_roundtrip_fixtures() {
        let fixtures = [
            ("rpmostree/pkg/foo/1.0-1.x86__64", "foo-1.0-1.x86_64"),
            (
                "rpmostree/pkg/git/1.8.3.1-6.el7__2.1.x86__64",
                "git-1.8.3.1-6.el7_2.1.x86_64",
            ),
            (
                "rpmostree/pkg/perl/4_3A5.16.3-291.el7.x86__64",
                "perl-4:5.16.3-291.el7.x86_64",
            ),
            (
                "rpmostree/pkg/perl-Error/1_3A0.17020-2.el7.noarch",
                "perl-Error-1:0.17020-2.el7.noarch",
            ),
            (
                "rpmostree/pkg/vim-common/2_3A7.4.160-1.el7__3.1.x86__64",
                "vim-common-2:7.4.160-1.el7_3.1.x86_64",
            ),
        ];
        for (branch, expected_nevra) in fixtures {
            let n = cache_branch_to_nevra(branch).unwrap();
            assert_eq!(n.nevra(), expected_nevra, "branch={branch}");
            assert_eq!(nevra_to_cache_branch(&n), branch, "nevra={expected_nevra}");
        }
    }

    #[test]
    fn diff_disjoint_and_counts_match() {
        let a = vec![
            Nevra::new("bash", None, "5.0", "1", "x86_64"),
            Nevra::new("git", None, "2.30", "1", "x86_64"),
            Nevra::new("vim", None, "8.0", "1", "x86_64"),
        ];
        let b = vec![
            Nevra::new("bash", None, "5.1", "1", "x86_64"),
            Nevra::new("fish", None, "3.0", "1", "x86_64"),
            Nevra::new("vim", None, "8.0", "1", "x86_64"),
        ];
        let d = diff_package_lists(&a, &b);
        assert_eq!(d.unique_a, vec![Nevra::new("git", None, "2.30", "1", "x86_64")]);
        assert_eq!(d.unique_b, vec![Nevra::new("fish", None, "3.0", "1", "x86_64")]);
        assert_eq!(d.modified_a, vec![Nevra::new("bash", None, "5.0", "1", "x86_64")]);
        assert_eq!(d.modified_b, vec![Nevra::new("bash", None, "5.1", "1", "x86_64")]);
        assert_eq!(d.common, vec![Nevra::new("vim", None, "8.0", "1", "x86_64")]);

        assert_eq!(d.common.len() + d.unique_a.len() + d.modified_a.len(), a.len());
        assert_eq!(d.common.len() + d.unique_b.len() + d.modified_b.len(), b.len());
    }

    #[test]
    fn diff_single_arch_change_is_modification() {
        let a = vec![Nevra::new("foo", None, "1.0", "1", "x86_64")];
        let b = vec![Nevra::new("foo", None, "1.0", "1", "noarch")];
        let d = diff_package_lists(&a, &b);
        assert_eq!(d.modified_a, a);
        assert_eq!(d.modified_b, b);
        assert!(d.unique_a.is_empty() && d.unique_b.is_empty());
    }

    #[test]
    fn diff_multilib_arch_changes_are_unique_not_modified() {
        let a = vec![
            Nevra::new("foo", None, "1.0", "1", "i686"),
            Nevra::new("foo", None, "1.0", "1", "x86_64"),
        ];
        let b = vec![Nevra::new("foo", None, "1.0", "1", "x86_64")];
        let d = diff_package_lists(&a, &b);
        assert_eq!(d.unique_a, vec![Nevra::new("foo", None, "1.0", "1", "i686")]);
        assert_eq!(d.common, vec![Nevra::new("foo", None, "1.0", "1", "x86_64")]);
        assert!(d.modified_a.is_empty() && d.modified_b.is_empty());
    }

    #[test]
    fn checksum_is_order_independent() {
        let a = vec![
            Nevra::new("b", None, "1", "1", "x86_64"),
            Nevra::new("a", None, "1", "1", "x86_64"),
        ];
        let b = vec![
            Nevra::new("a", None, "1", "1", "x86_64"),
            Nevra::new("b", None, "1", "1", "x86_64"),
        ];
        assert_eq!(package_list_checksum(&a), package_list_checksum(&b));
    }
}
