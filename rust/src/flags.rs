//! Flags consumed by the upgrader.

bitflags::bitflags! {
    /// Bitmask of caller-requested behaviors passed to
    /// [`crate::upgrader::Upgrader::deploy`].
    #[derive(Default)]
    pub struct UpgradeFlags: u32 {
        /// Proceed even if origin has `unconfigured_state`.
        const IGNORE_UNCONFIGURED = 0b0000_0001;
        /// Skip timestamp-monotonicity check on base pull.
        const ALLOW_OLDER         = 0b0000_0010;
        /// Print transaction summary, do not write.
        const DRY_RUN             = 0b0000_0100;
        /// Forbid network fetch of rpms during import.
        const PKGCACHE_ONLY       = 0b0000_1000;
        /// Do not contact the ostree remote; use local repo data.
        const SYNTHETIC_PULL      = 0b0001_0000;
    }
}

impl UpgradeFlags {
    pub fn to_pull_flags(self) -> crate::resolver::PullFlags {
        let mut out = crate::resolver::PullFlags::empty();
        if self.contains(UpgradeFlags::ALLOW_OLDER) {
            out |= crate::resolver::PullFlags::ALLOW_OLDER;
        }
        if self.contains(UpgradeFlags::SYNTHETIC_PULL) {
            out |= crate::resolver::PullFlags::SYNTHETIC_PULL;
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pull_flags_project_the_relevant_bits() {
        let flags = UpgradeFlags::ALLOW_OLDER | UpgradeFlags::DRY_RUN;
        let pull = flags.to_pull_flags();
        assert!(pull.contains(crate::resolver::PullFlags::ALLOW_OLDER));
        assert!(!pull.contains(crate::resolver::PullFlags::SYNTHETIC_PULL));
    }
}
