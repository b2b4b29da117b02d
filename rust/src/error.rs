//! The error kinds used across the upgrader.
//!
//! These are not an open hierarchy: every fallible operation in this crate
//! ultimately reports one of the kinds below, each carrying a human-readable
//! phase-prefix chain (`"While pulling <ref>: <cause>"`) built up as the error
//! propagates outward.

use std::fmt;

/// The fixed set of error kinds produced by the upgrader.
#[derive(Debug, thiserror::Error)]
pub enum UpgraderError {
    /// Malformed origin, contradictory requests, unknown reference kind.
    #[error("{0}")]
    Config(String),
    /// Request would change live-applied state, unsupported combinations,
    /// unconfigured-state refusal, incompatible flag combinations.
    #[error("{0}")]
    Policy(String),
    /// Unknown ref, inaccessible remote, depsolve failure, ambiguity.
    #[error("{0}")]
    Resolution(String),
    /// Base commit predates current base without `AllowOlder`, HMAC mismatch,
    /// package already installed at identical NEVRA.
    #[error("{0}")]
    Integrity(String),
    /// Checkout, prune, commit, or pull failures at the object-store layer.
    #[error("{0}")]
    Store(String),
    /// Raw filesystem or subprocess failures (hardlinking, directory
    /// creation, reading/writing scratch files, spawning a child process)
    /// that aren't themselves an object-store operation.
    #[error("{0}")]
    Io(String),
    /// Caller-initiated cancellation.
    #[error("operation cancelled")]
    Cancelled,
}

impl UpgraderError {
    pub fn config(msg: impl fmt::Display) -> Self {
        UpgraderError::Config(msg.to_string())
    }
    pub fn policy(msg: impl fmt::Display) -> Self {
        UpgraderError::Policy(msg.to_string())
    }
    pub fn resolution(msg: impl fmt::Display) -> Self {
        UpgraderError::Resolution(msg.to_string())
    }
    pub fn integrity(msg: impl fmt::Display) -> Self {
        UpgraderError::Integrity(msg.to_string())
    }
    pub fn store(msg: impl fmt::Display) -> Self {
        UpgraderError::Store(msg.to_string())
    }
    pub fn io(msg: impl fmt::Display) -> Self {
        UpgraderError::Io(msg.to_string())
    }

    /// Prefix this error with a phase description, producing a
    /// `"While pulling <ref>: <cause>"`-style chain.
    pub fn with_phase(self, phase: impl fmt::Display) -> Self {
        use UpgraderError::*;
        let prefix = |c: String| format!("While {phase}: {c}");
        match self {
            Config(c) => Config(prefix(c)),
            Policy(c) => Policy(prefix(c)),
            Resolution(c) => Resolution(prefix(c)),
            Integrity(c) => Integrity(prefix(c)),
            Store(c) => Store(prefix(c)),
            Io(c) => Io(prefix(c)),
            Cancelled => Cancelled,
        }
    }

    /// True if this error represents a caller-initiated cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UpgraderError::Cancelled)
    }
}

impl From<anyhow::Error> for UpgraderError {
    fn from(e: anyhow::Error) -> Self {
        UpgraderError::Store(format!("{e:#}"))
    }
}

impl From<std::io::Error> for UpgraderError {
    fn from(e: std::io::Error) -> Self {
        UpgraderError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpgraderError>;

/// Extension trait mirroring `fn_error_context::context`'s ergonomics but
/// producing a phase-prefixed [`UpgraderError`] instead of an opaque
/// `anyhow::Error`.
pub trait ResultExt<T> {
    fn phase(self, phase: impl fmt::Display) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<UpgraderError>,
{
    fn phase(self, phase: impl fmt::Display) -> Result<T> {
        self.map_err(|e| e.into().with_phase(phase))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phase_prefix() {
        let e = UpgraderError::resolution("unknown ref 'foo'").with_phase("resolving base");
        assert_eq!(
            e.to_string(),
            "While resolving base: unknown ref 'foo'"
        );
    }

    #[test]
    fn cancelled_has_no_prefix() {
        let e = UpgraderError::Cancelled.with_phase("importing");
        assert!(e.is_cancelled());
        assert_eq!(e.to_string(), "operation cancelled");
    }
}
