//! History directory: one file per deployment, filename the ctime of the
//! deployment directory, content the full deployment metadata, plus a
//! pruning pass that folds into pkgcache cleanup.

use crate::deployment::Deployment;
use crate::error::{Result, UpgraderError};
use serde::{Deserialize, Serialize};

/// The full metadata recorded for one deployment at write time, so later
/// introspection doesn't require reading the bootloader config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub osname: String,
    pub base_commit: String,
    pub csum: String,
    pub deployserial: u32,
    pub origin_document: String,
    /// Unix ctime of the deployment directory; also the file's name.
    pub ctime: i64,
}

impl HistoryEntry {
    pub fn from_deployment(dep: &Deployment, ctime: i64) -> Self {
        HistoryEntry {
            osname: dep.osname.clone(),
            base_commit: dep.base_commit.clone(),
            csum: dep.csum.clone(),
            deployserial: dep.deployserial,
            origin_document: dep.origin.serialize(),
            ctime,
        }
    }

    pub fn filename(&self) -> String {
        self.ctime.to_string()
    }
}

/// Append-only history store. A real instance writes one JSON file per
/// entry under a `history/` directory; [`MemoryHistory`] is the in-memory
/// stand-in used by tests.
pub trait HistoryStore: Send + Sync {
    fn record(&self, entry: &HistoryEntry) -> Result<()>;
    fn list(&self) -> Result<Vec<HistoryEntry>>;
    /// Drop entries whose `ctime` predates `keep_since`, as long as no live
    /// deployment still references them. Folded into the pkgcache cleanup
    /// pass rather than run standalone.
    fn prune_older_than(&self, keep_since: i64, live_csums: &[String]) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryHistory {
    entries: std::sync::Mutex<Vec<HistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistory {
    fn record(&self, entry: &HistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.ctime == entry.ctime) {
            return Err(UpgraderError::store(format!(
                "history entry for ctime {} already exists",
                entry.ctime
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.entries.lock().unwrap().clone())
    }

    fn prune_older_than(&self, keep_since: i64, live_csums: &[String]) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.ctime >= keep_since || live_csums.contains(&e.csum));
        Ok(before - entries.len())
    }
}
