//! Tag-scoped read-modify-write of the host-resolution table.

use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use {
    tempfile::NamedTempFile,
    tracing::{debug, info},
};

use crate::error::{Error, Result};

/// Sentinel carried by every line this tool owns. Lines without it are
/// foreign and never touched.
pub const OWNERSHIP_TAG: &str = "# managed by vigil";

/// Address owned entries resolve to.
const LOOPBACK: &str = "127.0.0.1";

/// Handle on a host-resolution table file.
///
/// No enforcement state is cached in memory: the current enforced set is
/// always recovered by re-parsing the file, so external edits and process
/// restarts are picked up. Writes between this process's read and write by
/// other tools are last-writer-wins.
#[derive(Debug, Clone)]
pub struct HostsTable {
    path: PathBuf,
}

impl HostsTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The currently enforced set, recovered by re-parsing owned lines.
    pub fn enforced(&self) -> Result<BTreeSet<String>> {
        let contents = self.read()?;
        Ok(contents
            .lines()
            .filter(|line| line.contains(OWNERSHIP_TAG))
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(str::to_string)
            .collect())
    }

    /// Rewrite the table so its owned entries match `desired` exactly.
    ///
    /// Foreign lines keep their content and relative order; owned lines are
    /// regenerated sorted so repeated runs with the same set are
    /// byte-identical. The whole file is replaced via a temp file and rename
    /// in the same directory, so a failed write leaves the previous
    /// contents untouched. Returns the number of domains now enforced.
    pub fn reconcile(&self, desired: &BTreeSet<String>) -> Result<usize> {
        let contents = self.read()?;

        let mut output = String::with_capacity(contents.len() + desired.len() * 48);
        for line in contents.lines().filter(|l| !l.contains(OWNERSHIP_TAG)) {
            output.push_str(line);
            output.push('\n');
        }
        for domain in desired {
            output.push_str(&format!("{LOOPBACK} {domain} {OWNERSHIP_TAG}\n"));
            debug!(domain = %domain, "blocking domain");
        }

        self.replace(&output)?;
        info!(
            blocked = desired.len(),
            path = %self.path.display(),
            "hosts table updated"
        );
        Ok(desired.len())
    }

    /// Remove every owned entry. Used on all shutdown paths so no block
    /// outlives the process.
    pub fn clear_all(&self) -> Result<()> {
        self.reconcile(&BTreeSet::new()).map(|_| ())
    }

    /// Probe that enforcement can write here, without modifying anything.
    ///
    /// Opens the table for append and creates a scratch file next to it:
    /// the rename-based replace needs both a writable file and a writable
    /// directory.
    pub fn check_writable(&self) -> Result<()> {
        fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::from_io(e, &self.path))?;
        let dir = self.parent_dir()?;
        NamedTempFile::new_in(dir).map_err(|e| Error::from_io(e, &self.path))?;
        Ok(())
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| Error::from_io(e, &self.path))
    }

    fn replace(&self, contents: &str) -> Result<()> {
        let dir = self.parent_dir()?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::from_io(e, &self.path))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| Error::from_io(e, &self.path))?;

        // The rename must not tighten permissions on a world-readable table.
        if let Ok(metadata) = fs::metadata(&self.path) {
            let _ = tmp.as_file().set_permissions(metadata.permissions());
        }

        tmp.persist(&self.path)
            .map_err(|e| Error::from_io(e.error, &self.path))?;
        Ok(())
    }

    fn parent_dir(&self) -> Result<&Path> {
        self.path.parent().ok_or_else(|| Error::Io {
            path: self.path.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "hosts path has no parent directory",
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn table_with(contents: &str) -> (tempfile::TempDir, HostsTable) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, contents).unwrap();
        (dir, HostsTable::new(path))
    }

    fn desired(domains: &[&str]) -> BTreeSet<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn enforced_parses_only_tagged_lines() {
        let (_dir, table) = table_with(
            "127.0.0.1 localhost\n\
             192.168.1.1 router.local\n\
             127.0.0.1 blocked.com # managed by vigil\n",
        );
        assert_eq!(table.enforced().unwrap(), desired(&["blocked.com"]));
    }

    #[test]
    fn reconcile_round_trips_through_enforced() {
        let (_dir, table) = table_with("127.0.0.1 localhost\n");
        let set = desired(&["a.com", "b.com", "c.com"]);
        assert_eq!(table.reconcile(&set).unwrap(), 3);
        assert_eq!(table.enforced().unwrap(), set);
    }

    #[test]
    fn foreign_lines_survive_verbatim_and_in_order() {
        let (_dir, table) = table_with(
            "# This is a comment\n\
             127.0.0.1 localhost\n\
             ::1 localhost\n\
             192.168.1.1 router.local\n",
        );
        table.reconcile(&desired(&["blocked.com"])).unwrap();

        let contents = fs::read_to_string(table.path()).unwrap();
        let foreign: Vec<&str> = contents
            .lines()
            .filter(|l| !l.contains(OWNERSHIP_TAG))
            .collect();
        assert_eq!(foreign, vec![
            "# This is a comment",
            "127.0.0.1 localhost",
            "::1 localhost",
            "192.168.1.1 router.local",
        ]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let (_dir, table) = table_with("127.0.0.1 localhost\n");
        let set = desired(&["a.com", "b.com"]);

        table.reconcile(&set).unwrap();
        let first = fs::read_to_string(table.path()).unwrap();
        table.reconcile(&set).unwrap();
        let second = fs::read_to_string(table.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_owned_entries_are_replaced() {
        // One foreign line plus a stale owned entry for old.com; the new
        // desired set keeps the foreign line and swaps in new.com.
        let (_dir, table) = table_with(
            "192.168.1.1 router.local\n\
             127.0.0.1 old.com # managed by vigil\n",
        );
        table.reconcile(&desired(&["new.com"])).unwrap();

        let contents = fs::read_to_string(table.path()).unwrap();
        assert!(contents.contains("192.168.1.1 router.local"));
        assert!(contents.contains("127.0.0.1 new.com # managed by vigil"));
        assert!(!contents.contains("old.com"));
        assert_eq!(table.enforced().unwrap(), desired(&["new.com"]));
    }

    #[test]
    fn owned_block_is_sorted_for_stable_diffs() {
        let (_dir, table) = table_with("");
        table.reconcile(&desired(&["z.com", "a.com", "m.com"])).unwrap();

        let contents = fs::read_to_string(table.path()).unwrap();
        let owned: Vec<&str> = contents
            .lines()
            .filter(|l| l.contains(OWNERSHIP_TAG))
            .collect();
        assert_eq!(owned, vec![
            "127.0.0.1 a.com # managed by vigil",
            "127.0.0.1 m.com # managed by vigil",
            "127.0.0.1 z.com # managed by vigil",
        ]);
    }

    #[test]
    fn clear_all_leaves_zero_owned_lines() {
        let (_dir, table) = table_with("127.0.0.1 localhost\n");
        table.reconcile(&desired(&["a.com", "b.com"])).unwrap();
        table.clear_all().unwrap();

        assert!(table.enforced().unwrap().is_empty());
        let contents = fs::read_to_string(table.path()).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");
    }

    #[test]
    fn missing_table_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = HostsTable::new(dir.path().join("missing"));

        let err = table.enforced().unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        let err = table.reconcile(&desired(&["a.com"])).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        // Nothing was created by the failed attempts.
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn check_writable_accepts_a_writable_table() {
        let (_dir, table) = table_with("127.0.0.1 localhost\n");
        table.check_writable().unwrap();
        // The probe must not modify the table.
        let contents = fs::read_to_string(table.path()).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");
    }

    #[test]
    fn check_writable_rejects_a_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = HostsTable::new(dir.path().join("missing"));
        assert!(table.check_writable().is_err());
    }

    #[test]
    fn empty_desired_set_on_clean_table_is_a_no_op() {
        let (_dir, table) = table_with("127.0.0.1 localhost\n");
        table.reconcile(&BTreeSet::new()).unwrap();
        let contents = fs::read_to_string(table.path()).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");
    }
}
