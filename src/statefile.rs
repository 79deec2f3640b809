//! Boot-persistent record of an in-progress update.
//!
//! The pending state file exists only between the point an update has been
//! staged and the point the next boot validates it. Storing the bootID of
//! the staging boot lets us detect the pathological case where the reboot
//! never happened, which would otherwise retry and reboot-loop forever.

use anyhow::{Context, Result};
use fs2::FileExt;
use openat_ext::OpenatDirExt;
use thiserror::Error;

use crate::model::PendingState;

/// Top-level directory for daemon state (relative to the root mount).
pub(crate) const STATE_DIR: &str = "etc/machine-config-daemon";
/// On-disk pending state, stored as a single JSON object.
const STATEFILE_NAME: &str = "state.json";
const STATEFILE_PATH: &str = "etc/machine-config-daemon/state.json";
/// Advisory lock around state mutations. The worker is the only writer
/// by construction; the lock guards against a second daemon instance.
const LOCK_NAME: &str = ".state.lock";

/// A pending update whose recorded bootID is still the running boot's:
/// the reboot did not actually occur. Fatal; retrying would loop.
#[derive(Debug, Error)]
#[error("pending config {pending} matches current bootID {boot_id}; reboot failed to occur")]
pub(crate) struct RebootLoopError {
    pub(crate) pending: String,
    pub(crate) boot_id: String,
}

pub(crate) struct StateStore {
    root: openat::Dir,
    boot_id: String,
}

impl StateStore {
    pub(crate) fn new(root: openat::Dir, boot_id: String) -> Self {
        Self { root, boot_id }
    }

    /// Load the name of the pending config, if any. An absent file is not
    /// an error. A stored bootID equal to the current one is.
    pub(crate) fn load_pending(&self) -> Result<Option<String>> {
        let Some(f) = self
            .root
            .open_file_optional(STATEFILE_PATH)
            .with_context(|| format!("opening {STATEFILE_PATH}"))?
        else {
            return Ok(None);
        };
        let bufr = std::io::BufReader::new(f);
        let state: PendingState = serde_json::from_reader(bufr)
            .with_context(|| format!("parsing {STATEFILE_PATH}"))?;
        if state.boot_id == self.boot_id {
            return Err(RebootLoopError {
                pending: state.pending_config,
                boot_id: state.boot_id,
            }
            .into());
        }
        Ok(Some(state.pending_config))
    }

    /// Atomically record `name` as pending, tagged with the current bootID.
    pub(crate) fn write_pending(&self, name: &str) -> Result<()> {
        let state = PendingState {
            pending_config: name.to_string(),
            boot_id: self.boot_id.clone(),
        };
        let _guard = self.lock()?;
        let dir = self.state_dir()?;
        dir.write_file_with(STATEFILE_NAME, 0o644, |w| -> Result<_> {
            Ok(serde_json::to_writer(w, &state)?)
        })
        .with_context(|| format!("writing {STATEFILE_PATH}"))?;
        Ok(())
    }

    /// Remove the pending state; a no-op when it does not exist.
    pub(crate) fn clear(&self) -> Result<()> {
        let _guard = self.lock()?;
        self.root
            .remove_file_optional(STATEFILE_PATH)
            .with_context(|| format!("removing {STATEFILE_PATH}"))?;
        Ok(())
    }

    fn state_dir(&self) -> Result<openat::Dir> {
        self.root
            .ensure_dir_all(STATE_DIR, 0o755)
            .with_context(|| format!("creating {STATE_DIR}"))?;
        self.root
            .sub_dir(STATE_DIR)
            .with_context(|| format!("opening {STATE_DIR}"))
    }

    fn lock(&self) -> Result<std::fs::File> {
        let dir = self.state_dir()?;
        let lockfile = dir
            .update_file(LOCK_NAME, 0o644)
            .context("opening state lock")?;
        lockfile
            .lock_exclusive()
            .context("acquiring state lock")?;
        Ok(lockfile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOT0: &str = "b4305922-7bdc-4228-94ce-0ef5a68e6be5";
    const BOOT1: &str = "9f4a21e2-0ddd-47fc-84f8-10e531b2f774";

    fn store(td: &tempfile::TempDir, boot_id: &str) -> Result<StateStore> {
        Ok(StateStore::new(
            openat::Dir::open(td.path())?,
            boot_id.to_string(),
        ))
    }

    #[test]
    fn test_missing_is_none() -> Result<()> {
        let td = tempfile::tempdir()?;
        assert_eq!(store(&td, BOOT0)?.load_pending()?, None);
        Ok(())
    }

    #[test]
    fn test_roundtrip_across_boots() -> Result<()> {
        let td = tempfile::tempdir()?;
        store(&td, BOOT0)?.write_pending("worker-5f6d2c8e")?;
        // Next boot sees the pending config
        let next = store(&td, BOOT1)?;
        assert_eq!(next.load_pending()?.as_deref(), Some("worker-5f6d2c8e"));
        next.clear()?;
        assert_eq!(next.load_pending()?, None);
        // Clearing twice is fine
        next.clear()?;
        Ok(())
    }

    #[test]
    fn test_reboot_loop_guard() -> Result<()> {
        let td = tempfile::tempdir()?;
        let s = store(&td, BOOT0)?;
        s.write_pending("worker-5f6d2c8e")?;
        // Same boot: the reboot did not happen
        let err = s.load_pending().unwrap_err();
        assert!(err.downcast_ref::<RebootLoopError>().is_some());
        Ok(())
    }

    #[test]
    fn test_garbage_statefile() -> Result<()> {
        let td = tempfile::tempdir()?;
        let s = store(&td, BOOT0)?;
        std::fs::create_dir_all(td.path().join(STATE_DIR))?;
        std::fs::write(td.path().join(STATEFILE_PATH), "not json")?;
        assert!(s.load_pending().is_err());
        Ok(())
    }
}
