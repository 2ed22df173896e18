//! Operator-requested restart detection via restart files.
//!
//! An application asks for a code reload by touching `restart.txt` in its
//! restart directory, or for a reload on every checkout by creating
//! `always_restart.txt`. The pool tracks the last-seen identity of
//! `restart.txt` per group and tears the group down when it changes.

use crate::options::PoolOptions;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

const RESTART_FILE: &str = "restart.txt";
const ALWAYS_RESTART_FILE: &str = "always_restart.txt";

/// Identity of `restart.txt` as last observed: `None` means absent.
type FileStamp = Option<SystemTime>;

pub(crate) fn resolve_restart_dir(app_root: &Path, options: &PoolOptions) -> PathBuf {
    match &options.restart_dir {
        None => app_root.join("tmp"),
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => app_root.join(dir),
    }
}

fn stamp(path: &Path) -> FileStamp {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Restart check for a group that does not exist yet. There is no witness
/// to compare against, so any restart file counts as a directive.
pub(crate) fn restart_requested(app_root: &Path, options: &PoolOptions) -> bool {
    let dir = resolve_restart_dir(app_root, options);
    dir.join(ALWAYS_RESTART_FILE).exists() || dir.join(RESTART_FILE).exists()
}

/// Last-observed identity of a group's `restart.txt`.
///
/// The witness is recorded when the group is created, so a restart file
/// that predates the group does not retrigger a teardown; only a file that
/// appears or changes afterwards does.
#[derive(Debug)]
pub(crate) struct RestartWitness {
    restart_dir: PathBuf,
    seen: FileStamp,
}

impl RestartWitness {
    pub(crate) fn observe(app_root: &Path, options: &PoolOptions) -> Self {
        let restart_dir = resolve_restart_dir(app_root, options);
        let seen = stamp(&restart_dir.join(RESTART_FILE));
        Self { restart_dir, seen }
    }

    /// True when a restart file demands tearing the group down. Updates
    /// the witness on a negative answer.
    pub(crate) fn check(&mut self) -> bool {
        if self.restart_dir.join(ALWAYS_RESTART_FILE).exists() {
            return true;
        }
        let current = stamp(&self.restart_dir.join(RESTART_FILE));
        match (self.seen, current) {
            (_, None) => {
                self.seen = None;
                false
            }
            (None, Some(_)) => true,
            (Some(seen), Some(current)) => current != seen,
        }
    }
}
