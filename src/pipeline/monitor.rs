//! Output file growth tracking.
//!
//! The software pipeline only logs what it sees; the hardware pipeline uses
//! consecutive no-growth checks as its stall watchdog.

use std::path::{Path, PathBuf};

use super::segment::file_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCheck {
    pub bytes: u64,
    pub grown_by: u64,
    /// Consecutive checks without growth, including this one.
    pub stalled_checks: u32,
}

#[derive(Debug)]
pub struct FileSizeMonitor {
    path: PathBuf,
    last_bytes: u64,
    stalled_checks: u32,
    checks: u64,
}

impl FileSizeMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_bytes: 0,
            stalled_checks: 0,
            checks: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follow a new segment file.
    pub fn retarget(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
        self.last_bytes = 0;
        self.stalled_checks = 0;
    }

    pub fn check(&mut self) -> SizeCheck {
        let bytes = file_size(&self.path);
        let grown_by = bytes.saturating_sub(self.last_bytes);
        if grown_by == 0 {
            self.stalled_checks += 1;
        } else {
            self.stalled_checks = 0;
        }
        self.last_bytes = bytes;
        self.checks += 1;
        SizeCheck {
            bytes,
            grown_by,
            stalled_checks: self.stalled_checks,
        }
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}
