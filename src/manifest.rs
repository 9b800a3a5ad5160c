//! Per-run segment manifest for crash recovery.
//!
//! Every segment start and close of a run is recorded in
//! `{stamp}_manifest.json` next to the video files. If the process dies
//! mid-run, [`recover_interrupted`] validates whatever was still in progress
//! and finalises the manifest on the next start.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::camera::SlotPosition;
use crate::error::RecorderResult;
use crate::pipeline::{validate_segment_file, RunId, SegmentOutcome};

/// Current manifest format version.
pub const CURRENT_MANIFEST_VERSION: u32 = 1;

const MANIFEST_SUFFIX: &str = "_manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentStatus {
    InProgress,
    Complete,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEntry {
    pub path: PathBuf,
    pub slot: SlotPosition,
    pub index: u32,
    pub status: SegmentStatus,
    /// Known once the segment is closed.
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub version: u32,
    pub run_id: RunId,
    pub created_at: DateTime<Local>,
    pub segments: Vec<SegmentEntry>,
    /// Whether the run stopped normally (or was recovered).
    pub is_complete: bool,
}

impl RunManifest {
    pub fn new(run_id: RunId) -> Self {
        Self {
            version: CURRENT_MANIFEST_VERSION,
            run_id,
            created_at: Local::now(),
            segments: Vec::new(),
            is_complete: false,
        }
    }

    pub fn segment_started(&mut self, slot: SlotPosition, index: u32, path: PathBuf) {
        self.segments.push(SegmentEntry {
            path,
            slot,
            index,
            status: SegmentStatus::InProgress,
            file_size: None,
        });
    }

    pub fn segment_closed(&mut self, path: &Path, bytes: u64, kept: bool) {
        let status = if kept {
            SegmentStatus::Complete
        } else {
            SegmentStatus::Deleted
        };
        match self.segments.iter_mut().find(|s| s.path == path) {
            Some(entry) => {
                entry.status = status;
                entry.file_size = Some(bytes);
            },
            None => log::warn!(
                "[MANIFEST] Close for unknown segment {}",
                path.display()
            ),
        }
    }

    /// Forget a segment whose file was removed before it held any frames.
    pub fn segment_discarded(&mut self, path: &Path) {
        self.segments.retain(|s| s.path != path);
    }

    pub fn finalize(&mut self) {
        self.is_complete = true;
    }

    pub fn in_progress(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::InProgress)
    }

    pub fn completed_paths(&self) -> Vec<&Path> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Complete)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// A manifest bound to its file; every change is persisted immediately.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    manifest: RunManifest,
}

impl ManifestWriter {
    pub fn create(dir: &Path, run_id: RunId) -> RecorderResult<Self> {
        std::fs::create_dir_all(dir)?;
        let writer = Self {
            path: dir.join(run_id.manifest_name()),
            manifest: RunManifest::new(run_id),
        };
        writer.persist()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    pub fn segment_started(&mut self, slot: SlotPosition, index: u32, path: PathBuf) {
        self.manifest.segment_started(slot, index, path);
        self.persist_logged();
    }

    pub fn segment_closed(&mut self, path: &Path, bytes: u64, kept: bool) {
        self.manifest.segment_closed(path, bytes, kept);
        self.persist_logged();
    }

    pub fn segment_discarded(&mut self, path: &Path) {
        self.manifest.segment_discarded(path);
        self.persist_logged();
    }

    pub fn finalize(&mut self) {
        self.manifest.finalize();
        self.persist_logged();
    }

    fn persist(&self) -> RecorderResult<()> {
        atomic_write_json(&self.path, &self.manifest)
    }

    fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            log::warn!("[MANIFEST] Failed to write {}: {}", self.path.display(), e);
        }
    }
}

/// Atomically write JSON data to a file.
///
/// Temp file, fsync, rename over the target, then fsync the parent directory.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> RecorderResult<()> {
    use std::io::Write;

    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(data)?;

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn read_manifest(path: &Path) -> RecorderResult<RunManifest> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// What [`recover_interrupted`] did to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredRun {
    pub run_id: RunId,
    pub kept: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Finalise every incomplete manifest in `dir`.
///
/// In-progress segments are validated like a normal close: undersized files
/// are deleted, the rest are kept.
pub fn recover_interrupted(dir: &Path) -> RecorderResult<Vec<RecoveredRun>> {
    let mut recovered = Vec::new();
    if !dir.exists() {
        return Ok(recovered);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
        if !is_manifest {
            continue;
        }

        let mut manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("[MANIFEST] Skipping unreadable {}: {}", path.display(), e);
                continue;
            },
        };
        if manifest.is_complete {
            continue;
        }

        let pending: Vec<PathBuf> = manifest.in_progress().map(|s| s.path.clone()).collect();
        let mut run = RecoveredRun {
            run_id: manifest.run_id,
            kept: Vec::new(),
            deleted: Vec::new(),
        };
        for segment in pending {
            match validate_segment_file(&segment) {
                SegmentOutcome::Kept { path, bytes } => {
                    manifest.segment_closed(&path, bytes, true);
                    run.kept.push(path);
                },
                SegmentOutcome::Deleted { path, bytes } => {
                    manifest.segment_closed(&path, bytes, false);
                    run.deleted.push(path);
                },
            }
        }
        manifest.finalize();
        atomic_write_json(&path, &manifest)?;
        log::info!(
            "[MANIFEST] Recovered interrupted run {}: {} kept, {} deleted",
            run.run_id,
            run.kept.len(),
            run.deleted.len()
        );
        recovered.push(run);
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{segment_file_name, MIN_SEGMENT_BYTES};

    fn run_id() -> RunId {
        RunId::parse("20240102_030405").unwrap()
    }

    #[test]
    fn test_manifest_tracks_segments() {
        let mut manifest = RunManifest::new(run_id());
        manifest.segment_started(SlotPosition::Front, 0, PathBuf::from("a.mp4"));
        manifest.segment_started(SlotPosition::Back, 0, PathBuf::from("b.mp4"));
        manifest.segment_closed(Path::new("a.mp4"), 20_000, true);

        assert_eq!(manifest.completed_paths(), vec![Path::new("a.mp4")]);
        assert_eq!(manifest.in_progress().count(), 1);
        assert_eq!(manifest.segments[0].file_size, Some(20_000));
        assert!(!manifest.is_complete);

        manifest.segment_discarded(Path::new("b.mp4"));
        assert_eq!(manifest.in_progress().count(), 0);
        assert_eq!(manifest.segments.len(), 1);
    }

    #[test]
    fn test_writer_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ManifestWriter::create(dir.path(), run_id()).unwrap();
        writer.segment_started(SlotPosition::Left, 0, dir.path().join("x.mp4"));
        writer.finalize();

        let loaded = read_manifest(writer.path()).unwrap();
        assert!(loaded.is_complete);
        assert_eq!(loaded.run_id, run_id());
        assert_eq!(loaded.segments.len(), 1);
        assert!(!writer.path().with_extension("json.tmp").exists());
        assert_eq!(
            writer.path().file_name().unwrap(),
            "20240102_030405_manifest.json"
        );
    }

    #[test]
    fn test_recover_interrupted_validates_pending() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join(segment_file_name("20240102_030405", SlotPosition::Front));
        let bad = dir.path().join(segment_file_name("20240102_030405", SlotPosition::Back));
        std::fs::write(&good, vec![0u8; MIN_SEGMENT_BYTES as usize]).unwrap();
        std::fs::write(&bad, vec![0u8; 100]).unwrap();

        {
            let mut writer = ManifestWriter::create(dir.path(), run_id()).unwrap();
            writer.segment_started(SlotPosition::Front, 0, good.clone());
            writer.segment_started(SlotPosition::Back, 0, bad.clone());
        }

        let recovered = recover_interrupted(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].kept, vec![good.clone()]);
        assert_eq!(recovered[0].deleted, vec![bad.clone()]);
        assert!(good.exists());
        assert!(!bad.exists());

        let manifest = read_manifest(&dir.path().join(run_id().manifest_name())).unwrap();
        assert!(manifest.is_complete);
        assert_eq!(manifest.in_progress().count(), 0);

        assert!(recover_interrupted(dir.path()).unwrap().is_empty());
    }
}
