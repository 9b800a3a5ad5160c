//! Observer events published by the coordinator.
//!
//! Serialized with a `type` tag so hosts can forward them verbatim as JSON.

use std::path::PathBuf;

use serde::Serialize;

use crate::camera::SlotPosition;
use crate::media::FrameSize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RecorderEvent {
    CameraOpened {
        slot: SlotPosition,
    },
    /// Used by hosts to fit the preview aspect ratio.
    PreviewSizeChosen {
        slot: SlotPosition,
        width: u32,
        height: u32,
    },
    CameraConfigured {
        slot: SlotPosition,
        recording: bool,
    },
    CameraClosed {
        slot: SlotPosition,
    },
    CameraError {
        slot: SlotPosition,
        code: i32,
        message: String,
        reconnecting: bool,
    },
    RecordingStarted {
        #[serde(rename = "runId")]
        run_id: String,
        slots: Vec<SlotPosition>,
    },
    /// A camera joined a run after the start barrier had already resolved.
    RecordingJoined {
        slot: SlotPosition,
    },
    RecordingError {
        message: String,
    },
    SegmentSwitched {
        slot: SlotPosition,
        #[serde(rename = "completedFile")]
        completed_file: Option<PathBuf>,
        #[serde(rename = "newIndex")]
        new_index: u32,
    },
    CorruptedFilesDeleted {
        slot: SlotPosition,
        files: Vec<String>,
    },
    PipelineError {
        slot: SlotPosition,
        message: String,
        recovering: bool,
    },
    PipelineRecovered {
        slot: SlotPosition,
        attempts: u32,
    },
    RecordingStopped {
        files: Vec<PathBuf>,
    },
    SnapshotTaken {
        slot: SlotPosition,
        path: PathBuf,
        error: Option<String>,
    },
}

impl RecorderEvent {
    pub(crate) fn preview_size(slot: SlotPosition, size: FrameSize) -> Self {
        RecorderEvent::PreviewSizeChosen {
            slot,
            width: size.width,
            height: size.height,
        }
    }

    pub fn slot(&self) -> Option<SlotPosition> {
        match self {
            RecorderEvent::CameraOpened { slot }
            | RecorderEvent::PreviewSizeChosen { slot, .. }
            | RecorderEvent::CameraConfigured { slot, .. }
            | RecorderEvent::CameraClosed { slot }
            | RecorderEvent::CameraError { slot, .. }
            | RecorderEvent::RecordingJoined { slot }
            | RecorderEvent::SegmentSwitched { slot, .. }
            | RecorderEvent::CorruptedFilesDeleted { slot, .. }
            | RecorderEvent::PipelineError { slot, .. }
            | RecorderEvent::PipelineRecovered { slot, .. }
            | RecorderEvent::SnapshotTaken { slot, .. } => Some(*slot),
            RecorderEvent::RecordingStarted { .. }
            | RecorderEvent::RecordingError { .. }
            | RecorderEvent::RecordingStopped { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_type_tag() {
        let event = RecorderEvent::SegmentSwitched {
            slot: SlotPosition::Front,
            completed_file: Some(PathBuf::from("20240101_000000_front.mp4")),
            new_index: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "segmentSwitched");
        assert_eq!(json["slot"], "front");
        assert_eq!(json["newIndex"], 2);
        assert_eq!(json["completedFile"], "20240101_000000_front.mp4");
    }

    #[test]
    fn test_run_level_events_have_no_slot() {
        let stopped = RecorderEvent::RecordingStopped { files: Vec::new() };
        assert_eq!(stopped.slot(), None);
        let size = RecorderEvent::preview_size(SlotPosition::Left, FrameSize::new(1280, 800));
        assert_eq!(size.slot(), Some(SlotPosition::Left));
    }
}
