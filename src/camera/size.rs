//! Preview/record size selection.

use crate::media::FrameSize;

/// Preferred size when no explicit target is configured.
pub const DEFAULT_PREVIEW_SIZE: FrameSize = FrameSize::new(1280, 800);

/// Target used for the "highest" policy; nearest-size matching then lands on
/// the largest supported size.
pub const HIGHEST_TARGET_SIZE: FrameSize = FrameSize::new(7680, 4320);

/// Pick the output size closest to `target`.
///
/// An exact match wins; otherwise the candidate with the smallest
/// |dw| + |dh|. Ties keep the first candidate. Falls back to `target` when
/// the device reports no sizes.
pub fn choose_preview_size(candidates: &[FrameSize], target: FrameSize) -> FrameSize {
    if candidates.contains(&target) {
        return target;
    }
    candidates
        .iter()
        .copied()
        .min_by_key(|size| size.distance(&target))
        .unwrap_or(target)
}
