//! Camera state mirrored from the legacy status push.

use crate::records::StatusPush;
use crate::types::{CameraMode, CameraStatus, EisMode, FpsIdx, VideoResolution};

/// The engine's view of the camera, fed by `(0x1D, 0x02)` pushes.
///
/// Raw bytes are kept as received; the typed accessors return `None` for
/// values outside the known enums (newer cameras describe those through
/// the new-format push instead). `initialized` flips once the first push
/// lands and is cleared on disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraState {
    pub camera_mode: u8,
    pub camera_status: u8,
    pub video_resolution: u8,
    pub fps_idx: u8,
    pub eis_mode: u8,
    pub record_time: u16,
    pub initialized: bool,
}

impl CameraState {
    /// Fold a push into the state. Returns whether anything the engine
    /// tracks changed (the first push always counts as a change).
    pub(crate) fn apply(&mut self, push: &StatusPush) -> bool {
        let mut changed = false;
        let mut update = |current: &mut u8, new: u8| {
            if *current != new {
                *current = new;
                changed = true;
            }
        };
        update(&mut self.camera_mode, push.camera_mode);
        update(&mut self.camera_status, push.camera_status);
        update(&mut self.video_resolution, push.video_resolution);
        update(&mut self.fps_idx, push.fps_idx);
        update(&mut self.eis_mode, push.eis_mode);
        if self.record_time != push.record_time {
            self.record_time = push.record_time;
            changed = true;
        }
        if !self.initialized {
            self.initialized = true;
            changed = true;
        }
        changed
    }

    pub(crate) fn reset(&mut self) {
        self.initialized = false;
    }

    pub fn mode(&self) -> Option<CameraMode> {
        CameraMode::from_repr(self.camera_mode)
    }

    pub fn status(&self) -> Option<CameraStatus> {
        CameraStatus::from_repr(self.camera_status)
    }

    pub fn resolution(&self) -> Option<VideoResolution> {
        VideoResolution::from_repr(self.video_resolution)
    }

    pub fn fps(&self) -> Option<FpsIdx> {
        FpsIdx::from_repr(self.fps_idx)
    }

    pub fn eis(&self) -> Option<EisMode> {
        EisMode::from_repr(self.eis_mode)
    }

    /// Whether the camera is capturing or pre-recording. Only meaningful
    /// once a status push has arrived.
    pub fn is_recording(&self) -> bool {
        self.initialized
            && matches!(
                self.status(),
                Some(CameraStatus::PhotoOrRecording) | Some(CameraStatus::PreRecording)
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(mode: u8, status: u8) -> StatusPush {
        StatusPush {
            camera_mode: mode,
            camera_status: status,
            ..StatusPush::default()
        }
    }

    #[test]
    fn first_push_marks_initialized_and_changed() {
        let mut state = CameraState::default();
        assert!(!state.initialized);
        assert!(state.apply(&push(0x01, 0x01)));
        assert!(state.initialized);
    }

    #[test]
    fn identical_push_is_not_a_change() {
        let mut state = CameraState::default();
        let p = push(0x01, 0x01);
        assert!(state.apply(&p));
        assert!(!state.apply(&p));
    }

    #[test]
    fn recording_requires_initialization() {
        let mut state = CameraState::default();
        state.camera_status = CameraStatus::PhotoOrRecording as u8;
        assert!(!state.is_recording());

        state.apply(&push(0x01, CameraStatus::PhotoOrRecording as u8));
        assert!(state.is_recording());

        state.apply(&push(0x01, CameraStatus::PreRecording as u8));
        assert!(state.is_recording());

        state.apply(&push(0x01, CameraStatus::LiveView as u8));
        assert!(!state.is_recording());
    }

    #[test]
    fn reset_clears_initialized_but_keeps_last_values() {
        let mut state = CameraState::default();
        state.apply(&push(0x05, 0x01));
        state.reset();
        assert!(!state.initialized);
        assert_eq!(state.camera_mode, 0x05);
        assert!(!state.is_recording());
    }

    #[test]
    fn unknown_raw_values_have_no_typed_view() {
        let mut state = CameraState::default();
        state.apply(&push(0x77, 0x66));
        assert_eq!(state.mode(), None);
        assert_eq!(state.status(), None);
    }
}
