//! Frame level metering and voice-activity detection
//!
//! Energy-threshold VAD: a frame counts as speech when its RMS exceeds
//! [`VAD_THRESHOLD`]. Analysis is a pure function of the frame so it can
//! run on the real-time path without allocation.

/// RMS above which a frame is classified as speech
pub const VAD_THRESHOLD: f32 = 0.01;

/// Level and voice-activity classification of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLevel {
    /// Root-mean-square energy in `[0.0, 1.0]` for normalized input
    pub level: f32,
    /// Whether the frame is classified as speech
    pub is_speaking: bool,
}

/// Analyze one audio frame
#[must_use]
pub fn analyze_frame(samples: &[f32]) -> FrameLevel {
    let level = calculate_rms(samples);
    FrameLevel {
        level,
        is_speaking: level > VAD_THRESHOLD,
    }
}

/// Calculate RMS energy of audio samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Tracks speech onset/offset across frames
///
/// Used to log utterance boundaries without re-emitting per-frame state.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    speaking: bool,
    speech_frames: u32,
}

impl ActivityTracker {
    /// Feed a frame result; returns `Some(new_state)` on a transition
    pub fn update(&mut self, frame: FrameLevel) -> Option<bool> {
        if frame.is_speaking {
            self.speech_frames = self.speech_frames.saturating_add(1);
        }

        if frame.is_speaking == self.speaking {
            return None;
        }

        self.speaking = frame.is_speaking;
        if !self.speaking {
            tracing::trace!(frames = self.speech_frames, "speech segment ended");
            self.speech_frames = 0;
        }
        Some(self.speaking)
    }

    /// Current classification
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }
}
