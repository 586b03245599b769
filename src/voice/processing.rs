//! Capture-side voice processing
//!
//! Lightweight stand-ins for the echo cancellation, noise suppression and
//! automatic gain control a browser applies to `getUserMedia` input:
//!
//! - Echo: half-duplex gate that attenuates the microphone while far-end
//!   audio is playing louder than the local talker
//! - Noise: gate that zeroes frames under a noise floor
//! - Gain: bounded AGC that steers speech frames toward a target RMS
//!
//! All stages work in place on a single frame and never allocate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::activity::calculate_rms;

/// Frames below this RMS are treated as background noise
const NOISE_FLOOR: f32 = 0.003;

/// AGC target RMS for speech frames
const AGC_TARGET: f32 = 0.1;

/// AGC gain bounds
const AGC_MIN_GAIN: f32 = 0.5;
const AGC_MAX_GAIN: f32 = 8.0;

/// Per-frame smoothing factor for gain changes
const AGC_SMOOTHING: f32 = 0.1;

/// Far-end level above which the echo gate engages
const ECHO_FAR_END_THRESHOLD: f32 = 0.02;

/// Attenuation applied to the microphone while the echo gate is engaged
const ECHO_ATTENUATION: f32 = 0.1;

/// Processing stages requested when acquiring the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Shared level of the audio currently being played back
///
/// Written by the playback path, read by the capture path's echo gate.
#[derive(Debug, Clone, Default)]
pub struct FarEndLevel(Arc<AtomicU32>);

impl FarEndLevel {
    /// Record the RMS of the most recent playback frame
    pub fn set(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Most recent playback RMS
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Applies the configured processing stages to capture frames
#[derive(Debug)]
pub struct FrameProcessor {
    constraints: CaptureConstraints,
    far_end: FarEndLevel,
    gain: f32,
}

impl FrameProcessor {
    /// Create a processor
    #[must_use]
    pub const fn new(constraints: CaptureConstraints, far_end: FarEndLevel) -> Self {
        Self {
            constraints,
            far_end,
            gain: 1.0,
        }
    }

    /// Process a frame in place
    pub fn process(&mut self, frame: &mut [f32]) {
        let mut level = calculate_rms(frame);

        if self.constraints.echo_cancellation {
            let far = self.far_end.get();
            if far > ECHO_FAR_END_THRESHOLD && level < far * 2.0 {
                scale(frame, ECHO_ATTENUATION);
                level *= ECHO_ATTENUATION;
            }
        }

        if self.constraints.noise_suppression && level < NOISE_FLOOR {
            frame.fill(0.0);
            return;
        }

        if self.constraints.auto_gain_control && level > NOISE_FLOOR {
            let desired = (AGC_TARGET / level).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            self.gain += (desired - self.gain) * AGC_SMOOTHING;
            scale(frame, self.gain);
        }
    }

    /// Current AGC gain
    #[must_use]
    pub const fn gain(&self) -> f32 {
        self.gain
    }
}

fn scale(frame: &mut [f32], factor: f32) {
    for sample in frame.iter_mut() {
        *sample = (*sample * factor).clamp(-1.0, 1.0);
    }
}
