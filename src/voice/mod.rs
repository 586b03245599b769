//! Audio pipeline
//!
//! Handles microphone capture, capture processing, level metering and
//! voice-activity detection, the PCMU wire codec, and playback of remote
//! audio. Device access goes through [`MediaDevices`].

mod activity;
mod capture;
mod codec;
mod devices;
mod pipeline;
mod playback;
mod processing;

pub use activity::{ActivityTracker, FrameLevel, VAD_THRESHOLD, analyze_frame, calculate_rms};
pub use capture::{CpalMicrophone, FRAME_SAMPLES, FrameChunker, SAMPLE_RATE, samples_to_wav};
pub use codec::{
    DownlinkDecoder, PCMU_PAYLOAD_TYPE, StreamResampler, UplinkEncoder, WIRE_FRAME_SAMPLES,
    WIRE_SAMPLE_RATE, linear_to_ulaw, ulaw_to_linear,
};
pub use devices::{CpalDevices, MediaDevices, MediaTrack, PlaybackSink, SilentDevices};
pub use pipeline::{DownlinkProcessor, MuteGate, UplinkProcessor};
pub use playback::{CpalSpeaker, PlaybackQueue};
pub use processing::{CaptureConstraints, FarEndLevel, FrameProcessor};
