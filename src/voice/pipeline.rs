//! Per-frame audio pipeline
//!
//! Uplink: capture frame → processing → level/VAD events → mute gate → PCMU.
//! Downlink: PCMU payload → 16 kHz samples → playback sink.
//!
//! Both halves are synchronous and bounded per frame; the session manager
//! drives them from its own tasks and does the network I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::activity::{ActivityTracker, analyze_frame, calculate_rms};
use super::codec::{DownlinkDecoder, UplinkEncoder};
use super::devices::PlaybackSink;
use super::processing::{CaptureConstraints, FarEndLevel, FrameProcessor};
use crate::Result;
use crate::events::{ClientEvent, EventBus};

/// Local gate on the outgoing track
///
/// While muted the track keeps sending frames, but they are silent.
#[derive(Debug, Clone, Default)]
pub struct MuteGate(Arc<AtomicBool>);

impl MuteGate {
    /// Set the mute state; returns `true` if it changed
    pub fn set(&self, muted: bool) -> bool {
        self.0.swap(muted, Ordering::SeqCst) != muted
    }

    /// Current mute state
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Processes capture frames into wire payloads
pub struct UplinkProcessor {
    processor: FrameProcessor,
    encoder: UplinkEncoder,
    mute: MuteGate,
    events: EventBus,
    tracker: ActivityTracker,
    payload: Vec<u8>,
}

impl UplinkProcessor {
    /// Create an uplink processor
    ///
    /// # Errors
    ///
    /// Returns error if the encoder cannot be constructed
    pub fn new(
        constraints: CaptureConstraints,
        far_end: FarEndLevel,
        mute: MuteGate,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            processor: FrameProcessor::new(constraints, far_end),
            encoder: UplinkEncoder::new()?,
            mute,
            events,
            tracker: ActivityTracker::default(),
            payload: Vec::with_capacity(256),
        })
    }

    /// Process one frame in place and return its encoded payload
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn process(&mut self, frame: &mut [f32]) -> Result<&[u8]> {
        self.processor.process(frame);

        let level = analyze_frame(frame);
        self.events.emit(ClientEvent::AudioLevel { level: level.level });
        self.events.emit(ClientEvent::VoiceActivity {
            is_speaking: level.is_speaking,
        });
        if let Some(speaking) = self.tracker.update(level) {
            tracing::trace!(speaking, level = level.level, "voice activity changed");
        }

        if self.mute.is_muted() {
            frame.fill(0.0);
        }

        self.encoder.encode(frame, &mut self.payload)?;
        Ok(&self.payload)
    }
}

/// Decodes wire payloads into a playback sink
pub struct DownlinkProcessor {
    decoder: DownlinkDecoder,
    sink: Arc<dyn PlaybackSink>,
    far_end: FarEndLevel,
    samples: Vec<f32>,
}

impl DownlinkProcessor {
    /// Create a downlink processor
    ///
    /// # Errors
    ///
    /// Returns error if the decoder cannot be constructed
    pub fn new(sink: Arc<dyn PlaybackSink>, far_end: FarEndLevel) -> Result<Self> {
        Ok(Self {
            decoder: DownlinkDecoder::new()?,
            sink,
            far_end,
            samples: Vec::with_capacity(1024),
        })
    }

    /// Decode one payload and queue it for playback
    ///
    /// # Errors
    ///
    /// Returns error if decoding fails
    pub fn process(&mut self, payload: &[u8]) -> Result<()> {
        self.samples.clear();
        self.decoder.decode(payload, &mut self.samples)?;

        if !self.samples.is_empty() {
            self.far_end.set(calculate_rms(&self.samples));
            self.sink.write(&self.samples);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::voice::capture::FRAME_SAMPLES;

    fn raw() -> CaptureConstraints {
        CaptureConstraints {
            echo_cancellation: false,
            noise_suppression: false,
            auto_gain_control: false,
        }
    }

    #[test]
    fn mute_gate_is_idempotent() {
        let gate = MuteGate::default();
        assert!(gate.set(true));
        assert!(!gate.set(true));
        assert!(gate.is_muted());
        assert!(gate.set(false));
        assert!(!gate.set(false));
    }

    #[tokio::test]
    async fn uplink_emits_level_and_activity_per_frame() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut uplink =
            UplinkProcessor::new(raw(), FarEndLevel::default(), MuteGate::default(), events)
                .unwrap();

        let mut frame = vec![0.5f32; FRAME_SAMPLES];
        uplink.process(&mut frame).unwrap();

        match rx.recv().await.unwrap() {
            ClientEvent::AudioLevel { level } => assert!((level - 0.5).abs() < 1e-4),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::VoiceActivity { is_speaking: true }
        );
    }

    #[test]
    fn muted_frames_encode_as_silence() {
        let mute = MuteGate::default();
        mute.set(true);
        let mut uplink =
            UplinkProcessor::new(raw(), FarEndLevel::default(), mute.clone(), EventBus::new())
                .unwrap();

        for _ in 0..3 {
            let mut frame = vec![0.5f32; FRAME_SAMPLES];
            let payload = uplink.process(&mut frame).unwrap();
            assert!(payload.iter().all(|b| *b == 0xFF));
        }

        mute.set(false);
        let mut frame = vec![0.5f32; FRAME_SAMPLES];
        let payload = uplink.process(&mut frame).unwrap();
        assert!(payload.iter().any(|b| *b != 0xFF));
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<f32>>);

    impl PlaybackSink for RecordingSink {
        fn write(&self, samples: &[f32]) {
            self.0.lock().unwrap().extend_from_slice(samples);
        }
        fn stop(&self) {}
        fn is_live(&self) -> bool {
            true
        }
    }

    #[test]
    fn downlink_feeds_sink_and_far_end() {
        let sink = Arc::new(RecordingSink::default());
        let far_end = FarEndLevel::default();
        let mut downlink = DownlinkProcessor::new(sink.clone(), far_end.clone()).unwrap();

        // 0x80 decodes to a large positive sample
        downlink.process(&[0x80; 160]).unwrap();

        assert_eq!(sink.0.lock().unwrap().len(), FRAME_SAMPLES);
        assert!(far_end.get() > 0.0);
    }
}
