//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;

use toy_link::voice::{
    ActivityTracker, CaptureConstraints, FRAME_SAMPLES, FarEndLevel, FrameChunker,
    FrameProcessor, SAMPLE_RATE, StreamResampler, UplinkEncoder, WIRE_FRAME_SAMPLES,
    analyze_frame, samples_to_wav,
};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

#[test]
fn test_vad_is_pure() {
    let speech = generate_sine_samples(440.0, 0.02, 0.3);

    let first = analyze_frame(&speech);
    let second = analyze_frame(&speech);
    assert_eq!(first, second);
    assert!(first.is_speaking);
}

#[test]
fn test_vad_silence() {
    let silence = generate_silence(0.02);
    let level = analyze_frame(&silence);
    assert_eq!(level.level, 0.0);
    assert!(!level.is_speaking);
}

#[test]
fn test_activity_tracker_reports_transitions() {
    let mut tracker = ActivityTracker::default();
    let speech = analyze_frame(&generate_sine_samples(440.0, 0.02, 0.3));
    let silence = analyze_frame(&generate_silence(0.02));

    assert_eq!(tracker.update(silence), None);
    assert_eq!(tracker.update(speech), Some(true));
    assert_eq!(tracker.update(speech), None);
    assert_eq!(tracker.update(silence), Some(false));
    assert!(!tracker.is_speaking());
}

#[test]
fn test_chunker_emits_20ms_frames() {
    let mut chunker = FrameChunker::new(1);
    let mut frames = Vec::new();

    let audio = generate_sine_samples(440.0, 0.1, 0.3);
    for chunk in audio.chunks(123) {
        chunker.push(chunk, |frame| frames.push(frame));
    }

    assert_eq!(frames.len(), audio.len() / FRAME_SAMPLES);
    assert!(frames.iter().all(|f| f.len() == FRAME_SAMPLES));
}

#[test]
fn test_noise_gate_silences_hiss() {
    let constraints = CaptureConstraints {
        echo_cancellation: false,
        noise_suppression: true,
        auto_gain_control: false,
    };
    let mut processor = FrameProcessor::new(constraints, FarEndLevel::default());

    let mut hiss = generate_sine_samples(3000.0, 0.02, 0.001);
    processor.process(&mut hiss);
    assert!(hiss.iter().all(|s| *s == 0.0));

    let mut speech = generate_sine_samples(440.0, 0.02, 0.3);
    processor.process(&mut speech);
    assert!(analyze_frame(&speech).is_speaking);
}

#[test]
fn test_uplink_encoder_produces_wire_frames() {
    let mut encoder = UplinkEncoder::new().unwrap();
    let mut payload = Vec::new();

    let audio = generate_sine_samples(440.0, 0.2, 0.3);
    let mut total = 0;
    for frame in audio.chunks(FRAME_SAMPLES) {
        encoder.encode(frame, &mut payload).unwrap();
        total += payload.len();
    }

    // Resampler latency may hold back part of the first frame
    assert!(total <= audio.len() / 2);
    assert!(total >= audio.len() / 2 - 2 * WIRE_FRAME_SAMPLES);
}

#[test]
fn test_resampler_ratio() {
    let mut resampler = StreamResampler::new(16000, 8000, FRAME_SAMPLES).unwrap();
    let mut out = Vec::new();
    let mut total = 0;

    for frame in generate_sine_samples(440.0, 0.5, 0.3).chunks(FRAME_SAMPLES) {
        resampler.push(frame, &mut out).unwrap();
        total += out.len();
    }

    let expected = (SAMPLE_RATE as f32 * 0.5 / 2.0) as usize;
    assert!(total <= expected);
    assert!(total >= expected - 2 * WIRE_FRAME_SAMPLES);
}

#[test]
fn test_samples_to_wav() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav_data = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");

    // WAV should have reasonable size
    assert!(wav_data.len() > 44); // WAV header is 44 bytes
}

#[test]
fn test_wav_roundtrip() {
    let original_samples: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav_data = samples_to_wav(&original_samples, SAMPLE_RATE).unwrap();

    // Read WAV back
    let cursor = Cursor::new(wav_data);
    let mut reader = hound::WavReader::new(cursor).unwrap();

    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    // Read samples back
    let read_samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read_samples.len(), original_samples.len());
}
