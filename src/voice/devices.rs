//! Media device abstraction
//!
//! The session manager acquires its microphone and speaker through
//! [`MediaDevices`], so the same pipeline runs on real hardware
//! ([`CpalDevices`]) and on headless hosts ([`SilentDevices`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use super::capture::{CpalMicrophone, FRAME_SAMPLES};
use super::playback::CpalSpeaker;
use crate::Result;

/// A live capture source bound to a session
pub trait MediaTrack: Send {
    /// Stop producing frames and release the device (idempotent)
    fn stop(&mut self);

    /// Whether the source is still producing frames
    fn is_live(&self) -> bool;
}

/// A playback destination for decoded remote audio
pub trait PlaybackSink: Send + Sync {
    /// Queue mono samples at the pipeline rate
    fn write(&self, samples: &[f32]);

    /// Stop rendering and release the device (idempotent)
    fn stop(&self);

    /// Whether the sink is still rendering
    fn is_live(&self) -> bool;
}

/// Factory for capture and playback endpoints
pub trait MediaDevices: Send + Sync {
    /// Acquire the microphone, delivering 20 ms mono frames at 16 kHz
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAcquisition` if the microphone is unavailable
    fn open_microphone(&self, frames: mpsc::Sender<Vec<f32>>) -> Result<Box<dyn MediaTrack>>;

    /// Open a playback sink for remote audio
    ///
    /// # Errors
    ///
    /// Returns `Error::Audio` if no output device can be opened
    fn open_speaker(&self) -> Result<Arc<dyn PlaybackSink>>;
}

/// Default host audio devices via `cpal`
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalDevices;

impl MediaDevices for CpalDevices {
    fn open_microphone(&self, frames: mpsc::Sender<Vec<f32>>) -> Result<Box<dyn MediaTrack>> {
        Ok(Box::new(CpalMicrophone::open(frames)?))
    }

    fn open_speaker(&self) -> Result<Arc<dyn PlaybackSink>> {
        Ok(Arc::new(CpalSpeaker::open()?))
    }
}

/// Headless devices: the microphone yields silence, playback is discarded
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentDevices;

impl MediaDevices for SilentDevices {
    fn open_microphone(&self, frames: mpsc::Sender<Vec<f32>>) -> Result<Box<dyn MediaTrack>> {
        Ok(Box::new(SilentMicrophone::start(frames)?))
    }

    fn open_speaker(&self) -> Result<Arc<dyn PlaybackSink>> {
        Ok(Arc::new(NullSpeaker::default()))
    }
}

/// Emits silent frames at real-time cadence
struct SilentMicrophone {
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SilentMicrophone {
    fn start(frames: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("toy-link-silence".to_string())
            .spawn(move || {
                while thread_running.load(Ordering::SeqCst) {
                    if frames.is_closed() {
                        break;
                    }
                    let _ = frames.try_send(vec![0.0; FRAME_SAMPLES]);
                    std::thread::sleep(Duration::from_millis(20));
                }
                thread_running.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }
}

impl MediaTrack for SilentMicrophone {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn is_live(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SilentMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Discards everything written to it
#[derive(Debug)]
struct NullSpeaker {
    live: AtomicBool,
}

impl Default for NullSpeaker {
    fn default() -> Self {
        Self {
            live: AtomicBool::new(true),
        }
    }
}

impl PlaybackSink for NullSpeaker {
    fn write(&self, _samples: &[f32]) {}

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn silent_microphone_produces_frames_until_stopped() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut track = SilentDevices.open_microphone(tx).unwrap();
        assert!(track.is_live());

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.len(), FRAME_SAMPLES);

        track.stop();
        assert!(!track.is_live());
        track.stop();
    }

    #[test]
    fn null_speaker_stops() {
        let sink = SilentDevices.open_speaker().unwrap();
        sink.write(&[0.1, 0.2]);
        assert!(sink.is_live());
        sink.stop();
        assert!(!sink.is_live());
    }
}
