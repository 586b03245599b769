//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};

use super::capture::SAMPLE_RATE;
use super::devices::PlaybackSink;
use crate::{Error, Result};

/// Maximum queued playback (2 s); older audio is discarded past this
const MAX_QUEUED_SAMPLES: usize = SAMPLE_RATE as usize * 2;

/// Bounded queue between the network reader and the device callback
#[derive(Debug, Clone, Default)]
pub struct PlaybackQueue(Arc<Mutex<VecDeque<f32>>>);

impl PlaybackQueue {
    /// Append samples, dropping the oldest beyond the cap
    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut queue) = self.0.lock() {
            queue.extend(samples.iter().copied());
            let excess = queue.len().saturating_sub(MAX_QUEUED_SAMPLES);
            if excess > 0 {
                queue.drain(..excess);
                tracing::trace!(dropped = excess, "playback queue overflow");
            }
        }
    }

    /// Fill `out` (one mono sample per frame of `channels`), padding with silence
    pub fn fill(&self, out: &mut [f32], channels: usize) {
        let Ok(mut queue) = self.0.lock() else {
            out.fill(0.0);
            return;
        };

        for frame in out.chunks_mut(channels.max(1)) {
            let sample = queue.pop_front().unwrap_or(0.0);
            frame.fill(sample);
        }
    }

    /// Number of queued samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().map(|q| q.len()).unwrap_or_default()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued audio
    pub fn clear(&self) {
        if let Ok(mut queue) = self.0.lock() {
            queue.clear();
        }
    }
}

/// Streams audio to the default output device
///
/// Like capture, the `cpal` stream is owned by a dedicated thread.
pub struct CpalSpeaker {
    queue: PlaybackQueue,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    live: Arc<AtomicBool>,
}

impl CpalSpeaker {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn open() -> Result<Self> {
        let queue = PlaybackQueue::default();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let live = Arc::new(AtomicBool::new(false));

        let thread_queue = queue.clone();
        let thread_live = Arc::clone(&live);
        let thread = std::thread::Builder::new()
            .name("toy-link-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(thread_queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                thread_live.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                let _ = stop_rx.recv();
                drop(stream);
                thread_live.store(false, Ordering::SeqCst);
                tracing::debug!("audio playback stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        Ok(Self {
            queue,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
            live,
        })
    }

    /// Queued samples not yet rendered
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl PlaybackSink for CpalSpeaker {
    fn write(&self, samples: &[f32]) {
        self.queue.push(samples);
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
            let _ = thread.join();
        }
        self.queue.clear();
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        PlaybackSink::stop(self);
    }
}

fn build_output_stream(queue: PlaybackQueue) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                queue.fill(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}
