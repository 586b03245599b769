//! Audio capture from microphone

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use tokio::sync::mpsc;

use super::devices::MediaTrack;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per 20 ms frame at [`SAMPLE_RATE`]
pub const FRAME_SAMPLES: usize = 320;

/// Splits device callbacks into fixed mono frames
///
/// Multi-channel input keeps the first channel only.
#[derive(Debug)]
pub struct FrameChunker {
    channels: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    /// Create a chunker for interleaved input with `channels` channels
    #[must_use]
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
        }
    }

    /// Push interleaved samples, calling `emit` for every completed frame
    pub fn push(&mut self, data: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        self.pending
            .extend(data.iter().step_by(self.channels).copied());

        while self.pending.len() >= FRAME_SAMPLES {
            let rest = self.pending.split_off(FRAME_SAMPLES);
            emit(std::mem::replace(&mut self.pending, rest));
        }
    }
}

/// Captures audio from the default input device
///
/// The `cpal` stream lives on its own thread so this handle can move
/// between tasks. Frames are delivered with `try_send`: a slow consumer
/// loses frames instead of stalling the device callback.
pub struct CpalMicrophone {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    live: Arc<AtomicBool>,
}

impl CpalMicrophone {
    /// Open the default microphone and start delivering frames
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAcquisition` if no usable input device exists
    /// or the stream cannot be started
    pub fn open(frames: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let live = Arc::new(AtomicBool::new(false));
        let thread_live = Arc::clone(&live);

        let thread = std::thread::Builder::new()
            .name("toy-link-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                thread_live.store(true, Ordering::SeqCst);
                let _ = ready_tx.send(Ok(()));

                // Park until stopped or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                thread_live.store(false, Ordering::SeqCst);
                tracing::debug!("audio capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::MediaAcquisition("capture thread exited".to_string()))??;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            live,
        })
    }
}

impl MediaTrack for CpalMicrophone {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(frames: mpsc::Sender<Vec<f32>>) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAcquisition("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::MediaAcquisition(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::MediaAcquisition("no 16kHz input config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let mut chunker = FrameChunker::new(usize::from(config.channels));
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                chunker.push(data, |frame| {
                    if frames.try_send(frame).is_err() {
                        tracing::trace!("capture frame dropped");
                    }
                });
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::MediaAcquisition(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::MediaAcquisition(e.to_string()))?;

    tracing::debug!("audio capture started");
    Ok(stream)
}

/// Convert f32 samples to WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(super::codec::f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunker_emits_whole_frames() {
        let mut chunker = FrameChunker::new(1);
        let mut frames = Vec::new();

        chunker.push(&vec![0.1; 500], |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), FRAME_SAMPLES);

        chunker.push(&vec![0.1; 140], |f| frames.push(f));
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn chunker_keeps_first_channel() {
        let mut chunker = FrameChunker::new(2);
        let mut frames = Vec::new();

        let stereo: Vec<f32> = (0..FRAME_SAMPLES * 2)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        chunker.push(&stereo, |f| frames.push(f));

        assert_eq!(frames.len(), 1);
        assert!(frames[0].iter().all(|s| (*s - 0.5).abs() < f32::EPSILON));
    }
}
