//! Wire audio codec
//!
//! Audio travels as G.711 mu-law (PCMU) at 8 kHz. The pipeline runs at
//! 16 kHz, so both directions resample with `rubato`.

use rubato::{FftFixedIn, Resampler};

use super::capture::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::{Error, Result};

/// Sample rate of PCMU on the wire
pub const WIRE_SAMPLE_RATE: u32 = 8000;

/// Samples per 20 ms frame at the wire rate
pub const WIRE_FRAME_SAMPLES: usize = 160;

/// Static RTP payload type for PCMU
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

/// Encode a 16-bit linear sample as mu-law
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample);
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };

    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    // Highest set bit is in 7..=14 after biasing
    let exponent = (31 - (pcm as u32).leading_zeros()).saturating_sub(7).min(7) as u8;
    let mantissa = ((pcm >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Decode a mu-law byte to a 16-bit linear sample
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = i32::from(byte & 0x0F);
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;

    if byte & 0x80 == 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

/// Convert a normalized float sample to i16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert an i16 sample to a normalized float
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Streaming mono resampler with a fixed input chunk
///
/// Input is buffered until a whole chunk is available; output buffers are
/// allocated once up front.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    chunk: usize,
    pending: Vec<f32>,
    out: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Create a resampler from `from` Hz to `to` Hz consuming `chunk` input samples at a time
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed for these rates
    pub fn new(from: u32, to: u32, chunk: usize) -> Result<Self> {
        let inner = if from == to {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from as usize, to as usize, chunk, 1, 1)
                    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };
        let out = inner
            .as_ref()
            .map_or_else(Vec::new, |r| r.output_buffer_allocate(true));

        Ok(Self {
            inner,
            chunk,
            pending: Vec::with_capacity(chunk * 2),
            out,
        })
    }

    /// Push input samples, appending any completed output to `output`
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn push(&mut self, input: &[f32], output: &mut Vec<f32>) -> Result<()> {
        let Some(resampler) = self.inner.as_mut() else {
            output.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        while self.pending.len() >= self.chunk {
            let (_, produced) = resampler
                .process_into_buffer(&[&self.pending[..self.chunk]], &mut self.out, None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            output.extend_from_slice(&self.out[0][..produced]);
            self.pending.drain(..self.chunk);
        }

        Ok(())
    }
}

/// Encodes 16 kHz capture frames into PCMU payloads
pub struct UplinkEncoder {
    resampler: StreamResampler,
    scratch: Vec<f32>,
}

impl UplinkEncoder {
    /// Create an encoder for 20 ms pipeline frames
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn new() -> Result<Self> {
        Ok(Self {
            resampler: StreamResampler::new(SAMPLE_RATE, WIRE_SAMPLE_RATE, FRAME_SAMPLES)?,
            scratch: Vec::with_capacity(WIRE_FRAME_SAMPLES * 2),
        })
    }

    /// Encode one frame into `payload` (cleared first)
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn encode(&mut self, frame: &[f32], payload: &mut Vec<u8>) -> Result<()> {
        self.scratch.clear();
        self.resampler.push(frame, &mut self.scratch)?;

        payload.clear();
        payload.extend(self.scratch.iter().map(|&s| linear_to_ulaw(f32_to_i16(s))));
        Ok(())
    }
}

/// Decodes PCMU payloads into 16 kHz samples
pub struct DownlinkDecoder {
    resampler: StreamResampler,
    scratch: Vec<f32>,
}

impl DownlinkDecoder {
    /// Create a decoder
    ///
    /// # Errors
    ///
    /// Returns error if the resampler cannot be constructed
    pub fn new() -> Result<Self> {
        Ok(Self {
            resampler: StreamResampler::new(WIRE_SAMPLE_RATE, SAMPLE_RATE, WIRE_FRAME_SAMPLES)?,
            scratch: Vec::with_capacity(WIRE_FRAME_SAMPLES * 2),
        })
    }

    /// Decode a payload, appending 16 kHz samples to `output`
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn decode(&mut self, payload: &[u8], output: &mut Vec<f32>) -> Result<()> {
        self.scratch.clear();
        self.scratch
            .extend(payload.iter().map(|&b| i16_to_f32(ulaw_to_linear(b))));
        self.resampler.push(&self.scratch, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_silence_is_0xff() {
        assert_eq!(linear_to_ulaw(0), 0xFF);
        assert_eq!(ulaw_to_linear(0xFF), 0);
    }

    #[test]
    fn ulaw_preserves_sign_and_magnitude() {
        for &sample in &[100i16, 1000, 8000, 20000, 32000] {
            let positive = ulaw_to_linear(linear_to_ulaw(sample));
            let negative = ulaw_to_linear(linear_to_ulaw(-sample));

            assert!(positive > 0);
            assert_eq!(negative, -positive);

            let error = f32::from((positive - sample).abs()) / f32::from(sample);
            assert!(error < 0.07, "sample {sample} decoded as {positive}");
        }
    }

    #[test]
    fn ulaw_clips_extremes() {
        let max = ulaw_to_linear(linear_to_ulaw(i16::MAX));
        let min = ulaw_to_linear(linear_to_ulaw(i16::MIN));
        assert!(max > 30000);
        assert!(min < -30000);
    }

    #[test]
    fn uplink_frame_becomes_wire_frame() {
        let mut encoder = UplinkEncoder::new().unwrap();
        let mut payload = Vec::new();
        encoder
            .encode(&vec![0.0f32; FRAME_SAMPLES], &mut payload)
            .unwrap();
        assert_eq!(payload.len(), WIRE_FRAME_SAMPLES);
    }

    #[test]
    fn downlink_buffers_partial_payloads() {
        let mut decoder = DownlinkDecoder::new().unwrap();
        let mut output = Vec::new();

        decoder.decode(&[0xFF; 80], &mut output).unwrap();
        assert!(output.is_empty());

        decoder.decode(&[0xFF; 80], &mut output).unwrap();
        assert_eq!(output.len(), FRAME_SAMPLES);
    }
}
