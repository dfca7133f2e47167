//! PCM buffers and post-processing.
//!
//! Pure functions: no I/O, no async runtime. Samples are interleaved `f32`
//! in `[-1.0, 1.0]`.

use std::time::Duration;

use crate::types::AudioFormat;

/// Sample rate assumed for headerless PCM from the voice backend.
pub const VOICE_SAMPLE_RATE: u32 = 24_000;

/// Interleaved PCM audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self {
            samples,
            sample_rate: format.sample_rate,
            channels: format.channels,
        }
    }

    pub fn empty(format: AudioFormat) -> Self {
        Self::new(Vec::new(), format)
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// In-memory size of the sample data, used for cache accounting.
    pub fn byte_len(&self) -> u64 {
        (self.samples.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

/// Concatenate buffers in order. All buffers must already share `format`.
pub fn concat(parts: &[impl AsRef<AudioBuffer>], format: AudioFormat) -> Result<AudioBuffer, String> {
    let total = parts.iter().map(|p| p.as_ref().samples.len()).sum();
    let mut samples = Vec::with_capacity(total);
    for part in parts {
        let part = part.as_ref();
        if part.format() != format {
            return Err(format!(
                "cannot concatenate {} Hz/{} ch audio into {} Hz/{} ch",
                part.sample_rate, part.channels, format.sample_rate, format.channels
            ));
        }
        samples.extend_from_slice(&part.samples);
    }
    Ok(AudioBuffer::new(samples, format))
}

impl AsRef<AudioBuffer> for AudioBuffer {
    fn as_ref(&self) -> &AudioBuffer {
        self
    }
}

// ─── Decoding ─────────────────────────────────────────────────────────────

/// Parsed WAV header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset in the buffer where raw PCM data begins.
    pub data_offset: usize,
}

/// Parse a RIFF/WAVE header.
///
/// Streaming voice servers write `0xFFFFFFFF` for unknown chunk sizes; those
/// sizes are ignored.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, &'static str> {
    if buf.len() < 12 {
        return Err("too short for RIFF header");
    }
    if &buf[0..4] != b"RIFF" {
        return Err("missing RIFF tag");
    }
    if &buf[8..12] != b"WAVE" {
        return Err("missing WAVE tag");
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u32, u16)> = None;

    while pos + 8 <= buf.len() {
        let chunk_id = &buf[pos..pos + 4];
        let chunk_size =
            u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);

        match chunk_id {
            b"fmt " => {
                if pos + 24 > buf.len() {
                    return Err("fmt chunk truncated");
                }
                if u16::from_le_bytes([buf[pos + 8], buf[pos + 9]]) != 1 {
                    return Err("not PCM format");
                }
                let channels = u16::from_le_bytes([buf[pos + 10], buf[pos + 11]]);
                let rate = u32::from_le_bytes([
                    buf[pos + 12],
                    buf[pos + 13],
                    buf[pos + 14],
                    buf[pos + 15],
                ]);
                let bits = u16::from_le_bytes([buf[pos + 22], buf[pos + 23]]);
                fmt = Some((channels, rate, bits));
                pos += 8 + if chunk_size == u32::MAX { 16 } else { chunk_size as usize };
            }
            b"data" => {
                let (channels, sample_rate, bits_per_sample) =
                    fmt.ok_or("data chunk before fmt chunk")?;
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: pos + 8,
                });
            }
            _ => {
                pos += 8 + if chunk_size == u32::MAX { 0 } else { chunk_size as usize };
            }
        }
    }

    Err("data chunk not found")
}

/// Little-endian signed 16-bit PCM to `f32`. A trailing odd byte is dropped.
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Decode a voice backend payload: a 16-bit PCM WAV file, or headerless
/// 16-bit mono PCM at `raw_rate`.
pub fn decode_voice_payload(bytes: &[u8], raw_rate: u32) -> Result<AudioBuffer, String> {
    if bytes.starts_with(b"RIFF") {
        let header = parse_wav_header(bytes).map_err(|e| format!("invalid WAV: {e}"))?;
        if header.bits_per_sample != 16 {
            return Err(format!(
                "unsupported WAV sample width: {} bits",
                header.bits_per_sample
            ));
        }
        if header.channels == 0 || header.sample_rate == 0 {
            return Err("WAV header declares zero channels or sample rate".into());
        }
        let data = bytes.get(header.data_offset..).unwrap_or_default();
        return Ok(AudioBuffer {
            samples: pcm16_le_to_f32(data),
            sample_rate: header.sample_rate,
            channels: header.channels,
        });
    }

    Ok(AudioBuffer {
        samples: pcm16_le_to_f32(bytes),
        sample_rate: raw_rate,
        channels: 1,
    })
}

// ─── Post-processing ──────────────────────────────────────────────────────

/// Convert the channel count. Down-mixing averages each frame; up-mixing
/// duplicates the mono signal.
pub fn convert_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    if from == to || from == 0 {
        return samples.to_vec();
    }
    let from = from as usize;
    let to = to as usize;
    samples
        .chunks_exact(from)
        .flat_map(|frame| {
            let mono = frame.iter().sum::<f32>() / from as f32;
            std::iter::repeat_n(mono, to)
        })
        .collect()
}

/// Resample interleaved audio using linear interpolation. Good enough for speech.
pub fn resample_linear(input: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    let frames = input.len() / ch;
    if from_rate == to_rate || frames == 0 || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let output_frames = (frames as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(output_frames * ch);
    for i in 0..output_frames {
        let src_pos = i as f64 * ratio;
        let idx = (src_pos as usize).min(frames - 1);
        let frac = (src_pos - idx as f64) as f32;
        let next = (idx + 1).min(frames - 1);
        for c in 0..ch {
            let s0 = input[idx * ch + c];
            let s1 = input[next * ch + c];
            output.push(s0 + frac * (s1 - s0));
        }
    }
    output
}

/// Keep every sample within `threshold`. Loud audio is scaled down so its
/// peak sits at the threshold; anything left over is clamped. Non-finite
/// samples become silence.
pub fn normalize_peak(samples: &mut [f32], threshold: f32) {
    for s in samples.iter_mut() {
        if !s.is_finite() {
            *s = 0.0;
        }
    }
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > threshold {
        let gain = threshold / peak;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
    for s in samples.iter_mut() {
        *s = s.clamp(-threshold, threshold);
    }
}

/// Full chain: resample, convert channels, normalize peak.
pub fn postprocess(buffer: AudioBuffer, target: AudioFormat, clip_threshold: f32) -> AudioBuffer {
    let mut samples = resample_linear(
        &buffer.samples,
        buffer.channels,
        buffer.sample_rate,
        target.sample_rate,
    );
    samples = convert_channels(&samples, buffer.channels, target.channels);
    normalize_peak(&mut samples, clip_threshold);
    AudioBuffer::new(samples, target)
}
