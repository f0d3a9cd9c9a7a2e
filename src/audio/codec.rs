//! L16/L24 PCM codecs
//!
//! AES67 carries big-endian linear PCM on the wire; the engine works in
//! normalized `f32` internally. Encoding saturates out-of-range samples.

use byteorder::{BigEndian, ByteOrder};

/// L16 full-scale encode multiplier
const L16_SCALE_ENCODE: f32 = 32_767.0;
/// L16 decode divisor
const L16_SCALE_DECODE: f32 = 32_768.0;
/// L24 full-scale encode multiplier
const L24_SCALE_ENCODE: f32 = 8_388_607.0;
/// L24 decode divisor
const L24_SCALE_DECODE: f32 = 8_388_608.0;

/// Wire bytes for `samples` L16 samples
#[must_use]
pub fn l16_byte_len(samples: usize) -> usize {
    samples * 2
}

/// Wire bytes for `samples` L24 samples
#[must_use]
pub fn l24_byte_len(samples: usize) -> usize {
    samples * 3
}

/// Encode float samples to big-endian L16
///
/// Encodes `min(samples.len(), out.len() / 2)` samples and returns the
/// number of bytes written. Samples outside [-1, 1] saturate.
#[allow(clippy::cast_possible_truncation, reason = "value is clamped to i16 range")]
pub fn encode_l16(samples: &[f32], out: &mut [u8]) -> usize {
    let count = samples.len().min(out.len() / 2);
    for (sample, chunk) in samples[..count].iter().zip(out.chunks_exact_mut(2)) {
        let value = (sample.clamp(-1.0, 1.0) * L16_SCALE_ENCODE).round() as i16;
        BigEndian::write_i16(chunk, value);
    }
    count * 2
}

/// Decode big-endian L16 to float samples in [-1.0, 1.0)
///
/// Decodes `min(input.len() / 2, out.len())` samples and returns the
/// number of samples written.
pub fn decode_l16(input: &[u8], out: &mut [f32]) -> usize {
    let count = (input.len() / 2).min(out.len());
    for (chunk, sample) in input.chunks_exact(2).zip(out[..count].iter_mut()) {
        *sample = f32::from(BigEndian::read_i16(chunk)) / L16_SCALE_DECODE;
    }
    count
}

/// Encode float samples to big-endian L24
///
/// Encodes `min(samples.len(), out.len() / 3)` samples and returns the
/// number of bytes written. Samples outside [-1, 1] saturate to
/// ±(2^23 - 1).
#[allow(clippy::cast_possible_truncation, reason = "value is clamped to 24-bit range")]
pub fn encode_l24(samples: &[f32], out: &mut [u8]) -> usize {
    let count = samples.len().min(out.len() / 3);
    for (sample, chunk) in samples[..count].iter().zip(out.chunks_exact_mut(3)) {
        let value = (sample.clamp(-1.0, 1.0) * L24_SCALE_ENCODE).round() as i32;
        BigEndian::write_i24(chunk, value);
    }
    count * 3
}

/// Decode big-endian L24 to float samples in [-1.0, 1.0)
#[allow(clippy::cast_precision_loss, reason = "24-bit values are exact in f32 range")]
pub fn decode_l24(input: &[u8], out: &mut [f32]) -> usize {
    let count = (input.len() / 3).min(out.len());
    for (chunk, sample) in input.chunks_exact(3).zip(out[..count].iter_mut()) {
        *sample = BigEndian::read_i24(chunk) as f32 / L24_SCALE_DECODE;
    }
    count
}
