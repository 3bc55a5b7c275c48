//! Audio codec: PCM⇄WAV framing, resampling, carrier frame chunking
//!
//! All PCM in this crate is 16-bit signed little-endian mono. Session
//! rates are 8000 or 16000 Hz; the TTS provider commonly answers at
//! 24000 Hz, so outbound fragments are resampled down before framing.

use anyhow::{bail, Context, Result};

/// Outbound frame sizes must stay aligned to this many bytes.
pub const FRAME_ALIGNMENT: usize = 320;

/// Carrier frame size in bytes for a session sample rate
/// (3200 at 8 kHz, 6400 at 16 kHz).
pub fn frame_size_for_rate(sample_rate: u32) -> usize {
    let size = sample_rate as usize * 2 / 5;
    // Guard against odd configured rates; frames must stay 320-aligned.
    (size / FRAME_ALIGNMENT).max(1) * FRAME_ALIGNMENT
}

/// Wrap raw 16-bit LE mono PCM in a 44-byte RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + pcm.len()));

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("Failed to create WAV writer")?;
    for sample in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([sample[0], sample[1]]))?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}

/// Extract 16-bit LE mono PCM and the header sample rate from WAV bytes.
///
/// Parses the RIFF chunks manually: streaming TTS responses carry
/// 0xFFFFFFFF chunk sizes that strict readers reject. Float32 and Int32
/// data are converted down to Int16.
pub fn wav_to_pcm(wav_bytes: &[u8]) -> Result<(Vec<u8>, u32)> {
    if wav_bytes.len() < 44 {
        bail!("WAV data too short: {} bytes", wav_bytes.len());
    }
    if &wav_bytes[0..4] != b"RIFF" || &wav_bytes[8..12] != b"WAVE" {
        bail!("Not a valid WAV file");
    }

    let mut pos = 12;
    let mut data_start = 0usize;
    let mut audio_format = 0u16;
    let mut bits_per_sample = 0u16;
    let mut sample_rate = 0u32;

    while pos + 8 <= wav_bytes.len() {
        let chunk_id = &wav_bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes([
            wav_bytes[pos + 4],
            wav_bytes[pos + 5],
            wav_bytes[pos + 6],
            wav_bytes[pos + 7],
        ]);

        if chunk_id == b"fmt " {
            if pos + 8 + 16 <= wav_bytes.len() {
                audio_format = u16::from_le_bytes([wav_bytes[pos + 8], wav_bytes[pos + 9]]);
                sample_rate = u32::from_le_bytes([
                    wav_bytes[pos + 12],
                    wav_bytes[pos + 13],
                    wav_bytes[pos + 14],
                    wav_bytes[pos + 15],
                ]);
                bits_per_sample =
                    u16::from_le_bytes([wav_bytes[pos + 22], wav_bytes[pos + 23]]);
            }
            let real_size = if chunk_size == 0xFFFFFFFF { 16 } else { chunk_size as usize };
            pos += 8 + real_size;
        } else if chunk_id == b"data" {
            data_start = pos + 8;
            break;
        } else {
            let real_size = if chunk_size == 0xFFFFFFFF { 0 } else { chunk_size as usize };
            pos += 8 + real_size;
        }
    }

    if data_start == 0 || data_start >= wav_bytes.len() {
        bail!("Could not find data chunk in WAV");
    }
    if sample_rate == 0 {
        bail!("WAV fmt chunk missing or invalid");
    }

    let audio_data = &wav_bytes[data_start..];
    let mut pcm = Vec::with_capacity(audio_data.len());

    match audio_format {
        3 => {
            // IEEE Float32 -> Int16
            for chunk in audio_data.chunks_exact(4) {
                let f = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let v = (f * 32767.0).clamp(-32768.0, 32767.0) as i16;
                pcm.extend_from_slice(&v.to_le_bytes());
            }
        }
        1 => match bits_per_sample {
            16 => pcm.extend_from_slice(&audio_data[..audio_data.len() & !1]),
            32 => {
                for chunk in audio_data.chunks_exact(4) {
                    let v32 = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    let v = (v32 >> 16) as i16;
                    pcm.extend_from_slice(&v.to_le_bytes());
                }
            }
            other => bail!("Unsupported WAV bit depth: {}", other),
        },
        other => bail!("Unsupported WAV audio format: {}", other),
    }

    Ok((pcm, sample_rate))
}

/// Resample 16-bit LE mono PCM between rates using linear interpolation.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Vec<u8> {
    if from_rate == to_rate || pcm.len() < 2 {
        return pcm.to_vec();
    }

    let samples: Vec<i16> = pcm
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(out_len * 2);

    for i in 0..out_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len() - 1);
        let frac = (src_idx - idx_floor as f64) as f32;

        let value = samples[idx_floor] as f32 * (1.0 - frac) + samples[idx_ceil] as f32 * frac;
        out.extend_from_slice(&(value as i16).to_le_bytes());
    }

    out
}

/// Split PCM into fixed-size frames. Concatenation of the frames equals
/// the input; the final frame may be shorter.
pub fn chunk_frames(pcm: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    debug_assert!(chunk_size > 0 && chunk_size % FRAME_ALIGNMENT == 0);
    pcm.chunks(chunk_size.max(1)).map(|c| c.to_vec()).collect()
}

/// Ratio of samples whose absolute amplitude exceeds `threshold`.
///
/// Used as a cheap gate so buffers of line noise never reach STT.
pub fn voiced_ratio(pcm: &[u8], threshold: i16) -> f32 {
    let total = pcm.len() / 2;
    if total == 0 {
        return 0.0;
    }
    let voiced = pcm
        .chunks_exact(2)
        .filter(|c| i16::from_le_bytes([c[0], c[1]]).unsigned_abs() > threshold.unsigned_abs())
        .count();
    voiced as f32 / total as f32
}

/// One second of PCM silence at the given rate.
pub fn silence(sample_rate: u32, seconds: f32) -> Vec<u8> {
    vec![0u8; (sample_rate as f32 * 2.0 * seconds) as usize]
}
