use std::io::Cursor;

/// Twilio media streams carry mu-law at 8 kHz.
pub const TWILIO_SAMPLE_RATE: u32 = 8000;
/// Rate we feed speech-to-text.
pub const STT_SAMPLE_RATE: u32 = 16000;
/// One outbound frame is 20 ms of mu-law at 8 kHz.
pub const TWILIO_FRAME_BYTES: usize = 160;
/// Mu-law silence (the encoding of PCM zero).
pub const MULAW_SILENCE: u8 = 0xFF;

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Standard G.711 mu-law expansion table, computed once at compile time.
const MULAW_DECODE: [i16; 256] = build_decode_table();

const fn build_decode_table() -> [i16; 256] {
    let mut table = [0i16; 256];
    let mut i = 0usize;
    while i < 256 {
        let mulaw = !(i as u8);
        let sign = mulaw & 0x80;
        let exponent = (mulaw >> 4) & 0x07;
        let mantissa = mulaw & 0x0F;
        let mut sample = (((mantissa as i32) << 3) + MULAW_BIAS) << exponent;
        sample -= MULAW_BIAS;
        table[i] = if sign != 0 { -sample as i16 } else { sample as i16 };
        i += 1;
    }
    table
}

/// Decode a single mu-law byte to a 16-bit PCM sample.
pub fn mulaw_to_pcm(mulaw: u8) -> i16 {
    MULAW_DECODE[mulaw as usize]
}

/// Encode a 16-bit PCM sample to a mu-law byte per ITU-T G.711
/// (bias 0x84, clip 32635, final bit inversion).
pub fn pcm_to_mulaw(sample: i16) -> u8 {
    let mut value = sample as i32;
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };

    if value > MULAW_CLIP {
        value = MULAW_CLIP;
    }
    value += MULAW_BIAS;

    let exponent = compress_table((value >> 7) as u8);
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

fn compress_table(val: u8) -> u8 {
    match val {
        0..=1 => 0,
        2..=3 => 1,
        4..=7 => 2,
        8..=15 => 3,
        16..=31 => 4,
        32..=63 => 5,
        64..=127 => 6,
        _ => 7,
    }
}

/// Decode a buffer of mu-law bytes to 16-bit PCM samples.
pub fn decode_mulaw(mulaw_data: &[u8]) -> Vec<i16> {
    mulaw_data.iter().map(|&b| mulaw_to_pcm(b)).collect()
}

/// Encode 16-bit PCM samples to mu-law bytes.
pub fn encode_mulaw(pcm_data: &[i16]) -> Vec<u8> {
    pcm_data.iter().map(|&s| pcm_to_mulaw(s)).collect()
}

/// Interpret bytes as 16-bit little-endian PCM. A trailing odd byte is
/// treated as truncation and dropped.
pub fn pcm_bytes_to_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Serialize PCM samples as 16-bit little-endian bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Linear-interpolation resampler. Identity when rates match.
///
/// Voice-band only; the rates we bridge (8/16/24 kHz) are integer-related
/// so this stays deterministic and cheap.
pub fn resample(samples: &[i16], src_rate: u32, dst_rate: u32) -> Vec<i16> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let s0 = samples[idx] as f64;
        let s1 = if idx + 1 < samples.len() {
            samples[idx + 1] as f64
        } else {
            s0
        };
        out.push((s0 + (s1 - s0) * frac).round() as i16);
    }

    out
}

/// Little-endian PCM at `src_rate` → 8 kHz mu-law, framed as exactly
/// 160-byte chunks. The last frame is right-padded with mu-law silence.
pub fn convert_to_twilio(pcm_bytes: &[u8], src_rate: u32) -> Vec<Vec<u8>> {
    let samples = pcm_bytes_to_samples(pcm_bytes);
    let resampled = resample(&samples, src_rate, TWILIO_SAMPLE_RATE);
    let mulaw = encode_mulaw(&resampled);

    mulaw
        .chunks(TWILIO_FRAME_BYTES)
        .map(|chunk| {
            let mut frame = chunk.to_vec();
            frame.resize(TWILIO_FRAME_BYTES, MULAW_SILENCE);
            frame
        })
        .collect()
}

/// Inbound mu-law chunks → little-endian PCM at `dst_rate`.
pub fn convert_from_twilio(mulaw_chunks: &[Vec<u8>], dst_rate: u32) -> Vec<u8> {
    let mut pcm = Vec::new();
    for chunk in mulaw_chunks {
        pcm.extend(decode_mulaw(chunk));
    }
    let resampled = resample(&pcm, TWILIO_SAMPLE_RATE, dst_rate);
    samples_to_pcm_bytes(&resampled)
}

/// Encode PCM samples as a WAV file in memory (16-bit mono).
pub fn pcm_to_wav(pcm_data: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let mut buffer = Cursor::new(Vec::new());

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::new(&mut buffer, spec)?;
    for &sample in pcm_data {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;

    Ok(buffer.into_inner())
}

/// RMS energy of PCM samples, used by the batch STT silence gate.
pub fn rms_energy(pcm_data: &[i16]) -> f64 {
    if pcm_data.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm_data.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / pcm_data.len() as f64).sqrt()
}
