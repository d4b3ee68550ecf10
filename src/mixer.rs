use log::warn;
use opus::{Application, Bitrate, Channels, Decoder, Encoder};

use crate::pool::Pool;

/// Codec sample rate, Hz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Mono; conferencing voice gains nothing from stereo here.
pub const CHANNELS: usize = 1;

/// Samples per 20 ms frame at 48 kHz.
pub const FRAME_SAMPLES: usize = 960;

/// Upper bound for one encoded packet.
pub const MAX_PACKET_LEN: usize = 4_000;

/// Voice-optimized target bitrate, bits per second.
pub const BITRATE: i32 = 64_000;

/// Decode / sum / clip / re-encode pipeline for one room.
///
/// The mixer owns a single Opus encoder and decoder; neither is shareable,
/// and both carry inter-frame state, so a mixer must only ever be driven from
/// the mix loop. PCM scratch buffers are recycled through an object pool
/// rather than allocated per tick.
pub struct AudioMixer {
    encoder: Encoder,
    decoder: Decoder,
    pcm_pool: Pool<Vec<i16>>,
}

impl AudioMixer {
    pub fn new() -> Result<AudioMixer, opus::Error> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(Bitrate::Bits(BITRATE))?;
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)?;
        Ok(AudioMixer {
            encoder,
            decoder,
            pcm_pool: Pool::new(|| vec![0i16; FRAME_SAMPLES * CHANNELS]),
        })
    }

    /// Mixes one tick's worth of speaker frames into a single encoded packet.
    ///
    /// Inputs that fail to decode, or decode to the wrong sample count, are
    /// dropped with a log line; one corrupted speaker must not poison the
    /// whole mix. Returns `None` when no input contributed or the re-encode
    /// produced nothing.
    pub fn mix(&mut self, frames: &[Vec<u8>]) -> Option<Vec<u8>> {
        if frames.is_empty() {
            return None;
        }

        let mut decoded = Vec::with_capacity(frames.len());
        for frame in frames {
            let mut pcm = self.pcm_pool.acquire();
            match self.decoder.decode(frame, &mut pcm[..], false) {
                Ok(samples) if samples == FRAME_SAMPLES => decoded.push(pcm),
                Ok(samples) => warn!(
                    "discarding frame: decoded {} samples, expected {}",
                    samples, FRAME_SAMPLES
                ),
                Err(err) => warn!("discarding undecodable frame: {}", err),
            }
        }
        if decoded.is_empty() {
            return None;
        }

        let inputs: Vec<&[i16]> = decoded.iter().map(|pcm| &pcm[..]).collect();
        let mixed = mix_pcm(&inputs);

        let mut packet = vec![0u8; MAX_PACKET_LEN];
        match self.encoder.encode(&mixed, &mut packet) {
            Ok(0) => None,
            Ok(n) => {
                packet.truncate(n);
                Some(packet)
            }
            Err(err) => {
                warn!("encode failed: {}", err);
                None
            }
        }
    }
}

/// Additive mix with clip protection.
///
/// Accumulation runs in 32 bits and clamps into i16 range at every step, so
/// numerical wrap is impossible by construction. With more than two
/// contributors each sample is divided by `K/2` as a crude pre-limiter; the
/// division is integral, keeping the pipeline deterministic.
fn mix_pcm(inputs: &[&[i16]]) -> Vec<i16> {
    let mut acc = vec![0i32; FRAME_SAMPLES * CHANNELS];
    for pcm in inputs {
        for (sum, &sample) in acc.iter_mut().zip(pcm.iter()) {
            *sum = (*sum + i32::from(sample)).clamp(i32::from(i16::MIN), i32::from(i16::MAX));
        }
    }

    let contributors = inputs.len();
    if contributors > 2 {
        let div = (contributors / 2) as i32;
        for sum in acc.iter_mut() {
            *sum /= div;
        }
    }

    acc.into_iter().map(|sum| sum as i16).collect()
}

#[cfg(test)]
mod tests {
    use super::{mix_pcm, FRAME_SAMPLES};

    fn flat(value: i16) -> Vec<i16> {
        vec![value; FRAME_SAMPLES]
    }

    #[test]
    fn single_input_passes_through() {
        let input = flat(1234);
        let mixed = mix_pcm(&[&input]);
        assert_eq!(mixed, input);
    }

    #[test]
    fn two_inputs_sum() {
        let a = flat(1000);
        let b = flat(-300);
        let mixed = mix_pcm(&[&a, &b]);
        assert!(mixed.iter().all(|&s| s == 700));
    }

    #[test]
    fn clamps_instead_of_wrapping() {
        let loud = flat(i16::MAX);
        let mixed = mix_pcm(&[&loud, &loud]);
        assert!(mixed.iter().all(|&s| s == i16::MAX));

        let quiet = flat(i16::MIN);
        let mixed = mix_pcm(&[&quiet, &quiet]);
        assert!(mixed.iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn many_contributors_are_limited() {
        let inputs: Vec<Vec<i16>> = (0..16).map(|_| flat(i16::MAX)).collect();
        let refs: Vec<&[i16]> = inputs.iter().map(|v| &v[..]).collect();
        let mixed = mix_pcm(&refs);
        // Clamped to 32767 during accumulation, then divided by 16/2.
        assert!(mixed.iter().all(|&s| s == i16::MAX / 8));
    }

    #[test]
    fn three_contributors_divide_by_one() {
        // K/2 in integer math is 1 for K = 3: the limiter only starts biting
        // at four speakers.
        let inputs = [flat(100), flat(100), flat(100)];
        let refs: Vec<&[i16]> = inputs.iter().map(|v| &v[..]).collect();
        let mixed = mix_pcm(&refs);
        assert!(mixed.iter().all(|&s| s == 300));
    }
}
