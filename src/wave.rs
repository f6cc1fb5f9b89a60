// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::io::{Read, Seek, SeekFrom};

use crate::error::AudioError;
use crate::format::SampleEncoding;

/// WAVE format tag for integer PCM.
pub const FORMAT_PCM: u16 = 0x0001;
/// WAVE format tag for IMA/DVI ADPCM.
pub const FORMAT_IMA_ADPCM: u16 = 0x0011;

/// Parsed `fmt ` and `data` chunk information for a WAVE file.
#[derive(Clone, Debug)]
pub struct WaveInfo {
    pub format_tag: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Absolute byte offset of the start of sample data.
    pub data_offset: u64,
    /// Length of the data chunk in bytes.
    pub data_len: u64,
}

impl WaveInfo {
    /// The PCM layout of the data once decoded. ADPCM always decodes to
    /// 16 bit.
    pub fn encoding(&self) -> Result<SampleEncoding, AudioError> {
        match self.format_tag {
            FORMAT_PCM => SampleEncoding::from_parts(self.bits_per_sample, self.channels),
            FORMAT_IMA_ADPCM => SampleEncoding::from_parts(16, self.channels),
            tag => Err(AudioError::UnsupportedFormat(format!(
                "WAVE format tag {tag:#06x}"
            ))),
        }
    }

    pub fn is_adpcm(&self) -> bool {
        self.format_tag == FORMAT_IMA_ADPCM
    }

    /// Decoded PCM sample frames per ADPCM block. Nibbles come in 4 byte
    /// groups per channel; trailing bytes that do not fill a group carry no
    /// samples.
    pub fn adpcm_samples_per_block(&self) -> usize {
        let channels = self.channels.max(1) as usize;
        let data_bytes = (self.block_align as usize).saturating_sub(4 * channels);
        data_bytes / (4 * channels) * 8 + 1
    }

    /// The length of the data in bytes once decoded to PCM.
    pub fn decoded_len(&self) -> u64 {
        if !self.is_adpcm() {
            return self.data_len;
        }
        if self.block_align == 0 {
            return 0;
        }
        let blocks = self.data_len / self.block_align as u64;
        blocks * self.adpcm_samples_per_block() as u64 * 2 * self.channels as u64
    }
}

/// Parses the RIFF/WAVE header of `reader`, leaving it positioned at the
/// start of the data chunk. Chunk sizes are rounded up to even byte counts
/// when skipping, per the RIFF padding rule.
pub fn parse_header<R: Read + Seek>(reader: &mut R) -> Result<WaveInfo, AudioError> {
    let mut riff = [0u8; 12];
    reader.read_exact(&mut riff)?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Err(AudioError::UnsupportedFormat(String::from(
            "not a RIFF/WAVE file",
        )));
    }

    let mut fmt: Option<(u16, u16, u32, u32, u16, u16)> = None;
    loop {
        let mut chunk_header = [0u8; 8];
        reader.read_exact(&mut chunk_header).map_err(|_| {
            AudioError::UnsupportedFormat(String::from("WAVE file has no data chunk"))
        })?;
        let chunk_id = [
            chunk_header[0],
            chunk_header[1],
            chunk_header[2],
            chunk_header[3],
        ];
        let chunk_len = u32::from_le_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as u64;

        match &chunk_id {
            b"fmt " => {
                if chunk_len < 16 {
                    return Err(AudioError::UnsupportedFormat(String::from(
                        "truncated fmt chunk",
                    )));
                }
                let mut buf = [0u8; 16];
                reader.read_exact(&mut buf)?;
                fmt = Some((
                    u16::from_le_bytes([buf[0], buf[1]]),
                    u16::from_le_bytes([buf[2], buf[3]]),
                    u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
                    u16::from_le_bytes([buf[12], buf[13]]),
                    u16::from_le_bytes([buf[14], buf[15]]),
                ));
                // Skip any extension bytes, with the RIFF pad byte.
                let skip = (chunk_len - 16 + 1) & !1;
                reader.seek(SeekFrom::Current(skip as i64))?;
            }
            b"data" => {
                let (format_tag, channels, sample_rate, avg_bytes_per_sec, block_align, bits) =
                    fmt.ok_or_else(|| {
                        AudioError::UnsupportedFormat(String::from(
                            "WAVE data chunk precedes fmt chunk",
                        ))
                    })?;
                let data_offset = reader.stream_position()?;
                let info = WaveInfo {
                    format_tag,
                    channels,
                    sample_rate,
                    avg_bytes_per_sec,
                    block_align,
                    bits_per_sample: bits,
                    data_offset,
                    data_len: chunk_len,
                };
                // Reject unsupported tags up front.
                info.encoding()?;
                if info.sample_rate == 0 {
                    return Err(AudioError::UnsupportedFormat(String::from(
                        "WAVE sample rate is zero",
                    )));
                }
                if info.is_adpcm() && (info.block_align as usize) < 4 * info.channels as usize + 4 {
                    return Err(AudioError::UnsupportedFormat(String::from(
                        "ADPCM block alignment too small",
                    )));
                }
                return Ok(info);
            }
            _ => {
                reader.seek(SeekFrom::Current(((chunk_len + 1) & !1) as i64))?;
            }
        }
    }
}

const ADPCM_INDEX_TABLE: [i32; 16] = [-1, -1, -1, -1, 2, 4, 6, 8, -1, -1, -1, -1, 2, 4, 6, 8];

const ADPCM_STEP_TABLE: [i32; 89] = [
    7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 19, 21, 23, 25, 28, 31, 34, 37, 41, 45, 50, 55, 60, 66,
    73, 80, 88, 97, 107, 118, 130, 143, 157, 173, 190, 209, 230, 253, 279, 307, 337, 371, 408,
    449, 494, 544, 598, 658, 724, 796, 876, 963, 1060, 1166, 1282, 1411, 1552, 1707, 1878, 2066,
    2272, 2499, 2749, 3024, 3327, 3660, 4026, 4428, 4871, 5358, 5894, 6484, 7132, 7845, 8630,
    9493, 10442, 11487, 12635, 13899, 15289, 16818, 18500, 20350, 22385, 24623, 27086, 29794,
    32767,
];

/// One channel's ADPCM predictor state.
struct AdpcmState {
    predictor: i32,
    step_index: i32,
}

impl AdpcmState {
    fn decode(&mut self, nibble: u8) -> i16 {
        let step = ADPCM_STEP_TABLE[self.step_index as usize];
        let mut diff = step >> 3;
        if nibble & 1 != 0 {
            diff += step >> 2;
        }
        if nibble & 2 != 0 {
            diff += step >> 1;
        }
        if nibble & 4 != 0 {
            diff += step;
        }
        if nibble & 8 != 0 {
            self.predictor -= diff;
        } else {
            self.predictor += diff;
        }
        self.predictor = self.predictor.clamp(i16::MIN as i32, i16::MAX as i32);
        self.step_index = (self.step_index + ADPCM_INDEX_TABLE[nibble as usize]).clamp(0, 88);
        self.predictor as i16
    }
}

/// Decodes IMA ADPCM blocks to interleaved 16 bit little-endian PCM.
/// A trailing partial block is ignored.
pub fn decode_ima_adpcm(data: &[u8], channels: u16, block_align: usize) -> Vec<u8> {
    let channels = channels.max(1) as usize;
    if block_align < 4 * channels + 4 {
        return Vec::new();
    }
    // One frame from the header predictors plus eight per whole nibble
    // group; trailing bytes short of a group are ignored.
    let samples_per_block = (block_align - 4 * channels) / (4 * channels) * 8 + 1;
    let blocks = data.len() / block_align;
    let mut out = Vec::with_capacity(blocks * samples_per_block * channels * 2);

    for block in data.chunks_exact(block_align) {
        let mut states = Vec::with_capacity(channels);
        // Each channel leads with a 4 byte header whose predictor is also
        // the first output sample.
        for ch in 0..channels {
            let base = ch * 4;
            let predictor = i16::from_le_bytes([block[base], block[base + 1]]) as i32;
            let step_index = (block[base + 2] as i32).clamp(0, 88);
            states.push(AdpcmState {
                predictor,
                step_index,
            });
        }
        for state in &states {
            out.extend_from_slice(&(state.predictor as i16).to_le_bytes());
        }

        // Data nibbles come in 4 byte groups per channel, channels
        // interleaved group-wise. Low nibble first within each byte.
        let payload = &block[4 * channels..];
        let groups = payload.len() / (4 * channels);
        let mut decoded: Vec<Vec<i16>> = vec![Vec::with_capacity(samples_per_block); channels];
        for group in 0..groups {
            for (ch, samples) in decoded.iter_mut().enumerate() {
                let base = (group * channels + ch) * 4;
                for byte in &payload[base..base + 4] {
                    samples.push(states[ch].decode(byte & 0x0f));
                    samples.push(states[ch].decode(byte >> 4));
                }
            }
        }
        for i in 0..samples_per_block - 1 {
            for samples in &decoded {
                out.extend_from_slice(&samples[i].to_le_bytes());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn wave_bytes(format_tag: u16, channels: u16, bits: u16, data: &[u8]) -> Vec<u8> {
        let block_align = if format_tag == FORMAT_PCM {
            channels * bits / 8
        } else {
            8
        };
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36u32 + data.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&format_tag.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&44100u32.to_le_bytes());
        out.extend_from_slice(&176400u32.to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&bits.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_parse_pcm_header() {
        let bytes = wave_bytes(FORMAT_PCM, 2, 16, &[0u8; 16]);
        let mut cursor = Cursor::new(bytes);
        let info = parse_header(&mut cursor).expect("Unable to parse header");
        assert_eq!(info.channels, 2);
        assert_eq!(info.sample_rate, 44100);
        assert_eq!(info.data_len, 16);
        assert_eq!(info.data_offset, 44);
        assert_eq!(
            info.encoding().expect("encoding"),
            SampleEncoding::S16Stereo
        );
        assert_eq!(cursor.position(), 44);
    }

    #[test]
    fn test_parse_rejects_float_format() {
        // Format tag 3 is IEEE float, which the engine does not accept.
        let bytes = wave_bytes(0x0003, 2, 32, &[0u8; 16]);
        let mut cursor = Cursor::new(bytes);
        match parse_header(&mut cursor) {
            Err(AudioError::UnsupportedFormat(msg)) => assert!(msg.contains("0x0003")),
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_skips_odd_sized_chunks() {
        // A 3 byte LIST chunk before data must be skipped with its pad byte.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&FORMAT_PCM.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8000u32.to_le_bytes());
        bytes.extend_from_slice(&8000u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&8u16.to_le_bytes());
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 0]); // chunk + pad byte
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[128, 128, 128, 128]);

        let mut cursor = Cursor::new(bytes);
        let info = parse_header(&mut cursor).expect("Unable to parse header");
        assert_eq!(info.data_len, 4);
        assert_eq!(info.encoding().expect("encoding"), SampleEncoding::U8Mono);
    }

    #[test]
    fn test_parse_missing_data_chunk() {
        let mut bytes = wave_bytes(FORMAT_PCM, 1, 8, &[]);
        bytes.truncate(36); // cut off the data chunk header
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            parse_header(&mut cursor),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_adpcm_decode_known_block() {
        // Mono block, align 8: header (predictor 0, index 0) then nibbles
        // 0, 3, 8, 7, 0, 0, 0, 0.
        let block = [0u8, 0, 0, 0, 0x30, 0x78, 0x00, 0x00];
        let pcm = decode_ima_adpcm(&block, 1, 8);
        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![0, 0, 4, 4, 15, 17, 18, 19, 20]);
    }

    #[test]
    fn test_adpcm_decode_ignores_partial_block() {
        let mut data = vec![0u8; 8];
        data.extend_from_slice(&[0u8; 3]);
        let pcm = decode_ima_adpcm(&data, 1, 8);
        // One full block of 9 samples, partial trailing data dropped.
        assert_eq!(pcm.len(), 9 * 2);
    }

    #[test]
    fn test_adpcm_decode_odd_block_alignment() {
        // A mono block of 10 bytes has one whole nibble group and two
        // leftover bytes; those bytes carry no samples.
        let pcm = decode_ima_adpcm(&[0u8; 10], 1, 10);
        assert_eq!(pcm.len(), 9 * 2);

        let info = WaveInfo {
            format_tag: FORMAT_IMA_ADPCM,
            channels: 1,
            sample_rate: 8000,
            avg_bytes_per_sec: 4000,
            block_align: 10,
            bits_per_sample: 4,
            data_offset: 44,
            data_len: 20,
        };
        assert_eq!(info.decoded_len(), pcm.len() as u64 * 2);
    }

    #[test]
    fn test_adpcm_decoded_len() {
        let info = WaveInfo {
            format_tag: FORMAT_IMA_ADPCM,
            channels: 1,
            sample_rate: 8000,
            avg_bytes_per_sec: 4000,
            block_align: 8,
            bits_per_sample: 4,
            data_offset: 44,
            data_len: 16,
        };
        // Two blocks of nine mono samples.
        assert_eq!(info.decoded_len(), 2 * 9 * 2);
    }
}
