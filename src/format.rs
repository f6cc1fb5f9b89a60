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

use crate::error::AudioError;

/// The PCM layout of registered sample data. All sample data in the registry
/// is one of these four layouts; compressed sources are decoded at
/// registration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleEncoding {
    U8Mono,
    U8Stereo,
    S16Mono,
    S16Stereo,
}

impl SampleEncoding {
    /// Maps WAVE fmt fields onto an encoding. Anything other than 8 or 16 bit
    /// mono/stereo PCM is unsupported.
    pub fn from_parts(bits: u16, channels: u16) -> Result<SampleEncoding, AudioError> {
        match (bits, channels) {
            (8, 1) => Ok(SampleEncoding::U8Mono),
            (8, 2) => Ok(SampleEncoding::U8Stereo),
            (16, 1) => Ok(SampleEncoding::S16Mono),
            (16, 2) => Ok(SampleEncoding::S16Stereo),
            _ => Err(AudioError::UnsupportedFormat(format!(
                "{bits} bit, {channels} channel PCM"
            ))),
        }
    }

    /// Shift converting a byte count to a count of sample frames. Positions
    /// and loop points are stored in frames; external APIs speak bytes.
    pub fn shift(self) -> u32 {
        match self {
            SampleEncoding::U8Mono => 0,
            SampleEncoding::U8Stereo | SampleEncoding::S16Mono => 1,
            SampleEncoding::S16Stereo => 2,
        }
    }

    /// Bytes per sample frame.
    pub fn frame_bytes(self) -> u64 {
        1 << self.shift()
    }

    pub fn is_stereo(self) -> bool {
        matches!(self, SampleEncoding::U8Stereo | SampleEncoding::S16Stereo)
    }

    pub fn bits(self) -> u16 {
        match self {
            SampleEncoding::U8Mono | SampleEncoding::U8Stereo => 8,
            SampleEncoding::S16Mono | SampleEncoding::S16Stereo => 16,
        }
    }
}

/// How a sample loops during playback.
///
/// `SingleRelease` and `Double` carry a release phase: stop-looping moves the
/// channel out of the first loop and, for `Double`, into the second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoopMode {
    #[default]
    None,
    /// Loop the first region until explicitly stopped.
    Single,
    /// Loop the first region until released, then play through to the end.
    SingleRelease,
    /// Loop the first region until released, then loop the second region.
    Double,
}

/// Loop regions in sample frames. Regions are half-open `[start, end)`;
/// a zero-length region means "not present".
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopSpec {
    pub mode: LoopMode,
    pub first_start: u64,
    pub first_end: u64,
    pub second_start: u64,
    pub second_end: u64,
}

impl LoopSpec {
    /// Loop spec for a non-looping sample.
    pub fn none() -> LoopSpec {
        LoopSpec::default()
    }

    /// A single repeating region over `[start, end)` frames.
    pub fn single(start: u64, end: u64) -> LoopSpec {
        LoopSpec {
            mode: LoopMode::Single,
            first_start: start,
            first_end: end,
            ..LoopSpec::default()
        }
    }

    pub fn has_first(&self) -> bool {
        self.mode != LoopMode::None && self.first_end > self.first_start
    }

    pub fn has_second(&self) -> bool {
        self.mode == LoopMode::Double && self.second_end > self.second_start
    }

    /// Clamps loop regions to the sample length and drops empty ones.
    pub fn normalized(mut self, frames: u64) -> LoopSpec {
        self.first_end = self.first_end.min(frames);
        self.second_end = self.second_end.min(frames);
        if self.first_end <= self.first_start {
            self.mode = LoopMode::None;
        } else if self.mode == LoopMode::Double && self.second_end <= self.second_start {
            self.mode = LoopMode::SingleRelease;
        }
        self
    }
}
