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
use std::fmt;

use tracing::debug;

use crate::error::AudioError;
use crate::format::{LoopSpec, SampleEncoding};

/// Streaming buffers hold roughly this many seconds of audio.
pub const STREAM_BUFFER_SECONDS: u64 = 3;
/// Smallest permissible streaming buffer in bytes.
pub const MIN_STREAM_BUFFER: u64 = 256;

/// Opaque identifier for one registered audio source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SampleHandle(u32);

impl SampleHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SampleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of one read from a stream source. End-of-source is a distinct
/// outcome, never an error.
pub enum ReadOutcome {
    /// Bytes were produced into the buffer.
    Data(usize),
    /// The source is exhausted.
    End,
}

/// A producer of decoded PCM bytes for a streaming sample. Positions are
/// byte offsets into the decoded PCM space of the source.
pub trait StreamSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, AudioError>;
    fn seek(&mut self, position: u64) -> Result<(), AudioError>;
}

/// Mutable state of a streaming sample: the source plus ring fill tracking.
pub struct StreamState {
    pub source: Box<dyn StreamSource>,
    /// Byte offset within the source where playback begins.
    pub seek_start: u64,
    /// Total decoded length in bytes. `u64::MAX` when unknown.
    pub total_len: u64,
    /// Bytes written into the ring since the last rewind.
    pub written: u64,
    /// Set once the source reports end and no loop restart applies.
    pub ended: bool,
    /// Restart the source from `seek_start` at end-of-source.
    pub looping: bool,
}

impl StreamState {
    /// Bytes of valid data the consumer has not yet played, given the
    /// consumer's total consumed byte count.
    pub fn pending(&self, consumed: u64) -> u64 {
        self.written.saturating_sub(consumed)
    }

    /// The consumer byte count at which playback should stop.
    pub fn play_limit(&self) -> u64 {
        if self.ended {
            self.written.min(self.total_len)
        } else {
            self.total_len
        }
    }
}

/// One registered sample: fully resident PCM data, or a ring buffer fed by a
/// stream source.
pub struct SampleEntry {
    pub encoding: SampleEncoding,
    pub rate: u32,
    /// Resident PCM, or the stream ring.
    pub data: Vec<u8>,
    /// Length of `data` in sample frames.
    pub frames: u64,
    pub loops: LoopSpec,
    pub stream: Option<StreamState>,
}

impl SampleEntry {
    pub fn is_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Tops up the stream ring. `consumed` is the consumer's total consumed
    /// byte count, used to bound the writable region so unplayed data is
    /// never overwritten. Returns true if the source has ended.
    pub fn top_up(&mut self, consumed: u64) -> Result<bool, AudioError> {
        let ring_len = self.data.len() as u64;
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Ok(true),
        };
        if stream.ended || ring_len == 0 {
            return Ok(stream.ended);
        }

        let mut free = ring_len.saturating_sub(stream.pending(consumed));
        while free > 0 {
            let offset = (stream.written % ring_len) as usize;
            let span = (ring_len as usize - offset).min(free as usize);
            match stream.source.read(&mut self.data[offset..offset + span])? {
                ReadOutcome::Data(n) => {
                    stream.written += n as u64;
                    free -= n as u64;
                }
                ReadOutcome::End => {
                    if stream.looping {
                        stream.source.seek(stream.seek_start)?;
                    } else {
                        stream.ended = true;
                        break;
                    }
                }
            }
        }
        Ok(stream.ended)
    }

    /// Rewinds the stream to `position` bytes past its seek start and
    /// refills the ring from there. The caller resets the consumer cursor.
    pub fn rewind_stream(&mut self, position: u64) -> Result<(), AudioError> {
        if let Some(stream) = self.stream.as_mut() {
            stream.source.seek(stream.seek_start + position)?;
            stream.written = 0;
            stream.ended = false;
        }
        self.top_up(0)?;
        Ok(())
    }
}

/// The sample registry: a slab of entries addressed by opaque handles.
/// Handles are slot indices and may be reused after removal.
#[derive(Default)]
pub struct SampleRegistry {
    entries: Vec<Option<SampleEntry>>,
}

impl SampleRegistry {
    pub fn new() -> SampleRegistry {
        SampleRegistry::default()
    }

    fn insert(&mut self, entry: SampleEntry) -> SampleHandle {
        // Reuse the first vacated slot before growing the slab.
        for (i, slot) in self.entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return SampleHandle(i as u32 + 1);
            }
        }
        self.entries.push(Some(entry));
        SampleHandle(self.entries.len() as u32)
    }

    /// Registers fully resident PCM data. Loop offsets are given in bytes
    /// and converted to frames internally.
    pub fn register(
        &mut self,
        encoding: SampleEncoding,
        rate: u32,
        data: Vec<u8>,
        loops_bytes: LoopSpec,
    ) -> Result<SampleHandle, AudioError> {
        if data.is_empty() {
            return Err(AudioError::AllocationFailure(String::from(
                "sample data is empty",
            )));
        }
        if rate == 0 {
            return Err(AudioError::UnsupportedFormat(String::from(
                "sample rate is zero",
            )));
        }
        let shift = encoding.shift();
        let frames = data.len() as u64 >> shift;
        let loops = LoopSpec {
            mode: loops_bytes.mode,
            first_start: loops_bytes.first_start >> shift,
            first_end: loops_bytes.first_end >> shift,
            second_start: loops_bytes.second_start >> shift,
            second_end: loops_bytes.second_end >> shift,
        }
        .normalized(frames);

        let handle = self.insert(SampleEntry {
            encoding,
            rate,
            data,
            frames,
            loops,
            stream: None,
        });
        debug!(handle = %handle, frames, "Registered sample");
        Ok(handle)
    }

    /// Registers a streaming sample. `total_len` of zero means the decoded
    /// length is unknown. `buffer_len` of zero sizes the ring automatically
    /// from the data rate.
    pub fn attach_stream(
        &mut self,
        encoding: SampleEncoding,
        rate: u32,
        mut source: Box<dyn StreamSource>,
        seek_start: u64,
        total_len: u64,
        buffer_len: u64,
        looping: bool,
    ) -> Result<SampleHandle, AudioError> {
        if rate == 0 {
            return Err(AudioError::UnsupportedFormat(String::from(
                "sample rate is zero",
            )));
        }
        let total_len = if total_len == 0 { u64::MAX } else { total_len };
        let frame_bytes = encoding.frame_bytes();
        let mut buffer_len = if buffer_len == 0 {
            rate as u64 * frame_bytes * STREAM_BUFFER_SECONDS
        } else {
            buffer_len
        };
        buffer_len = buffer_len.min(total_len).max(MIN_STREAM_BUFFER);
        // Whole frames only.
        buffer_len &= !(frame_bytes - 1);

        source.seek(seek_start)?;
        let mut entry = SampleEntry {
            encoding,
            rate,
            data: vec![0; buffer_len as usize],
            frames: buffer_len >> encoding.shift(),
            loops: LoopSpec::none(),
            stream: Some(StreamState {
                source,
                seek_start,
                total_len,
                written: 0,
                ended: false,
                looping,
            }),
        };
        entry.top_up(0)?;

        let handle = self.insert(entry);
        debug!(handle = %handle, buffer_len, "Attached stream");
        Ok(handle)
    }

    pub fn get(&self, handle: SampleHandle) -> Option<&SampleEntry> {
        self.entries
            .get(handle.0.wrapping_sub(1) as usize)
            .and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, handle: SampleHandle) -> Option<&mut SampleEntry> {
        self.entries
            .get_mut(handle.0.wrapping_sub(1) as usize)
            .and_then(|e| e.as_mut())
    }

    /// Removes an entry, returning whether it existed. Channels referencing
    /// the handle must be stopped by the caller first.
    pub fn remove(&mut self, handle: SampleHandle) -> bool {
        match self.entries.get_mut(handle.0.wrapping_sub(1) as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                debug!(handle = %handle, "Removed sample");
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::LoopMode;

    /// Produces an incrementing byte pattern, restartable via seek.
    pub(crate) struct PatternSource {
        pub len: u64,
        pub pos: u64,
    }

    impl StreamSource for PatternSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, AudioError> {
            if self.pos >= self.len {
                return Ok(ReadOutcome::End);
            }
            let n = buf.len().min((self.len - self.pos) as usize);
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte = (self.pos as usize + i) as u8;
            }
            self.pos += n as u64;
            Ok(ReadOutcome::Data(n))
        }

        fn seek(&mut self, position: u64) -> Result<(), AudioError> {
            self.pos = position;
            Ok(())
        }
    }

    #[test]
    fn test_register_and_remove() {
        let mut registry = SampleRegistry::new();
        let handle = registry
            .register(
                SampleEncoding::U8Mono,
                8000,
                vec![128; 100],
                LoopSpec::single(10, 90),
            )
            .expect("Unable to register");
        let entry = registry.get(handle).expect("Missing entry");
        assert_eq!(entry.frames, 100);
        assert_eq!(entry.loops.mode, LoopMode::Single);

        assert!(registry.remove(handle));
        assert!(registry.get(handle).is_none());
        assert!(!registry.remove(handle));
    }

    #[test]
    fn test_register_rejects_empty_data() {
        let mut registry = SampleRegistry::new();
        assert!(matches!(
            registry.register(SampleEncoding::U8Mono, 8000, vec![], LoopSpec::none()),
            Err(AudioError::AllocationFailure(_))
        ));
    }

    #[test]
    fn test_handle_reuse() {
        let mut registry = SampleRegistry::new();
        let first = registry
            .register(SampleEncoding::U8Mono, 8000, vec![0; 4], LoopSpec::none())
            .expect("register");
        let second = registry
            .register(SampleEncoding::U8Mono, 8000, vec![0; 4], LoopSpec::none())
            .expect("register");
        assert_ne!(first, second);

        registry.remove(first);
        let third = registry
            .register(SampleEncoding::U8Mono, 8000, vec![0; 4], LoopSpec::none())
            .expect("register");
        assert_eq!(first, third);
    }

    #[test]
    fn test_loop_offsets_converted_to_frames() {
        let mut registry = SampleRegistry::new();
        // Stereo 16 bit: 4 bytes per frame.
        let handle = registry
            .register(
                SampleEncoding::S16Stereo,
                44100,
                vec![0; 4000],
                LoopSpec::single(400, 4000),
            )
            .expect("register");
        let entry = registry.get(handle).expect("Missing entry");
        assert_eq!(entry.frames, 1000);
        assert_eq!(entry.loops.first_start, 100);
        assert_eq!(entry.loops.first_end, 1000);
    }

    #[test]
    fn test_stream_prefill_and_top_up() {
        let mut registry = SampleRegistry::new();
        let source = PatternSource { len: 5000, pos: 0 };
        let handle = registry
            .attach_stream(
                SampleEncoding::U8Mono,
                8000,
                Box::new(source),
                0,
                5000,
                1024,
                false,
            )
            .expect("attach");
        let entry = registry.get_mut(handle).expect("Missing entry");
        let stream = entry.stream.as_ref().expect("not a stream");
        assert_eq!(entry.data.len(), 1024);
        assert_eq!(stream.written, 1024);
        assert_eq!(entry.data[0], 0);
        assert_eq!(entry.data[1023], 255);

        // Consume half the ring, top up, and verify continuity at the seam.
        let ended = entry.top_up(512).expect("top up");
        assert!(!ended);
        let stream = entry.stream.as_ref().expect("not a stream");
        assert_eq!(stream.written, 1536);
        assert_eq!(entry.data[0], 0x00); // 1024 % 256
        assert_eq!(entry.data[511], 0xff);
        // Unconsumed half untouched.
        assert_eq!(entry.data[512], 0x00); // original byte 512 = 0x00
    }

    #[test]
    fn test_stream_end_detection() {
        let mut registry = SampleRegistry::new();
        let source = PatternSource { len: 300, pos: 0 };
        let handle = registry
            .attach_stream(
                SampleEncoding::U8Mono,
                8000,
                Box::new(source),
                0,
                300,
                0,
                false,
            )
            .expect("attach");
        let entry = registry.get_mut(handle).expect("Missing entry");
        // Auto buffer clamps to total length floor MIN_STREAM_BUFFER, then
        // the 300 byte source ends during prefill.
        let stream = entry.stream.as_ref().expect("not a stream");
        assert!(stream.ended);
        assert_eq!(stream.written, 300);
        assert_eq!(stream.play_limit(), 300);
    }

    #[test]
    fn test_looping_stream_restarts_source() {
        let mut registry = SampleRegistry::new();
        let source = PatternSource { len: 100, pos: 0 };
        let handle = registry
            .attach_stream(
                SampleEncoding::U8Mono,
                8000,
                Box::new(source),
                0,
                0,
                256,
                true,
            )
            .expect("attach");
        let entry = registry.get(handle).expect("Missing entry");
        let stream = entry.stream.as_ref().expect("not a stream");
        // The 100 byte source wrapped enough times to fill the ring.
        assert!(!stream.ended);
        assert_eq!(stream.written, 256);
        assert_eq!(entry.data[100], 0); // second pass starts over
    }
}
