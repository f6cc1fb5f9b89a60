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
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{trace, warn};

use crate::error::AudioError;
use crate::playsync::CancelHandle;
use crate::pool::{ChannelSlot, SharedAudio, SoundId};
use crate::registry::{SampleEntry, SampleHandle};

/// Total bytes the channel has consumed from the stream ring.
pub fn consumed_bytes(slot: &ChannelSlot, entry: &SampleEntry) -> u64 {
    let frames = slot
        .ring_wraps
        .saturating_mul(entry.frames)
        .saturating_add(slot.position);
    frames << entry.encoding.shift()
}

/// The per-stream refill task. Ticks on a quarter-second-class period and
/// tops the ring up behind the mixer's cursor, so playback never reaches
/// unwritten buffer while the source keeps up.
///
/// The task winds down on its own when the source ends, the channel is
/// reassigned, or the source faults (which also stops the channel).
pub struct StreamScheduler {
    cancel: CancelHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl StreamScheduler {
    pub fn start(
        shared: Arc<SharedAudio>,
        handle: SampleHandle,
        channel: usize,
        owner: SoundId,
        period: Duration,
    ) -> StreamScheduler {
        let cancel = CancelHandle::new();
        let thread = {
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(String::from("polymix-stream"))
                .spawn(move || {
                    run_refill(shared, handle, channel, owner, period, cancel);
                })
                .ok()
        };
        StreamScheduler {
            cancel,
            thread,
        }
    }

    /// Cancels the refill task and waits for it. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_refill(
    shared: Arc<SharedAudio>,
    handle: SampleHandle,
    channel: usize,
    owner: SoundId,
    period: Duration,
    cancel: CancelHandle,
) {
    while !cancel.wait_timeout(period) {
        match refill_once(&shared, handle, channel, owner) {
            Ok(RefillOutcome::Continue) => {}
            Ok(RefillOutcome::Done) => break,
            Err(AudioError::AccessTimeout) => {
                // The state is busy; try again next tick.
                trace!(handle = %handle, "Stream refill skipped a tick");
            }
            Err(e) => {
                warn!(handle = %handle, channel, err = %e, "Stream source fault; stopping channel");
                fault_stop(&shared, channel, owner);
                break;
            }
        }
    }
}

enum RefillOutcome {
    Continue,
    /// The source ended or the channel moved on; no more refills needed.
    Done,
}

fn refill_once(
    shared: &SharedAudio,
    handle: SampleHandle,
    channel: usize,
    owner: SoundId,
) -> Result<RefillOutcome, AudioError> {
    let mut state = shared.lock()?;
    let state = &mut *state;

    let slot = match state.pool.slot(channel) {
        Some(slot) if slot.owner == Some(owner) => slot,
        _ => return Ok(RefillOutcome::Done),
    };
    let entry = match state.samples.get_mut(handle) {
        Some(entry) if entry.is_stream() => entry,
        _ => return Ok(RefillOutcome::Done),
    };

    let consumed = consumed_bytes(slot, entry);
    let ended = entry
        .top_up(consumed)
        .map_err(|e| AudioError::StreamFault(e.to_string()))?;
    if ended {
        Ok(RefillOutcome::Done)
    } else {
        Ok(RefillOutcome::Continue)
    }
}

/// Best-effort stop of the channel after a source fault.
fn fault_stop(shared: &SharedAudio, channel: usize, owner: SoundId) {
    if let Ok(mut state) = shared.lock() {
        if let Some(slot) = state.pool.slot_mut(channel) {
            if slot.owner == Some(owner) {
                slot.force_stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleEncoding;
    use crate::pool::ChannelState;
    use crate::registry::{ReadOutcome, StreamSource};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Endless byte pattern source.
    struct EndlessSource {
        pos: u64,
    }

    impl StreamSource for EndlessSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, AudioError> {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = (self.pos as usize + i) as u8;
            }
            self.pos += buf.len() as u64;
            Ok(ReadOutcome::Data(buf.len()))
        }

        fn seek(&mut self, position: u64) -> Result<(), AudioError> {
            self.pos = position;
            Ok(())
        }
    }

    /// Fails after a fixed number of bytes.
    struct FaultySource {
        remaining: usize,
    }

    impl StreamSource for FaultySource {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, AudioError> {
            if self.remaining == 0 {
                return Err(AudioError::StreamFault(String::from("read failed")));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(0);
            self.remaining -= n;
            Ok(ReadOutcome::Data(n))
        }

        fn seek(&mut self, _: u64) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn stream_state(
        source: Box<dyn StreamSource>,
        buffer_len: u64,
    ) -> (Arc<SharedAudio>, SampleHandle, usize, SoundId) {
        let shared = Arc::new(SharedAudio::new(2, Duration::from_millis(100)));
        let owner = SoundId::next();
        let (handle, channel) = {
            let mut state = shared.lock().expect("Unable to lock");
            let handle = state
                .samples
                .attach_stream(SampleEncoding::U8Mono, 8000, source, 0, 0, buffer_len, false)
                .expect("Unable to attach");
            let channel = state.pool.allocate(owner, 0, true).expect("allocate");
            let slot = state.pool.slot_mut(channel).expect("slot");
            slot.sample = Some(handle);
            slot.state = ChannelState::Playing;
            (handle, channel)
        };
        (shared, handle, channel, owner)
    }

    #[test]
    fn test_consumed_gap_never_exceeds_buffer() {
        // Property: with refills keeping pace, the consumed-but-unfilled
        // gap stays within the buffer size under random consumption jitter.
        let buffer: u64 = 1024;
        let (shared, handle, channel, _owner) =
            stream_state(Box::new(EndlessSource { pos: 0 }), buffer);

        let mut rng = StdRng::seed_from_u64(42);
        let mut consumed_frames: u64 = 0;
        for _ in 0..500 {
            let mut state = shared.lock().expect("Unable to lock");
            let state = &mut *state;
            let entry = state.samples.get_mut(handle).expect("entry");
            let written = entry.stream.as_ref().expect("stream").written;

            // The mixer never reads past what was written.
            let step = rng.gen_range(0..=256u64);
            consumed_frames = (consumed_frames + step).min(written);
            let slot = state.pool.slot_mut(channel).expect("slot");
            slot.ring_wraps = consumed_frames / entry.frames;
            slot.position = consumed_frames % entry.frames;

            entry.top_up(consumed_frames).expect("top up");
            let written = entry.stream.as_ref().expect("stream").written;
            assert!(written >= consumed_frames);
            assert!(written - consumed_frames <= buffer);
        }
    }

    #[test]
    fn test_scheduler_refills_behind_cursor() {
        let (shared, handle, channel, owner) =
            stream_state(Box::new(EndlessSource { pos: 0 }), 512);
        let mut scheduler = StreamScheduler::start(
            shared.clone(),
            handle,
            channel,
            owner,
            Duration::from_millis(5),
        );

        // Simulate the mixer consuming half the ring.
        {
            let mut state = shared.lock().expect("Unable to lock");
            state.pool.slot_mut(channel).expect("slot").position = 256;
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let mut state = shared.lock().expect("Unable to lock");
                let entry = state.samples.get_mut(handle).expect("entry");
                if entry.stream.as_ref().expect("stream").written >= 512 + 256 {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "refill never caught up");
            thread::sleep(Duration::from_millis(5));
        }

        scheduler.stop();
        scheduler.stop(); // idempotent
    }

    #[test]
    fn test_fault_stops_channel() {
        let (shared, handle, channel, owner) =
            stream_state(Box::new(FaultySource { remaining: 600 }), 512);
        let mut scheduler = StreamScheduler::start(
            shared.clone(),
            handle,
            channel,
            owner,
            Duration::from_millis(5),
        );

        // Consume so the next refill hits the faulting read.
        {
            let mut state = shared.lock().expect("Unable to lock");
            state.pool.slot_mut(channel).expect("slot").position = 400;
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let state = shared.lock().expect("Unable to lock");
                if state.pool.slot(channel).expect("slot").state == ChannelState::Stopped {
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "channel never stopped");
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();
    }
}
