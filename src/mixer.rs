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
use crate::config::MixQuality;
use crate::format::SampleEncoding;
use crate::pool::{AudioState, ChannelSlot, ChannelState, SoundId, RAMP_SPEED};
use crate::registry::SampleEntry;

/// Notifications produced during a mix pass. Collected while mixing and
/// delivered afterwards, so observers never run inside the mix loop.
#[derive(Clone, Copy, Debug)]
pub enum SoundEvent {
    /// A channel played its sample to completion.
    Completed {
        owner: Option<SoundId>,
        channel: usize,
    },
}

/// The mixer core. Steps every active channel through its sample data with a
/// 16.16 fixed-point cursor and accumulates into an interleaved f32 buffer.
pub struct Mixer {
    output_rate: u32,
    stereo: bool,
    quality: MixQuality,
    /// Engine master volume, 0.0-1.0. Combined with the pool volume.
    pub master_volume: f32,
}

impl Mixer {
    pub fn new(output_rate: u32, stereo: bool, quality: MixQuality) -> Mixer {
        Mixer {
            output_rate: output_rate.max(1),
            stereo,
            quality,
            master_volume: 1.0,
        }
    }

    pub fn output_channels(&self) -> usize {
        if self.stereo {
            2
        } else {
            1
        }
    }

    /// Mixes `frames` output frames into `out`, which must hold at least
    /// `frames * output_channels()` samples. The buffer is cleared first.
    /// Completion events are appended to `events`.
    pub fn mix(
        &self,
        state: &mut AudioState,
        out: &mut [f32],
        frames: usize,
        events: &mut Vec<SoundEvent>,
    ) {
        let channels = self.output_channels();
        let out = &mut out[..frames * channels];
        out.fill(0.0);

        let AudioState { pool, samples } = state;
        let master = self.master_volume * pool.volume;
        for (index, slot) in pool.slots_mut().iter_mut().enumerate() {
            if !slot.state.is_active() {
                continue;
            }
            let entry = match slot.sample.and_then(|h| samples.get_mut(h)) {
                Some(entry) => entry,
                None => {
                    // The sample was removed out from under the channel.
                    slot.force_stop();
                    continue;
                }
            };
            self.mix_slot(index, slot, entry, out, frames, master, events);
        }
    }

    fn mix_slot(
        &self,
        index: usize,
        slot: &mut ChannelSlot,
        entry: &mut SampleEntry,
        out: &mut [f32],
        frames: usize,
        master: f32,
        events: &mut Vec<SoundEvent>,
    ) {
        if slot.frequency == 0 || entry.frames == 0 {
            return;
        }
        let step = ((slot.frequency as u64) << 16) / self.output_rate as u64;
        if step == 0 {
            return;
        }

        let channels = self.output_channels();
        let mut remaining = frames;
        let mut out_pos = 0usize;
        loop {
            if !slot.state.is_active() {
                return;
            }
            let end = current_end(slot, entry);
            if slot.position >= end {
                // Loop wrap, ring wrap, or completion, within the same tick.
                if advance_boundary(index, slot, entry, events) {
                    return;
                }
                continue;
            }
            if remaining == 0 {
                return;
            }

            let until_end = ((end - slot.position) << 16) - slot.frac as u64;
            let window = remaining.min(until_end.div_ceil(step) as usize);
            let wrap_tap = wrap_target(slot, entry, end);
            for k in 0..window {
                if slot.ramping {
                    step_ramp(slot);
                    if !slot.state.is_active() {
                        return;
                    }
                }
                let (l, r) = self.read_taps(entry, slot, end, wrap_tap);
                let lv = slot.lvolume * master;
                let rv = slot.rvolume * master;
                let base = (out_pos + k) * channels;
                if self.stereo {
                    out[base] = (out[base] + l * lv).clamp(-1.0, 1.0);
                    out[base + 1] = (out[base + 1] + r * rv).clamp(-1.0, 1.0);
                } else {
                    out[base] = (out[base] + 0.5 * (l * lv + r * rv)).clamp(-1.0, 1.0);
                }
                slot.set_cursor(slot.cursor() + step);
            }
            remaining -= window;
            out_pos += window;
        }
    }

    /// Reads the interpolated stereo pair at the channel's cursor. `wrap_tap`
    /// names the frame the second tap comes from when the cursor sits on a
    /// loop or ring boundary.
    fn read_taps(
        &self,
        entry: &SampleEntry,
        slot: &ChannelSlot,
        end: u64,
        wrap_tap: Option<u64>,
    ) -> (f32, f32) {
        let a = tap(entry, slot.position);
        if self.quality == MixQuality::Nearest {
            return a;
        }
        let next = slot.position + 1;
        let b = if next < end {
            tap(entry, next)
        } else {
            match wrap_tap {
                Some(target) => tap(entry, target),
                None => a,
            }
        };
        let f = slot.frac as f32 / 65536.0;
        (a.0 + (b.0 - a.0) * f, a.1 + (b.1 - a.1) * f)
    }
}

/// Reads one frame as a stereo pair in [-1.0, 1.0); mono frames are
/// duplicated.
fn tap(entry: &SampleEntry, frame: u64) -> (f32, f32) {
    let data = &entry.data;
    match entry.encoding {
        SampleEncoding::U8Mono => {
            let m = (data[frame as usize] as f32 - 128.0) / 128.0;
            (m, m)
        }
        SampleEncoding::U8Stereo => {
            let i = frame as usize * 2;
            (
                (data[i] as f32 - 128.0) / 128.0,
                (data[i + 1] as f32 - 128.0) / 128.0,
            )
        }
        SampleEncoding::S16Mono => {
            let i = frame as usize * 2;
            let m = i16::from_le_bytes([data[i], data[i + 1]]) as f32 / 32768.0;
            (m, m)
        }
        SampleEncoding::S16Stereo => {
            let i = frame as usize * 4;
            (
                i16::from_le_bytes([data[i], data[i + 1]]) as f32 / 32768.0,
                i16::from_le_bytes([data[i + 2], data[i + 3]]) as f32 / 32768.0,
            )
        }
    }
}

/// The frame index at which the current playback region ends.
fn current_end(slot: &ChannelSlot, entry: &SampleEntry) -> u64 {
    if let Some(stream) = entry.stream.as_ref() {
        let limit = stream.play_limit();
        let limit_frames = if limit == u64::MAX {
            u64::MAX
        } else {
            limit >> entry.encoding.shift()
        };
        let within = limit_frames.saturating_sub(slot.ring_wraps.saturating_mul(entry.frames));
        return entry.frames.min(within);
    }
    if slot.loop_index == 1 && entry.loops.has_first() && slot.position < entry.loops.first_end {
        entry.loops.first_end
    } else if slot.loop_index >= 2
        && entry.loops.has_second()
        && slot.position < entry.loops.second_end
    {
        entry.loops.second_end
    } else {
        entry.frames
    }
}

/// Where the interpolation tap past `end` comes from, if the region loops.
fn wrap_target(slot: &ChannelSlot, entry: &SampleEntry, end: u64) -> Option<u64> {
    if entry.is_stream() {
        return if end == entry.frames { Some(0) } else { None };
    }
    if slot.loop_index == 1 && entry.loops.has_first() && end == entry.loops.first_end {
        Some(entry.loops.first_start)
    } else if slot.loop_index >= 2 && entry.loops.has_second() && end == entry.loops.second_end {
        Some(entry.loops.second_start)
    } else {
        None
    }
}

/// Handles the cursor crossing its current region end: wraps loops and
/// stream rings in place, or finishes the channel. Returns true once the
/// channel is done for this pass.
fn advance_boundary(
    index: usize,
    slot: &mut ChannelSlot,
    entry: &mut SampleEntry,
    events: &mut Vec<SoundEvent>,
) -> bool {
    if let Some(stream) = entry.stream.as_ref() {
        let limit = stream.play_limit();
        let limit_frames = if limit == u64::MAX {
            u64::MAX
        } else {
            limit >> entry.encoding.shift()
        };
        let absolute = slot
            .ring_wraps
            .saturating_mul(entry.frames)
            .saturating_add(slot.position);
        if absolute >= limit_frames {
            finish(index, slot, events);
            return true;
        }
        // Wrap the ring, keeping the fractional overshoot.
        slot.position -= entry.frames;
        slot.ring_wraps += 1;
        return false;
    }

    if slot.loop_index == 1 && entry.loops.has_first() {
        slot.position = entry.loops.first_start + (slot.position - entry.loops.first_end);
        return false;
    }
    if slot.loop_index >= 2 && entry.loops.has_second() && slot.position >= entry.loops.second_end
    {
        slot.position = entry.loops.second_start + (slot.position - entry.loops.second_end);
        return false;
    }
    if slot.position >= entry.frames {
        finish(index, slot, events);
        return true;
    }
    false
}

fn finish(index: usize, slot: &mut ChannelSlot, events: &mut Vec<SoundEvent>) {
    slot.state = ChannelState::Finished;
    slot.ramping = false;
    events.push(SoundEvent::Completed {
        owner: slot.owner,
        channel: index,
    });
}

/// Moves the applied gains one step toward their targets. Completing a
/// fade-out stops the channel.
fn step_ramp(slot: &mut ChannelSlot) {
    slot.lvolume = ramp_toward(slot.lvolume, slot.lvolume_target);
    slot.rvolume = ramp_toward(slot.rvolume, slot.rvolume_target);
    if slot.lvolume == slot.lvolume_target && slot.rvolume == slot.rvolume_target {
        slot.ramping = false;
        if slot.fading_out {
            slot.fading_out = false;
            slot.state = ChannelState::Stopped;
        }
    }
}

fn ramp_toward(current: f32, target: f32) -> f32 {
    if current < target {
        (current + RAMP_SPEED).min(target)
    } else if current > target {
        (current - RAMP_SPEED).max(target)
    } else {
        current
    }
}
