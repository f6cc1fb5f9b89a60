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
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::AudioError;
use crate::registry::{SampleHandle, SampleRegistry};

static SOUND_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of the sound that owns a channel slot. Commands carry the
/// issuer's identity so that messages for a reassigned slot can be discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SoundId(u64);

impl SoundId {
    /// Allocates a process-unique identity.
    pub fn next() -> SoundId {
        SoundId(SOUND_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sound-{}", self.0)
    }
}

/// Playback state of one channel slot.
///
/// `Released` is a playing phase: the channel has left its first loop and is
/// playing out the tail or second loop. `Muted` keeps advancing the cursor
/// but contributes nothing to the mix, so unmuting resumes in sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Free,
    Stopped,
    Finished,
    Playing,
    Released,
    Muted,
}

impl ChannelState {
    /// Whether the mixer should advance this channel.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChannelState::Playing | ChannelState::Released | ChannelState::Muted
        )
    }

    /// Whether an allocation scan may take this slot without preemption.
    pub fn is_reclaimable(self) -> bool {
        matches!(
            self,
            ChannelState::Free | ChannelState::Stopped | ChannelState::Finished
        )
    }
}

/// Volume ramp applied per output sample when a channel's gain changes or
/// fades, to avoid clicks.
pub const RAMP_SPEED: f32 = 0.01;

/// One slot in the mixing pool.
#[derive(Clone, Debug)]
pub struct ChannelSlot {
    pub state: ChannelState,
    pub sample: Option<SampleHandle>,
    pub owner: Option<SoundId>,
    /// Channel priority, -100 to 100.
    pub priority: i32,
    /// Channel volume, 0.0-1.0.
    pub volume: f32,
    /// Stereo pan, -1.0 (left) to 1.0 (right).
    pub pan: f32,
    /// Playback rate in Hz.
    pub frequency: u32,
    /// Cursor integer part in sample frames.
    pub position: u64,
    /// Cursor fraction, lower 16 bits of the 16.16 fixed-point cursor.
    pub frac: u32,
    /// For streams: how many times the cursor wrapped the ring.
    pub ring_wraps: u64,
    /// 1 while in (or before) the first loop, 2 once in the second.
    pub loop_index: u8,
    /// Applied left/right gains, ramped toward the targets.
    pub lvolume: f32,
    pub rvolume: f32,
    pub lvolume_target: f32,
    pub rvolume_target: f32,
    pub ramping: bool,
    /// Ramping to silence; reaching it stops the channel.
    pub fading_out: bool,
}

impl Default for ChannelSlot {
    fn default() -> ChannelSlot {
        ChannelSlot {
            state: ChannelState::Free,
            sample: None,
            owner: None,
            priority: 0,
            volume: 1.0,
            pan: 0.0,
            frequency: 0,
            position: 0,
            frac: 0,
            ring_wraps: 0,
            loop_index: 1,
            lvolume: 1.0,
            rvolume: 1.0,
            lvolume_target: 1.0,
            rvolume_target: 1.0,
            ramping: false,
            fading_out: false,
        }
    }
}

impl ChannelSlot {
    /// Claims the slot for a new owner, clearing all playback state.
    fn claim(&mut self, owner: SoundId, priority: i32) {
        *self = ChannelSlot {
            state: ChannelState::Stopped,
            owner: Some(owner),
            priority,
            ..ChannelSlot::default()
        };
    }

    /// Stops playback, keeping the sample binding and cursor.
    pub fn force_stop(&mut self) {
        if self.state.is_active() {
            self.state = ChannelState::Stopped;
        }
    }

    /// Recomputes the left/right gain targets from volume, pan and mute.
    /// When `ramp` is set and the channel is audible, the change is applied
    /// gradually.
    pub fn refresh_gains(&mut self, ramp: bool) {
        let mut left = self.volume;
        let mut right = self.volume;
        if self.pan < 0.0 {
            right *= 1.0 + self.pan;
        } else if self.pan > 0.0 {
            left *= 1.0 - self.pan;
        }
        if self.state == ChannelState::Muted {
            left = 0.0;
            right = 0.0;
        }
        self.lvolume_target = left;
        self.rvolume_target = right;
        if ramp && self.state.is_active() {
            self.ramping = self.lvolume != left || self.rvolume != right;
        } else {
            self.lvolume = left;
            self.rvolume = right;
            self.ramping = false;
        }
    }

    /// The 16.16 fixed-point cursor.
    pub fn cursor(&self) -> u64 {
        (self.position << 16) | self.frac as u64
    }

    pub fn set_cursor(&mut self, cursor: u64) {
        self.position = cursor >> 16;
        self.frac = (cursor & 0xffff) as u32;
    }
}

/// The fixed pool of mixing channels.
pub struct ChannelPool {
    slots: Vec<ChannelSlot>,
    /// Pool-wide volume, 0.0-1.0, combined with per-channel gain.
    pub volume: f32,
    /// Command batch interval in milliseconds. Zero executes pending
    /// commands at every mix window.
    pub update_rate_ms: u32,
}

impl ChannelPool {
    pub fn new(size: usize) -> ChannelPool {
        ChannelPool {
            slots: vec![ChannelSlot::default(); size.max(1)],
            volume: 1.0,
            update_rate_ms: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&ChannelSlot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ChannelSlot> {
        self.slots.get_mut(index)
    }

    pub fn slots(&self) -> &[ChannelSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [ChannelSlot] {
        &mut self.slots
    }

    /// The slot currently owned by `owner`, if any.
    pub fn slot_for_owner(&self, owner: SoundId) -> Option<usize> {
        self.slots.iter().position(|s| s.owner == Some(owner))
    }

    /// Allocates a channel for `owner`.
    ///
    /// When `reuse_own` is set (restricted or streaming sounds), a slot
    /// already owned by this identity is stopped and reused. Otherwise the
    /// first reclaimable slot is taken; failing that, the busy slot with the
    /// lowest priority strictly below `priority` is preempted, lowest index
    /// winning ties. Priorities are clamped to -100..100. On failure no slot
    /// is modified.
    pub fn allocate(
        &mut self,
        owner: SoundId,
        priority: i32,
        reuse_own: bool,
    ) -> Result<usize, AudioError> {
        let priority = priority.clamp(-100, 100);
        if reuse_own {
            if let Some(index) = self.slot_for_owner(owner) {
                self.slots[index].claim(owner, priority);
                debug!(channel = index, owner = %owner, "Reusing own channel");
                return Ok(index);
            }
        }

        if let Some(index) = self.slots.iter().position(|s| s.state.is_reclaimable()) {
            self.slots[index].claim(owner, priority);
            return Ok(index);
        }

        let mut candidate: Option<(usize, i32)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.priority < priority {
                match candidate {
                    Some((_, best)) if slot.priority >= best => {}
                    _ => candidate = Some((index, slot.priority)),
                }
            }
        }
        match candidate {
            Some((index, preempted)) => {
                debug!(
                    channel = index,
                    preempted_priority = preempted,
                    priority,
                    owner = %owner,
                    "Preempting channel"
                );
                self.slots[index].claim(owner, priority);
                Ok(index)
            }
            None => Err(AudioError::ChannelUnavailable),
        }
    }

    /// Releases the slot owned by `owner`, returning it to the free state.
    pub fn release(&mut self, owner: SoundId) {
        if let Some(index) = self.slot_for_owner(owner) {
            self.slots[index] = ChannelSlot::default();
        }
    }

    /// Force-stops every channel bound to `handle`. Used before a sample is
    /// removed from the registry.
    pub fn stop_sample(&mut self, handle: SampleHandle) {
        for slot in &mut self.slots {
            if slot.sample == Some(handle) {
                slot.force_stop();
                slot.sample = None;
            }
        }
    }
}

/// Everything the mixing task owns: the channel pool and the sample
/// registry. Mutated only under the `SharedAudio` lock.
pub struct AudioState {
    pub pool: ChannelPool,
    pub samples: SampleRegistry,
}

impl AudioState {
    pub fn new(pool_size: usize) -> AudioState {
        AudioState {
            pool: ChannelPool::new(pool_size),
            samples: SampleRegistry::new(),
        }
    }

    /// Removes a sample, force-stopping any channel still playing it.
    pub fn remove_sample(&mut self, handle: SampleHandle) -> bool {
        self.pool.stop_sample(handle);
        self.samples.remove(handle)
    }
}

/// Shared handle to the audio state. Every cross-task access goes through
/// `lock`, a bounded acquire that reports `AccessTimeout` instead of
/// blocking indefinitely behind the mixing task.
pub struct SharedAudio {
    state: Mutex<AudioState>,
    access_timeout: Duration,
}

impl SharedAudio {
    pub fn new(pool_size: usize, access_timeout: Duration) -> SharedAudio {
        SharedAudio {
            state: Mutex::new(AudioState::new(pool_size)),
            access_timeout,
        }
    }

    /// Acquires the audio state, waiting at most the configured timeout.
    pub fn lock(&self) -> Result<MutexGuard<'_, AudioState>, AudioError> {
        self.state
            .try_lock_for(self.access_timeout)
            .ok_or(AudioError::AccessTimeout)
    }

    /// Runs `f` against the slot at `index` under the state lock.
    pub fn with_slot<T>(
        &self,
        index: usize,
        f: impl FnOnce(&ChannelSlot) -> T,
    ) -> Result<Option<T>, AudioError> {
        let state = self.lock()?;
        Ok(state.pool.slot(index).map(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_pool(priorities: &[i32]) -> ChannelPool {
        let mut pool = ChannelPool::new(priorities.len());
        for (i, &priority) in priorities.iter().enumerate() {
            let slot = pool.slot_mut(i).expect("Missing slot");
            slot.state = ChannelState::Playing;
            slot.owner = Some(SoundId::next());
            slot.priority = priority;
        }
        pool
    }

    #[test]
    fn test_bounded_allocation() {
        let mut pool = ChannelPool::new(4);
        let mut taken = Vec::new();
        for _ in 0..4 {
            let index = pool
                .allocate(SoundId::next(), 0, false)
                .expect("Unable to allocate");
            taken.push(index);
            pool.slot_mut(index).expect("Missing slot").state = ChannelState::Playing;
        }
        taken.sort();
        assert_eq!(taken, vec![0, 1, 2, 3]);

        // A fifth equal-priority sound gets exactly one failure, and the
        // pool is untouched.
        assert!(matches!(
            pool.allocate(SoundId::next(), 0, false),
            Err(AudioError::ChannelUnavailable)
        ));
        for slot in pool.slots() {
            assert_eq!(slot.state, ChannelState::Playing);
        }
    }

    #[test]
    fn test_preemption_picks_lowest_priority() {
        let mut pool = full_pool(&[-5, 0, 3, 0]);
        let owner = SoundId::next();
        let index = pool.allocate(owner, 1, false).expect("Unable to allocate");
        assert_eq!(index, 0);
        assert_eq!(pool.slot(0).expect("slot").owner, Some(owner));
    }

    #[test]
    fn test_preemption_tie_breaks_on_lowest_index() {
        let mut pool = full_pool(&[3, 0, 0, 5]);
        let index = pool
            .allocate(SoundId::next(), 1, false)
            .expect("Unable to allocate");
        assert_eq!(index, 1);
    }

    #[test]
    fn test_priority_clamped_on_allocate() {
        let mut pool = ChannelPool::new(2);
        let index = pool
            .allocate(SoundId::next(), 1000, false)
            .expect("Unable to allocate");
        assert_eq!(pool.slot(index).expect("slot").priority, 100);

        // An out-of-range priority cannot preempt the maximum.
        let mut full = full_pool(&[100, 100]);
        assert!(matches!(
            full.allocate(SoundId::next(), 5000, false),
            Err(AudioError::ChannelUnavailable)
        ));
    }

    #[test]
    fn test_preemption_requires_strictly_lower_priority() {
        let mut pool = full_pool(&[1, 1, 1]);
        assert!(matches!(
            pool.allocate(SoundId::next(), 1, false),
            Err(AudioError::ChannelUnavailable)
        ));
    }

    #[test]
    fn test_free_slot_preferred_over_preemption() {
        let mut pool = full_pool(&[-5, 0, 0]);
        pool.slot_mut(2).expect("slot").state = ChannelState::Finished;
        let index = pool
            .allocate(SoundId::next(), 10, false)
            .expect("Unable to allocate");
        assert_eq!(index, 2);
    }

    #[test]
    fn test_restricted_reuses_own_slot() {
        let mut pool = ChannelPool::new(2);
        let owner = SoundId::next();
        let first = pool.allocate(owner, 0, true).expect("allocate");
        pool.slot_mut(first).expect("slot").state = ChannelState::Playing;

        let second = pool.allocate(owner, 0, true).expect("allocate");
        assert_eq!(first, second);
        assert_eq!(pool.slot(second).expect("slot").state, ChannelState::Stopped);
    }

    #[test]
    fn test_gain_targets_follow_pan() {
        let mut slot = ChannelSlot {
            volume: 0.5,
            pan: -1.0,
            state: ChannelState::Playing,
            ..ChannelSlot::default()
        };
        slot.refresh_gains(false);
        assert_eq!(slot.lvolume, 0.5);
        assert_eq!(slot.rvolume, 0.0);

        slot.pan = 0.5;
        slot.refresh_gains(true);
        assert!(slot.ramping);
        assert_eq!(slot.lvolume_target, 0.25);
        assert_eq!(slot.rvolume_target, 0.5);
    }

    #[test]
    fn test_muted_gains_are_zero() {
        let mut slot = ChannelSlot {
            volume: 1.0,
            state: ChannelState::Muted,
            ..ChannelSlot::default()
        };
        slot.refresh_gains(false);
        assert_eq!(slot.lvolume, 0.0);
        assert_eq!(slot.rvolume, 0.0);
    }

    #[test]
    fn test_shared_audio_timeout() {
        let shared = SharedAudio::new(2, Duration::from_millis(10));
        let guard = shared.lock().expect("Unable to lock");
        assert!(matches!(shared.lock(), Err(AudioError::AccessTimeout)));
        drop(guard);
        assert!(shared.lock().is_ok());
    }
}
