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
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::trace;

use crate::error::AudioError;
use crate::format::LoopMode;
use crate::pool::{AudioState, ChannelSlot, ChannelState, SoundId};
use crate::registry::{SampleEntry, SampleHandle};

/// A channel-pool mutation request. Commands are queued by any task and
/// executed only by the mixing task, between mix windows.
#[derive(Clone, Debug)]
pub enum Command {
    /// Binds a registered sample to the channel.
    SetSample(SampleHandle),
    /// Starts playback from the beginning at the given rate in Hz.
    Play { frequency: u32 },
    /// Stops playback, keeping the cursor.
    Stop,
    /// Resumes a stopped channel. A no-op if the cursor is at the end or
    /// the channel is already playing.
    Continue,
    /// Silences (or unsilences) the channel without halting its cursor.
    Mute(bool),
    /// Ramps the channel in from silence.
    FadeIn,
    /// Ramps the channel out; reaching silence stops it.
    FadeOut,
    /// Channel volume in percent, clamped to 0-100.
    SetVolume(f64),
    /// Stereo pan, clamped to -100 (left) through 100 (right).
    SetPan(f64),
    /// Playback rate in Hz.
    SetFrequency(u32),
    /// Cursor position as a byte offset into the sample data.
    SetPosition(u64),
    /// Pool-wide command batch interval in milliseconds.
    SetRate(u32),
    /// Overrides a stream's total decoded length in bytes.
    SetLength(u64),
    /// Leaves the first loop: the channel is released and plays its tail
    /// or second loop.
    StopLooping,
}

/// A queued command with its target channel, the issuer's identity, and an
/// optional acknowledgement slot.
pub struct CommandEnvelope {
    pub channel: usize,
    pub owner: Option<SoundId>,
    pub command: Command,
    pub ack: Option<Sender<Result<(), AudioError>>>,
}

/// Client-side handle for submitting commands to the mixing task.
#[derive(Clone)]
pub struct CommandSender {
    tx: Sender<CommandEnvelope>,
    timeout: Duration,
}

impl CommandSender {
    pub fn new(tx: Sender<CommandEnvelope>, timeout: Duration) -> CommandSender {
        CommandSender { tx, timeout }
    }

    /// Enqueues a command and blocks until the mixing task acknowledges it
    /// or the configured timeout elapses.
    pub fn submit(
        &self,
        channel: usize,
        owner: Option<SoundId>,
        command: Command,
    ) -> Result<(), AudioError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.tx
            .send(CommandEnvelope {
                channel,
                owner,
                command,
                ack: Some(ack_tx),
            })
            .map_err(|_| AudioError::EngineStopped)?;
        match ack_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(_) => Err(AudioError::AccessTimeout),
        }
    }

    /// Enqueues a command without waiting for execution.
    pub fn post(
        &self,
        channel: usize,
        owner: Option<SoundId>,
        command: Command,
    ) -> Result<(), AudioError> {
        self.tx
            .send(CommandEnvelope {
                channel,
                owner,
                command,
                ack: None,
            })
            .map_err(|_| AudioError::EngineStopped)
    }
}

/// Executes one envelope against the audio state, acknowledging the sender.
/// Stale envelopes (the slot has a different owner by now) are discarded
/// without error; the new occupant must never be affected.
pub fn execute(state: &mut AudioState, envelope: CommandEnvelope) {
    let result = match stale(state, &envelope) {
        true => {
            trace!(
                channel = envelope.channel,
                command = ?envelope.command,
                "Discarding stale command"
            );
            Ok(())
        }
        false => apply(state, envelope.channel, &envelope.command),
    };
    if let Some(ack) = envelope.ack {
        // The submitter may have timed out and gone; that is fine.
        let _ = ack.send(result);
    }
}

/// Drains and executes every queued envelope. Called by the mixing task at
/// command batch boundaries.
pub fn drain(state: &mut AudioState, rx: &Receiver<CommandEnvelope>) {
    while let Ok(envelope) = rx.try_recv() {
        execute(state, envelope);
    }
}

fn stale(state: &AudioState, envelope: &CommandEnvelope) -> bool {
    let owner = match envelope.owner {
        Some(owner) => owner,
        None => return false,
    };
    match state.pool.slot(envelope.channel) {
        Some(slot) => slot.owner != Some(owner),
        None => false,
    }
}

/// Applies one command to the channel at `index`. Exhaustive over the
/// command set.
pub fn apply(state: &mut AudioState, index: usize, command: &Command) -> Result<(), AudioError> {
    let AudioState { pool, samples } = state;

    // Pool-wide commands have no per-slot target.
    if let Command::SetRate(rate_ms) = command {
        pool.update_rate_ms = *rate_ms;
        return Ok(());
    }

    let slot = pool.slot_mut(index).ok_or_else(|| {
        AudioError::AllocationFailure(format!("channel index {index} out of range"))
    })?;

    match command {
        // Handled above.
        Command::SetRate(_) => Ok(()),
        Command::SetSample(handle) => {
            if samples.get(*handle).is_none() {
                return Err(AudioError::InvalidHandle(handle.raw()));
            }
            slot.sample = Some(*handle);
            slot.position = 0;
            slot.frac = 0;
            slot.ring_wraps = 0;
            slot.loop_index = 1;
            Ok(())
        }
        Command::Play { frequency } => {
            let handle = slot.sample.ok_or_else(|| {
                AudioError::AllocationFailure(format!("channel {index} has no sample bound"))
            })?;
            let entry = samples
                .get_mut(handle)
                .ok_or(AudioError::InvalidHandle(handle.raw()))?;
            slot.frequency = *frequency;
            slot.loop_index = 1;
            slot.fading_out = false;
            slot.state = ChannelState::Playing;
            slot.refresh_gains(false);
            set_position(slot, entry, 0)
        }
        Command::Stop => {
            slot.force_stop();
            Ok(())
        }
        Command::Continue => {
            if slot.state != ChannelState::Stopped {
                return Ok(());
            }
            let at_end = match slot.sample.and_then(|h| samples.get(h)) {
                Some(entry) => !entry.is_stream() && slot.position >= entry.frames,
                None => true,
            };
            if !at_end {
                slot.state = ChannelState::Playing;
            }
            Ok(())
        }
        Command::Mute(mute) => {
            if *mute {
                if slot.state.is_active() {
                    slot.state = ChannelState::Muted;
                    slot.refresh_gains(true);
                }
            } else if slot.state == ChannelState::Muted {
                slot.state = if slot.loop_index >= 2 {
                    ChannelState::Released
                } else {
                    ChannelState::Playing
                };
                slot.refresh_gains(true);
            }
            Ok(())
        }
        Command::FadeIn => {
            if slot.state.is_active() {
                slot.lvolume = 0.0;
                slot.rvolume = 0.0;
                slot.fading_out = false;
                slot.refresh_gains(true);
                slot.ramping = true;
            }
            Ok(())
        }
        Command::FadeOut => {
            if slot.state.is_active() {
                slot.lvolume_target = 0.0;
                slot.rvolume_target = 0.0;
                slot.ramping = true;
                slot.fading_out = true;
            }
            Ok(())
        }
        Command::SetVolume(volume) => {
            slot.volume = (volume.clamp(0.0, 100.0) / 100.0) as f32;
            slot.refresh_gains(true);
            Ok(())
        }
        Command::SetPan(pan) => {
            slot.pan = (pan.clamp(-100.0, 100.0) / 100.0) as f32;
            slot.refresh_gains(true);
            Ok(())
        }
        Command::SetFrequency(frequency) => {
            slot.frequency = *frequency;
            Ok(())
        }
        Command::SetPosition(bytes) => {
            let handle = slot.sample.ok_or_else(|| {
                AudioError::AllocationFailure(format!("channel {index} has no sample bound"))
            })?;
            let entry = samples
                .get_mut(handle)
                .ok_or(AudioError::InvalidHandle(handle.raw()))?;
            let frames = bytes >> entry.encoding.shift();
            set_position(slot, entry, frames)
        }
        Command::SetLength(bytes) => {
            if let Some(entry) = slot.sample.and_then(|h| samples.get_mut(h)) {
                if let Some(stream) = entry.stream.as_mut() {
                    stream.total_len = if *bytes == 0 { u64::MAX } else { *bytes };
                } else {
                    trace!(channel = index, "SetLength ignored for resident sample");
                }
            }
            Ok(())
        }
        Command::StopLooping => {
            if slot.state.is_active()
                && matches!(
                    slot.sample
                        .and_then(|h| samples.get(h))
                        .map(|e| e.loops.mode),
                    Some(LoopMode::SingleRelease) | Some(LoopMode::Double)
                )
                && slot.loop_index < 2
            {
                slot.loop_index = 2;
                if slot.state == ChannelState::Playing {
                    slot.state = ChannelState::Released;
                }
            }
            Ok(())
        }
    }
}

/// Moves the cursor to `frames`. Streams rewind their source and refill;
/// resident samples clamp to their length and recompute the loop phase.
fn set_position(
    slot: &mut ChannelSlot,
    entry: &mut SampleEntry,
    frames: u64,
) -> Result<(), AudioError> {
    if entry.is_stream() {
        entry.rewind_stream(frames << entry.encoding.shift())?;
        slot.position = 0;
        slot.frac = 0;
        slot.ring_wraps = 0;
        return Ok(());
    }

    slot.position = frames.min(entry.frames);
    slot.frac = 0;
    if entry.loops.has_first() && slot.loop_index < 2 && slot.position >= entry.loops.first_end {
        // Jumping past the first loop region implies release.
        slot.loop_index = 2;
        if slot.state == ChannelState::Playing {
            slot.state = ChannelState::Released;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{LoopSpec, SampleEncoding};
    use crate::pool::SoundId;
    use std::thread;

    fn state_with_sample(loops: LoopSpec) -> (AudioState, SampleHandle, usize, SoundId) {
        let mut state = AudioState::new(4);
        let handle = state
            .samples
            .register(SampleEncoding::U8Mono, 8000, vec![128; 1000], loops)
            .expect("Unable to register");
        let owner = SoundId::next();
        let index = state.pool.allocate(owner, 0, false).expect("allocate");
        apply(&mut state, index, &Command::SetSample(handle)).expect("set sample");
        (state, handle, index, owner)
    }

    #[test]
    fn test_play_and_stop() {
        let (mut state, _, index, _) = state_with_sample(LoopSpec::none());
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.state, ChannelState::Playing);
        assert_eq!(slot.frequency, 8000);

        apply(&mut state, index, &Command::Stop).expect("stop");
        assert_eq!(state.pool.slot(index).expect("slot").state, ChannelState::Stopped);
    }

    #[test]
    fn test_play_without_sample_fails() {
        let mut state = AudioState::new(1);
        let owner = SoundId::next();
        let index = state.pool.allocate(owner, 0, false).expect("allocate");
        assert!(apply(&mut state, index, &Command::Play { frequency: 8000 }).is_err());
    }

    #[test]
    fn test_volume_and_pan_clamped() {
        let (mut state, _, index, _) = state_with_sample(LoopSpec::none());
        apply(&mut state, index, &Command::SetVolume(250.0)).expect("volume");
        apply(&mut state, index, &Command::SetPan(-500.0)).expect("pan");
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.volume, 1.0);
        assert_eq!(slot.pan, -1.0);
    }

    #[test]
    fn test_continue_is_noop_at_end() {
        let (mut state, _, index, _) = state_with_sample(LoopSpec::none());
        {
            let slot = state.pool.slot_mut(index).expect("slot");
            slot.state = ChannelState::Stopped;
            slot.position = 1000;
        }
        apply(&mut state, index, &Command::Continue).expect("continue");
        assert_eq!(state.pool.slot(index).expect("slot").state, ChannelState::Stopped);

        state.pool.slot_mut(index).expect("slot").position = 500;
        apply(&mut state, index, &Command::Continue).expect("continue");
        assert_eq!(state.pool.slot(index).expect("slot").state, ChannelState::Playing);
    }

    #[test]
    fn test_stop_looping_releases() {
        let loops = LoopSpec {
            mode: LoopMode::SingleRelease,
            first_start: 100,
            first_end: 900,
            ..LoopSpec::default()
        };
        let (mut state, _, index, _) = state_with_sample(loops);
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        apply(&mut state, index, &Command::StopLooping).expect("stop looping");
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.state, ChannelState::Released);
        assert_eq!(slot.loop_index, 2);
    }

    #[test]
    fn test_stop_looping_ignores_plain_loop() {
        let (mut state, _, index, _) = state_with_sample(LoopSpec::single(0, 1000));
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        apply(&mut state, index, &Command::StopLooping).expect("stop looping");
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.state, ChannelState::Playing);
        assert_eq!(slot.loop_index, 1);
    }

    #[test]
    fn test_mute_preserves_release_phase() {
        let loops = LoopSpec {
            mode: LoopMode::SingleRelease,
            first_start: 0,
            first_end: 900,
            ..LoopSpec::default()
        };
        let (mut state, _, index, _) = state_with_sample(loops);
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        apply(&mut state, index, &Command::StopLooping).expect("stop looping");
        apply(&mut state, index, &Command::Mute(true)).expect("mute");
        assert_eq!(state.pool.slot(index).expect("slot").state, ChannelState::Muted);
        apply(&mut state, index, &Command::Mute(false)).expect("unmute");
        assert_eq!(state.pool.slot(index).expect("slot").state, ChannelState::Released);
    }

    #[test]
    fn test_stale_command_discarded() {
        let (mut state, _, index, old_owner) = state_with_sample(LoopSpec::none());
        apply(&mut state, index, &Command::SetVolume(80.0)).expect("volume");

        // The slot is reassigned before the old owner's command executes.
        let new_owner = SoundId::next();
        state.pool.slot_mut(index).expect("slot").owner = Some(new_owner);

        execute(
            &mut state,
            CommandEnvelope {
                channel: index,
                owner: Some(old_owner),
                command: Command::SetVolume(5.0),
                ack: None,
            },
        );
        // The new occupant's volume is untouched.
        assert_eq!(state.pool.slot(index).expect("slot").volume, 0.8);
    }

    #[test]
    fn test_set_rate_updates_pool() {
        let mut state = AudioState::new(1);
        apply(&mut state, 0, &Command::SetRate(125)).expect("set rate");
        assert_eq!(state.pool.update_rate_ms, 125);
    }

    #[test]
    fn test_set_position_past_loop_releases() {
        let loops = LoopSpec {
            mode: LoopMode::SingleRelease,
            first_start: 0,
            first_end: 500,
            ..LoopSpec::default()
        };
        let (mut state, _, index, _) = state_with_sample(loops);
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        apply(&mut state, index, &Command::SetPosition(700)).expect("position");
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.position, 700);
        assert_eq!(slot.loop_index, 2);
        assert_eq!(slot.state, ChannelState::Released);
    }

    #[test]
    fn test_remove_sample_force_stops_channel() {
        let (mut state, handle, index, _) = state_with_sample(LoopSpec::none());
        apply(&mut state, index, &Command::Play { frequency: 8000 }).expect("play");
        assert!(state.remove_sample(handle));
        let slot = state.pool.slot(index).expect("slot");
        assert_eq!(slot.state, ChannelState::Stopped);
        assert_eq!(slot.sample, None);
    }

    #[test]
    fn test_submit_times_out_without_executor() {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let sender = CommandSender::new(tx, Duration::from_millis(20));
        assert!(matches!(
            sender.submit(0, None, Command::Stop),
            Err(AudioError::AccessTimeout)
        ));
    }

    #[test]
    fn test_submit_round_trip() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = CommandSender::new(tx, Duration::from_secs(1));

        let executor = thread::spawn(move || {
            let mut state = AudioState::new(2);
            let envelope = rx.recv().expect("Unable to receive");
            execute(&mut state, envelope);
            state.pool.update_rate_ms
        });

        sender
            .submit(0, None, Command::SetRate(50))
            .expect("Unable to submit");
        assert_eq!(executor.join().expect("Join failed"), 50);
    }
}
