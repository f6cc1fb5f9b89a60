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
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandSender};
use crate::engine::AudioEngine;
use crate::error::AudioError;
use crate::format::{LoopSpec, SampleEncoding};
use crate::playsync::CancelHandle;
use crate::pool::{SharedAudio, SoundId};
use crate::registry::{ReadOutcome, SampleHandle, StreamSource};
use crate::stream::{self, StreamScheduler};
use crate::wave::{self, WaveInfo};

/// Sources at or above this size stream under `StreamMode::Always`.
pub const STREAM_MIN_SIZE: u64 = 64 * 1024;
/// Sources above this size stream under `StreamMode::Smart`.
pub const STREAM_SMART_SIZE: u64 = 512 * 1024;

/// How eagerly a sound's source is streamed instead of held resident.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamMode {
    /// Decode everything up front.
    Never,
    /// Stream only sources too large to comfortably hold resident.
    #[default]
    Smart,
    /// Stream anything big enough for a streaming buffer to make sense.
    Always,
}

/// Whether a source of `decoded_len` bytes should stream. ADPCM sources are
/// always decoded up front, since the decoder is block-based and cheap at
/// load time.
pub fn should_stream(mode: StreamMode, decoded_len: u64, adpcm: bool) -> bool {
    if adpcm {
        return false;
    }
    match mode {
        StreamMode::Never => false,
        StreamMode::Smart => decoded_len > STREAM_SMART_SIZE,
        StreamMode::Always => decoded_len >= STREAM_MIN_SIZE,
    }
}

/// Playback options for a sound.
#[derive(Clone, Debug)]
pub struct SoundOptions {
    /// Channel priority; higher values preempt lower ones.
    pub priority: i32,
    /// Initial volume, 0-100.
    pub volume: f64,
    /// Initial pan, -100 (left) to 100 (right).
    pub pan: f64,
    /// Playback rate override in Hz. Defaults to the source's rate.
    pub frequency: Option<u32>,
    /// Musical note adjusting the playback rate, e.g. "C5", "F#4".
    pub note: Option<String>,
    /// Loop the whole sample (or restart the stream at its end).
    pub looping: bool,
    /// Restrict this sound to a single channel slot.
    pub restricted: bool,
    pub stream_mode: StreamMode,
    /// Release engine resources automatically once playback completes.
    pub auto_terminate: bool,
}

impl Default for SoundOptions {
    fn default() -> SoundOptions {
        SoundOptions {
            priority: 0,
            volume: 100.0,
            pan: 0.0,
            frequency: None,
            note: None,
            looping: false,
            restricted: false,
            stream_mode: StreamMode::default(),
            auto_terminate: false,
        }
    }
}

/// A client-visible playback handle over one WAVE source.
///
/// Loading registers the sample (or attaches its stream); `activate`
/// acquires a channel with priority preemption and starts playback through
/// the command protocol. Parameter setters work with or without a live
/// channel: without one they update the stored options applied on the next
/// activation.
pub struct Sound {
    engine: Arc<AudioEngine>,
    shared: Arc<SharedAudio>,
    commands: CommandSender,
    id: SoundId,
    path: PathBuf,
    options: SoundOptions,
    encoding: SampleEncoding,
    /// Decoded source length in bytes.
    length: u64,
    streaming: bool,
    playback_frequency: u32,
    /// Registry handle, shared with the liveness watcher. Whoever releases
    /// the sample takes the handle first, so the registry slot is removed
    /// exactly once even after the index has been recycled.
    handle: Arc<Mutex<Option<SampleHandle>>>,
    channel: Option<usize>,
    scheduler: Option<StreamScheduler>,
    watcher: Option<(CancelHandle, thread::JoinHandle<()>)>,
    /// Cached byte position used while no channel is held.
    position: u64,
    /// Set by the liveness watcher once playback has completed.
    completed: Arc<AtomicBool>,
}

impl Sound {
    /// Loads a WAVE file and registers it with the engine.
    pub fn load<P: AsRef<Path>>(
        engine: &Arc<AudioEngine>,
        path: P,
        options: SoundOptions,
    ) -> Result<Sound, AudioError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let info = wave::parse_header(&mut file)?;
        let encoding = info.encoding()?;
        let length = info.decoded_len();
        let streaming = should_stream(options.stream_mode, length, info.is_adpcm());

        let shared = engine.shared();
        let handle = if streaming {
            let source = WaveSource::new(file, &info);
            let mut state = shared.lock()?;
            state.samples.attach_stream(
                encoding,
                info.sample_rate,
                Box::new(source),
                0,
                length,
                0,
                options.looping,
            )?
        } else {
            let data = read_resident(&mut file, &info)?;
            let loops = if options.looping {
                LoopSpec::single(0, data.len() as u64)
            } else {
                LoopSpec::none()
            };
            let mut state = shared.lock()?;
            state
                .samples
                .register(encoding, info.sample_rate, data, loops)?
        };

        let base = options.frequency.unwrap_or(info.sample_rate);
        let playback_frequency = match options.note.as_deref() {
            Some(note) => note_frequency(base, note)?,
            None => base,
        };

        info!(
            path = %path.display(),
            bits = info.bits_per_sample,
            channels = info.channels,
            rate = info.sample_rate,
            length,
            streaming,
            "Loaded sound"
        );
        Ok(Sound {
            shared,
            commands: engine.commands(),
            engine: engine.clone(),
            id: SoundId::next(),
            path,
            options,
            encoding,
            length,
            streaming,
            playback_frequency,
            handle: Arc::new(Mutex::new(Some(handle))),
            channel: None,
            scheduler: None,
            watcher: None,
            position: 0,
            completed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Decoded length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Acquires a channel and starts playback. Restricted and streaming
    /// sounds reuse their own slot; otherwise a reclaimable slot is taken or
    /// a lower-priority channel preempted. Fails with `ChannelUnavailable`
    /// when the pool has nothing to give, leaving this sound unchanged.
    pub fn activate(&mut self) -> Result<(), AudioError> {
        let handle = (*self.handle.lock())
            .ok_or_else(|| AudioError::AllocationFailure(String::from("sound was freed")))?;
        self.stop_tasks();

        let reuse = self.options.restricted || self.streaming || self.channel.is_some();
        let channel = {
            let mut state = self.shared.lock()?;
            state.pool.allocate(self.id, self.options.priority, reuse)?
        };

        if let Err(e) = self.start_playback(channel, handle) {
            // Release the claim so a failed activation leaves no trace.
            if let Ok(mut state) = self.shared.lock() {
                state.pool.release(self.id);
            }
            self.channel = None;
            return Err(e);
        }
        self.channel = Some(channel);
        self.completed.store(false, Ordering::Relaxed);

        if self.streaming {
            self.scheduler = Some(StreamScheduler::start(
                self.shared.clone(),
                handle,
                channel,
                self.id,
                self.engine.config().refill_period(),
            ));
        }
        self.spawn_watcher(channel);
        debug!(sound = %self.id, channel, "Activated sound");
        Ok(())
    }

    fn start_playback(&self, channel: usize, handle: SampleHandle) -> Result<(), AudioError> {
        let owner = Some(self.id);
        self.commands
            .submit(channel, owner, Command::SetSample(handle))?;
        self.commands
            .submit(channel, owner, Command::SetVolume(self.options.volume))?;
        self.commands
            .submit(channel, owner, Command::SetPan(self.options.pan))?;
        self.commands.submit(
            channel,
            owner,
            Command::Play {
                frequency: self.playback_frequency,
            },
        )?;
        if self.position > 0 {
            self.commands
                .submit(channel, owner, Command::SetPosition(self.position))?;
        }
        Ok(())
    }

    /// Stops playback and rewinds. The channel claim is kept so a restricted
    /// sound reactivates in place.
    pub fn deactivate(&mut self) -> Result<(), AudioError> {
        self.stop_tasks();
        if let Some(channel) = self.channel {
            // A stale submission here is harmless: if the slot has moved on,
            // the command is discarded.
            self.commands.submit(channel, Some(self.id), Command::Stop)?;
        }
        self.position = 0;
        Ok(())
    }

    /// Stops playback, remembering the position for `resume`.
    pub fn pause(&mut self) -> Result<(), AudioError> {
        self.position = self.position()?;
        if let Some(channel) = self.channel {
            self.commands.submit(channel, Some(self.id), Command::Stop)?;
        }
        Ok(())
    }

    /// Resumes a paused channel. A no-op if playback already finished.
    pub fn resume(&mut self) -> Result<(), AudioError> {
        if let Some(channel) = self.channel {
            self.commands
                .submit(channel, Some(self.id), Command::Continue)?;
        }
        Ok(())
    }

    /// Moves the playback position to a byte offset.
    pub fn seek(&mut self, bytes: u64) -> Result<(), AudioError> {
        self.position = bytes.min(self.length);
        if self.owns_channel()? {
            if let Some(channel) = self.channel {
                self.commands
                    .submit(channel, Some(self.id), Command::SetPosition(self.position))?;
            }
        }
        Ok(())
    }

    pub fn set_volume(&mut self, volume: f64) -> Result<(), AudioError> {
        self.options.volume = volume.clamp(0.0, 100.0);
        self.submit_if_live(Command::SetVolume(self.options.volume))
    }

    pub fn set_pan(&mut self, pan: f64) -> Result<(), AudioError> {
        self.options.pan = pan.clamp(-100.0, 100.0);
        self.submit_if_live(Command::SetPan(self.options.pan))
    }

    /// Sets the playback rate in Hz.
    pub fn set_frequency(&mut self, frequency: u32) -> Result<(), AudioError> {
        self.options.frequency = Some(frequency);
        self.playback_frequency = match self.options.note.as_deref() {
            Some(note) => note_frequency(frequency, note)?,
            None => frequency,
        };
        self.submit_if_live(Command::SetFrequency(self.playback_frequency))
    }

    /// Adjusts the playback rate to a musical note such as "C5" or "F#4".
    pub fn set_note(&mut self, note: &str) -> Result<(), AudioError> {
        let base = self.options.frequency.unwrap_or(self.base_rate());
        self.playback_frequency = note_frequency(base, note)?;
        self.options.note = Some(note.to_string());
        self.submit_if_live(Command::SetFrequency(self.playback_frequency))
    }

    pub fn mute(&mut self, mute: bool) -> Result<(), AudioError> {
        self.submit_if_live(Command::Mute(mute))
    }

    /// Ramps the channel up from silence to its set volume.
    pub fn fade_in(&mut self) -> Result<(), AudioError> {
        self.submit_if_live(Command::FadeIn)
    }

    pub fn fade_out(&mut self) -> Result<(), AudioError> {
        self.submit_if_live(Command::FadeOut)
    }

    /// Leaves the loop and lets the sound play out its tail.
    pub fn stop_looping(&mut self) -> Result<(), AudioError> {
        self.submit_if_live(Command::StopLooping)
    }

    /// Whether the sound currently holds a channel that is playing.
    pub fn active(&self) -> bool {
        if self.completed.load(Ordering::Relaxed) {
            return false;
        }
        let channel = match self.channel {
            Some(channel) => channel,
            None => return false,
        };
        let id = self.id;
        matches!(
            self.shared
                .with_slot(channel, |slot| slot.owner == Some(id) && slot.state.is_active()),
            Ok(Some(true))
        )
    }

    /// The current playback position as a byte offset into the decoded data.
    pub fn position(&self) -> Result<u64, AudioError> {
        let channel = match self.channel {
            Some(channel) => channel,
            None => return Ok(self.position),
        };
        let state = self.shared.lock()?;
        let slot = match state.pool.slot(channel) {
            Some(slot) if slot.owner == Some(self.id) => slot,
            _ => return Ok(self.position),
        };
        let entry = match slot.sample.and_then(|h| state.samples.get(h)) {
            Some(entry) => entry,
            None => return Ok(self.position),
        };
        if entry.is_stream() {
            Ok(stream::consumed_bytes(slot, entry).min(self.length))
        } else {
            Ok(slot.position << entry.encoding.shift())
        }
    }

    fn base_rate(&self) -> u32 {
        // The registry entry holds the source rate; fall back to the stored
        // playback frequency if the sample is gone.
        let handle = *self.handle.lock();
        handle
            .and_then(|h| {
                self.shared
                    .lock()
                    .ok()
                    .and_then(|state| state.samples.get(h).map(|e| e.rate))
            })
            .unwrap_or(self.playback_frequency)
    }

    fn owns_channel(&self) -> Result<bool, AudioError> {
        let channel = match self.channel {
            Some(channel) => channel,
            None => return Ok(false),
        };
        let id = self.id;
        Ok(self
            .shared
            .with_slot(channel, |slot| slot.owner == Some(id))?
            .unwrap_or(false))
    }

    fn submit_if_live(&self, command: Command) -> Result<(), AudioError> {
        if self.owns_channel()? {
            if let Some(channel) = self.channel {
                return self.commands.submit(channel, Some(self.id), command);
            }
        }
        Ok(())
    }

    /// Spawns the liveness timer: a quarter-second poll that notices
    /// completion and, for auto-terminating sounds, releases the engine-side
    /// resources.
    fn spawn_watcher(&mut self, channel: usize) {
        let cancel = CancelHandle::new();
        let thread = {
            let cancel = cancel.clone();
            let shared = self.shared.clone();
            let completed = self.completed.clone();
            let handle = self.handle.clone();
            let id = self.id;
            let auto_terminate = self.options.auto_terminate;
            thread::Builder::new()
                .name(String::from("polymix-liveness"))
                .spawn(move || {
                    while !cancel.wait_timeout(Duration::from_millis(250)) {
                        let done = match shared.with_slot(channel, |slot| {
                            slot.owner != Some(id)
                                || slot.state == crate::pool::ChannelState::Finished
                        }) {
                            Ok(Some(done)) => done,
                            Ok(None) => true,
                            Err(_) => continue,
                        };
                        if done {
                            completed.store(true, Ordering::Relaxed);
                            if auto_terminate {
                                // Taking the handle keeps a later drop from
                                // removing the recycled registry slot again.
                                release_resources(&shared, id, handle.lock().take());
                            }
                            break;
                        }
                    }
                })
                .ok()
        };
        if let Some(thread) = thread {
            self.watcher = Some((cancel, thread));
        }
    }

    fn stop_tasks(&mut self) {
        if let Some((cancel, thread)) = self.watcher.take() {
            cancel.cancel();
            let _ = thread.join();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}

impl Drop for Sound {
    /// Tears down everything this sound owns: timers, its channel claim,
    /// and the registry entry. Safe after any partial teardown.
    fn drop(&mut self) {
        self.stop_tasks();
        self.channel = None;
        release_resources(&self.shared, self.id, self.handle.lock().take());
    }
}

/// Frees the channel owned by `id` and removes the sample. Idempotent; used
/// by both `Drop` and the auto-terminate path.
fn release_resources(shared: &SharedAudio, id: SoundId, handle: Option<SampleHandle>) {
    match shared.lock() {
        Ok(mut state) => {
            state.pool.release(id);
            if let Some(handle) = handle {
                state.remove_sample(handle);
            }
        }
        Err(_) => warn!(sound = %id, "Timed out releasing sound resources"),
    }
}

/// Streams decoded PCM out of a WAVE file's data chunk.
struct WaveSource {
    file: File,
    data_offset: u64,
    data_len: u64,
    pos: u64,
}

impl WaveSource {
    fn new(file: File, info: &WaveInfo) -> WaveSource {
        WaveSource {
            file,
            data_offset: info.data_offset,
            data_len: info.data_len,
            pos: 0,
        }
    }
}

impl StreamSource for WaveSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, AudioError> {
        let remaining = self.data_len.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(ReadOutcome::End);
        }
        let want = buf.len().min(remaining as usize);
        self.file
            .seek(SeekFrom::Start(self.data_offset + self.pos))?;
        let n = self.file.read(&mut buf[..want])?;
        if n == 0 {
            return Ok(ReadOutcome::End);
        }
        self.pos += n as u64;
        Ok(ReadOutcome::Data(n))
    }

    fn seek(&mut self, position: u64) -> Result<(), AudioError> {
        self.pos = position.min(self.data_len);
        Ok(())
    }
}

/// Reads and decodes the data chunk of a resident sound.
fn read_resident(file: &mut File, info: &WaveInfo) -> Result<Vec<u8>, AudioError> {
    file.seek(SeekFrom::Start(info.data_offset))?;
    let mut raw = vec![0u8; info.data_len as usize];
    file.read_exact(&mut raw)?;
    if info.is_adpcm() {
        Ok(wave::decode_ima_adpcm(
            &raw,
            info.channels,
            info.block_align as usize,
        ))
    } else {
        Ok(raw)
    }
}

/// Semitone offsets within an octave, C through B.
const NOTE_OFFSETS: [(char, i32); 7] = [
    ('C', 0),
    ('D', 2),
    ('E', 4),
    ('F', 5),
    ('G', 7),
    ('A', 9),
    ('B', 11),
];

/// Middle octave: notes without an octave digit sit here, playing "C5" at
/// the source's native rate.
const MIDDLE_OCTAVE: i32 = 5;

/// Converts a note name ("C", "F#4", "Bb6"-style flats excluded, sharps via
/// '#' or 's') to a playback frequency relative to `base` at middle C.
pub fn note_frequency(base: u32, note: &str) -> Result<u32, AudioError> {
    let mut chars = note.chars();
    let letter = chars
        .next()
        .map(|c| c.to_ascii_uppercase())
        .ok_or_else(|| AudioError::UnsupportedFormat(String::from("empty note")))?;
    let mut semitone = NOTE_OFFSETS
        .iter()
        .find(|(c, _)| *c == letter)
        .map(|(_, offset)| *offset)
        .ok_or_else(|| AudioError::UnsupportedFormat(format!("invalid note {note}")))?;

    let mut rest: Vec<char> = chars.collect();
    if matches!(rest.first(), Some('#') | Some('s') | Some('S')) {
        semitone += 1;
        rest.remove(0);
    }
    let octave = match rest.as_slice() {
        [] => MIDDLE_OCTAVE,
        [d] if d.is_ascii_digit() => *d as i32 - '0' as i32,
        _ => {
            return Err(AudioError::UnsupportedFormat(format!(
                "invalid note {note}"
            )))
        }
    };

    let semitones = (octave - MIDDLE_OCTAVE) * 12 + semitone;
    let frequency = base as f64 * f64::powf(2.0, semitones as f64 / 12.0);
    Ok(frequency.round() as u32)
}
