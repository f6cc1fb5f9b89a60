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
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{error, info, warn};

use crate::backend::{self, Backend};
use crate::command::{self, CommandEnvelope, CommandSender};
use crate::config::Config;
use crate::error::AudioError;
use crate::mixer::{Mixer, SoundEvent};
use crate::playsync::CancelHandle;
use crate::pool::SharedAudio;

/// Priority for the mixing thread.
const MIXER_THREAD_PRIORITY: u8 = 70;

/// Completion events queued but not yet drained. Past this, new events are
/// dropped, so an engine whose events are never consumed does not grow.
const EVENT_QUEUE_LIMIT: usize = 64;

/// The audio engine: owns the mixing task, which is the only task that
/// mutates the channel pool and sample registry directly. Everything else
/// goes through the shared state lock or the command queue.
pub struct AudioEngine {
    config: Config,
    shared: Arc<SharedAudio>,
    cmd_tx: Sender<CommandEnvelope>,
    events_rx: Receiver<SoundEvent>,
    cancel: CancelHandle,
    mixer_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioEngine {
    /// Starts the engine against the device named in the config.
    pub fn start(config: Config) -> Result<Arc<AudioEngine>, AudioError> {
        let backend = backend::get_backend(&config.device)?;
        AudioEngine::start_with_backend(config, backend)
    }

    /// Starts the engine with an explicit backend. The backend is opened on
    /// the mixing thread; startup fails if it cannot open.
    pub fn start_with_backend(
        config: Config,
        backend: Box<dyn Backend>,
    ) -> Result<Arc<AudioEngine>, AudioError> {
        let shared = Arc::new(SharedAudio::new(config.channels, config.access_timeout()));
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, events_rx) = bounded(EVENT_QUEUE_LIMIT);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let cancel = CancelHandle::new();

        let mixer_thread = {
            let config = config.clone();
            let shared = shared.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(String::from("polymix-mixer"))
                .spawn(move || {
                    run_mixer(config, shared, cmd_rx, event_tx, cancel, backend, ready_tx)
                })
                .map_err(|e| AudioError::AllocationFailure(e.to_string()))?
        };

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| AudioError::Backend(String::from("mixing task did not start")))
            .and_then(|result| result);
        if let Err(e) = ready {
            cancel.cancel();
            let _ = mixer_thread.join();
            return Err(e);
        }

        info!(
            rate = config.output_rate,
            channels = config.channels,
            stereo = config.stereo,
            "Audio engine started"
        );
        Ok(Arc::new(AudioEngine {
            config,
            shared,
            cmd_tx,
            events_rx,
            cancel,
            mixer_thread: Mutex::new(Some(mixer_thread)),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared audio state, for locked accessor calls.
    pub fn shared(&self) -> Arc<SharedAudio> {
        self.shared.clone()
    }

    /// A sender for queueing commands to the mixing task.
    pub fn commands(&self) -> CommandSender {
        CommandSender::new(self.cmd_tx.clone(), self.config.command_timeout())
    }

    /// Completion events, delivered after the mix pass that produced them.
    /// The queue is bounded; events beyond the limit are dropped rather than
    /// accumulated when nobody drains them.
    pub fn events(&self) -> Receiver<SoundEvent> {
        self.events_rx.clone()
    }

    /// Sets the engine-wide volume, 0-100.
    pub fn set_master_volume(&self, percent: f64) -> Result<(), AudioError> {
        let mut state = self.shared.lock()?;
        state.pool.volume = (percent.clamp(0.0, 100.0) / 100.0) as f32;
        Ok(())
    }

    /// Stops the mixing task and closes the backend. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(thread) = self.mixer_thread.lock().take() {
            if thread.join().is_err() {
                error!("Mixing thread panicked during shutdown");
            }
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_mixer(
    config: Config,
    shared: Arc<SharedAudio>,
    cmd_rx: Receiver<CommandEnvelope>,
    event_tx: Sender<SoundEvent>,
    cancel: CancelHandle,
    mut backend: Box<dyn Backend>,
    ready_tx: Sender<Result<(), AudioError>>,
) {
    if let Ok(priority) = ThreadPriorityValue::try_from(MIXER_THREAD_PRIORITY) {
        let _ = set_current_thread_priority(ThreadPriority::Crossplatform(priority));
    }

    let channels = config.output_channels();
    if let Err(e) = backend.open(config.output_rate, channels as u16) {
        let _ = ready_tx.send(Err(e));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let mut mixer = Mixer::new(config.output_rate, config.stereo, config.quality);
    mixer.master_volume = (config.master_volume.clamp(0.0, 100.0) / 100.0) as f32;

    let frames_per_tick =
        (config.output_rate as u64 * config.mix_interval_ms.max(1) / 1000).max(1) as usize;
    let mut buf = vec![0f32; frames_per_tick * channels];
    let mut events: Vec<SoundEvent> = Vec::new();
    // Frames left before the next command batch boundary.
    let mut batch_left: u64 = 0;

    let sleeper = spin_sleep::SpinSleeper::default();
    let mut deadline = Instant::now();

    while !cancel.is_cancelled() {
        let mut todo = frames_per_tick;
        while todo > 0 && !cancel.is_cancelled() {
            let window = match shared.lock() {
                Ok(mut state) => {
                    // Commands execute between mix windows, at the batch
                    // rate the pool asks for.
                    if batch_left == 0 {
                        command::drain(&mut state, &cmd_rx);
                        let rate_ms = state.pool.update_rate_ms;
                        batch_left = if rate_ms == 0 {
                            todo as u64
                        } else {
                            (config.output_rate as u64 * rate_ms as u64 / 1000).max(1)
                        };
                    }
                    let window = todo.min(batch_left as usize);
                    mixer.mix(&mut state, &mut buf[..window * channels], window, &mut events);
                    window
                }
                Err(_) => {
                    warn!("Audio state lock timed out in the mixing task");
                    buf[..todo * channels].fill(0.0);
                    batch_left = batch_left.max(todo as u64);
                    todo
                }
            };

            // Completion events are delivered outside the state lock, after
            // the pass that produced them. A full queue drops the event.
            for event in events.drain(..) {
                let _ = event_tx.try_send(event);
            }

            if let Err(e) = backend.submit(&buf[..window * channels]) {
                error!(err = %e, "Audio backend rejected output; stopping");
                cancel.cancel();
                break;
            }
            todo -= window;
            batch_left -= (window as u64).min(batch_left);
        }

        deadline += config.mix_interval();
        let now = Instant::now();
        if deadline > now {
            sleeper.sleep(deadline - now);
        } else {
            deadline = now;
        }
    }

    backend.close();
    info!("Audio engine stopped");
}
