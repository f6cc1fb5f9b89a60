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
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use tracing::{error, info};

use crate::backend::Backend;
use crate::error::AudioError;
use crate::playsync::CancelHandle;

/// Lock-free single-producer single-consumer ring between the mixing task
/// and the cpal output callback.
struct Ring {
    buffer: UnsafeCell<Vec<f32>>,
    /// Power of two, so wrapping is a mask.
    capacity: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// Safety: the producer writes only outside [read_pos, write_pos) and the
// consumer reads only inside it; the acquire/release position updates order
// those accesses, so the two sides never touch the same samples at once.
unsafe impl Sync for Ring {}

impl Ring {
    fn new(capacity: usize) -> Ring {
        let capacity = capacity.next_power_of_two();
        Ring {
            buffer: UnsafeCell::new(vec![0.0; capacity]),
            capacity,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
        }
    }

    fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    fn space(&self) -> usize {
        self.capacity - self.available() - 1
    }

    /// Writes as many samples as fit, returning the count written.
    fn write(&self, samples: &[f32]) -> usize {
        let to_write = self.space().min(samples.len());
        if to_write == 0 {
            return 0;
        }
        let write = self.write_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;

        let first = (self.capacity - write).min(to_write);
        // Safety: the producer is the only writer and the regions written
        // here are outside [read_pos, write_pos), which the consumer reads.
        unsafe {
            let base = (*self.buffer.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(samples.as_ptr(), base.add(write), first);
            if to_write > first {
                std::ptr::copy_nonoverlapping(samples.as_ptr().add(first), base, to_write - first);
            }
        }

        self.write_pos
            .store((write + to_write) & mask, Ordering::Release);
        to_write
    }

    /// Reads up to `output.len()` samples, returning the count read.
    fn read(&self, output: &mut [f32]) -> usize {
        let to_read = self.available().min(output.len());
        if to_read == 0 {
            return 0;
        }
        let read = self.read_pos.load(Ordering::Acquire);
        let mask = self.capacity - 1;

        let first = (self.capacity - read).min(to_read);
        // Safety: the consumer is the only reader of [read_pos, write_pos).
        unsafe {
            let base = (*self.buffer.get()).as_ptr();
            std::ptr::copy_nonoverlapping(base.add(read), output.as_mut_ptr(), first);
            if to_read > first {
                std::ptr::copy_nonoverlapping(base, output.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read + to_read) & mask, Ordering::Release);
        to_read
    }
}

fn fill_callback<T: cpal::Sample + cpal::FromSample<f32>>(
    ring: Arc<Ring>,
) -> impl FnMut(&mut [T], &cpal::OutputCallbackInfo) + Send + 'static {
    let mut scratch: Vec<f32> = Vec::new();
    move |data: &mut [T], _| {
        scratch.resize(data.len(), 0.0);
        let n = ring.read(&mut scratch);
        // Underruns emit silence.
        scratch[n..].fill(0.0);
        for (out, sample) in data.iter_mut().zip(scratch.iter()) {
            *out = T::from_sample(*sample);
        }
    }
}

/// A cpal-backed output device. The stream itself lives on a dedicated
/// thread because it cannot move between threads; the mixing task talks to
/// it through the ring.
pub struct Device {
    name: String,
    ring: Option<Arc<Ring>>,
    cancel: CancelHandle,
    output_thread: Option<thread::JoinHandle<()>>,
}

impl Device {
    /// Gets a handle for the device with the given name. "default" selects
    /// the host default; otherwise the first device whose name contains
    /// `name` is used. The device itself is resolved in `open`.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            ring: None,
            cancel: CancelHandle::new(),
            output_thread: None,
        }
    }

    /// Lists the names of output devices known to cpal.
    pub fn list() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        let mut names = Vec::new();
        for device in devices {
            names.push(device.name().map_err(|e| AudioError::Backend(e.to_string()))?);
        }
        Ok(names)
    }

    fn resolve(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        if self.name == "default" {
            return host
                .default_output_device()
                .ok_or_else(|| AudioError::Backend(String::from("no default output device")));
        }
        let devices = host
            .output_devices()
            .map_err(|e| AudioError::Backend(e.to_string()))?;
        for device in devices {
            if device
                .name()
                .map(|n| n.contains(&self.name))
                .unwrap_or(false)
            {
                return Ok(device);
            }
        }
        Err(AudioError::Backend(format!(
            "no output device matching {}",
            self.name
        )))
    }
}

impl Backend for Device {
    fn open(&mut self, rate: u32, channels: u16) -> Result<(), AudioError> {
        let device = self.resolve()?;
        let sample_format = device
            .default_output_config()
            .map_err(|e| AudioError::Backend(e.to_string()))?
            .sample_format();

        // Half a second of interleaved audio between us and the callback.
        let ring = Arc::new(Ring::new((rate as usize * channels as usize / 2).max(1024)));
        self.ring = Some(ring.clone());

        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let cancel = self.cancel.clone();
        let name = self.name.clone();

        // The stream is created and kept alive on this thread.
        self.output_thread = Some(thread::spawn(move || {
            let stream = match sample_format {
                cpal::SampleFormat::F32 => device.build_output_stream(
                    &stream_config,
                    fill_callback::<f32>(ring),
                    |e| error!(err = %e, "Output stream error"),
                    None,
                ),
                cpal::SampleFormat::I16 => device.build_output_stream(
                    &stream_config,
                    fill_callback::<i16>(ring),
                    |e| error!(err = %e, "Output stream error"),
                    None,
                ),
                cpal::SampleFormat::I32 => device.build_output_stream(
                    &stream_config,
                    fill_callback::<i32>(ring),
                    |e| error!(err = %e, "Output stream error"),
                    None,
                ),
                other => {
                    let _ = ready_tx.send(Err(AudioError::Backend(format!(
                        "unsupported output sample format {other:?}"
                    ))));
                    return;
                }
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::Backend(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::Backend(e.to_string())));
                return;
            }
            info!(device = name, rate, channels, "Output stream running");
            let _ = ready_tx.send(Ok(()));

            // Keep the stream alive until cancelled.
            while !cancel.wait_timeout(Duration::from_millis(100)) {}
            drop(stream);
        }));

        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| AudioError::Backend(String::from("output stream did not start")))?
    }

    fn submit(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        let ring = self
            .ring
            .as_ref()
            .ok_or_else(|| AudioError::Backend(String::from("backend is not open")))?;
        let mut written = 0;
        while written < samples.len() {
            if self.cancel.is_cancelled() {
                return Err(AudioError::Backend(String::from("output stream stopped")));
            }
            let n = ring.write(&samples[written..]);
            written += n;
            if n == 0 {
                // Ring full; let the callback drain.
                thread::sleep(Duration::from_micros(500));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.output_thread.take() {
            let _ = thread.join();
        }
        self.ring = None;
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (cpal)", self.name)
    }
}
