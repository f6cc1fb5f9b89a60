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

use crate::error::AudioError;

pub mod cpal;
pub mod mock;

/// An audio output sink. The mixer core and channel pool know nothing about
/// the platform underneath; they only hand interleaved f32 windows to this
/// trait.
pub trait Backend: fmt::Display + Send {
    /// Prepares the backend for interleaved output at `rate` Hz with
    /// `channels` channels. Called once, from the mixing task.
    fn open(&mut self, rate: u32, channels: u16) -> Result<(), AudioError>;

    /// Hands one mix window to the backend. May block until the backend has
    /// accepted all of it.
    fn submit(&mut self, samples: &[f32]) -> Result<(), AudioError>;

    /// Tears the output down. Idempotent.
    fn close(&mut self);
}

/// Lists the names of available output devices.
pub fn list_devices() -> Result<Vec<String>, AudioError> {
    cpal::Device::list()
}

/// Gets a backend by configured device name. Names starting with "mock"
/// yield a capturing mock backend.
pub fn get_backend(device: &str) -> Result<Box<dyn Backend>, AudioError> {
    if device.starts_with("mock") {
        return Ok(Box::new(mock::Device::get(device)));
    }
    Ok(Box::new(cpal::Device::get(device)))
}
