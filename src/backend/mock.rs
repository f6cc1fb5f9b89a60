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
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::Backend;
use crate::error::AudioError;

/// A mock backend. Doesn't actually play anything; it captures everything
/// submitted so tests can inspect the mix output.
#[derive(Clone)]
pub struct Device {
    name: String,
    rate: u32,
    channels: u16,
    captured: Arc<Mutex<Vec<f32>>>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            rate: 0,
            channels: 0,
            captured: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A shared view of everything submitted so far.
    pub fn captured(&self) -> Arc<Mutex<Vec<f32>>> {
        self.captured.clone()
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

impl Backend for Device {
    fn open(&mut self, rate: u32, channels: u16) -> Result<(), AudioError> {
        self.rate = rate;
        self.channels = channels;
        Ok(())
    }

    fn submit(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        self.captured.lock().extend_from_slice(samples);
        Ok(())
    }

    fn close(&mut self) {}
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
