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
//! A software audio mixer and sample playback engine.
//!
//! The engine mixes a fixed pool of channels into one output device.
//! Channels are allocated with priority preemption, driven through a
//! command queue owned by the mixing task, and fed from a sample registry
//! holding resident PCM or streamed sources. [`sound::Sound`] is the
//! client-facing handle tying all of it together for one WAVE file.

pub mod backend;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod mixer;
pub mod playsync;
pub mod pool;
pub mod registry;
pub mod sound;
pub mod stream;
pub mod wave;

pub use config::Config;
pub use engine::AudioEngine;
pub use error::AudioError;
pub use sound::{Sound, SoundOptions, StreamMode};
