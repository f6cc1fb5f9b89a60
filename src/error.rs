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

/// Error types for the audio engine.
///
/// Cross-task accessor timeouts are reported as `AccessTimeout` and are never
/// folded into "resource does not exist" errors.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    /// The sample data is not in a format the engine can play.
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),

    /// No channel slot is free or preemptable for the requesting sound.
    #[error("No audio channel available for playback")]
    ChannelUnavailable,

    /// A resource (mix buffer, sample memory, device) could not be allocated.
    #[error("Audio allocation failed: {0}")]
    AllocationFailure(String),

    /// The backing source of a stream failed mid-playback.
    #[error("Stream source fault: {0}")]
    StreamFault(String),

    /// A queued command no longer matches the channel's owning sound.
    /// Discarded internally; callers normally never observe this.
    #[error("Command is stale; channel owner has changed")]
    StaleCommand,

    /// A locked accessor call did not acquire the audio state in time.
    #[error("Timed out accessing audio state")]
    AccessTimeout,

    /// The referenced sample handle does not exist or was removed.
    #[error("Invalid sample handle {0}")]
    InvalidHandle(u32),

    /// The engine has shut down and can no longer accept commands.
    #[error("Audio engine is not running")]
    EngineStopped,

    /// Output backend failure.
    #[error("Audio backend error: {0}")]
    Backend(String),

    /// IO error from a sample file or stream source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
