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
use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Interpolation quality used by the mixer when stepping through sample data
/// at a non-native rate.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MixQuality {
    /// Nearest-sample taps. Cheapest, audible aliasing on large pitch shifts.
    Nearest,
    /// Linear interpolation between adjacent frames.
    #[default]
    Linear,
}

/// Engine configuration. Every field has a default, so an empty YAML document
/// (or `Config::default()`) yields a working engine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// The output sample rate in Hz.
    pub output_rate: u32,

    /// Whether the output is stereo. Mono output downmixes stereo samples.
    pub stereo: bool,

    /// Number of channel slots in the mixing pool.
    pub channels: usize,

    /// Mixer interpolation quality.
    pub quality: MixQuality,

    /// Master volume, 0-100.
    pub master_volume: f64,

    /// Duration of one mix tick in milliseconds.
    pub mix_interval_ms: u64,

    /// How long cross-task accessors wait for the audio state lock before
    /// reporting a timeout, in milliseconds.
    pub access_timeout_ms: u64,

    /// How long a blocking command submission waits for acknowledgement,
    /// in milliseconds.
    pub command_timeout_ms: u64,

    /// Streaming buffer refill period in milliseconds.
    pub refill_period_ms: u64,

    /// Output device: "default", "mock", or a substring of a device name.
    pub device: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            output_rate: 44100,
            stereo: true,
            channels: 8,
            quality: MixQuality::Linear,
            master_volume: 100.0,
            mix_interval_ms: 10,
            access_timeout_ms: 100,
            command_timeout_ms: 250,
            refill_period_ms: 250,
            device: String::from("default"),
        }
    }
}

impl Config {
    /// Deserializes the config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, Box<dyn Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yml::from_str(&contents)?;
        Ok(config)
    }

    pub fn mix_interval(&self) -> Duration {
        Duration::from_millis(self.mix_interval_ms.max(1))
    }

    pub fn access_timeout(&self) -> Duration {
        Duration::from_millis(self.access_timeout_ms.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    pub fn refill_period(&self) -> Duration {
        Duration::from_millis(self.refill_period_ms.max(1))
    }

    /// Interleaved output channel count.
    pub fn output_channels(&self) -> usize {
        if self.stereo {
            2
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.output_rate, 44100);
        assert_eq!(config.channels, 8);
        assert_eq!(config.quality, MixQuality::Linear);
        assert_eq!(config.output_channels(), 2);
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().expect("Unable to create temp dir");
        let path = dir.path().join("engine.yaml");
        let mut file = fs::File::create(&path).expect("Unable to create file");
        file.write_all(
            b"output_rate: 22050\nstereo: false\nchannels: 4\nquality: nearest\ndevice: mock\n",
        )
        .expect("Unable to write file");

        let config = Config::load(&path).expect("Unable to load config");
        assert_eq!(config.output_rate, 22050);
        assert!(!config.stereo);
        assert_eq!(config.channels, 4);
        assert_eq!(config.quality, MixQuality::Nearest);
        assert_eq!(config.device, "mock");
        // Unspecified fields keep their defaults.
        assert_eq!(config.master_volume, 100.0);
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let dir = tempfile::tempdir().expect("Unable to create temp dir");
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "banana: true\n").expect("Unable to write file");
        assert!(Config::load(&path).is_err());
    }
}
