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
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{crate_version, Parser, Subcommand};

use polymix::backend;
use polymix::sound::{Sound, SoundOptions, StreamMode};
use polymix::{AudioEngine, Config};

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A software audio mixer and sample playback engine."
)]
struct Cli {
    /// The path to the engine config. Defaults are used if not given.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Plays one or more WAVE files and exits when they finish.
    Play {
        /// The paths of the WAVE files to play.
        paths: Vec<PathBuf>,
        /// Loop playback until interrupted.
        #[arg(short, long)]
        looping: bool,
        /// Playback volume, 0-100.
        #[arg(short, long, default_value_t = 100.0)]
        volume: f64,
        /// Stereo pan, -100 (left) through 100 (right).
        #[arg(short, long, default_value_t = 0.0)]
        pan: f64,
        /// Musical note to pitch playback to, e.g. C5 or F#4.
        #[arg(short, long)]
        note: Option<String>,
        /// Stream sources from disk instead of decoding them up front.
        #[arg(short, long)]
        stream: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Devices {} => {
            let devices = backend::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Play {
            paths,
            looping,
            volume,
            pan,
            note,
            stream,
        } => {
            if paths.is_empty() {
                return Err("no files to play".into());
            }

            let engine = AudioEngine::start(config)?;
            let mut sounds = Vec::with_capacity(paths.len());
            for path in paths {
                let mut sound = Sound::load(
                    &engine,
                    &path,
                    SoundOptions {
                        looping,
                        volume,
                        pan,
                        note: note.clone(),
                        stream_mode: if stream {
                            StreamMode::Always
                        } else {
                            StreamMode::Smart
                        },
                        ..SoundOptions::default()
                    },
                )?;
                sound.activate()?;
                println!("Playing {}", path.display());
                sounds.push(sound);
            }

            while sounds.iter().any(|s| s.active()) {
                thread::sleep(Duration::from_millis(100));
            }
            engine.shutdown();
        }
    }

    Ok(())
}
