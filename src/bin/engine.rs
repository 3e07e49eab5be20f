//! DAC transmission engine entry point
//!
//! Plays a playlist of audio files against a UDP-attached DAC, or runs a
//! supervised maintenance test of a single recording.
//!
//! Usage:
//!   engine [config.toml] playlist.txt
//!   engine [config.toml] --maintenance audio.raw duration-secs [alert-chunks [same-chunks]]
//!
//! The playlist file lists one audio file path per line; each file holds
//! raw 8 kHz G.711 samples. Without an explicit config path the default
//! location under the user config directory is used.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use directories::ProjectDirs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dac_streamer::config::EngineConfig;
use dac_streamer::engine::maintenance::{MaintenancePlan, MaintenanceSource};
use dac_streamer::engine::playlist::{PlaybackItem, PlaylistCursor, PlaylistSource};
use dac_streamer::engine::{AudioSource, FrameSink};
use dac_streamer::net::{UdpControlLink, UdpFrameSink};
use dac_streamer::regulate::{ChunkClass, UnityRegulator};
use dac_streamer::session::{Session, SessionDeps, SessionOutcome};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args: VecDeque<String> = std::env::args().skip(1).collect();

    let config_path = match args.pop_front() {
        Some(arg) if arg.ends_with(".toml") => PathBuf::from(arg),
        Some(arg) => {
            args.push_front(arg);
            default_config_path()?
        }
        None => default_config_path()?,
    };
    tracing::info!(path = %config_path.display(), "loading configuration");
    let config = EngineConfig::load(&config_path)?;

    match args.pop_front().as_deref() {
        Some("--maintenance") => {
            let (audio, spec) = parse_maintenance_args(&mut args)?;
            run_maintenance(config, Path::new(&audio), spec)
        }
        Some(playlist) => run_playlist(config, Path::new(playlist)),
        None => bail!(
            "usage: engine [config.toml] \
             (playlist.txt | --maintenance audio.raw secs [alert-chunks [same-chunks]])"
        ),
    }
}

/// Leading phases of a maintenance run, parsed from the command line
struct MaintenanceSpec {
    duration_secs: f64,
    alert_chunks: usize,
    same_chunks: usize,
}

/// `audio.raw secs [alert-chunks [same-chunks]]`; omitted phase counts
/// default to zero, which plays the whole recording at the content target
fn parse_maintenance_args(args: &mut VecDeque<String>) -> Result<(String, MaintenanceSpec)> {
    let audio = args.pop_front().context("--maintenance needs an audio file")?;
    let duration_secs: f64 = args
        .pop_front()
        .context("--maintenance needs a duration in seconds")?
        .parse()
        .context("maintenance duration must be a number")?;
    let alert_chunks: usize = match args.pop_front() {
        Some(raw) => raw.parse().context("alert chunk count must be an integer")?,
        None => 0,
    };
    let same_chunks: usize = match args.pop_front() {
        Some(raw) => raw.parse().context("SAME chunk count must be an integer")?,
        None => 0,
    };
    Ok((
        audio,
        MaintenanceSpec {
            duration_secs,
            alert_chunks,
            same_chunks,
        },
    ))
}

fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", "dac-streamer")
        .context("cannot determine the user config directory")?;
    Ok(dirs.config_dir().join("engine.toml"))
}

/// Cursor over a playlist file of audio file paths, one per line
struct FileListCursor {
    paths: VecDeque<PathBuf>,
}

impl FileListCursor {
    fn load(playlist: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(playlist)
            .with_context(|| format!("cannot read playlist {}", playlist.display()))?;
        let paths: VecDeque<PathBuf> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            bail!("playlist {} has no entries", playlist.display());
        }
        tracing::info!(items = paths.len(), "playlist loaded");
        Ok(Self { paths })
    }
}

impl PlaylistCursor for FileListCursor {
    fn next_item(&mut self) -> Option<PlaybackItem> {
        // Unreadable entries are skipped so one bad path cannot stall
        // the whole playlist
        while let Some(path) = self.paths.pop_front() {
            match std::fs::read(&path) {
                Ok(audio) => {
                    return Some(PlaybackItem {
                        id: path
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string()),
                        audio: Bytes::from(audio),
                        class: ChunkClass::Content,
                        is_interrupt: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping unreadable item: {e}");
                }
            }
        }
        None
    }
}

fn run_playlist(config: EngineConfig, playlist: &Path) -> Result<()> {
    let cursor = FileListCursor::load(playlist)?;
    let source = Box::new(PlaylistSource::new(Box::new(cursor)));
    run_session(config, source)
}

fn run_maintenance(mut config: EngineConfig, audio_path: &Path, spec: MaintenanceSpec) -> Result<()> {
    // Maintenance runs unsupervised
    config.supervisor_port = None;

    let audio = std::fs::read(audio_path)
        .with_context(|| format!("cannot read {}", audio_path.display()))?;
    let (source, handle) = MaintenanceSource::new(MaintenancePlan {
        audio: Bytes::from(audio),
        duration_secs: spec.duration_secs,
        alert_chunks: spec.alert_chunks,
        same_chunks: spec.same_chunks,
    });
    tracing::info!(
        packets = handle.remaining_packets(),
        duration_secs = spec.duration_secs,
        alert_chunks = spec.alert_chunks,
        same_chunks = spec.same_chunks,
        "maintenance run prepared"
    );
    run_session(config, Box::new(source))
}

fn run_session(config: EngineConfig, source: Box<dyn AudioSource>) -> Result<()> {
    let control = UdpControlLink::connect(&config)?;
    let sink_config = config.clone();
    let deps = SessionDeps {
        control: Box::new(control),
        source,
        regulator: Arc::new(UnityRegulator),
        data_sinks: Box::new(move || {
            UdpFrameSink::connect(&sink_config).map(|sink| Box::new(sink) as Box<dyn FrameSink>)
        }),
        // The live feed transport belongs to the embedding parent; the
        // standalone binary refuses live broadcast directives
        live_sources: None,
    };

    let mut session = Session::start(config, deps)?;
    tracing::info!("session started");
    let outcome = session.wait_for_shutdown();
    session.shutdown(false);

    match outcome {
        SessionOutcome::Completed => Ok(()),
        SessionOutcome::Failed(reason) => bail!("session failed: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deque(args: &[&str]) -> VecDeque<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_maintenance_args_with_phase_counts() {
        let mut args = deque(&["test.raw", "30.5", "4", "12"]);
        let (audio, spec) = parse_maintenance_args(&mut args).unwrap();
        assert_eq!(audio, "test.raw");
        assert_eq!(spec.duration_secs, 30.5);
        assert_eq!(spec.alert_chunks, 4);
        assert_eq!(spec.same_chunks, 12);
    }

    #[test]
    fn test_maintenance_phase_counts_default_to_zero() {
        let mut args = deque(&["test.raw", "-1"]);
        let (_, spec) = parse_maintenance_args(&mut args).unwrap();
        assert_eq!(spec.duration_secs, -1.0);
        assert_eq!(spec.alert_chunks, 0);
        assert_eq!(spec.same_chunks, 0);

        let mut args = deque(&["test.raw", "10", "3"]);
        let (_, spec) = parse_maintenance_args(&mut args).unwrap();
        assert_eq!(spec.alert_chunks, 3);
        assert_eq!(spec.same_chunks, 0);
    }

    #[test]
    fn test_maintenance_args_reject_garbage() {
        assert!(parse_maintenance_args(&mut deque(&["test.raw"])).is_err());
        assert!(parse_maintenance_args(&mut deque(&["test.raw", "soon"])).is_err());
        assert!(parse_maintenance_args(&mut deque(&["test.raw", "10", "-3"])).is_err());
    }
}
