//! Drives a player from the command line until the queue has played out.

use std::time::{Duration, Instant};

use anyhow::Result;
use segue_audio::{Player, PlayerEvent};
use tracing::{debug, error, info, warn};

/// How long to wait for an event before reporting position.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between position reports.
const STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// How long to wait for the first track before giving up on an initial seek.
const START_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    player: Player,
}

impl Session {
    pub const fn new(player: Player) -> Self {
        Self { player }
    }

    /// Begin playback, optionally `start_at` seconds into the first track.
    pub fn start(&self, start_at: Option<f64>) -> Result<()> {
        self.player.play()?;

        let Some(seconds) = start_at else {
            return Ok(());
        };
        let deadline = Instant::now() + START_TIMEOUT;
        while self.player.current_frame().is_none() {
            if Instant::now() > deadline {
                warn!("First track never started; ignoring start offset");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match self.player.seek_to_time(seconds) {
            Ok(frame) => debug!("Starting at frame {frame}"),
            Err(e) => warn!("Cannot start at {seconds}s: {e}"),
        }
        Ok(())
    }

    /// Log events until playback finishes.
    pub fn run(&self) -> Result<()> {
        let mut last_status = Instant::now();

        loop {
            if let Some(event) = self.player.recv_event_timeout(POLL_INTERVAL) {
                if !self.handle(event) {
                    break;
                }
            }

            if last_status.elapsed() >= STATUS_INTERVAL {
                self.report_position();
                last_status = Instant::now();
            }
        }

        info!("Done ({} underrun(s))", self.player.underrun_count());
        Ok(())
    }

    /// Returns false once there is nothing left to play.
    fn handle(&self, event: PlayerEvent) -> bool {
        match event {
            PlayerEvent::StateChanged(state) => debug!("Playback state changed: {:?}", state),
            PlayerEvent::DecodingStarted { url } => {
                debug!("Decoding {}", url.as_deref().unwrap_or("<unnamed>"));
            }
            PlayerEvent::DecodingFinished { url, frames } => {
                debug!(
                    "Decoded {} ({frames} frames)",
                    url.as_deref().unwrap_or("<unnamed>")
                );
            }
            PlayerEvent::RenderingFinished { url } => {
                info!("Finished {}", url.as_deref().unwrap_or("<unnamed>"));
                if let Some(next) = self.player.playing_url() {
                    info!("Now playing {next}");
                }
            }
            PlayerEvent::DecodeError { url, message } => {
                error!(
                    "Playback error in {}: {message}",
                    url.as_deref().unwrap_or("<unnamed>")
                );
            }
            PlayerEvent::SeekCompleted { frame } => debug!("Seeked to frame {frame}"),
            PlayerEvent::FormatChanged(format) => info!("Output format: {format}"),
            PlayerEvent::PlaybackFinished => {
                info!("Playback finished");
                return false;
            }
        }
        true
    }

    fn report_position(&self) {
        let (Some(current), Some(total)) = (self.player.current_time(), self.player.total_time())
        else {
            return;
        };
        info!(
            "{} {} / {} (buffer {:.0}%)",
            self.player.playing_url().as_deref().unwrap_or("<unnamed>"),
            format_time(current),
            format_time(total),
            self.player.buffer_fill() * 100.0
        );
    }
}

/// Format seconds as `m:ss`.
fn format_time(seconds: f64) -> String {
    let whole = seconds.max(0.0) as u64;
    format!("{}:{:02}", whole / 60, whole % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time() {
        assert_eq!(format_time(0.0), "0:00");
        assert_eq!(format_time(59.9), "0:59");
        assert_eq!(format_time(61.0), "1:01");
        assert_eq!(format_time(3725.0), "62:05");
        assert_eq!(format_time(-3.0), "0:00");
    }
}
