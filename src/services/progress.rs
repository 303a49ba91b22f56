//! Normalizes raw [`FetchEvent`]s into [`TaskState`] transitions + payloads
//! appended to TSS (spec §4.5 state machine, §4.6 progress normalization).
//!
//! WR owns the only writer of this mapping; once a terminal state has been
//! appended for a task, [`ProgressNormalizer::normalize`] refuses to produce
//! another append (spec §8: "nothing is appended after a terminal state").

use std::time::Instant;

use crate::error::{AppError, Result};
use crate::models::progress::{format_rate, normalize_percent, overall_progress, parse_current_track};
use crate::models::{FetchEvent, TaskState};

pub struct ProgressNormalizer {
    terminal_reached: bool,
    /// Instant + byte count of the previous `real_time` sample, used to turn
    /// the fetch library's raw byte counter into a bytes/second rate
    /// (spec §4.6: "rate = bytes / (now - last_update)").
    real_time_last: Option<(Instant, u64)>,
    /// Same tracking for `track_progress` samples, kept separate since a new
    /// track restarts its own byte counter from zero.
    track_progress_last: Option<(Instant, u64)>,
}

impl Default for ProgressNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressNormalizer {
    pub fn new() -> Self {
        Self {
            terminal_reached: false,
            real_time_last: None,
            track_progress_last: None,
        }
    }

    /// Turns a raw byte counter into a bytes/second rate against the
    /// previous sample recorded in `tracker`, then updates `tracker` to the
    /// current sample. Returns `None` for the first sample of a tracker,
    /// since there is no prior timestamp to measure elapsed time against.
    fn rate_from(tracker: &mut Option<(Instant, u64)>, bytes: u64) -> Option<String> {
        let now = Instant::now();
        let rate = tracker.map(|(prev_instant, prev_bytes)| {
            let elapsed = now.duration_since(prev_instant).as_secs_f64();
            let delta = bytes.saturating_sub(prev_bytes) as f64;
            if elapsed > 0.0 {
                format_rate(delta / elapsed)
            } else {
                format_rate(0.0)
            }
        });
        *tracker = Some((now, bytes));
        rate
    }

    /// Translate one raw event into a `(TaskState, payload)` pair, or an
    /// error if the task has already reached a terminal state.
    pub fn normalize(&mut self, event: FetchEvent) -> Result<(TaskState, serde_json::Value)> {
        if self.terminal_reached {
            return Err(AppError::Other(anyhow::anyhow!(
                "progress event received after task reached a terminal state"
            )));
        }

        let (state, payload) = match event {
            FetchEvent::Initializing { total_tracks, name } => (
                TaskState::Initializing,
                serde_json::json!({ "total_tracks": total_tracks, "name": name }),
            ),
            FetchEvent::Downloading { current_track_num } => (
                TaskState::Downloading,
                serde_json::json!({ "current_track_num": current_track_num }),
            ),
            FetchEvent::Progress { current_track } => {
                let payload = match parse_current_track(&current_track) {
                    Some((current, total)) => serde_json::json!({
                        "current_track": current_track,
                        "overall_progress": overall_progress(current, total),
                    }),
                    None => serde_json::json!({ "current_track": current_track }),
                };
                (TaskState::Progress, payload)
            }
            FetchEvent::RealTime {
                percent,
                bytes_downloaded,
                total_bytes,
            } => {
                let rate = match bytes_downloaded {
                    Some(b) => Self::rate_from(&mut self.real_time_last, b),
                    None => None,
                };
                (
                    TaskState::RealTime,
                    serde_json::json!({
                        "percent": normalize_percent(percent),
                        "bytes_downloaded": bytes_downloaded,
                        "total_bytes": total_bytes,
                        "rate": rate,
                    }),
                )
            }
            FetchEvent::TrackProgress {
                percent,
                bytes_downloaded,
                total_bytes,
            } => {
                let rate = match bytes_downloaded {
                    Some(b) => Self::rate_from(&mut self.track_progress_last, b),
                    None => None,
                };
                (
                    TaskState::TrackProgress,
                    serde_json::json!({
                        "percent": normalize_percent(percent),
                        "bytes_downloaded": bytes_downloaded,
                        "total_bytes": total_bytes,
                        "rate": rate,
                    }),
                )
            }
            FetchEvent::Skipped { reason, track } => (
                TaskState::Skipped,
                serde_json::json!({ "reason": reason, "track": track }),
            ),
            FetchEvent::Retrying { seconds_left, error } => (
                TaskState::Retrying,
                serde_json::json!({ "seconds_left": seconds_left, "error": error }),
            ),
            FetchEvent::Error { message } => {
                self.terminal_reached = true;
                (TaskState::Error, serde_json::json!({ "message": message }))
            }
            // A `done` event carrying a `track` but no `summary` is a single
            // child's completion inside an album/playlist run and is NOT
            // terminal; only the final summary `done` closes out the task
            // (spec §4.6: "for a track child, increment completed_tracks...;
            // for an album/playlist parent, append {status=COMPLETE...}").
            FetchEvent::Done { summary, message, track } if track.is_some() && summary.is_none() => (
                TaskState::TrackComplete,
                serde_json::json!({ "message": message, "track": track }),
            ),
            FetchEvent::Done { summary, message, track } => {
                self.terminal_reached = true;
                (
                    TaskState::Complete,
                    serde_json::json!({ "summary": summary, "message": message, "track": track }),
                )
            }
        };

        Ok((state, payload))
    }

    /// Whether a terminal state has already been produced; callers bridging
    /// a fetch library that returns its final event separately from what it
    /// pushed through the progress callback use this to avoid appending the
    /// same terminal transition twice.
    pub fn is_terminal(&self) -> bool {
        self.terminal_reached
    }

    pub fn mark_cancelled(&mut self) -> (TaskState, serde_json::Value) {
        self.terminal_reached = true;
        (TaskState::Cancelled, serde_json::json!({}))
    }
}
