//! Raw progress event shapes emitted by the fetch library (spec §4.6, §6).
//!
//! The fetch library is a black box; these are the event dicts it is
//! documented to emit. WR's progress callback (`services::progress`)
//! normalizes these into `TaskStatus` entries.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchEvent {
    Initializing {
        #[serde(default)]
        total_tracks: Option<u32>,
        #[serde(default)]
        name: Option<String>,
    },
    Downloading {
        #[serde(default)]
        current_track_num: Option<u32>,
    },
    Progress {
        /// Form "m/n", e.g. "3/12".
        current_track: String,
    },
    RealTime {
        #[serde(default)]
        percent: Option<f64>,
        #[serde(default)]
        bytes_downloaded: Option<u64>,
        #[serde(default)]
        total_bytes: Option<u64>,
    },
    TrackProgress {
        #[serde(default)]
        percent: Option<f64>,
        #[serde(default)]
        bytes_downloaded: Option<u64>,
        #[serde(default)]
        total_bytes: Option<u64>,
    },
    Skipped {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        track: Option<serde_json::Value>,
    },
    Retrying {
        #[serde(default)]
        seconds_left: Option<u64>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        message: String,
    },
    Done {
        #[serde(default)]
        summary: Option<serde_json::Value>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        track: Option<serde_json::Value>,
    },
}

/// Human-readable download rate, formatted the way §4.6 specifies
/// (B/s, KB/s, MB/s).
pub fn format_rate(bytes_per_second: f64) -> String {
    if bytes_per_second >= 1024.0 * 1024.0 {
        format!("{:.2} MB/s", bytes_per_second / (1024.0 * 1024.0))
    } else if bytes_per_second >= 1024.0 {
        format!("{:.2} KB/s", bytes_per_second / 1024.0)
    } else {
        format!("{:.0} B/s", bytes_per_second)
    }
}

/// Normalize a fractional percent (e.g. `63.97`) to an integer percent for
/// display (spec §4.6: "percent" is reported as an integer, not the raw
/// fractional value the fetch library emits).
pub fn normalize_percent(percent: Option<f64>) -> Option<u32> {
    percent.map(|p| p.round().clamp(0.0, 100.0) as u32)
}

/// Parse a `current_track` field of form "m/n" into (current, total).
pub fn parse_current_track(raw: &str) -> Option<(u32, u32)> {
    let (m, n) = raw.split_once('/')?;
    Some((m.trim().parse().ok()?, n.trim().parse().ok()?))
}

/// `overall_progress = floor(current/total * 100)`, capped at 100 (spec §4.6).
pub fn overall_progress(current: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let pct = (current as f64 / total as f64 * 100.0).floor() as u32;
    pct.min(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_current_track() {
        assert_eq!(parse_current_track("3/12"), Some((3, 12)));
        assert_eq!(parse_current_track(" 3 / 12 "), Some((3, 12)));
    }

    #[test]
    fn rejects_malformed_current_track() {
        assert_eq!(parse_current_track("nope"), None);
        assert_eq!(parse_current_track("3/12/99"), None);
    }

    #[test]
    fn normalize_percent_rounds_and_clamps() {
        assert_eq!(normalize_percent(Some(63.97)), Some(64));
        assert_eq!(normalize_percent(Some(0.2)), Some(0));
        assert_eq!(normalize_percent(Some(104.0)), Some(100));
        assert_eq!(normalize_percent(Some(-5.0)), Some(0));
        assert_eq!(normalize_percent(None), None);
    }

    #[test]
    fn overall_progress_floors_and_caps() {
        assert_eq!(overall_progress(1, 3), 33);
        assert_eq!(overall_progress(3, 3), 100);
        assert_eq!(overall_progress(5, 3), 100);
        assert_eq!(overall_progress(0, 0), 0);
    }

    #[test]
    fn format_rate_picks_the_right_unit() {
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(2048.0), "2.00 KB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.00 MB/s");
    }

    #[test]
    fn deserializes_tagged_events() {
        let v: FetchEvent = serde_json::from_str(
            r#"{"status":"progress","current_track":"2/10"}"#,
        )
        .unwrap();
        match v {
            FetchEvent::Progress { current_track } => assert_eq!(current_track, "2/10"),
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
