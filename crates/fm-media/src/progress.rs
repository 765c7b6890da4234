//! Parse ffmpeg progress markers from stderr.
//!
//! ffmpeg reports `time=HH:MM:SS.cc` in its periodic status lines; measured
//! against the known output duration that becomes a completion percentage.

/// Extract the `time=` marker from a stderr line, as seconds.
pub fn parse_time_marker(line: &str) -> Option<f64> {
    let idx = line.find("time=")?;
    let rest = &line[idx + 5..];
    let token = rest.split_whitespace().next()?;

    // N/A shows up before the first frame.
    let mut parts = token.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Completion percentage given elapsed output seconds and total output
/// seconds, clamped to [0, 100].
pub fn percent_of(elapsed_secs: f64, total_secs: f64) -> u8 {
    if total_secs <= 0.0 {
        return 0;
    }
    ((elapsed_secs / total_secs) * 100.0).clamp(0.0, 100.0) as u8
}
