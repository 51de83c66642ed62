/// One parsed FFmpeg progress sample from a stderr status line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Media time already encoded, in seconds.
    pub time_seconds: f64,
    /// Realtime speed multiplier, when the line carries one.
    pub speed: Option<f64>,
}

/// Parse an FFmpeg stderr status line of the shape
/// `frame=  123 fps= 30 q=28.0 size=  1024kB time=00:00:41.36 bitrate=… speed=1.23x`.
///
/// Returns `None` for lines without a parsable `time=`.
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let time_seconds = extract_value(line, "time=").and_then(parse_clock)?;
    let speed = extract_value(line, "speed=")
        .and_then(|v| v.trim_end_matches(['x', 'X']).parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s > 0.0);

    Some(ProgressSample {
        time_seconds,
        speed,
    })
}

/// Extract the token following `key` up to the next whitespace.
fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(char::is_whitespace)
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

/// Parse `HH:MM:SS.cc` into seconds. FFmpeg emits `N/A` before the first
/// sample; that is not a time.
fn parse_clock(raw: &str) -> Option<f64> {
    let mut parts = raw.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Weight of one encoding pass inside the whole job: the video pass is 70%
/// when audio passes follow (100% otherwise), the remaining 30% is split
/// evenly across audio passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassWeight {
    pub base: f64,
    pub span: f64,
}

impl PassWeight {
    pub fn whole() -> Self {
        Self {
            base: 0.0,
            span: 100.0,
        }
    }

    pub fn video(audio_count: usize) -> Self {
        if audio_count == 0 {
            Self::whole()
        } else {
            Self {
                base: 0.0,
                span: 70.0,
            }
        }
    }

    pub fn audio(index: usize, audio_count: usize) -> Self {
        let span = 30.0 / audio_count.max(1) as f64;
        Self {
            base: 70.0 + span * index as f64,
            span,
        }
    }

    /// Overall job percent for a fraction of this pass, capped below 100
    /// until publish.
    pub fn percent(&self, fraction: f64) -> f64 {
        (self.base + self.span * fraction.clamp(0.0, 1.0)).min(99.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN: &str = "frame= 1234 fps= 30.0 q=28.0 size=   12345KiB time=00:00:41.36 bitrate= 244.8kbits/s speed=1.23x";

    #[test]
    fn parses_golden_status_line() {
        let sample = parse_progress_line(GOLDEN).unwrap();
        assert!((sample.time_seconds - 41.36).abs() < 1e-9);
        assert_eq!(sample.speed, Some(1.23));
    }

    #[test]
    fn parses_hours_and_large_speeds() {
        let line = "frame=99999 fps=120 q=-1.0 size=2097152KiB time=01:30:00.00 bitrate=3100.1kbits/s speed=12.4x";
        let sample = parse_progress_line(line).unwrap();
        assert_eq!(sample.time_seconds, 5400.0);
        assert_eq!(sample.speed, Some(12.4));
    }

    #[test]
    fn missing_speed_is_tolerated() {
        let sample = parse_progress_line("time=00:01:00.00 bitrate=N/A").unwrap();
        assert_eq!(sample.time_seconds, 60.0);
        assert_eq!(sample.speed, None);
    }

    #[test]
    fn na_time_yields_nothing() {
        assert!(parse_progress_line("frame=0 time=N/A speed=N/A").is_none());
        assert!(parse_progress_line("Press [q] to stop").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn video_weight_without_audio_spans_everything() {
        assert_eq!(PassWeight::video(0), PassWeight::whole());
        assert_eq!(PassWeight::video(0).percent(0.5), 50.0);
    }

    #[test]
    fn weighted_passes_compose_to_a_full_job() {
        let video = PassWeight::video(2);
        assert_eq!(video.percent(1.0), 70.0);

        let a0 = PassWeight::audio(0, 2);
        let a1 = PassWeight::audio(1, 2);
        assert_eq!(a0.percent(0.0), 70.0);
        assert_eq!(a0.percent(1.0), 85.0);
        assert_eq!(a1.percent(0.0), 85.0);
        // The last sliver is held back until publish.
        assert_eq!(a1.percent(1.0), 99.0);
    }

    #[test]
    fn percent_never_reaches_one_hundred() {
        assert_eq!(PassWeight::whole().percent(1.0), 99.0);
        assert_eq!(PassWeight::whole().percent(5.0), 99.0);
    }
}
