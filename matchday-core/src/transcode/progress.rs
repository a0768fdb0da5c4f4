use std::sync::LazyLock;

use regex::Regex;

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex")
});
static TIME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("valid regex"));

/// One line of transcoder output with the completion ratio known so far.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub line: String,
    pub completion: Option<f64>,
}

/// Tracks completion from ffmpeg's `Duration:` header and `time=` stats.
#[derive(Debug, Clone, Default)]
pub struct ProgressParser {
    total_s: Option<f64>,
    elapsed_s: f64,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the total with a duration known up front, e.g. from probed
    /// metadata. Later `Duration:` headers do not override it.
    pub fn with_expected_duration(mut self, seconds: f64) -> Self {
        if seconds > 0.0 {
            self.total_s = Some(seconds);
        }
        self
    }

    pub fn total_seconds(&self) -> Option<f64> {
        self.total_s
    }

    /// Feeds one line and returns the completion ratio in `[0, 1]` once the
    /// total duration is known.
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        if self.total_s.is_none() {
            if let Some(total) = capture_seconds(&DURATION_PATTERN, line) {
                if total > 0.0 {
                    self.total_s = Some(total);
                }
            }
        }
        if let Some(elapsed) = capture_seconds(&TIME_PATTERN, line) {
            self.elapsed_s = self.elapsed_s.max(elapsed);
        }
        self.completion()
    }

    pub fn completion(&self) -> Option<f64> {
        self.total_s
            .map(|total| (self.elapsed_s / total).clamp(0.0, 1.0))
    }

    pub fn update(&mut self, line: String) -> ProgressUpdate {
        let completion = self.observe(&line);
        ProgressUpdate { line, completion }
    }
}

fn capture_seconds(pattern: &Regex, line: &str) -> Option<f64> {
    let captures = pattern.captures(line)?;
    let hours: f64 = captures.get(1)?.as_str().parse().ok()?;
    let minutes: f64 = captures.get(2)?.as_str().parse().ok()?;
    let seconds: f64 = captures.get(3)?.as_str().parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
