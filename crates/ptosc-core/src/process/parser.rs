//! Incremental parsing of the tool's streamed output.
//!
//! Output arrives in arbitrary chunks. [`LineSplitter`] reassembles lines,
//! treating `\r`, `\n` and `\r\n` as terminators so that progress updates
//! which overwrite one terminal line each count as a line. [`OutputParser`]
//! then scans every complete line for progress and statistics tokens.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::options::{ProgressCallback, StatisticsCallback};

/// Label to value pairs reported by `--statistics`.
pub type Statistics = BTreeMap<String, f64>;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,3}(?:\.\d+)?)%(?:\s+(\d+(?:[+:]\d+)*)\s+remain)?")
        .expect("valid progress regex")
});

static STATISTIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s+(.+?)\s+(-?\d+(?:\.\d+)?)\s*$").expect("valid statistics regex")
});

/// A parsed progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: f64,
    /// Remaining time as printed, e.g. `01:23` or `1+02:03:04`.
    pub remaining: Option<String>,
}

/// Parse a progress token such as `45% 01:23 remain`.
pub fn parse_progress(line: &str) -> Option<Progress> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent = caps.get(1)?.as_str().parse().ok()?;
    Some(Progress {
        percent,
        remaining: caps.get(2).map(|m| m.as_str().to_string()),
    })
}

/// Parse a statistics line such as `# INSERT 1024`.
pub fn parse_statistic(line: &str) -> Option<(String, f64)> {
    let caps = STATISTIC_RE.captures(line.trim_end())?;
    let value = caps.get(2)?.as_str().parse().ok()?;
    Some((caps.get(1)?.as_str().to_string(), value))
}

/// Reassembles complete lines from a byte stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes. Empty lines are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).into_owned());
                    self.partial.clear();
                }
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Return the trailing unterminated line, if any, at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial.clear();
        Some(line)
    }
}

/// Scans complete lines, fires callbacks and accumulates statistics.
#[derive(Default)]
pub struct OutputParser {
    statistics: Statistics,
    on_progress: Option<ProgressCallback>,
    on_statistics: Option<StatisticsCallback>,
}

impl OutputParser {
    pub fn new(on_progress: Option<ProgressCallback>, on_statistics: Option<StatisticsCallback>) -> Self {
        Self {
            statistics: Statistics::new(),
            on_progress,
            on_statistics,
        }
    }

    /// Scan one complete line.
    pub fn handle_line(&mut self, line: &str) {
        if let Some(progress) = parse_progress(line) {
            if let Some(cb) = &self.on_progress {
                cb(progress.percent, progress.remaining.as_deref());
            }
        }
        if let Some((label, value)) = parse_statistic(line) {
            self.statistics.insert(label, value);
            if let Some(cb) = &self.on_statistics {
                cb(&self.statistics);
            }
        }
    }

    /// Statistics collected so far.
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn into_statistics(self) -> Statistics {
        self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_parse_progress_forms() {
        assert_eq!(
            parse_progress("Copying `app`.`users`:  45% 01:23 remain"),
            Some(Progress {
                percent: 45.0,
                remaining: Some("01:23".to_string())
            })
        );
        assert_eq!(
            parse_progress("Copying rows:  99.5% 1+02:03:04 remain"),
            Some(Progress {
                percent: 99.5,
                remaining: Some("1+02:03:04".to_string())
            })
        );
        assert_eq!(
            parse_progress("Progress 12%"),
            Some(Progress {
                percent: 12.0,
                remaining: None
            })
        );
        assert_eq!(parse_progress("No progress here"), None);
    }

    #[test]
    fn test_parse_statistics_lines() {
        assert_eq!(parse_statistic("# INSERT 1024"), Some(("INSERT".to_string(), 1024.0)));
        assert_eq!(
            parse_statistic("#  copy_rows retries   2.5  "),
            Some(("copy_rows retries".to_string(), 2.5))
        );
        assert_eq!(parse_statistic("# Event  Count"), None);
        assert_eq!(parse_statistic("# ====== ====="), None);
        assert_eq!(parse_statistic("INSERT 1024"), None);
    }

    #[test]
    fn test_splitter_handles_split_chunks_and_carriage_returns() {
        let mut s = LineSplitter::new();
        assert!(s.push(b"Copying: 1").is_empty());
        assert_eq!(s.push(b"0% 00:09 remain\rCopying: 20%"), vec!["Copying: 10% 00:09 remain"]);
        assert_eq!(s.push(b" 00:08 remain\r\n\r\ndone"), vec!["Copying: 20% 00:08 remain"]);
        assert_eq!(s.finish(), Some("done".to_string()));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_crlf_split_across_chunks_yields_one_line() {
        let mut s = LineSplitter::new();
        assert_eq!(s.push(b"a\r"), vec!["a"]);
        assert!(s.push(b"\nb").is_empty());
        assert_eq!(s.finish(), Some("b".to_string()));
    }

    #[test]
    fn test_parser_fires_callbacks_and_overwrites_labels() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let snapshots = Arc::new(Mutex::new(0usize));
        let seen_cb = Arc::clone(&seen);
        let snap_cb = Arc::clone(&snapshots);
        let mut parser = OutputParser::new(
            Some(Arc::new(move |pct, rem: Option<&str>| {
                seen_cb.lock().push((pct, rem.map(str::to_string)));
            })),
            Some(Arc::new(move |_stats: &Statistics| {
                *snap_cb.lock() += 1;
            })),
        );

        parser.handle_line("Copying: 50% 00:10 remain");
        parser.handle_line("# INSERT 10");
        assert_eq!(parser.statistics().get("INSERT"), Some(&10.0));
        parser.handle_line("# INSERT 20");
        parser.handle_line("# mysql_warnings 0");

        assert_eq!(*seen.lock(), vec![(50.0, Some("00:10".to_string()))]);
        assert_eq!(*snapshots.lock(), 3);
        let stats = parser.into_statistics();
        assert_eq!(stats.get("INSERT"), Some(&20.0));
        assert_eq!(stats.len(), 2);
    }
}
