//! Parser for workload-generator progress lines.
//!
//! The generator reports once per interval in the form
//!
//! ```text
//! progress: 10.0 s, 30234.5 tps, lat 4.123 ms stddev 1.456, 0 failed
//! ```
//!
//! Trailing fields (`failed`, `lag`, ...) are ignored. Parsing is a pure
//! function of the line so it can be tested without a live subprocess.

use std::fmt;

use crate::error::{BenchError, BenchResult};

const MARKER: &str = "progress:";

/// Numeric fields extracted from one progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressLine {
    /// Elapsed seconds as reported by the generator itself.
    pub elapsed_seconds: f64,
    pub tps: f64,
    pub latency_avg_ms: f64,
    pub latency_stddev_ms: f64,
}

impl ProgressLine {
    /// Parses a single progress line.
    ///
    /// Returns [`BenchError::Parse`] when the marker is missing or any of the
    /// four fields is absent, non-numeric, negative or not finite.
    pub fn parse(line: &str) -> BenchResult<Self> {
        let start = line
            .find(MARKER)
            .ok_or_else(|| BenchError::parse(line, "missing `progress:` marker"))?;
        let tokens: Vec<&str> = line[start + MARKER.len()..]
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect();

        let elapsed_seconds = match tokens.as_slice() {
            [value, "s", ..] => number(line, "elapsed", value)?,
            _ => return Err(BenchError::parse(line, "missing elapsed seconds")),
        };
        let tps = preceding(&tokens, "tps")
            .ok_or_else(|| BenchError::parse(line, "missing tps"))
            .and_then(|value| number(line, "tps", value))?;
        let latency_avg_ms = following(&tokens, "lat")
            .ok_or_else(|| BenchError::parse(line, "missing latency"))
            .and_then(|value| number(line, "latency", value))?;
        let latency_stddev_ms = following(&tokens, "stddev")
            .ok_or_else(|| BenchError::parse(line, "missing stddev"))
            .and_then(|value| number(line, "stddev", value))?;

        Ok(Self {
            elapsed_seconds,
            tps,
            latency_avg_ms,
            latency_stddev_ms,
        })
    }
}

impl fmt::Display for ProgressLine {
    /// Formats the line the way the generator prints it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "progress: {:.1} s, {:.1} tps, lat {:.3} ms stddev {:.3}",
            self.elapsed_seconds, self.tps, self.latency_avg_ms, self.latency_stddev_ms
        )
    }
}

fn preceding<'a>(tokens: &[&'a str], label: &str) -> Option<&'a str> {
    let idx = tokens.iter().position(|token| *token == label)?;
    idx.checked_sub(1).map(|prev| tokens[prev])
}

fn following<'a>(tokens: &[&'a str], label: &str) -> Option<&'a str> {
    let idx = tokens.iter().position(|token| *token == label)?;
    tokens.get(idx + 1).copied()
}

fn number(line: &str, field: &str, raw: &str) -> BenchResult<f64> {
    let value: f64 = raw
        .parse()
        .map_err(|_| BenchError::parse(line, format!("{field} `{raw}` is not a number")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(BenchError::parse(
            line,
            format!("{field} `{raw}` is out of range"),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_standard_line() {
        let line = "progress: 10.0 s, 30234.5 tps, lat 4.123 ms stddev 1.456";
        let parsed = ProgressLine::parse(line).unwrap();

        assert_eq!(parsed.elapsed_seconds, 10.0);
        assert_eq!(parsed.tps, 30234.5);
        assert_eq!(parsed.latency_avg_ms, 4.123);
        assert_eq!(parsed.latency_stddev_ms, 1.456);
    }

    #[test]
    fn test_parse_ignores_trailing_fields() {
        let line = "progress: 4.0 s, 812.0 tps, lat 2.460 ms stddev 0.310, 0 failed\n";
        let parsed = ProgressLine::parse(line).unwrap();
        assert_eq!(parsed.tps, 812.0);
        assert_eq!(parsed.latency_stddev_ms, 0.310);

        let lagged = "progress: 6.0 s, 99.5 tps, lat 1.000 ms stddev 0.200, lag 0.010 ms";
        assert_eq!(ProgressLine::parse(lagged).unwrap().elapsed_seconds, 6.0);
    }

    #[test]
    fn test_parse_accepts_prefixed_line() {
        let line = "pgbench: progress: 2.0 s, 10 tps, lat 1 ms stddev 0";
        let parsed = ProgressLine::parse(line).unwrap();
        assert_eq!(parsed.elapsed_seconds, 2.0);
        assert_eq!(parsed.tps, 10.0);
    }

    #[test]
    fn test_parse_rejects_non_progress_output() {
        for line in [
            "",
            "starting vacuum...end.",
            "transaction type: <builtin: select only>",
            "progress:",
        ] {
            assert!(ProgressLine::parse(line).is_err(), "accepted `{line}`");
        }
    }

    #[test]
    fn test_parse_rejects_bad_numbers() {
        let cases = [
            "progress: abc s, 1.0 tps, lat 1.0 ms stddev 1.0",
            "progress: 1.0 s, x tps, lat 1.0 ms stddev 1.0",
            "progress: 1.0 s, 1.0 tps, lat -nan ms stddev 1.0",
            "progress: 1.0 s, 1.0 tps, lat 1.0 ms stddev NaN",
            "progress: 1.0 s, -5 tps, lat 1.0 ms stddev 1.0",
            "progress: 1.0 s, 1.0 tps, lat 1.0 ms",
            "progress: 1.0 s, lat 1.0 ms stddev 1.0",
        ];
        for line in cases {
            let err = ProgressLine::parse(line).unwrap_err();
            assert!(matches!(err, BenchError::Parse { .. }), "{line}: {err}");
        }
    }

    #[test]
    fn test_formatted_line_parses_back() {
        let samples = [
            (1.0, 0.0, 0.0, 0.0),
            (120.0, 30234.5, 4.123, 1.456),
            (3599.0, 7.3, 1234.567, 89.001),
        ];
        for (elapsed, tps, lat, stddev) in samples {
            let line = ProgressLine {
                elapsed_seconds: elapsed,
                tps,
                latency_avg_ms: lat,
                latency_stddev_ms: stddev,
            };
            let parsed = ProgressLine::parse(&line.to_string()).unwrap();
            assert!((parsed.elapsed_seconds - elapsed).abs() < 0.05);
            assert!((parsed.tps - tps).abs() < 0.05);
            assert!((parsed.latency_avg_ms - lat).abs() < 0.0005);
            assert!((parsed.latency_stddev_ms - stddev).abs() < 0.0005);
        }
    }
}
