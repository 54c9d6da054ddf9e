//! Progress parsing
//!
//! Job runners hand a [`ProgressParser`] to the container runner, which
//! feeds it every output line. A parser that returns an error is switched
//! off for the rest of the command.

use anyhow::Result;
use serde_json::{Map, Value};

/// Progress derived from one line of output
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Fraction complete, between 0 and 1
    pub fraction: f64,
    pub metadata: Map<String, Value>,
}

impl Progress {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction,
            metadata: Map::new(),
        }
    }
}

pub trait ProgressParser: Send + Sync {
    /// Parses one output line
    ///
    /// # Arguments
    /// * `line` - The output line, without trailing newline
    /// * `last` - The last fraction reported for this command
    fn parse(&self, line: &str, last: f64) -> Result<Progress>;
}

impl<F> ProgressParser for F
where
    F: Fn(&str, f64) -> Result<Progress> + Send + Sync,
{
    fn parse(&self, line: &str, last: f64) -> Result<Progress> {
        self(line, last)
    }
}

/// Picks up the last `NN%` token on a line
///
/// Lines without a finite percentage keep the last fraction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentProgressParser;

impl ProgressParser for PercentProgressParser {
    fn parse(&self, line: &str, last: f64) -> Result<Progress> {
        let percent = line
            .split_whitespace()
            .filter_map(|token| token.trim_end_matches([',', ';', ')', ']']).strip_suffix('%'))
            .filter_map(|number| number.trim_start_matches(['(', '[']).parse::<f64>().ok())
            .filter(|percent| percent.is_finite())
            .last();

        Ok(match percent {
            Some(percent) => Progress::new((percent / 100.0).clamp(0.0, 1.0)),
            None => Progress::new(last),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_parser() {
        let parser = PercentProgressParser;
        assert_eq!(parser.parse("epoch 3: 45% done", 0.0).unwrap().fraction, 0.45);
        assert_eq!(parser.parse("loading (12.5%)", 0.0).unwrap().fraction, 0.125);
        assert_eq!(parser.parse("10% then 20%", 0.0).unwrap().fraction, 0.2);
        assert_eq!(parser.parse("no progress here", 0.3).unwrap().fraction, 0.3);
        assert_eq!(parser.parse("150%", 0.0).unwrap().fraction, 1.0);
    }

    #[test]
    fn test_percent_parser_ignores_non_finite() {
        let parser = PercentProgressParser;
        assert_eq!(parser.parse("loss nan%", 0.4).unwrap().fraction, 0.4);
        assert_eq!(parser.parse("inf% -inf% NaN%", 0.4).unwrap().fraction, 0.4);
        assert_eq!(parser.parse("30% nan%", 0.0).unwrap().fraction, 0.3);
    }

    #[test]
    fn test_closure_parser() {
        let parser = |line: &str, _last: f64| -> Result<Progress> {
            let mut progress = Progress::new(line.len() as f64 / 10.0);
            progress.metadata.insert("line".into(), Value::from(line));
            Ok(progress)
        };
        let progress = parser.parse("abcde", 0.0).unwrap();
        assert_eq!(progress.fraction, 0.5);
        assert_eq!(progress.metadata["line"], "abcde");
    }
}
