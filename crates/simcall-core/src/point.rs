//! Points and samples: the numeric vectors exchanged with an evaluator.
//!
//! A sample file is either a JSON array of arrays (`.json`) or a text table
//! with one point per line. Text tables accept whitespace, commas or
//! semicolons as separators; `#` starts a comment.

use std::ops::Index;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One fixed-dimension numeric vector.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Point(Vec<f64>);

impl Point {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    /// A point holding `value` repeated `count` times.
    pub fn repeated(value: f64, count: usize) -> Self {
        Self(vec![value; count])
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn get(&self, i: usize) -> Option<f64> {
        self.0.get(i).copied()
    }

    /// Element-wise comparison with a relative tolerance.
    pub fn approx_eq(&self, other: &Point, rel_tol: f64) -> bool {
        self.dimension() == other.dimension()
            && self.0.iter().zip(&other.0).all(|(a, b)| {
                let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
                (a - b).abs() <= rel_tol * scale
            })
    }
}

impl From<Vec<f64>> for Point {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl<const N: usize> From<[f64; N]> for Point {
    fn from(values: [f64; N]) -> Self {
        Self(values.to_vec())
    }
}

impl Index<usize> for Point {
    type Output = f64;

    fn index(&self, i: usize) -> &f64 {
        &self.0[i]
    }
}

/// Ordered batch of points.
pub type Sample = Vec<Point>;

/// Errors produced while reading a sample file.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("cannot read sample file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON sample in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}:{line}: cannot parse {token:?} as a number")]
    Parse {
        path: String,
        line: usize,
        token: String,
    },
}

/// Load a sample from `path`, choosing the format from the extension.
pub fn load_sample(path: &Path) -> Result<Sample, SampleError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| SampleError::Io {
        path: display.clone(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&text).map_err(|source| SampleError::Json {
            path: display,
            source,
        })
    } else {
        parse_table(&text, &display)
    }
}

fn parse_table(text: &str, path: &str) -> Result<Sample, SampleError> {
    let mut sample = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let values = line
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<f64>().map_err(|_| SampleError::Parse {
                    path: path.to_string(),
                    line: lineno + 1,
                    token: t.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        sample.push(Point::new(values));
    }
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_serializes_as_plain_array() {
        let p = Point::from([1.0, 2.5]);
        assert_eq!(serde_json::to_string(&p).unwrap(), "[1.0,2.5]");
    }

    #[test]
    fn test_approx_eq_uses_relative_tolerance() {
        let a = Point::from([210e9, -1e-3]);
        let b = Point::from([210e9 * (1.0 + 1e-9), -1e-3 * (1.0 - 1e-9)]);
        assert!(a.approx_eq(&b, 1e-6));
        assert!(!a.approx_eq(&Point::from([210e9]), 1e-6));
    }

    #[test]
    fn test_parse_table_mixed_separators() {
        let text = "# E F\n1.0 2.0\n\n3.0,4.0 # trailing\n5;6\n";
        let sample = parse_table(text, "inline").unwrap();
        assert_eq!(sample.len(), 3);
        assert_eq!(sample[1], Point::from([3.0, 4.0]));
        assert_eq!(sample[2], Point::from([5.0, 6.0]));
    }

    #[test]
    fn test_parse_table_reports_line() {
        let err = parse_table("1 2\n3 x\n", "s.txt").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("s.txt:2"), "{msg}");
        assert!(msg.contains("\"x\""), "{msg}");
    }

    #[test]
    fn test_load_json_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, "[[1, 2], [3.5, 4]]").unwrap();
        let sample = load_sample(&path).unwrap();
        assert_eq!(sample, vec![Point::from([1.0, 2.0]), Point::from([3.5, 4.0])]);
    }
}
