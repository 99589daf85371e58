//! Plain-text exchange with external programs.
//!
//! [`render`] copies a template replacing placeholder tokens (`@E`, `@F`, …)
//! with decimal values. [`extract`] scans program output for labels and reads
//! the number that follows each one (`Z=3.14`, `Z : 3.14`, `Z 3.14`).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::point::Point;

/// Placeholder label to value.
pub type TokenMap = BTreeMap<String, f64>;

/// Template could not be rendered.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("cannot read template {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write rendered input {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("token {label} has non-finite value {value}")]
    NonFinite { label: String, value: f64 },
}

/// Expected value could not be read back from program output.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("cannot read output {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("label {label:?} not found in {origin}")]
    MissingLabel { label: String, origin: String },

    #[error("label {label:?} in {origin} is followed by {found:?}, not a number")]
    NotANumber {
        label: String,
        origin: String,
        found: String,
    },

    #[error("no numeric result in {origin}")]
    NoValue { origin: String },

    #[error("malformed structured output in {origin}: {reason}")]
    Malformed { origin: String, reason: String },
}

/// Either side of a text exchange.
#[derive(Debug, thiserror::Error)]
pub enum TextIoError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

fn number_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(?:(?:\d+\.?\d*|\.\d+)(?:[eEdD][+-]?\d+)?|(?i:nan|inf(?:inity)?)\b)").ok()
    })
    .as_ref()
}

fn parse_literal(literal: &str) -> Option<f64> {
    literal.replace(['d', 'D'], "e").parse().ok()
}

/// Parse the numeric literal at the start of `text`, if any.
///
/// Fortran `D` exponents are accepted.
pub fn leading_number(text: &str) -> Option<f64> {
    let m = number_regex()?.find(text)?;
    parse_literal(m.as_str())
}

/// Parse `token` only if the whole of it is one numeric literal.
fn whole_number(token: &str) -> Option<f64> {
    let m = number_regex()?.find(token)?;
    if m.end() != token.len() {
        return None;
    }
    parse_literal(m.as_str())
}

/// Locale-independent decimal rendering of `value`.
pub fn format_value(value: f64) -> String {
    format!("{value}")
}

/// Substitute every token of `tokens` into `template`.
///
/// Longer labels are substituted first so that `@E` never rewrites part of
/// `@EE`.
pub fn render_str(template: &str, tokens: &TokenMap) -> Result<String, TemplateError> {
    let mut labels: Vec<(&String, &f64)> = tokens.iter().collect();
    labels.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut rendered = template.to_string();
    for (label, value) in labels {
        if !value.is_finite() {
            return Err(TemplateError::NonFinite {
                label: label.clone(),
                value: *value,
            });
        }
        if label.is_empty() {
            continue;
        }
        rendered = rendered.replace(label.as_str(), &format_value(*value));
    }
    Ok(rendered)
}

/// Copy `template_path` to `output_path`, substituting tokens.
pub fn render(template_path: &Path, output_path: &Path, tokens: &TokenMap) -> Result<(), TemplateError> {
    let template =
        std::fs::read_to_string(template_path).map_err(|source| TemplateError::Unreadable {
            path: template_path.display().to_string(),
            source,
        })?;
    let rendered = render_str(&template, tokens)?;
    std::fs::write(output_path, rendered).map_err(|source| TemplateError::Write {
        path: output_path.display().to_string(),
        source,
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// First occurrence of `label` that is not part of a longer word, so `Y`
/// skips the `Y` of `Y2=5`.
fn find_label(text: &str, label: &str) -> Option<usize> {
    let starts_word = label.chars().next().is_some_and(is_word_char);
    let ends_word = label.chars().next_back().is_some_and(is_word_char);
    text.match_indices(label).map(|(at, _)| at).find(|&at| {
        let before = text[..at].chars().next_back();
        let after = text[at + label.len()..].chars().next();
        !(starts_word && before.is_some_and(is_word_char))
            && !(ends_word && after.is_some_and(is_word_char))
    })
}

/// Read one value per label from `text`, in label order.
///
/// A label matches only as a whole word. `origin` names the text in error
/// messages.
pub fn extract_str(text: &str, labels: &[String], origin: &str) -> Result<Point, ExtractionError> {
    let mut values = Vec::with_capacity(labels.len());
    for label in labels {
        let at = find_label(text, label)
            .ok_or_else(|| ExtractionError::MissingLabel {
                label: label.clone(),
                origin: origin.to_string(),
            })?;
        let rest = text[at + label.len()..]
            .trim_start_matches(|c: char| c.is_whitespace() || c == '=' || c == ':');
        let value = leading_number(rest).ok_or_else(|| ExtractionError::NotANumber {
            label: label.clone(),
            origin: origin.to_string(),
            found: rest.lines().next().unwrap_or("").chars().take(32).collect(),
        })?;
        values.push(value);
    }
    Ok(Point::new(values))
}

/// Read one value per label from the file at `output_path`.
pub fn extract(output_path: &Path, labels: &[String]) -> Result<Point, ExtractionError> {
    let origin = output_path.display().to_string();
    let text = std::fs::read_to_string(output_path).map_err(|source| {
        ExtractionError::Unreadable {
            path: origin.clone(),
            source,
        }
    })?;
    extract_str(&text, labels, &origin)
}

/// Parse the result a program printed on standard output.
///
/// The last non-empty line holds the result; its values may be separated by
/// whitespace, commas or semicolons.
pub fn parse_stdout(stdout: &str) -> Result<Point, ExtractionError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| ExtractionError::NoValue {
            origin: "stdout".to_string(),
        })?;

    line.split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|t| !t.is_empty())
        .map(|token| {
            whole_number(token).ok_or_else(|| ExtractionError::NotANumber {
                label: "<stdout>".to_string(),
                origin: "stdout".to_string(),
                found: token.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Point::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(pairs: &[(&str, f64)]) -> TokenMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_value_has_no_exponent_or_grouping() {
        assert_eq!(format_value(210.0e9), "210000000000");
        assert_eq!(format_value(2e-6), "0.000002");
        assert_eq!(format_value(-1.5), "-1.5");
    }

    #[test]
    fn test_render_replaces_every_occurrence() {
        let out = render_str("a=@A b=@A c=@B", &tokens(&[("@A", 1.0), ("@B", 2.5)])).unwrap();
        assert_eq!(out, "a=1 b=1 c=2.5");
    }

    #[test]
    fn test_render_prefers_longer_labels() {
        let out = render_str("@E @EE", &tokens(&[("@E", 1.0), ("@EE", 2.0)])).unwrap();
        assert_eq!(out, "1 2");
    }

    #[test]
    fn test_render_rejects_nan() {
        let err = render_str("@X", &tokens(&[("@X", f64::NAN)])).unwrap_err();
        assert!(matches!(err, TemplateError::NonFinite { .. }));
    }

    #[test]
    fn test_render_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let err = render(
            &dir.path().join("absent.tpl"),
            &dir.path().join("out.txt"),
            &TokenMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::Unreadable { .. }));
    }

    #[test]
    fn test_extract_with_and_without_operators() {
        let text = "Z=3.14\nY : -2.5e3\nW 7\nV=1.5D+02";
        let p = extract_str(text, &labels(&["Z", "Y", "W", "V"]), "out").unwrap();
        assert_eq!(p, Point::from([3.14, -2500.0, 7.0, 150.0]));
    }

    #[test]
    fn test_extract_uses_first_occurrence() {
        let p = extract_str("R=1\nR=2\n", &labels(&["R"]), "out").unwrap();
        assert_eq!(p, Point::from([1.0]));
    }

    #[test]
    fn test_extract_missing_label_is_named() {
        let err = extract_str("A=1", &labels(&["A", "B"]), "result.out").unwrap_err();
        match err {
            ExtractionError::MissingLabel { label, origin } => {
                assert_eq!(label, "B");
                assert_eq!(origin, "result.out");
            }
            other => panic!("expected MissingLabel, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_not_a_number() {
        let err = extract_str("A=abc", &labels(&["A"]), "out").unwrap_err();
        assert!(matches!(err, ExtractionError::NotANumber { .. }));
    }

    #[test]
    fn test_extract_rejects_words_starting_like_nan_or_inf() {
        for text in ["Z=information\n", "Z=nanometers\n", "Z = Infinityx\n"] {
            let err = extract_str(text, &labels(&["Z"]), "out").unwrap_err();
            assert!(matches!(err, ExtractionError::NotANumber { .. }), "{text:?}: {err}");
        }

        let p = extract_str("Z=inf\nW=-Infinity;\nV=NaN\n", &labels(&["Z", "W", "V"]), "out")
            .unwrap();
        assert_eq!(p[0], f64::INFINITY);
        assert_eq!(p[1], f64::NEG_INFINITY);
        assert!(p[2].is_nan());
    }

    #[test]
    fn test_extract_matches_whole_labels_only() {
        let p = extract_str("Y2=5\nXY=9\nY=3\n", &labels(&["Y", "Y2"]), "out").unwrap();
        assert_eq!(p, Point::from([3.0, 5.0]));

        let err = extract_str("Y2=5\n", &labels(&["Y"]), "out").unwrap_err();
        assert!(matches!(err, ExtractionError::MissingLabel { .. }));
    }

    #[test]
    fn test_render_then_extract_echoes_values() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = dir.path().join("in.tpl");
        let out = dir.path().join("in.txt");
        std::fs::write(&tpl, "E=@E\nF=@F\n").unwrap();

        render(&tpl, &out, &tokens(&[("@E", 210.0e9), ("@F", 1000.0)])).unwrap();
        let p = extract(&out, &labels(&["E=", "F="])).unwrap();
        assert!(p.approx_eq(&Point::from([210.0e9, 1000.0]), 1e-12));
    }

    #[test]
    fn test_parse_stdout_last_line() {
        let p = parse_stdout("progress 10%\n-0.0026785714285714286\n\n").unwrap();
        assert_eq!(p.dimension(), 1);
        assert!((p[0] + 0.0026785714285714286).abs() < 1e-18);

        let p = parse_stdout("1, 2;3 4\n").unwrap();
        assert_eq!(p, Point::from([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_parse_stdout_errors() {
        assert!(matches!(
            parse_stdout("  \n"),
            Err(ExtractionError::NoValue { .. })
        ));
        assert!(matches!(
            parse_stdout("result: 3\n"),
            Err(ExtractionError::NotANumber { .. })
        ));
        assert!(matches!(
            parse_stdout("3abc\n"),
            Err(ExtractionError::NotANumber { .. })
        ));
    }
}
