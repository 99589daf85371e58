//! Coupling strategies: how a point reaches the program and how its result
//! comes back.
//!
//! - [`TemplateCoupling`] renders `@NAME` tokens into a template and reads the
//!   result from stdout or from `LABEL=value` lines of an output file.
//! - [`JsonCoupling`] writes `{"x": [...]}` and reads a JSON array back.
//!
//! [`CouplingSpec`] is the serialisable union used by job descriptors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::point::Point;
use crate::textio::{self, ExtractionError, TemplateError, TokenMap};

/// Writes a point into a workspace and reads the program's answer back.
pub trait Coupling: Send + Sync {
    /// Write the program input for `point` inside `workdir`; returns the
    /// path passed to the program as its argument.
    fn write_input(&self, point: &Point, workdir: &Path) -> Result<PathBuf, TemplateError>;

    /// Read the program's result after it exited successfully.
    fn read_output(&self, workdir: &Path, stdout: &str) -> Result<Point, ExtractionError>;
}

/// Where the program leaves its result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum OutputChannel {
    /// Last non-empty stdout line.
    Stdout,
    /// A file inside the workspace containing `LABEL=value` lines.
    File { path: PathBuf, labels: Vec<String> },
}

/// Token-template coupling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateCoupling {
    /// Template file containing the input tokens.
    pub template: PathBuf,
    /// File name of the rendered input inside the workspace.
    #[serde(default = "default_template_input")]
    pub input_file: String,
    /// Token for each input coordinate, position-matched.
    pub input_tokens: Vec<String>,
    pub output: OutputChannel,
}

fn default_template_input() -> String {
    "input.txt".to_string()
}

impl TemplateCoupling {
    /// Map each input token to the coordinate at the same position.
    ///
    /// Coordinates beyond the declared tokens are not substituted.
    pub fn token_map(&self, point: &Point) -> TokenMap {
        self.input_tokens
            .iter()
            .cloned()
            .zip(point.values().iter().copied())
            .collect()
    }
}

impl Coupling for TemplateCoupling {
    fn write_input(&self, point: &Point, workdir: &Path) -> Result<PathBuf, TemplateError> {
        let target = workdir.join(&self.input_file);
        textio::render(&self.template, &target, &self.token_map(point))?;
        Ok(target)
    }

    fn read_output(&self, workdir: &Path, stdout: &str) -> Result<Point, ExtractionError> {
        match &self.output {
            OutputChannel::Stdout => textio::parse_stdout(stdout),
            OutputChannel::File { path, labels } => textio::extract(&workdir.join(path), labels),
        }
    }
}

/// Structured JSON coupling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonCoupling {
    #[serde(default = "default_json_input")]
    pub input_file: String,
    /// Output file inside the workspace; `None` reads stdout.
    #[serde(default)]
    pub output_file: Option<PathBuf>,
}

fn default_json_input() -> String {
    "input.json".to_string()
}

impl Default for JsonCoupling {
    fn default() -> Self {
        Self {
            input_file: default_json_input(),
            output_file: None,
        }
    }
}

impl Coupling for JsonCoupling {
    fn write_input(&self, point: &Point, workdir: &Path) -> Result<PathBuf, TemplateError> {
        let target = workdir.join(&self.input_file);
        if let Some(bad) = point.values().iter().find(|v| !v.is_finite()) {
            return Err(TemplateError::NonFinite {
                label: "x".to_string(),
                value: *bad,
            });
        }
        let body = serde_json::json!({ "x": point });
        std::fs::write(&target, body.to_string()).map_err(|source| TemplateError::Write {
            path: target.display().to_string(),
            source,
        })?;
        Ok(target)
    }

    fn read_output(&self, workdir: &Path, stdout: &str) -> Result<Point, ExtractionError> {
        let (origin, text) = match &self.output_file {
            None => ("stdout".to_string(), stdout.to_string()),
            Some(rel) => {
                let path = workdir.join(rel);
                let origin = path.display().to_string();
                let text = std::fs::read_to_string(&path).map_err(|source| {
                    ExtractionError::Unreadable {
                        path: origin.clone(),
                        source,
                    }
                })?;
                (origin, text)
            }
        };
        if text.trim().is_empty() {
            return Err(ExtractionError::NoValue { origin });
        }
        serde_json::from_str::<Point>(text.trim()).map_err(|e| ExtractionError::Malformed {
            origin,
            reason: e.to_string(),
        })
    }
}

/// Coupling selected by a job descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouplingSpec {
    Template(TemplateCoupling),
    Json(JsonCoupling),
}

impl CouplingSpec {
    /// Resolve relative template paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if let CouplingSpec::Template(t) = self {
            if t.template.is_relative() {
                t.template = base.join(&t.template);
            }
        }
    }

    /// Number of input coordinates the coupling substitutes, if fixed.
    pub fn declared_inputs(&self) -> Option<usize> {
        match self {
            CouplingSpec::Template(t) => Some(t.input_tokens.len()),
            CouplingSpec::Json(_) => None,
        }
    }
}

impl Coupling for CouplingSpec {
    fn write_input(&self, point: &Point, workdir: &Path) -> Result<PathBuf, TemplateError> {
        match self {
            CouplingSpec::Template(c) => c.write_input(point, workdir),
            CouplingSpec::Json(c) => c.write_input(point, workdir),
        }
    }

    fn read_output(&self, workdir: &Path, stdout: &str) -> Result<Point, ExtractionError> {
        match self {
            CouplingSpec::Template(c) => c.read_output(workdir, stdout),
            CouplingSpec::Json(c) => c.read_output(workdir, stdout),
        }
    }
}
