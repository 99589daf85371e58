//! Point evaluators.
//!
//! The dispatcher only sees the [`Evaluator`] trait. Two implementations:
//!
//! - [`ExternalProcessEvaluator`]: one workspace and one program run per
//!   point, coupled through files (see [`crate::coupling`]).
//! - [`InProcessEvaluator`]: a Rust closure run on the blocking pool.
//!
//! An evaluation is all-or-nothing: it returns a complete point or an
//! [`EvaluationError`] carrying the point index and both captured streams.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::coupling::Coupling;
use crate::point::Point;
use crate::process::{ProcessError, ProcessRunner, Program};
use crate::textio::TextIoError;
use crate::workspace::{Workspace, WorkspaceError, WorkspaceManager};

/// Why a point failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationErrorKind {
    Template,
    Extraction,
    Launch,
    NonZeroExit { code: i32 },
    Timeout,
    Workspace,
    Dimension,
    InProcess,
    Panicked,
    Cancelled,
}

impl fmt::Display for EvaluationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template => f.write_str("template"),
            Self::Extraction => f.write_str("extraction"),
            Self::Launch => f.write_str("launch"),
            Self::NonZeroExit { code } => write!(f, "exit code {code}"),
            Self::Timeout => f.write_str("timeout"),
            Self::Workspace => f.write_str("workspace"),
            Self::Dimension => f.write_str("dimension"),
            Self::InProcess => f.write_str("in-process"),
            Self::Panicked => f.write_str("panicked"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Failure of one point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("point {index} failed ({kind}): {message}")]
pub struct EvaluationError {
    pub index: usize,
    pub kind: EvaluationErrorKind,
    pub message: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl EvaluationError {
    pub fn new(index: usize, kind: EvaluationErrorKind, message: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_streams(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn cancelled(index: usize, reason: &str) -> Self {
        Self::new(index, EvaluationErrorKind::Cancelled, reason)
    }

    fn text_io(index: usize, e: impl Into<TextIoError>) -> Self {
        let e = e.into();
        let kind = match e {
            TextIoError::Template(_) => EvaluationErrorKind::Template,
            TextIoError::Extraction(_) => EvaluationErrorKind::Extraction,
        };
        Self::new(index, kind, e.to_string())
    }

    fn workspace(index: usize, e: WorkspaceError) -> Self {
        Self::new(index, EvaluationErrorKind::Workspace, e.to_string())
    }

    fn process(index: usize, e: ProcessError) -> Self {
        let message = e.to_string();
        match e {
            ProcessError::Timeout { stdout, stderr, .. } => {
                Self::new(index, EvaluationErrorKind::Timeout, message).with_streams(stdout, stderr)
            }
            _ => Self::new(index, EvaluationErrorKind::Launch, message),
        }
    }
}

/// Result type for one evaluation.
pub type EvalResult<T> = std::result::Result<T, EvaluationError>;

/// Anything that maps an input point to an output point.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Declared input dimension.
    fn input_dimension(&self) -> usize;

    /// Declared output dimension; `None` when it varies per point.
    fn output_dimension(&self) -> Option<usize>;

    /// Evaluate the point at sample position `index`.
    async fn evaluate(&self, index: usize, point: &Point) -> EvalResult<Point>;
}

/// Upper bound on a replication count when no output dimension is declared.
pub const MAX_REPLICATION: usize = 1 << 20;

/// How a scalar program result is widened into an output point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Replication {
    /// Use the result as produced.
    #[default]
    None,
    /// Repeat a scalar result `count` times.
    Fixed { count: usize },
    /// Repeat a scalar result as many times as the input coordinate at
    /// `position` says. Compatibility mode for drivers that encode the
    /// output count inside the input vector.
    FromInput { position: usize },
}

impl Replication {
    /// Replication count for `point`, at most `limit`.
    fn count_for(&self, index: usize, point: &Point, limit: usize) -> EvalResult<usize> {
        let count = match *self {
            Replication::None => return Ok(1),
            Replication::Fixed { count } => count.max(1),
            Replication::FromInput { position } => {
                let raw = point.get(position).ok_or_else(|| {
                    EvaluationError::new(
                        index,
                        EvaluationErrorKind::Dimension,
                        format!("replication count position {position} is outside the input point"),
                    )
                })?;
                if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 {
                    return Err(EvaluationError::new(
                        index,
                        EvaluationErrorKind::Dimension,
                        format!("replication count {raw} is not a non-negative integer"),
                    ));
                }
                if raw > limit as f64 {
                    return Err(EvaluationError::new(
                        index,
                        EvaluationErrorKind::Dimension,
                        format!("replication count {raw} exceeds the limit of {limit}"),
                    ));
                }
                (raw as usize).max(1)
            }
        };
        if count > limit {
            return Err(EvaluationError::new(
                index,
                EvaluationErrorKind::Dimension,
                format!("replication count {count} exceeds the limit of {limit}"),
            ));
        }
        Ok(count)
    }

    /// Apply the replication policy to a raw program result.
    ///
    /// The count is bounded by the declared output dimension, or by
    /// [`MAX_REPLICATION`] when there is none.
    fn apply(
        &self,
        index: usize,
        input: &Point,
        raw: Point,
        output_dimension: Option<usize>,
    ) -> EvalResult<Point> {
        let limit = output_dimension.unwrap_or(MAX_REPLICATION).max(1);
        let count = self.count_for(index, input, limit)?;
        if count <= 1 {
            return Ok(raw);
        }
        match raw.values() {
            [value] => Ok(Point::repeated(*value, count)),
            other => Err(EvaluationError::new(
                index,
                EvaluationErrorKind::Dimension,
                format!(
                    "cannot replicate a result of dimension {} into {count} values",
                    other.len()
                ),
            )),
        }
    }
}

fn check_input(index: usize, point: &Point, expected: usize) -> EvalResult<()> {
    if point.dimension() != expected {
        return Err(EvaluationError::new(
            index,
            EvaluationErrorKind::Dimension,
            format!(
                "input has dimension {}, expected {expected}",
                point.dimension()
            ),
        ));
    }
    Ok(())
}

fn check_output(index: usize, point: &Point, expected: Option<usize>) -> EvalResult<()> {
    match expected {
        Some(n) if point.dimension() != n => Err(EvaluationError::new(
            index,
            EvaluationErrorKind::Dimension,
            format!("output has dimension {}, expected {n}", point.dimension()),
        )),
        _ => Ok(()),
    }
}

/// Evaluates points by running an external program in a fresh workspace.
pub struct ExternalProcessEvaluator {
    program: Program,
    coupling: Arc<dyn Coupling>,
    workspace_base: PathBuf,
    support_files: Vec<PathBuf>,
    input_dimension: usize,
    output_dimension: Option<usize>,
    replication: Replication,
    timeout: Option<Duration>,
    retain_workspaces: bool,
}

impl ExternalProcessEvaluator {
    pub fn new(
        program: Program,
        coupling: Arc<dyn Coupling>,
        workspace_base: impl Into<PathBuf>,
        input_dimension: usize,
        output_dimension: Option<usize>,
    ) -> Self {
        Self {
            program,
            coupling,
            workspace_base: workspace_base.into(),
            support_files: Vec::new(),
            input_dimension,
            output_dimension,
            replication: Replication::None,
            timeout: None,
            retain_workspaces: false,
        }
    }

    /// Files copied into every workspace before the program runs.
    pub fn with_support_files(mut self, files: Vec<PathBuf>) -> Self {
        self.support_files = files;
        self
    }

    pub fn with_replication(mut self, replication: Replication) -> Self {
        if let Replication::FromInput { position } = replication {
            warn!(
                position,
                "output replication count is read from the input point; results depend on that coordinate"
            );
        }
        self.replication = replication;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retain_workspaces(mut self, retain: bool) -> Self {
        self.retain_workspaces = retain;
        self
    }

    /// Take timeout and retention from a dispatch configuration.
    pub fn with_dispatch_config(self, config: &DispatchConfig) -> Self {
        self.with_timeout(config.per_point_timeout())
            .retain_workspaces(config.retain_workspaces)
    }

    pub fn workspace_base(&self) -> &Path {
        &self.workspace_base
    }

    fn workspace_name(index: usize) -> String {
        let tag = Uuid::new_v4().simple().to_string();
        format!("point-{index:06}-{}", &tag[..8])
    }
}

#[async_trait]
impl Evaluator for ExternalProcessEvaluator {
    fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    fn output_dimension(&self) -> Option<usize> {
        self.output_dimension
    }

    async fn evaluate(&self, index: usize, point: &Point) -> EvalResult<Point> {
        check_input(index, point, self.input_dimension)?;

        let mut ws = WorkspaceManager::acquire(&self.workspace_base, &Self::workspace_name(index))
            .map_err(|e| EvaluationError::workspace(index, e))?;

        // Cancellation drops this future before the release below; the
        // workspace's drop then removes the directory.
        let result = self.run_in(&ws, index, point).await;

        if let Err(e) = WorkspaceManager::release(&mut ws, self.retain_workspaces) {
            warn!(index, error = %e, "workspace cleanup failed");
        }
        result
    }
}

impl ExternalProcessEvaluator {
    async fn run_in(&self, ws: &Workspace, index: usize, point: &Point) -> EvalResult<Point> {
        WorkspaceManager::stage(ws, &self.support_files)
            .map_err(|e| EvaluationError::workspace(index, e))?;

        let input_path = self
            .coupling
            .write_input(point, ws.path())
            .map_err(|e| EvaluationError::text_io(index, e))?;
        // The program runs inside the workspace, so hand it the bare name.
        let input_arg = input_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or(input_path);

        let command = self.program.command_for(&input_arg);
        debug!(index, program = %self.program.name(), workdir = %ws.path().display(), "evaluating point");

        let output = ProcessRunner::run(&command, true, true, ws.path(), self.timeout)
            .await
            .map_err(|e| EvaluationError::process(index, e))?;

        if !output.success() {
            return Err(EvaluationError::new(
                index,
                EvaluationErrorKind::NonZeroExit {
                    code: output.exit_code,
                },
                format!("{} exited with code {}", self.program.name(), output.exit_code),
            )
            .with_streams(output.stdout, output.stderr));
        }

        let raw = match self.coupling.read_output(ws.path(), &output.stdout) {
            Ok(raw) => raw,
            Err(e) => {
                return Err(EvaluationError::text_io(index, e)
                    .with_streams(output.stdout, output.stderr))
            }
        };

        let result = self
            .replication
            .apply(index, point, raw, self.output_dimension)?;
        check_output(index, &result, self.output_dimension)?;

        debug!(index, elapsed_ms = output.duration_ms, "point evaluated");
        Ok(result)
    }
}

type PointFn = dyn Fn(&Point) -> Result<Point, String> + Send + Sync;

/// Evaluates points with a Rust function.
pub struct InProcessEvaluator {
    func: Arc<PointFn>,
    input_dimension: usize,
    output_dimension: Option<usize>,
}

impl InProcessEvaluator {
    pub fn new<F>(input_dimension: usize, output_dimension: Option<usize>, func: F) -> Self
    where
        F: Fn(&Point) -> Result<Point, String> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
            input_dimension,
            output_dimension,
        }
    }
}

#[async_trait]
impl Evaluator for InProcessEvaluator {
    fn input_dimension(&self) -> usize {
        self.input_dimension
    }

    fn output_dimension(&self) -> Option<usize> {
        self.output_dimension
    }

    async fn evaluate(&self, index: usize, point: &Point) -> EvalResult<Point> {
        check_input(index, point, self.input_dimension)?;

        let func = Arc::clone(&self.func);
        let input = point.clone();
        let result = tokio::task::spawn_blocking(move || func(&input))
            .await
            .map_err(|e| {
                EvaluationError::new(index, EvaluationErrorKind::InProcess, e.to_string())
            })?
            .map_err(|msg| EvaluationError::new(index, EvaluationErrorKind::InProcess, msg))?;

        check_output(index, &result, self.output_dimension)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_index_and_kind() {
        let err = EvaluationError::new(2, EvaluationErrorKind::NonZeroExit { code: 3 }, "boom");
        assert_eq!(err.to_string(), "point 2 failed (exit code 3): boom");
    }

    #[test]
    fn test_error_serde_keeps_streams() {
        let err = EvaluationError::new(1, EvaluationErrorKind::Timeout, "slow")
            .with_streams("partial out", "warning");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"]["type"], "timeout");
        assert_eq!(json["stderr"], "warning");
        let back: EvaluationError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_replication_fixed() {
        let p = Replication::Fixed { count: 3 }
            .apply(0, &Point::from([1.0]), Point::from([7.0]), None)
            .unwrap();
        assert_eq!(p, Point::from([7.0, 7.0, 7.0]));
    }

    #[test]
    fn test_replication_from_input() {
        let input = Point::from([1.0, 2.0, 3.0, 3.0]);
        let p = Replication::FromInput { position: 3 }
            .apply(0, &input, Point::from([-4.5]), None)
            .unwrap();
        assert_eq!(p, Point::from([-4.5, -4.5, -4.5]));

        let single = Point::from([1.0, 2.0, 3.0, 1.0]);
        let p = Replication::FromInput { position: 3 }
            .apply(0, &single, Point::from([-4.5]), None)
            .unwrap();
        assert_eq!(p, Point::from([-4.5]));
    }

    #[test]
    fn test_replication_rejects_bad_counts() {
        let err = Replication::FromInput { position: 0 }
            .apply(5, &Point::from([2.5]), Point::from([1.0]), None)
            .unwrap_err();
        assert_eq!(err.index, 5);
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);

        let err = Replication::Fixed { count: 2 }
            .apply(0, &Point::from([0.0]), Point::from([1.0, 2.0]), None)
            .unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);
    }

    #[test]
    fn test_replication_count_is_bounded() {
        let huge = Point::from([1.0, 2e18]);
        let err = Replication::FromInput { position: 1 }
            .apply(1, &huge, Point::from([7.0]), None)
            .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);

        // A declared output dimension is the tighter bound.
        let err = Replication::FromInput { position: 1 }
            .apply(0, &Point::from([1.0, 3.0]), Point::from([7.0]), Some(2))
            .unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);

        let err = Replication::Fixed { count: MAX_REPLICATION + 1 }
            .apply(0, &Point::from([0.0]), Point::from([7.0]), None)
            .unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);

        let p = Replication::FromInput { position: 1 }
            .apply(0, &Point::from([1.0, 2.0]), Point::from([7.0]), Some(2))
            .unwrap();
        assert_eq!(p, Point::from([7.0, 7.0]));
    }

    #[tokio::test]
    async fn test_in_process_evaluator() {
        let eval = InProcessEvaluator::new(2, Some(1), |p| Ok(Point::from([p[0] * p[1]])));
        let out = eval.evaluate(0, &Point::from([3.0, 4.0])).await.unwrap();
        assert_eq!(out, Point::from([12.0]));

        let err = eval.evaluate(7, &Point::from([3.0])).await.unwrap_err();
        assert_eq!(err.index, 7);
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);
    }

    #[tokio::test]
    async fn test_in_process_failure_and_output_check() {
        let failing = InProcessEvaluator::new(1, None, |_| Err("diverged".to_string()));
        let err = failing.evaluate(0, &Point::from([1.0])).await.unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::InProcess);
        assert_eq!(err.message, "diverged");

        let wrong = InProcessEvaluator::new(1, Some(2), |p| Ok(p.clone()));
        let err = wrong.evaluate(0, &Point::from([1.0])).await.unwrap_err();
        assert_eq!(err.kind, EvaluationErrorKind::Dimension);
    }
}
