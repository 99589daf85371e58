//! Per-point outcomes of a dispatched sample.

use serde::{Deserialize, Serialize};

use crate::evaluator::{EvaluationError, EvaluationErrorKind};
use crate::point::{Point, Sample};

/// Result slot for one input point: exactly one of a value or a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PointOutcome {
    Ok { values: Point },
    Failed { error: EvaluationError },
}

impl PointOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, PointOutcome::Ok { .. })
    }

    pub fn point(&self) -> Option<&Point> {
        match self {
            PointOutcome::Ok { values } => Some(values),
            PointOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&EvaluationError> {
        match self {
            PointOutcome::Ok { .. } => None,
            PointOutcome::Failed { error } => Some(error),
        }
    }
}

impl From<Result<Point, EvaluationError>> for PointOutcome {
    fn from(result: Result<Point, EvaluationError>) -> Self {
        match result {
            Ok(values) => PointOutcome::Ok { values },
            Err(error) => PointOutcome::Failed { error },
        }
    }
}

/// Ordered outcomes: `outcomes[i]` belongs to input point `i`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SampleResult {
    outcomes: Vec<PointOutcome>,
}

impl SampleResult {
    pub fn new(outcomes: Vec<PointOutcome>) -> Self {
        Self { outcomes }
    }

    /// Build from per-index slots; empty slots become cancellations.
    pub fn from_slots(slots: Vec<Option<PointOutcome>>, reason: &str) -> Self {
        let outcomes = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| PointOutcome::Failed {
                    error: EvaluationError::cancelled(i, reason),
                })
            })
            .collect();
        Self { outcomes }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PointOutcome> {
        self.outcomes.get(index)
    }

    pub fn outcomes(&self) -> &[PointOutcome] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    /// Failures with their sample index.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &EvaluationError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.error().map(|e| (i, e)))
    }

    /// Number of points that never ran because the batch was cut short.
    pub fn cancelled(&self) -> usize {
        self.failures()
            .filter(|(_, e)| e.kind == EvaluationErrorKind::Cancelled)
            .count()
    }

    /// The output sample, if every point succeeded.
    pub fn output_sample(&self) -> Option<Sample> {
        self.outcomes.iter().map(|o| o.point().cloned()).collect()
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} points: {} succeeded, {} failed",
            self.len(),
            self.succeeded(),
            self.failed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(v: f64) -> PointOutcome {
        PointOutcome::Ok {
            values: Point::from([v]),
        }
    }

    #[test]
    fn test_from_slots_fills_gaps_with_cancellations() {
        let result = SampleResult::from_slots(vec![Some(ok(1.0)), None, Some(ok(3.0))], "fail-fast");
        assert_eq!(result.len(), 3);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.cancelled(), 1);
        let (i, e) = result.failures().next().unwrap();
        assert_eq!(i, 1);
        assert_eq!(e.index, 1);
        assert_eq!(e.message, "fail-fast");
        assert!(result.output_sample().is_none());
    }

    #[test]
    fn test_output_sample_when_all_ok() {
        let result = SampleResult::new(vec![ok(1.0), ok(2.0)]);
        assert_eq!(
            result.output_sample().unwrap(),
            vec![Point::from([1.0]), Point::from([2.0])]
        );
        assert_eq!(result.summary(), "2 points: 2 succeeded, 0 failed");
    }

    #[test]
    fn test_outcome_serde_shape() {
        let json = serde_json::to_value(ok(2.5)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok", "values": [2.5]}));

        let failed = PointOutcome::from(Err(EvaluationError::new(
            4,
            EvaluationErrorKind::Timeout,
            "slow",
        )));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["index"], 4);
        let back: PointOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, failed);
    }
}
