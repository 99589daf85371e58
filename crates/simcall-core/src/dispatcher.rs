//! Sample dispatch.
//!
//! [`exec_sample`] evaluates every point of a sample on a bounded pool of
//! workers and returns one outcome per point, in input order. Each worker
//! claims the next unclaimed index, evaluates it and hands the outcome back;
//! a point failure is recorded at its index and the batch goes on, unless
//! fail-fast is configured.
//!
//! [`CoreDispatcher`] wraps the same machinery for descriptor-driven runs:
//!
//! ```text
//! Idle --load--> Loaded --exec_sample--> Collected --write--> Written
//! ```

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConfigError, DispatchConfig};
use crate::descriptor::{sample_digest, DescriptorError, JobDescriptor, ResultDescriptor};
use crate::evaluator::{
    EvalResult, EvaluationError, EvaluationErrorKind, Evaluator, ExternalProcessEvaluator,
};
use crate::point::{Point, Sample};
use crate::result::{PointOutcome, SampleResult};

/// Errors that abort a whole dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed job: {0}")]
    MalformedJob(String),

    #[error("dispatcher is {found}, expected {expected}")]
    InvalidState {
        expected: DispatchState,
        found: DispatchState,
    },

    #[error("fail-fast abort at point {index}: {source}")]
    FailFast {
        index: usize,
        #[source]
        source: EvaluationError,
        /// Outcomes collected before the abort; unfinished points are
        /// marked cancelled.
        partial: SampleResult,
    },

    #[error("result coverage error: {0}")]
    Coverage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Lifecycle of a [`CoreDispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Loaded,
    Dispatching,
    Collected,
    Written,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchState::Idle => "idle",
            DispatchState::Loaded => "loaded",
            DispatchState::Dispatching => "dispatching",
            DispatchState::Collected => "collected",
            DispatchState::Written => "written",
        };
        f.write_str(s)
    }
}

/// Evaluate `sample` with at most `config.max_concurrent_workers` points in
/// flight. `result[i]` always belongs to `sample[i]`.
pub async fn exec_sample(
    evaluator: Arc<dyn Evaluator>,
    sample: &[Point],
    config: &DispatchConfig,
) -> DispatchResult<SampleResult> {
    config.validate()?;
    run_pool(evaluator, Arc::new(sample.to_vec()), config).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[instrument(skip_all, fields(points = sample.len(), workers = config.max_concurrent_workers))]
async fn run_pool(
    evaluator: Arc<dyn Evaluator>,
    sample: Arc<Sample>,
    config: &DispatchConfig,
) -> DispatchResult<SampleResult> {
    let total = sample.len();
    if total == 0 {
        return Ok(SampleResult::default());
    }

    let workers = config.max_concurrent_workers.clamp(1, total);
    let next_index = Arc::new(Mutex::new(0usize));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, EvalResult<Point>)>();

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        let evaluator = Arc::clone(&evaluator);
        let sample = Arc::clone(&sample);
        let next_index = Arc::clone(&next_index);
        let done_tx = done_tx.clone();
        let mut cancel_rx = cancel_rx.clone();

        tasks.spawn(async move {
            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                let index = {
                    let mut next = next_index.lock().await;
                    if *next >= sample.len() {
                        break;
                    }
                    *next += 1;
                    *next - 1
                };

                // Losing the race to cancellation drops the evaluation,
                // which kills its process and removes its workspace.
                let evaluation =
                    AssertUnwindSafe(evaluator.evaluate(index, &sample[index])).catch_unwind();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    caught = evaluation => caught.unwrap_or_else(|payload| {
                        let message = panic_message(&*payload);
                        warn!(worker, index, %message, "evaluation panicked");
                        Err(EvaluationError::new(
                            index,
                            EvaluationErrorKind::Panicked,
                            format!("evaluation panicked: {message}"),
                        ))
                    }),
                };

                if done_tx.send((index, outcome)).is_err() {
                    break;
                }
            }
            debug!(worker, "worker stopped");
        });
    }
    drop(done_tx);

    let deadline = config
        .batch_timeout()
        .map(|limit| tokio::time::Instant::now() + limit);
    let mut slots: Vec<Option<PointOutcome>> = vec![None; total];
    let mut first_failure: Option<EvaluationError> = None;
    let mut timed_out = false;

    loop {
        let received = match deadline {
            Some(at) => match tokio::time::timeout_at(at, done_rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            },
            None => done_rx.recv().await,
        };
        let Some((index, outcome)) = received else {
            break;
        };

        match &outcome {
            Ok(_) => debug!(index, "point succeeded"),
            Err(e) => {
                warn!(index, kind = %e.kind, error = %e.message, "point failed");
                if config.fail_fast && first_failure.is_none() {
                    first_failure = Some(e.clone());
                }
            }
        }
        slots[index] = Some(outcome.into());

        if first_failure.is_some() {
            break;
        }
    }

    let _ = cancel_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "dispatch worker aborted");
        }
    }
    // Completions that raced the cancellation are still valid results.
    while let Ok((index, outcome)) = done_rx.try_recv() {
        if slots[index].is_none() {
            slots[index] = Some(outcome.into());
        }
    }

    let reason = if timed_out {
        "batch timed out before this point completed".to_string()
    } else if let Some(e) = &first_failure {
        format!("batch aborted after point {} failed", e.index)
    } else {
        "worker stopped before evaluating this point".to_string()
    };
    let result = SampleResult::from_slots(slots, &reason);

    if timed_out {
        warn!(cancelled = result.cancelled(), "batch timeout reached");
    }
    info!(
        succeeded = result.succeeded(),
        failed = result.failed(),
        "sample dispatched"
    );

    match first_failure {
        Some(source) => Err(DispatchError::FailFast {
            index: source.index,
            source,
            partial: result,
        }),
        None => Ok(result),
    }
}

/// Build the external-process evaluator a job descriptor describes.
pub fn job_evaluator(job: &JobDescriptor, config: &DispatchConfig) -> ExternalProcessEvaluator {
    ExternalProcessEvaluator::new(
        job.program.clone(),
        Arc::new(job.coupling.clone()),
        job.workdir.clone(),
        job.input_dimension,
        job.output_dimension,
    )
    .with_support_files(job.support_files.clone())
    .with_replication(job.replication)
    .with_dispatch_config(config)
}

struct LoadedJob {
    sample: Arc<Sample>,
    descriptor: ResultDescriptor,
}

/// Descriptor-driven dispatcher.
pub struct CoreDispatcher {
    config: DispatchConfig,
    evaluator: Arc<dyn Evaluator>,
    state: DispatchState,
    job: Option<LoadedJob>,
    result: Option<SampleResult>,
}

impl CoreDispatcher {
    pub fn new(config: DispatchConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            config,
            evaluator,
            state: DispatchState::Idle,
            job: None,
            result: None,
        }
    }

    /// Dispatcher running `job`'s program with `job`'s own dispatch settings.
    pub fn for_job(job: &JobDescriptor) -> Self {
        let config = job.dispatch.clone();
        let evaluator = job_evaluator(job, &config);
        Self::new(config, Arc::new(evaluator))
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    fn expect_state(&self, expected: DispatchState) -> DispatchResult<()> {
        if self.state != expected {
            return Err(DispatchError::InvalidState {
                expected,
                found: self.state,
            });
        }
        Ok(())
    }

    /// Read and validate a job. Structural problems are fatal.
    pub fn load(&mut self, job: &JobDescriptor) -> DispatchResult<()> {
        self.expect_state(DispatchState::Idle)?;
        self.config.validate()?;

        let sample = job.sample.resolve()?;
        validate_job(job, &sample, self.evaluator.as_ref(), &self.config)?;

        let job_id = Uuid::new_v4();
        let descriptor = ResultDescriptor::for_job(job, job_id, sample_digest(&sample));
        info!(
            job_id = %job_id,
            host = %job.host,
            workdir = %job.workdir.display(),
            points = sample.len(),
            "job loaded"
        );

        self.job = Some(LoadedJob {
            sample: Arc::new(sample),
            descriptor,
        });
        self.state = DispatchState::Loaded;
        Ok(())
    }

    /// Evaluate the loaded sample.
    ///
    /// On a fail-fast abort the partial result is kept, so [`Self::write`]
    /// can still report it.
    pub async fn exec_sample(&mut self) -> DispatchResult<&SampleResult> {
        self.expect_state(DispatchState::Loaded)?;
        let sample = match &self.job {
            Some(job) => Arc::clone(&job.sample),
            None => {
                return Err(DispatchError::InvalidState {
                    expected: DispatchState::Loaded,
                    found: DispatchState::Idle,
                })
            }
        };

        self.state = DispatchState::Dispatching;
        let outcome = run_pool(Arc::clone(&self.evaluator), sample, &self.config).await;
        self.state = DispatchState::Collected;

        match outcome {
            Ok(result) => Ok(&*self.result.insert(result)),
            Err(DispatchError::FailFast {
                index,
                source,
                partial,
            }) => {
                self.result = Some(partial.clone());
                Err(DispatchError::FailFast {
                    index,
                    source,
                    partial,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Collected outcomes, once available.
    pub fn result(&self) -> Option<&SampleResult> {
        self.result.as_ref()
    }

    /// The host-out descriptor, filled with the collected outcomes.
    pub fn result_descriptor(&self) -> Option<ResultDescriptor> {
        let job = self.job.as_ref()?;
        let result = self.result.as_ref()?;
        let mut descriptor = job.descriptor.clone();
        descriptor.populate(result);
        Some(descriptor)
    }

    /// Write the host-out descriptor to the destination it names.
    pub fn write(&mut self) -> DispatchResult<PathBuf> {
        let path = self
            .job
            .as_ref()
            .map(|job| job.descriptor.path())
            .ok_or(DispatchError::InvalidState {
                expected: DispatchState::Collected,
                found: self.state,
            })?;
        self.write_to(&path)?;
        Ok(path)
    }

    /// Write the host-out descriptor to `path`.
    pub fn write_to(&mut self, path: &Path) -> DispatchResult<()> {
        self.expect_state(DispatchState::Collected)?;
        let descriptor = self
            .result_descriptor()
            .ok_or(DispatchError::InvalidState {
                expected: DispatchState::Collected,
                found: self.state,
            })?;
        descriptor.save(path)?;
        info!(path = %path.display(), succeeded = descriptor.succeeded, failed = descriptor.failed, "results written");
        self.state = DispatchState::Written;
        Ok(())
    }
}

fn validate_job(
    job: &JobDescriptor,
    sample: &Sample,
    evaluator: &dyn Evaluator,
    config: &DispatchConfig,
) -> DispatchResult<()> {
    if sample.is_empty() && config.require_non_empty {
        return Err(DispatchError::MalformedJob(
            "sample is empty but at least one point is required".to_string(),
        ));
    }
    if job.input_dimension != evaluator.input_dimension() {
        return Err(DispatchError::MalformedJob(format!(
            "job declares input dimension {} but the evaluator expects {}",
            job.input_dimension,
            evaluator.input_dimension()
        )));
    }
    if let Some((i, p)) = sample
        .iter()
        .enumerate()
        .find(|(_, p)| p.dimension() != job.input_dimension)
    {
        return Err(DispatchError::MalformedJob(format!(
            "point {i} has dimension {}, expected {}",
            p.dimension(),
            job.input_dimension
        )));
    }
    if let Some(tokens) = job.coupling.declared_inputs() {
        if tokens > job.input_dimension {
            return Err(DispatchError::MalformedJob(format!(
                "{tokens} input tokens for {} input coordinates",
                job.input_dimension
            )));
        }
    }
    Ok(())
}
