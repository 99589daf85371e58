//! simcall core library
//!
//! Runs an external simulation program over a sample of input points. Each
//! point is rendered into the program's input file, the program runs in its
//! own workspace, and the numbers it prints are read back as the output
//! point. Points are dispatched to a bounded pool of workers and the results
//! come back in sample order, one outcome per point.

pub mod config;
pub mod coupling;
pub mod descriptor;
pub mod dispatcher;
pub mod evaluator;
pub mod point;
pub mod process;
pub mod remote;
pub mod result;
pub mod telemetry;
pub mod textio;
pub mod workspace;

pub use config::{ConfigError, DispatchConfig};
pub use coupling::{Coupling, CouplingSpec, JsonCoupling, OutputChannel, TemplateCoupling};
pub use descriptor::{
    sample_digest, DescriptorError, HostDescriptor, JobDescriptor, ReplyTo, ResultDescriptor,
    SampleSource, HOST_IN_FILE, HOST_OUT_FILE,
};
pub use dispatcher::{
    exec_sample, job_evaluator, CoreDispatcher, DispatchError, DispatchResult, DispatchState,
};
pub use evaluator::{
    EvalResult, EvaluationError, EvaluationErrorKind, Evaluator, ExternalProcessEvaluator,
    InProcessEvaluator, Replication,
};
pub use point::{load_sample, Point, Sample, SampleError};
pub use process::{ProcessError, ProcessOutput, ProcessRunner, Program};
pub use remote::{gather, merge_results, partition, stage_jobs, HostJob};
pub use result::{PointOutcome, SampleResult};
pub use telemetry::init_tracing;
pub use textio::{ExtractionError, TemplateError, TextIoError, TokenMap};
pub use workspace::{Workspace, WorkspaceError, WorkspaceManager};

/// simcall version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
