//! Host-in and host-out descriptors.
//!
//! A [`JobDescriptor`] ("host-in") tells a dispatcher what to evaluate and
//! where; a [`ResultDescriptor`] ("host-out") carries the outcomes back to
//! whoever issued the job. Both are JSON documents written atomically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::coupling::CouplingSpec;
use crate::evaluator::Replication;
use crate::point::{load_sample, Sample, SampleError};
use crate::process::Program;
use crate::result::{PointOutcome, SampleResult};

/// File name of a staged job inside a host working directory.
pub const HOST_IN_FILE: &str = "host-in.json";

/// File name of a result descriptor inside a host working directory.
pub const HOST_OUT_FILE: &str = "host-out.json";

/// Errors reading or writing descriptors.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("descriptor io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Sample(#[from] SampleError),
}

/// Result type for descriptor operations.
pub type DescriptorResult<T> = std::result::Result<T, DescriptorError>;

/// A named host and the working directory evaluations run under there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostDescriptor {
    pub name: String,
    pub workdir: PathBuf,
}

impl HostDescriptor {
    pub fn new(name: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            workdir: workdir.into(),
        }
    }
}

/// Where results of a delegated job must be written back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyTo {
    pub host: String,
    pub directory: PathBuf,
}

/// Input sample, inline or in a separate file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SampleSource {
    Inline(Sample),
    File { path: PathBuf },
}

impl SampleSource {
    pub fn resolve(&self) -> DescriptorResult<Sample> {
        match self {
            SampleSource::Inline(sample) => Ok(sample.clone()),
            SampleSource::File { path } => Ok(load_sample(path)?),
        }
    }
}

/// Host-in: one dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDescriptor {
    /// Host the job is meant to run on.
    pub host: String,
    /// Base directory for per-point workspaces.
    pub workdir: PathBuf,
    pub program: Program,
    pub coupling: CouplingSpec,
    pub input_dimension: usize,
    #[serde(default)]
    pub output_dimension: Option<usize>,
    #[serde(default)]
    pub replication: Replication,
    /// Files copied into every workspace.
    #[serde(default)]
    pub support_files: Vec<PathBuf>,
    pub sample: SampleSource,
    /// Position of the first point within the caller's full sample.
    #[serde(default)]
    pub first_index: usize,
    #[serde(default)]
    pub reply_to: Option<ReplyTo>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl JobDescriptor {
    /// Read a job descriptor; relative paths are taken relative to the
    /// descriptor's directory.
    pub fn load(path: &Path) -> DescriptorResult<Self> {
        let mut job: JobDescriptor = read_json(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        job.resolve_paths(base);
        Ok(job)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.workdir);
        self.support_files.iter_mut().for_each(rebase);
        if let SampleSource::File { path } = &mut self.sample {
            rebase(path);
        }
        if let Some(reply) = &mut self.reply_to {
            rebase(&mut reply.directory);
        }
        self.coupling.resolve_paths(base);
    }

    /// Default location for this job's result descriptor.
    pub fn result_path(&self) -> PathBuf {
        match &self.reply_to {
            Some(reply) => reply.directory.join(HOST_OUT_FILE),
            None => self.workdir.join(HOST_OUT_FILE),
        }
    }

    pub fn save(&self, path: &Path) -> DescriptorResult<()> {
        write_json_atomic(path, self)
    }
}

/// Host-out: the outcome of one dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultDescriptor {
    /// Host the results are destined for.
    pub host: String,
    /// Directory the results are written to.
    pub directory: PathBuf,
    /// Whether the results were produced for a remote requester.
    pub remote: bool,
    pub job_id: Uuid,
    /// SHA-256 of the input sample.
    pub job_digest: String,
    pub first_index: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<PointOutcome>,
}

impl ResultDescriptor {
    /// Empty descriptor for `job`, filled once the sample has been run.
    pub fn for_job(job: &JobDescriptor, job_id: Uuid, job_digest: String) -> Self {
        let (host, directory, remote) = match &job.reply_to {
            Some(reply) => (reply.host.clone(), reply.directory.clone(), true),
            None => (job.host.clone(), job.workdir.clone(), false),
        };
        Self {
            host,
            directory,
            remote,
            job_id,
            job_digest,
            first_index: job.first_index,
            created_at: Utc::now(),
            completed_at: None,
            succeeded: 0,
            failed: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn populate(&mut self, result: &SampleResult) {
        self.succeeded = result.succeeded();
        self.failed = result.failed();
        self.outcomes = result.outcomes().to_vec();
        self.completed_at = Some(Utc::now());
    }

    pub fn sample_result(&self) -> SampleResult {
        SampleResult::new(self.outcomes.clone())
    }

    /// `directory/host-out.json`.
    pub fn path(&self) -> PathBuf {
        self.directory.join(HOST_OUT_FILE)
    }

    pub fn load(path: &Path) -> DescriptorResult<Self> {
        read_json(path)
    }

    pub fn save(&self, path: &Path) -> DescriptorResult<()> {
        write_json_atomic(path, self)
    }
}

/// SHA-256 hex digest of the sample coordinates, point by point.
pub fn sample_digest(sample: &Sample) -> String {
    let mut hasher = Sha256::new();
    for point in sample {
        for v in point.values() {
            hasher.update(v.to_le_bytes());
        }
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> DescriptorResult<T> {
    let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| DescriptorError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Write `value` as pretty JSON: temp file in the same directory, then rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DescriptorResult<()> {
    let io_err = |source| DescriptorError::Io {
        path: path.display().to_string(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| DescriptorError::Json {
        path: path.display().to_string(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    std::io::Write::write_all(&mut tmp, &bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
