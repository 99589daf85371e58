//! Splitting a job across hosts and gathering the partial results.
//!
//! Moving files between machines is left to the caller (a shared file
//! system, rsync, a batch scheduler). This module only decides which host
//! evaluates which contiguous slice of the sample, writes one host-in
//! descriptor per host, and stitches the host-out descriptors back into a
//! single result in the original order.

use std::path::PathBuf;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::descriptor::{
    sample_digest, HostDescriptor, JobDescriptor, ReplyTo, ResultDescriptor, SampleSource,
    HOST_IN_FILE,
};
use crate::dispatcher::{DispatchError, DispatchResult};
use crate::point::Sample;
use crate::result::{PointOutcome, SampleResult};

/// The share of a job assigned to one host.
#[derive(Debug, Clone)]
pub struct HostJob {
    pub host: HostDescriptor,
    pub job: JobDescriptor,
}

impl HostJob {
    /// Where the host-in descriptor is staged on the host.
    pub fn job_path(&self) -> PathBuf {
        self.host.workdir.join(HOST_IN_FILE)
    }

    /// Where the host writes its results back.
    pub fn result_path(&self) -> PathBuf {
        self.job.result_path()
    }
}

/// Sizes of `hosts` contiguous chunks covering `total` points. The first
/// `total % hosts` chunks get one extra point.
fn chunk_sizes(total: usize, hosts: usize) -> Vec<usize> {
    let base = total / hosts;
    let extra = total % hosts;
    (0..hosts).map(|i| base + usize::from(i < extra)).collect()
}

/// Split `job` into one job per host. Hosts left without points get no job.
pub fn partition(
    job: &JobDescriptor,
    hosts: &[HostDescriptor],
    reply: &ReplyTo,
) -> DispatchResult<Vec<HostJob>> {
    if hosts.is_empty() {
        return Err(DispatchError::MalformedJob(
            "no hosts to distribute the sample over".to_string(),
        ));
    }
    let sample = job.sample.resolve()?;
    Ok(partition_sample(job, &sample, hosts, reply))
}

fn partition_sample(
    job: &JobDescriptor,
    sample: &Sample,
    hosts: &[HostDescriptor],
    reply: &ReplyTo,
) -> Vec<HostJob> {
    let mut offset = 0;
    let mut jobs = Vec::new();
    for (host, size) in hosts.iter().zip(chunk_sizes(sample.len(), hosts.len())) {
        if size == 0 {
            debug!(host = %host.name, "host left idle");
            continue;
        }
        let chunk = sample[offset..offset + size].to_vec();
        let mut host_job = job.clone();
        host_job.host = host.name.clone();
        host_job.workdir = host.workdir.clone();
        host_job.sample = SampleSource::Inline(chunk);
        host_job.first_index = job.first_index + offset;
        host_job.reply_to = Some(ReplyTo {
            host: reply.host.clone(),
            directory: reply.directory.join(&host.name),
        });
        jobs.push(HostJob {
            host: host.clone(),
            job: host_job,
        });
        offset += size;
    }
    jobs
}

/// Write each host job to `<host workdir>/host-in.json`.
#[instrument(skip_all, fields(hosts = jobs.len()))]
pub fn stage_jobs(jobs: &[HostJob]) -> DispatchResult<Vec<PathBuf>> {
    let mut paths = Vec::with_capacity(jobs.len());
    for host_job in jobs {
        let path = host_job.job_path();
        host_job.job.save(&path)?;
        info!(
            host = %host_job.host.name,
            path = %path.display(),
            first_index = host_job.job.first_index,
            "host job staged"
        );
        paths.push(path);
    }
    Ok(paths)
}

/// Merge host results into one ordered result of `total` points.
///
/// Every position must be covered exactly once. Error indices are rewritten
/// to positions in the merged result.
pub fn merge_results(
    partials: &[ResultDescriptor],
    first_index: usize,
    total: usize,
) -> DispatchResult<SampleResult> {
    let mut slots: Vec<Option<PointOutcome>> = vec![None; total];

    for partial in partials {
        let start = partial
            .first_index
            .checked_sub(first_index)
            .ok_or_else(|| {
                DispatchError::Coverage(format!(
                    "results from {} start at {}, before the job start {first_index}",
                    partial.host, partial.first_index
                ))
            })?;

        for (k, outcome) in partial.outcomes.iter().enumerate() {
            let position = start + k;
            let slot = slots.get_mut(position).ok_or_else(|| {
                DispatchError::Coverage(format!(
                    "result position {position} is outside a sample of {total} points"
                ))
            })?;
            if slot.is_some() {
                return Err(DispatchError::Coverage(format!(
                    "position {position} is covered more than once"
                )));
            }
            let mut outcome = outcome.clone();
            if let PointOutcome::Failed { error } = &mut outcome {
                error.index = position;
            }
            *slot = Some(outcome);
        }
    }

    let missing: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect();
    if !missing.is_empty() {
        return Err(DispatchError::Coverage(format!(
            "no result for positions {missing:?}"
        )));
    }

    Ok(SampleResult::new(slots.into_iter().flatten().collect()))
}

/// Collect the host-out descriptors of a partitioned job.
///
/// The partition is recomputed from `job` and `hosts`, so both must be the
/// ones passed to [`partition`].
#[instrument(skip_all, fields(hosts = hosts.len()))]
pub fn gather(
    job: &JobDescriptor,
    hosts: &[HostDescriptor],
    reply: &ReplyTo,
) -> DispatchResult<ResultDescriptor> {
    if hosts.is_empty() {
        return Err(DispatchError::MalformedJob(
            "no hosts to gather results from".to_string(),
        ));
    }
    let sample = job.sample.resolve()?;
    let host_jobs = partition_sample(job, &sample, hosts, reply);

    let mut partials = Vec::with_capacity(host_jobs.len());
    for host_job in &host_jobs {
        let path = host_job.result_path();
        if !path.is_file() {
            return Err(DispatchError::Coverage(format!(
                "host {} has not written {}",
                host_job.host.name,
                path.display()
            )));
        }
        let partial = ResultDescriptor::load(&path)?;

        let chunk = host_job.job.sample.resolve()?;
        if partial.job_digest != sample_digest(&chunk) {
            return Err(DispatchError::Coverage(format!(
                "results in {} belong to a different sample",
                path.display()
            )));
        }
        if partial.first_index != host_job.job.first_index || partial.outcomes.len() != chunk.len()
        {
            return Err(DispatchError::Coverage(format!(
                "results in {} cover {} points from {}, expected {} from {}",
                path.display(),
                partial.outcomes.len(),
                partial.first_index,
                chunk.len(),
                host_job.job.first_index
            )));
        }
        debug!(host = %host_job.host.name, failed = partial.failed, "host results loaded");
        partials.push(partial);
    }

    let merged = merge_results(&partials, job.first_index, sample.len())?;
    let mut descriptor = ResultDescriptor::for_job(job, Uuid::new_v4(), sample_digest(&sample));
    descriptor.populate(&merged);
    info!(
        succeeded = descriptor.succeeded,
        failed = descriptor.failed,
        "host results gathered"
    );
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatcher::CoreDispatcher;
    use crate::evaluator::{EvaluationErrorKind, Evaluator, InProcessEvaluator};
    use crate::point::Point;
    use std::path::Path;
    use std::sync::Arc;

    fn job(points: usize) -> JobDescriptor {
        let sample: Vec<Vec<f64>> = (0..points).map(|i| vec![i as f64]).collect();
        serde_json::from_value(serde_json::json!({
            "host": "driver",
            "workdir": "/tmp/simcall-driver",
            "program": ["true"],
            "coupling": {"type": "json"},
            "input_dimension": 1,
            "sample": sample,
        }))
        .unwrap()
    }

    fn hosts(root: &Path, n: usize) -> Vec<HostDescriptor> {
        (0..n)
            .map(|i| HostDescriptor::new(format!("node-{i}"), root.join(format!("node-{i}"))))
            .collect()
    }

    fn reply(root: &Path) -> ReplyTo {
        ReplyTo {
            host: "driver".to_string(),
            directory: root.join("replies"),
        }
    }

    #[test]
    fn test_chunk_sizes_are_balanced() {
        assert_eq!(chunk_sizes(5, 2), vec![3, 2]);
        assert_eq!(chunk_sizes(6, 3), vec![2, 2, 2]);
        assert_eq!(chunk_sizes(1, 3), vec![1, 0, 0]);
    }

    #[test]
    fn test_partition_assigns_contiguous_slices() {
        let root = tempfile::tempdir().unwrap();
        let jobs = partition(&job(5), &hosts(root.path(), 2), &reply(root.path())).unwrap();
        assert_eq!(jobs.len(), 2);

        assert_eq!(jobs[0].job.first_index, 0);
        assert_eq!(jobs[1].job.first_index, 3);
        assert_eq!(jobs[1].job.host, "node-1");
        assert_eq!(jobs[1].job.workdir, root.path().join("node-1"));
        assert_eq!(
            jobs[1].job.sample.resolve().unwrap(),
            vec![Point::from([3.0]), Point::from([4.0])]
        );
        assert_eq!(
            jobs[0].result_path(),
            root.path().join("replies").join("node-0").join("host-out.json")
        );
    }

    #[test]
    fn test_partition_skips_idle_hosts_and_rejects_no_hosts() {
        let root = tempfile::tempdir().unwrap();
        let jobs = partition(&job(1), &hosts(root.path(), 3), &reply(root.path())).unwrap();
        assert_eq!(jobs.len(), 1);

        assert!(matches!(
            partition(&job(1), &[], &reply(root.path())),
            Err(DispatchError::MalformedJob(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_run_and_gather() {
        let root = tempfile::tempdir().unwrap();
        let full = job(5);
        let hosts = hosts(root.path(), 2);
        let reply = reply(root.path());

        let host_jobs = partition(&full, &hosts, &reply).unwrap();
        let staged = stage_jobs(&host_jobs).unwrap();
        assert!(staged.iter().all(|p| p.is_file()));

        let evaluator: Arc<dyn Evaluator> = Arc::new(InProcessEvaluator::new(1, Some(1), |p| {
            if p[0] == 3.0 {
                Err("unstable".to_string())
            } else {
                Ok(Point::from([p[0] * 10.0]))
            }
        }));
        for path in &staged {
            let host_job = JobDescriptor::load(path).unwrap();
            let mut dispatcher =
                CoreDispatcher::new(DispatchConfig::default(), Arc::clone(&evaluator));
            dispatcher.load(&host_job).unwrap();
            dispatcher.exec_sample().await.unwrap();
            dispatcher.write().unwrap();
        }

        let gathered = gather(&full, &hosts, &reply).unwrap();
        assert_eq!(gathered.outcomes.len(), 5);
        assert_eq!(gathered.succeeded, 4);
        assert_eq!(gathered.outcomes[4].point().unwrap()[0], 40.0);

        // Host node-1 saw the failing point at its local index 0.
        let err = gathered.outcomes[3].error().unwrap();
        assert_eq!(err.index, 3);
        assert_eq!(err.kind, EvaluationErrorKind::InProcess);
    }

    #[test]
    fn test_gather_reports_missing_host() {
        let root = tempfile::tempdir().unwrap();
        let err = gather(&job(4), &hosts(root.path(), 2), &reply(root.path())).unwrap_err();
        match err {
            DispatchError::Coverage(msg) => assert!(msg.contains("node-0"), "{msg}"),
            other => panic!("expected Coverage, got {other:?}"),
        }
    }

    #[test]
    fn test_merge_rejects_overlap() {
        let base = job(2);
        let mut a = ResultDescriptor::for_job(&base, Uuid::new_v4(), String::new());
        a.populate(&SampleResult::new(vec![PointOutcome::Ok {
            values: Point::from([1.0]),
        }]));
        let err = merge_results(&[a.clone(), a], 0, 2).unwrap_err();
        assert!(matches!(err, DispatchError::Coverage(_)));
    }
}
