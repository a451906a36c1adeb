use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::Serialize;
use slotmap::{SlotMap, new_key_type};

use crate::domain::usage::{TokenUsage, UsageReport};
use crate::domain::util::id::{JobId, JobTypeId, ModelId};

new_key_type! {
    pub struct JobKey;
}

/// Where a job currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    WaitingForCapacity,
    WaitingOnModel,
    Processing,
}

/// Introspection record of one queued or running job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobInfo {
    pub job_id: JobId,
    pub job_type: JobTypeId,
    pub status: JobStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub current_model_id: Option<ModelId>,
    pub tried_models: Vec<ModelId>,
    pub wait_started_at: Option<i64>,
    #[serde(rename = "maxWaitMS")]
    pub max_wait_ms: Option<u64>,
    pub timeout_at: Option<i64>,
}

/// Registry of all jobs between `queue_job` entry and terminal
/// resolution. The single lock covers the whole map.
#[derive(Debug, Clone, Default)]
pub struct ActiveJobStore {
    inner: Arc<RwLock<SlotMap<JobKey, ActiveJobInfo>>>,
}

impl ActiveJobStore {
    pub fn new() -> ActiveJobStore {
        ActiveJobStore::default()
    }

    pub fn insert(&self, info: ActiveJobInfo) -> JobKey {
        let mut guard = self.inner.write().unwrap();
        guard.insert(info)
    }

    pub fn update<R>(&self, key: JobKey, f: impl FnOnce(&mut ActiveJobInfo) -> R) -> Option<R> {
        let mut guard = self.inner.write().unwrap();
        guard.get_mut(key).map(f)
    }

    pub fn remove(&self, key: JobKey) -> Option<ActiveJobInfo> {
        let mut guard = self.inner.write().unwrap();
        guard.remove(key)
    }

    pub fn snapshot(&self) -> Vec<ActiveJobInfo> {
        let guard = self.inner.read().unwrap();
        guard.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handed to the user callback so it knows which model it was admitted
/// on.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub model_id: ModelId,
}

/// What the user callback resolved to.
///
/// `Reject { delegate: true }` commits the reported usage on the current
/// model and escalates to the next one without failing the job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Resolve(UsageReport),
    Reject { usage: UsageReport, delegate: bool, reason: String },
}

pub type JobFuture = BoxFuture<'static, anyhow::Result<JobOutcome>>;

/// The user-supplied job body. Invoked once per model attempt, so it must
/// be re-runnable on delegation.
pub type JobFn = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

/// Terminal success of a job.
#[derive(Debug, Clone)]
pub struct JobSuccess {
    pub model_used: ModelId,
    pub usage: TokenUsage,
    pub models_tried: Vec<ModelId>,
}

pub type CompletionCallback = Arc<dyn Fn(&JobSuccess) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&crate::error::Error) + Send + Sync>;

/// One submission to [`queue_job`](crate::domain::coordinator::RateLimitCoordinator::queue_job).
#[derive(Clone)]
pub struct JobRequest {
    pub job_id: JobId,
    pub job_type: JobTypeId,
    pub job: JobFn,
    pub on_complete: Option<CompletionCallback>,
    pub on_error: Option<FailureCallback>,
}

impl std::fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRequest")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .finish_non_exhaustive()
    }
}

impl JobRequest {
    pub fn new(job_id: impl Into<String>, job_type: impl Into<String>, job: JobFn) -> JobRequest {
        JobRequest {
            job_id: JobId::new(job_id),
            job_type: JobTypeId::new(job_type),
            job,
            on_complete: None,
            on_error: None,
        }
    }
}
