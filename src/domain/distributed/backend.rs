use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::distributed::allocation::AllocationInfo;
use crate::domain::limiter::model_limiter::WindowStarts;
use crate::domain::usage::ResourceRequest;
use crate::domain::util::id::{InstanceId, JobId, ModelId};
use crate::error::Result;

/// Global-pool slot acquisition for one job.
#[derive(Debug, Clone)]
pub struct PoolAcquire {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub job_id: JobId,
    pub estimated: ResourceRequest,
}

/// Release of a pool slot, carrying actual usage and the window-start
/// stamps taken at reservation time so the usage counters land in the
/// right window keys.
#[derive(Debug, Clone)]
pub struct PoolRelease {
    pub instance_id: InstanceId,
    pub model_id: ModelId,
    pub job_id: JobId,
    pub estimated: ResourceRequest,
    pub actual_tokens: u64,
    pub actual_requests: u64,
    pub window_starts: WindowStarts,
}

/// The shared registry that partitions global model capacity across the
/// fleet.
///
/// Every mutating call triggers a reallocation and a publish. `register`
/// failures propagate; `release`, `heartbeat` and `cleanup` are
/// fire-and-forget from the coordinator's point of view, so a backend
/// outage never fails a local job.
#[async_trait]
pub trait DistributedAllocator: Send + Sync {
    /// Upserts the instance and returns its current allocation.
    async fn register(&self, instance_id: &InstanceId) -> Result<AllocationInfo>;

    async fn unregister(&self, instance_id: &InstanceId) -> Result<()>;

    async fn heartbeat(&self, instance_id: &InstanceId) -> Result<()>;

    /// Drops instances whose last heartbeat is older than `cutoff_ms`.
    async fn cleanup(&self, cutoff_ms: i64) -> Result<()>;

    /// Takes one slot from the instance's pool for the model. `false`
    /// means the pool is exhausted; the caller escalates as if the local
    /// limiter had no capacity.
    async fn acquire(&self, request: &PoolAcquire) -> Result<bool>;

    async fn release(&self, request: &PoolRelease) -> Result<()>;

    /// Streams this instance's allocation: once immediately, then on
    /// every publish that targets it.
    async fn subscribe(
        &self,
        instance_id: &InstanceId,
    ) -> Result<mpsc::UnboundedReceiver<AllocationInfo>>;

    /// Cluster-wide stats snapshot for introspection.
    async fn stats(&self) -> Result<serde_json::Value>;

    async fn shutdown(&self);
}
