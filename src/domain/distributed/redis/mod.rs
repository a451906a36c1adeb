pub mod scripts;

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::clock::SharedClock;
use crate::domain::config::ModelConfig;
use crate::domain::distributed::allocation::{
    AllocationInfo, AllocationUpdate, JobTypeResourceRecord,
};
use crate::domain::distributed::backend::{DistributedAllocator, PoolAcquire, PoolRelease};
use crate::domain::util::id::{InstanceId, JobTypeId, ModelId};
use crate::error::Result;

use self::scripts::{
    ACQUIRE_SCRIPT, CLEANUP_SCRIPT, GET_STATS_SCRIPT, HEARTBEAT_SCRIPT, INIT_CONFIG_SCRIPT,
    REGISTER_SCRIPT, RELEASE_SCRIPT, UNREGISTER_SCRIPT,
};

/// Wire shape of a model's capacities in the `modelCapacities` hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelCapacityRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    tokens_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tokens_per_day: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requests_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requests_per_day: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_concurrent_requests: Option<u64>,
}

impl From<&ModelConfig> for ModelCapacityRecord {
    fn from(config: &ModelConfig) -> Self {
        ModelCapacityRecord {
            tokens_per_minute: config.tokens_per_minute,
            tokens_per_day: config.tokens_per_day,
            requests_per_minute: config.requests_per_minute,
            requests_per_day: config.requests_per_day,
            max_concurrent_requests: config.max_concurrent_requests,
        }
    }
}

/// Redis-resident registry shared across the fleet.
///
/// All mutations go through the atomic server-side scripts in
/// [`scripts`]; this type only marshals arguments and results. The
/// subscription task survives connection drops by resubscribing; the
/// last received allocation stays in effect in between.
pub struct RedisAllocator {
    client: redis::Client,
    connection: ConnectionManager,
    prefix: String,
    clock: SharedClock,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisAllocator {
    /// Connects and pushes the local model/job-type configuration into
    /// the shared registry.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        clock: SharedClock,
        model_capacities: &BTreeMap<ModelId, ModelConfig>,
        job_type_resources: &BTreeMap<JobTypeId, JobTypeResourceRecord>,
    ) -> Result<RedisAllocator> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        let allocator = RedisAllocator {
            client,
            connection,
            prefix: prefix.into(),
            clock,
            tasks: Mutex::new(Vec::new()),
        };
        allocator.init_config(model_capacities, job_type_resources).await?;
        Ok(allocator)
    }

    async fn init_config(
        &self,
        model_capacities: &BTreeMap<ModelId, ModelConfig>,
        job_type_resources: &BTreeMap<JobTypeId, JobTypeResourceRecord>,
    ) -> Result<()> {
        let models: BTreeMap<&str, ModelCapacityRecord> = model_capacities
            .iter()
            .map(|(id, config)| (id.as_str(), ModelCapacityRecord::from(config)))
            .collect();
        let job_types: BTreeMap<&str, &JobTypeResourceRecord> =
            job_type_resources.iter().map(|(id, record)| (id.as_str(), record)).collect();

        let mut connection = self.connection.clone();
        let _: i64 = INIT_CONFIG_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(serde_json::to_string(&models)?)
            .arg(serde_json::to_string(&job_types)?)
            .invoke_async(&mut connection)
            .await?;
        log::info!(
            "Pushed {} model(s) and {} job type(s) into the shared registry.",
            models.len(),
            job_types.len()
        );
        Ok(())
    }

    fn allocations_channel(&self) -> String {
        format!("{}allocations", self.prefix)
    }
}

#[async_trait]
impl DistributedAllocator for RedisAllocator {
    async fn register(&self, instance_id: &InstanceId) -> Result<AllocationInfo> {
        let mut connection = self.connection.clone();
        let raw: String = REGISTER_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(instance_id.as_str())
            .invoke_async(&mut connection)
            .await?;
        let allocation: AllocationInfo = serde_json::from_str(&raw)?;
        log::info!(
            "Registered instance {} ({} instance(s) active).",
            instance_id,
            allocation.instance_count
        );
        Ok(allocation)
    }

    async fn unregister(&self, instance_id: &InstanceId) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = UNREGISTER_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(instance_id.as_str())
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &InstanceId) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = HEARTBEAT_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(instance_id.as_str())
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn cleanup(&self, cutoff_ms: i64) -> Result<()> {
        let mut connection = self.connection.clone();
        let removed: i64 = CLEANUP_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(cutoff_ms)
            .invoke_async(&mut connection)
            .await?;
        if removed > 0 {
            log::info!("Cleaned up {} stale instance(s).", removed);
        }
        Ok(())
    }

    async fn acquire(&self, request: &PoolAcquire) -> Result<bool> {
        let mut connection = self.connection.clone();
        let granted: i64 = ACQUIRE_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(request.instance_id.as_str())
            .arg(request.model_id.as_str())
            .invoke_async(&mut connection)
            .await?;
        Ok(granted == 1)
    }

    async fn release(&self, request: &PoolRelease) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: i64 = RELEASE_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .arg(request.instance_id.as_str())
            .arg(request.model_id.as_str())
            .arg(request.actual_tokens)
            .arg(request.actual_requests)
            .arg(request.window_starts.minute)
            .arg(request.window_starts.day)
            .invoke_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        instance_id: &InstanceId,
    ) -> Result<mpsc::UnboundedReceiver<AllocationInfo>> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Immediate snapshot of the current allocation, if any.
        let mut connection = self.connection.clone();
        let current: Option<String> = redis::cmd("HGET")
            .arg(format!("{}allocations", self.prefix))
            .arg(instance_id.as_str())
            .query_async(&mut connection)
            .await?;
        if let Some(raw) = current {
            match serde_json::from_str::<AllocationInfo>(&raw) {
                Ok(allocation) => {
                    let _ = tx.send(allocation);
                }
                Err(e) => log::warn!("Discarding malformed allocation snapshot: {}", e),
            }
        }

        let client = self.client.clone();
        let channel = self.allocations_channel();
        let target = instance_id.clone();
        let task = tokio::spawn(async move {
            loop {
                let connection = match client.get_async_connection().await {
                    Ok(connection) => connection,
                    Err(e) => {
                        log::warn!("Allocation subscription connect failed: {}.", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = connection.into_pubsub();
                if let Err(e) = pubsub.subscribe(&channel).await {
                    log::warn!("Allocation subscription to '{}' failed: {}.", channel, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(_) => continue,
                    };
                    match serde_json::from_str::<AllocationUpdate>(&payload) {
                        Ok(update) if update.instance_id == target => {
                            if tx.send(update.allocation).is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::warn!("Discarding malformed allocation update: {}", e),
                    }
                }
                // The last good allocation stays in effect while we retry.
                log::warn!("Allocation subscription dropped; reconnecting.");
            }
        });
        self.tasks.lock().unwrap().push(task);

        Ok(rx)
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        let mut connection = self.connection.clone();
        let raw: String = GET_STATS_SCRIPT
            .key(&self.prefix)
            .arg(self.clock.now_ms())
            .invoke_async(&mut connection)
            .await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
