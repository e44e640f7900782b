//! Per-tenant queueing and job execution

use crate::batch::{BatchProcessor, PacingConfig};
use crate::dispatch::{Dispatcher, RetryPolicy};
use crate::events::EventBus;
use crate::job::JobCoordinator;
use crate::transport::{SmtpTransportFactory, TransportFactory};
use crate::validate::{DnsMxLookup, DomainCache, MxLookup, RecipientValidator};
use mailburst_common::config::EngineConfig;
use mailburst_common::types::{
    Attachment, JobId, JobStatus, JobSubmission, JobSummary, MessagePayload, ProgressEvent,
    TenantId, TransportConfig,
};
use mailburst_common::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tracing::{debug, info};

/// One tenant's pending jobs and admission state. Item operations take
/// this queue's own lock, never the registry lock.
struct TenantQueue {
    inner: Mutex<TenantQueueInner>,
}

#[derive(Default)]
struct TenantQueueInner {
    pending: VecDeque<Arc<JobCoordinator>>,
    /// Active drain loops for this tenant, bounded by tenant_concurrency
    running: usize,
}

/// The dispatch engine: accepts job submissions per tenant, admits a
/// bounded number of running jobs per tenant, executes each job on a
/// worker drawn from a bounded pool, and exposes cancellation and status
/// queries. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    events: EventBus,
    cache: DomainCache,
    mx: Arc<dyn MxLookup>,
    factory: Arc<dyn TransportFactory>,
    /// Coarse lock guarding registry mutation only; per-item operations
    /// go through each tenant's own lock
    tenants: Arc<Mutex<HashMap<TenantId, Arc<TenantQueue>>>>,
    jobs: Arc<Mutex<HashMap<JobId, Arc<JobCoordinator>>>>,
    workers: Arc<Semaphore>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let cache = DomainCache::with_ttl_hours(config.validation_cache_ttl_hours);
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            config: Arc::new(config),
            events: EventBus::default(),
            cache,
            mx: Arc::new(DnsMxLookup::new()),
            factory: Arc::new(SmtpTransportFactory),
            tenants: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            workers,
        }
    }

    /// Swap the MX resolver (testing, or a custom resolver setup).
    pub fn with_mx_lookup(mut self, mx: Arc<dyn MxLookup>) -> Self {
        self.mx = mx;
        self
    }

    /// Swap the transport factory (testing, or alternative relays).
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// The domain-validation cache, shared across all jobs and tenants.
    pub fn domain_cache(&self) -> DomainCache {
        self.cache.clone()
    }

    /// Accept a job for a tenant. Fails fast with `QueueFull` when the
    /// tenant's pending list is at capacity; never blocks the caller.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        transport: TransportConfig,
        submission: JobSubmission,
    ) -> Result<JobId> {
        transport.validate()?;
        let (recipients, payload) = decode_submission(submission)?;

        let coordinator = Arc::new(JobCoordinator::new(
            tenant_id,
            transport,
            payload,
            recipients,
            self.events.clone(),
        ));
        let job_id = coordinator.job_id();
        let total = coordinator.total_recipients();

        // Registered before it becomes poppable, so a status query can
        // never miss a job a worker already picked up
        self.jobs.lock().await.insert(job_id, coordinator.clone());

        let queue = self.tenant_queue(tenant_id).await;
        let spawn_drainer = {
            let mut inner = queue.inner.lock().await;
            if inner.pending.len() >= self.config.queue_depth {
                drop(inner);
                self.jobs.lock().await.remove(&job_id);
                return Err(Error::QueueFull(tenant_id));
            }
            inner.pending.push_back(coordinator);
            if inner.running < self.config.tenant_concurrency.max(1) {
                inner.running += 1;
                true
            } else {
                false
            }
        };

        info!(
            "job {} queued for tenant {} ({} recipients)",
            job_id, tenant_id, total
        );

        if spawn_drainer {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.drain_tenant(queue).await;
            });
        }

        Ok(job_id)
    }

    /// Request cancellation. Best effort: takes effect at the job's next
    /// suspension-point boundary, never mid-send.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let coordinator = self.lookup(job_id).await?;
        if coordinator.status().await.state.is_terminal() {
            return Err(Error::AlreadyTerminal(job_id));
        }
        coordinator.cancel_token().cancel();
        info!("cancellation requested for job {}", job_id);
        Ok(())
    }

    /// Snapshot of a job's current state and counters.
    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(self.lookup(job_id).await?.status().await)
    }

    /// Terminal summary, once the job has finished.
    pub async fn summary(&self, job_id: JobId) -> Result<Option<JobSummary>> {
        Ok(self.lookup(job_id).await?.summary().await)
    }

    /// Pending jobs for a tenant (running jobs excluded).
    pub async fn queue_depth(&self, tenant_id: TenantId) -> usize {
        let queue = self.tenant_queue(tenant_id).await;
        let inner = queue.inner.lock().await;
        inner.pending.len()
    }

    async fn lookup(&self, job_id: JobId) -> Result<Arc<JobCoordinator>> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    /// Get or lazily create a tenant's queue under the registry lock.
    async fn tenant_queue(&self, tenant_id: TenantId) -> Arc<TenantQueue> {
        let mut tenants = self.tenants.lock().await;
        tenants
            .entry(tenant_id)
            .or_insert_with(|| {
                Arc::new(TenantQueue {
                    inner: Mutex::new(TenantQueueInner::default()),
                })
            })
            .clone()
    }

    /// Run this tenant's pending jobs in FIFO order until none remain.
    /// One drain loop is one admission slot.
    async fn drain_tenant(&self, queue: Arc<TenantQueue>) {
        loop {
            let coordinator = {
                let mut inner = queue.inner.lock().await;
                match inner.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        inner.running -= 1;
                        return;
                    }
                }
            };

            // Bounded worker pool, sized independently of tenant count
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            debug!("worker picked up job {}", coordinator.job_id());
            self.run_job(coordinator).await;
            drop(permit);
        }
    }

    async fn run_job(&self, coordinator: Arc<JobCoordinator>) {
        let transport = match self
            .factory
            .create(coordinator.transport_config(), &self.config)
        {
            Ok(transport) => transport,
            Err(e) => {
                coordinator.fail_without_processing(&e.to_string()).await;
                return;
            }
        };

        let validator = Arc::new(RecipientValidator::new(self.cache.clone(), self.mx.clone()));
        let policy = RetryPolicy::new(
            self.config.max_retries,
            Duration::from_secs_f64(self.config.retry_base_secs),
        );
        let dispatcher = Dispatcher::new(
            validator,
            transport,
            policy,
            self.events.clone(),
            coordinator.job_id(),
            coordinator.tenant_id(),
        );
        let pacing = PacingConfig::from_engine(
            &self.config,
            coordinator.transport_config().delay_seconds,
        );
        let processor = BatchProcessor::new(
            dispatcher,
            pacing,
            self.events.clone(),
            coordinator.job_id(),
            coordinator.tenant_id(),
        );

        coordinator.run(&processor).await;

        // Periodic cache maintenance piggybacks on job completion
        let pruned = self.cache.prune_expired().await;
        if pruned > 0 {
            debug!("pruned {} expired domain verdicts", pruned);
        }
    }
}

/// Decode the submission input into an internal payload. Malformed
/// attachment base64 rejects the whole submission.
fn decode_submission(submission: JobSubmission) -> Result<(Vec<String>, MessagePayload)> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let mut attachments = Vec::with_capacity(submission.attachments.len());
    for attachment in submission.attachments {
        let content = STANDARD.decode(attachment.content_base64.as_bytes()).map_err(|e| {
            Error::Validation(format!(
                "attachment {} is not valid base64: {}",
                attachment.filename, e
            ))
        })?;
        attachments.push(Attachment {
            filename: attachment.filename,
            mime_type: attachment.mime_type,
            content,
        });
    }

    Ok((
        submission.recipients,
        MessagePayload {
            subject: submission.subject,
            body_html: submission.body_html,
            attachments,
        },
    ))
}
