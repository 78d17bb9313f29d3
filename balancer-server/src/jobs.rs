//! Balance job queue and runner.
//!
//! Jobs are validated fully before anything is persisted, then queued and
//! executed one at a time: concurrency lives inside a plan's buckets, not
//! across plans.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use health::HealthHandle;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use meta_balancer::{DataBalancer, LeaderBalancer, PlanStatus, PlanStopHandle};
use meta_common::error::MetaError;
use meta_common::keys;
use meta_common::store::MetaStore;
use meta_common::types::{GraphSpaceID, HostAddr, JobID, JobRecord, JobStatus};

pub struct QueuedJob {
    pub job_id: JobID,
    pub space: GraphSpaceID,
    pub lost_hosts: Vec<HostAddr>,
}

pub struct JobManager {
    store: Arc<dyn MetaStore>,
    balancer: DataBalancer,
    leader: LeaderBalancer,
    queue: mpsc::Sender<QueuedJob>,
    running: Mutex<HashMap<JobID, PlanStopHandle>>,
    next_job_id: AtomicI32,
}

impl JobManager {
    /// Build the manager, continuing job ids after whatever is already
    /// persisted.
    pub async fn new(
        store: Arc<dyn MetaStore>,
        balancer: DataBalancer,
        leader: LeaderBalancer,
    ) -> Result<(Self, mpsc::Receiver<QueuedJob>), MetaError> {
        let mut last_id = 0;
        for (key, _) in store.prefix(&keys::job_prefix()).await? {
            if let Some(job_id) = keys::parse_job_key(&key) {
                last_id = last_id.max(job_id);
            }
        }

        let (tx, rx) = mpsc::channel(64);
        let manager = Self {
            store,
            balancer,
            leader,
            queue: tx,
            running: Mutex::new(HashMap::new()),
            next_job_id: AtomicI32::new(last_id + 1),
        };
        Ok((manager, rx))
    }

    /// Validate and enqueue a balance job. Parameters are `[spaceName]` or
    /// `[hostList, spaceName]`; nothing is persisted unless they parse.
    pub async fn submit(&self, paras: Vec<String>) -> Result<JobID, MetaError> {
        let (lost_hosts, space_name) = parse_paras(&paras)?;
        let space = self.resolve_space(space_name).await?;

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord {
            status: JobStatus::Queued,
            start_ms: Utc::now().timestamp_millis(),
            end_ms: 0,
            paras,
        };
        self.persist_record(job_id, &record).await?;

        self.queue
            .send(QueuedJob {
                job_id,
                space,
                lost_hosts,
            })
            .await
            .map_err(|_| MetaError::Unknown("job queue closed".to_owned()))?;
        info!("queued balance job {} for space {}", job_id, space);
        Ok(job_id)
    }

    pub async fn resolve_space(&self, name: &str) -> Result<GraphSpaceID, MetaError> {
        let value = self.store.get(&keys::space_name_key(name)).await?;
        Ok(serde_json::from_slice(&value)?)
    }

    pub async fn job_record(&self, job_id: JobID) -> Result<JobRecord, MetaError> {
        let value = self.store.get(&keys::job_key(job_id)).await?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Request a stop of a running job's plan. In-flight RPCs drain first.
    pub fn stop(&self, job_id: JobID) -> Result<(), MetaError> {
        match self.running.lock().unwrap().get(&job_id) {
            Some(handle) => {
                handle.stop();
                info!("stop requested for balance job {}", job_id);
                Ok(())
            }
            None => Err(MetaError::NotFound),
        }
    }

    pub async fn leader_balance(&self, space_name: &str) -> Result<usize, MetaError> {
        let space = self.resolve_space(space_name).await?;
        let plan = self.leader.leader_balance(space).await?;
        Ok(plan.len())
    }

    async fn persist_record(&self, job_id: JobID, record: &JobRecord) -> Result<(), MetaError> {
        self.store
            .multi_put(vec![(keys::job_key(job_id), serde_json::to_vec(record)?)])
            .await?;
        Ok(())
    }

    async fn set_status(&self, job_id: JobID, status: JobStatus, terminal: bool) {
        let mut record = match self.job_record(job_id).await {
            Ok(record) => record,
            Err(err) => {
                error!("job {} record read failed: {}", job_id, err);
                return;
            }
        };
        record.status = status;
        if terminal {
            record.end_ms = Utc::now().timestamp_millis();
        }
        if let Err(err) = self.persist_record(job_id, &record).await {
            error!("job {} status persist failed: {}", job_id, err);
        }
    }

    /// Run one queued job to completion.
    pub async fn execute(&self, job: QueuedJob) {
        info!("balance job {} started on space {}", job.job_id, job.space);
        self.set_status(job.job_id, JobStatus::Running, false).await;

        let plan = match self
            .balancer
            .build_plan(job.job_id, job.space, job.lost_hosts)
            .await
        {
            Ok(plan) => plan,
            Err(MetaError::Balanced) => {
                info!("balance job {}: nothing to do", job.job_id);
                self.set_status(job.job_id, JobStatus::Finished, true).await;
                return;
            }
            Err(err @ (MetaError::StoreFailure(_) | MetaError::LeaderChanged)) => {
                // Transient: leave the job queued so a later submission can
                // retry against a healthy store.
                warn!("balance job {} hit a transient error: {}", job.job_id, err);
                self.set_status(job.job_id, JobStatus::Queued, false).await;
                return;
            }
            Err(err) => {
                error!("balance job {} planning failed: {} ({})", job.job_id, err, err.code());
                self.set_status(job.job_id, JobStatus::Failed, true).await;
                return;
            }
        };

        self.running
            .lock()
            .unwrap()
            .insert(job.job_id, plan.stop_handle());
        let outcome = plan.invoke().await;
        self.running.lock().unwrap().remove(&job.job_id);

        let status = match outcome {
            Ok(outcome) => match outcome.status {
                PlanStatus::Finished => JobStatus::Finished,
                PlanStatus::Stopped => JobStatus::Stopped,
                _ => JobStatus::Failed,
            },
            Err(err) => {
                error!("balance job {} execution failed: {}", job.job_id, err);
                JobStatus::Failed
            }
        };
        self.set_status(job.job_id, status, true).await;

        let labels = [("status", format!("{status:?}"))];
        metrics::counter!("balance_jobs_total", &labels).increment(1);
        info!("balance job {} ended {:?}", job.job_id, status);
    }
}

/// Drain the job queue, reporting liveness between jobs.
pub async fn run(
    manager: Arc<JobManager>,
    mut queue: mpsc::Receiver<QueuedJob>,
    liveness: HealthHandle,
) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
    loop {
        tokio::select! {
            job = queue.recv() => match job {
                Some(job) => manager.execute(job).await,
                None => break,
            },
            _ = interval.tick() => liveness.report_healthy().await,
        }
    }
}

/// `[spaceName]` or `[comma-separated-host-list, spaceName]`.
fn parse_paras(paras: &[String]) -> Result<(Vec<HostAddr>, &str), MetaError> {
    match paras {
        [space_name] => Ok((Vec::new(), space_name)),
        [host_list, space_name] => {
            let mut hosts = Vec::new();
            for address in host_list.split(',') {
                let host = address.trim().parse::<HostAddr>().map_err(|err| {
                    MetaError::InvalidParameter(err.to_string())
                })?;
                hosts.push(host);
            }
            Ok((hosts, space_name))
        }
        _ => Err(MetaError::InvalidParameter(format!(
            "expected 1 or 2 parameters, got {}",
            paras.len()
        ))),
    }
}
