//! Bucketed concurrent executor over balance tasks.
//!
//! Tasks sharing a `(space, part)` pair always land in the same bucket, so a
//! single partition is never touched by two moves at once. That is the
//! balancer's core safety property; everything else here is plumbing around
//! it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use meta_common::error::MetaError;
use meta_common::keys;
use meta_common::store::MetaStore;
use meta_common::types::{GraphSpaceID, JobID, PartitionID};

use crate::admin::AdminClient;
use crate::task::{BalanceTask, BalanceTaskResult, TaskRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Running,
    Finished,
    Failed,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PlanRecord {
    status: PlanStatus,
}

/// Final state of an executed plan.
#[derive(Debug)]
pub struct PlanOutcome {
    pub status: PlanStatus,
    pub finished: usize,
    pub tasks: Vec<BalanceTask>,
}

/// Requests a stop of a running plan. In-flight RPCs drain; tasks that have
/// not started are invalidated.
#[derive(Clone)]
pub struct PlanStopHandle(Arc<AtomicBool>);

impl PlanStopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct BalancePlan {
    id: JobID,
    space_id: GraphSpaceID,
    tasks: Vec<BalanceTask>,
    buckets: Vec<Vec<usize>>,
    stopped: Arc<AtomicBool>,
    task_concurrency: usize,
    store: Arc<dyn MetaStore>,
    admin: Arc<dyn AdminClient>,
}

impl std::fmt::Debug for BalancePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancePlan")
            .field("id", &self.id)
            .field("space_id", &self.space_id)
            .field("tasks", &self.tasks)
            .field("buckets", &self.buckets)
            .field("stopped", &self.stopped)
            .field("task_concurrency", &self.task_concurrency)
            .finish()
    }
}

impl BalancePlan {
    pub fn new(
        id: JobID,
        space_id: GraphSpaceID,
        task_concurrency: usize,
        store: Arc<dyn MetaStore>,
        admin: Arc<dyn AdminClient>,
    ) -> Self {
        Self {
            id,
            space_id,
            tasks: Vec::new(),
            buckets: Vec::new(),
            stopped: Arc::new(AtomicBool::new(false)),
            task_concurrency: task_concurrency.max(1),
            store,
            admin,
        }
    }

    /// Rebuild a plan from the task records persisted for `(id, space)`, so
    /// a restarted service can resume it. Succeeded and invalidated tasks
    /// keep their result; everything else re-enters from its saved status.
    pub async fn recover(
        id: JobID,
        space_id: GraphSpaceID,
        task_concurrency: usize,
        store: Arc<dyn MetaStore>,
        admin: Arc<dyn AdminClient>,
    ) -> Result<Self, MetaError> {
        let kvs = store.prefix(&keys::balance_task_prefix(id, space_id)).await?;
        if kvs.is_empty() {
            return Err(MetaError::NotFound);
        }

        let mut plan = Self::new(id, space_id, task_concurrency, store, admin);
        for (key, value) in kvs {
            let Some(part) = keys::parse_balance_task_key(id, space_id, &key) else {
                warn!("skipping unparsable balance task key in job {}", id);
                continue;
            };
            let record: TaskRecord = serde_json::from_slice(&value)?;
            let mut task = BalanceTask::from_record(id, space_id, part, record);
            if !matches!(
                task.result,
                BalanceTaskResult::Succeeded | BalanceTaskResult::Invalid
            ) {
                task.result = BalanceTaskResult::InProgress;
            }
            plan.add_task(task);
        }
        Ok(plan)
    }

    pub fn id(&self) -> JobID {
        self.id
    }

    pub fn add_task(&mut self, task: BalanceTask) {
        self.tasks.push(task);
    }

    pub fn tasks(&self) -> &[BalanceTask] {
        &self.tasks
    }

    pub fn buckets(&self) -> &[Vec<usize>] {
        &self.buckets
    }

    pub fn stop_handle(&self) -> PlanStopHandle {
        PlanStopHandle(self.stopped.clone())
    }

    /// Assign tasks to buckets. Tasks are grouped by `(space, part)` in
    /// first-seen order, then whole groups are dealt round-robin over
    /// `min(task_concurrency, distinct pairs)` buckets.
    pub fn dispatch_tasks(&mut self) {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut group_of: HashMap<(GraphSpaceID, PartitionID), usize> = HashMap::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let pair = (task.space_id, task.part_id);
            match group_of.get(&pair) {
                Some(&group) => groups[group].push(index),
                None => {
                    group_of.insert(pair, groups.len());
                    groups.push(vec![index]);
                }
            }
        }

        if groups.is_empty() {
            self.buckets = Vec::new();
            return;
        }

        let bucket_count = self.task_concurrency.min(groups.len());
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); bucket_count];
        for (group_index, group) in groups.into_iter().enumerate() {
            buckets[group_index % bucket_count].extend(group);
        }
        self.buckets = buckets;
    }

    async fn persist_status(&self, status: PlanStatus) -> Result<(), MetaError> {
        let record = serde_json::to_vec(&PlanRecord { status })?;
        self.store
            .multi_put(vec![(keys::balance_plan_key(self.id, self.space_id), record)])
            .await?;
        Ok(())
    }

    /// Run the plan to completion. Buckets run in parallel and are strictly
    /// serial inside; a task failure fails the plan but never blocks other
    /// partitions.
    pub async fn invoke(mut self) -> Result<PlanOutcome, MetaError> {
        if self.buckets.is_empty() {
            self.dispatch_tasks();
        }

        // Everything is on record before the first RPC goes out.
        let mut batch = vec![(
            keys::balance_plan_key(self.id, self.space_id),
            serde_json::to_vec(&PlanRecord {
                status: PlanStatus::Running,
            })?,
        )];
        for task in &self.tasks {
            batch.push((
                keys::balance_task_key(task.job_id, task.space_id, task.part_id),
                serde_json::to_vec(&task.record())?,
            ));
        }
        self.store.multi_put(batch).await?;

        let total = self.tasks.len();
        if total == 0 {
            self.persist_status(PlanStatus::Finished).await?;
            self.touch_last_update().await;
            return Ok(PlanOutcome {
                status: PlanStatus::Finished,
                finished: 0,
                tasks: Vec::new(),
            });
        }

        info!(
            "invoking balance plan {} with {} tasks over {} buckets",
            self.id,
            total,
            self.buckets.len()
        );

        let mut slots: Vec<Option<BalanceTask>> = self.tasks.drain(..).map(Some).collect();
        let (event_tx, mut event_rx) = mpsc::channel::<(usize, BalanceTask)>(total);
        let mut workers = JoinSet::new();

        for bucket in &self.buckets {
            let bucket_tasks: Vec<(usize, BalanceTask)> = bucket
                .iter()
                .map(|&index| (index, slots[index].take().expect("task dispatched twice")))
                .collect();
            let store = self.store.clone();
            let admin = self.admin.clone();
            let stopped = self.stopped.clone();
            let events = event_tx.clone();

            workers.spawn(async move {
                for (index, mut task) in bucket_tasks {
                    if stopped.load(Ordering::Relaxed) {
                        task.mark_invalid();
                        task.persist(store.as_ref()).await;
                    } else {
                        task.invoke(store.as_ref(), admin.as_ref()).await;
                    }
                    if events.send((index, task)).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(event_tx);

        let mut finished = 0usize;
        let mut failed = 0usize;
        while let Some((index, task)) = event_rx.recv().await {
            finished += 1;
            if task.result == BalanceTaskResult::Failed {
                failed += 1;
            }
            info!(
                "balance plan {}: task {} finished {:?} ({}/{})",
                self.id,
                task.task_id(),
                task.result,
                finished,
                total
            );
            slots[index] = Some(task);
        }
        while workers.join_next().await.is_some() {}

        let status = if self.stopped.load(Ordering::Relaxed) {
            PlanStatus::Stopped
        } else if failed > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Finished
        };
        self.persist_status(status).await?;
        self.touch_last_update().await;

        let labels = [("status", format!("{status:?}"))];
        metrics::counter!("balance_plans_total", &labels).increment(1);
        info!(
            "balance plan {} ended {:?}, {} of {} tasks finished",
            self.id, status, finished, total
        );

        Ok(PlanOutcome {
            status,
            finished,
            tasks: slots.into_iter().flatten().collect(),
        })
    }

    async fn touch_last_update(&self) {
        let now = Utc::now().timestamp_millis();
        let value = match serde_json::to_vec(&now) {
            Ok(value) => value,
            Err(_) => return,
        };
        if let Err(err) = self
            .store
            .multi_put(vec![(keys::last_update_time_key(), value)])
            .await
        {
            warn!("balance plan {} last-update marker write failed: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meta_common::store::MemStore;
    use meta_common::types::HostAddr;

    use crate::admin::MockAdminClient;

    fn plan_with(
        concurrency: usize,
        store: Arc<MemStore>,
        admin: Arc<MockAdminClient>,
    ) -> BalancePlan {
        BalancePlan::new(101, 1, concurrency, store, admin)
    }

    fn move_task(part: PartitionID, index: i32) -> BalanceTask {
        BalanceTask::new(
            101,
            1,
            part,
            HostAddr::new(index.to_string(), 0),
            HostAddr::new(index.to_string(), 1),
        )
    }

    #[tokio::test]
    async fn tasks_on_one_partition_share_a_bucket() {
        let mut plan = plan_with(
            10,
            Arc::new(MemStore::new()),
            Arc::new(MockAdminClient::new()),
        );
        for i in 0..20 {
            plan.add_task(move_task(0, i));
        }
        plan.dispatch_tasks();

        assert_eq!(plan.buckets().len(), 1);
        assert_eq!(plan.buckets()[0].len(), 20);
    }

    #[tokio::test]
    async fn distinct_partitions_spread_over_buckets() {
        let mut plan = plan_with(
            10,
            Arc::new(MemStore::new()),
            Arc::new(MockAdminClient::new()),
        );
        for i in 0..5 {
            plan.add_task(move_task(i, i));
        }
        plan.dispatch_tasks();

        assert_eq!(plan.buckets().len(), 5);
        for bucket in plan.buckets() {
            assert_eq!(bucket.len(), 1);
        }
    }

    #[tokio::test]
    async fn groups_deal_round_robin() {
        let mut plan = plan_with(
            20,
            Arc::new(MemStore::new()),
            Arc::new(MockAdminClient::new()),
        );
        for i in 0..5 {
            plan.add_task(move_task(i, i));
        }
        for i in 0..10 {
            plan.add_task(move_task(i, 100 + i));
        }
        plan.dispatch_tasks();

        // 10 distinct partitions, 15 tasks in total.
        assert_eq!(plan.buckets().len(), 10);
        let mut total = 0;
        for bucket in plan.buckets() {
            assert!((1..=2).contains(&bucket.len()));
            total += bucket.len();
        }
        assert_eq!(total, 15);
    }

    #[tokio::test]
    async fn single_bucket_plan_finishes_all_tasks() {
        let store = Arc::new(MemStore::new());
        let admin = Arc::new(MockAdminClient::new());
        let mut plan = plan_with(10, store.clone(), admin.clone());
        for i in 0..10 {
            plan.add_task(move_task(0, i));
        }

        let outcome = plan.invoke().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Finished);
        assert_eq!(outcome.finished, 10);
        assert!(outcome
            .tasks
            .iter()
            .all(|task| task.result == BalanceTaskResult::Succeeded));

        let value = store.get(&keys::balance_plan_key(101, 1)).await.unwrap();
        let record: PlanRecord = serde_json::from_slice(&value).unwrap();
        assert_eq!(record.status, PlanStatus::Finished);
        assert!(store.get(&keys::last_update_time_key()).await.is_ok());
    }

    #[tokio::test]
    async fn one_failing_task_fails_the_plan_but_not_other_buckets() {
        let store = Arc::new(MemStore::new());
        let admin = Arc::new(MockAdminClient::new());
        admin.fail_on_part("trans_leader", 9, "transfer failed");

        let mut plan = plan_with(10, store, admin);
        for i in 0..10 {
            plan.add_task(move_task(i, i));
        }

        let outcome = plan.invoke().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        assert_eq!(outcome.finished, 10);
        let failed: Vec<_> = outcome
            .tasks
            .iter()
            .filter(|task| task.result == BalanceTaskResult::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].part_id, 9);
        assert_eq!(failed[0].status, crate::task::BalanceTaskStatus::ChangeLeader);
    }

    #[tokio::test]
    async fn stop_invalidates_tasks_that_have_not_started() {
        let store = Arc::new(MemStore::new());
        let admin = Arc::new(MockAdminClient::new());
        admin.set_delay(Duration::from_millis(30));

        let mut plan = plan_with(10, store, admin);
        for i in 0..5 {
            plan.add_task(move_task(0, i));
        }
        let stop = plan.stop_handle();

        let running = tokio::spawn(plan.invoke());
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.status, PlanStatus::Stopped);
        assert_eq!(outcome.finished, 5);
        assert!(outcome
            .tasks
            .iter()
            .any(|task| task.result == BalanceTaskResult::Invalid));
        assert!(outcome
            .tasks
            .iter()
            .any(|task| task.result == BalanceTaskResult::Succeeded));
    }

    #[tokio::test]
    async fn recover_resumes_unfinished_tasks() {
        let store = Arc::new(MemStore::new());
        let admin = Arc::new(MockAdminClient::new());
        admin.fail_on_part("remove_part", 1, "src unreachable");

        let mut plan = plan_with(10, store.clone(), admin);
        plan.add_task(move_task(0, 0));
        plan.add_task(move_task(1, 1));
        let outcome = plan.invoke().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Failed);

        // Recover against a healthy cluster: the failed task resumes from
        // RemovePart, the succeeded one is left alone.
        let admin = Arc::new(MockAdminClient::new());
        let recovered = BalancePlan::recover(101, 1, 10, store, admin.clone())
            .await
            .unwrap();
        assert_eq!(recovered.tasks().len(), 2);

        let outcome = recovered.invoke().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Finished);
        let ops: Vec<String> = admin
            .calls()
            .iter()
            .map(|call| call.split(' ').next().unwrap().to_owned())
            .collect();
        assert_eq!(ops, vec!["remove_part", "check_peers"]);
    }

    #[tokio::test]
    async fn missing_job_cannot_be_recovered() {
        let result = BalancePlan::recover(
            7,
            1,
            10,
            Arc::new(MemStore::new()),
            Arc::new(MockAdminClient::new()),
        )
        .await;
        assert!(matches!(result, Err(MetaError::NotFound)));
    }
}
