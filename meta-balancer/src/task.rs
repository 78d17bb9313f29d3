//! A single partition move and its state machine.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use meta_common::keys;
use meta_common::store::MetaStore;
use meta_common::types::{GraphSpaceID, HostAddr, JobID, PartitionID};

use crate::admin::AdminClient;

/// Last attempted step of a move. Only ever advances; the persisted value is
/// where a restarted plan resumes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceTaskStatus {
    Start,
    ChangeLeader,
    AddPartAsLearner,
    CatchUpData,
    MemberChangeAdd,
    MemberChangeRemove,
    UpdatePartInfo,
    RemovePart,
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceTaskResult {
    InProgress,
    Succeeded,
    Failed,
    /// Skipped because the plan was stopped before the task started.
    Invalid,
}

/// One `(space, part, src -> dst)` move owned by a [`crate::BalancePlan`].
#[derive(Clone, Debug)]
pub struct BalanceTask {
    pub job_id: JobID,
    pub space_id: GraphSpaceID,
    pub part_id: PartitionID,
    pub src: HostAddr,
    pub dst: HostAddr,
    pub status: BalanceTaskStatus,
    pub result: BalanceTaskResult,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Persisted form of a task, stored per `(job, space, part)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub src: HostAddr,
    pub dst: HostAddr,
    pub status: BalanceTaskStatus,
    pub result: BalanceTaskResult,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl BalanceTask {
    pub fn new(
        job_id: JobID,
        space_id: GraphSpaceID,
        part_id: PartitionID,
        src: HostAddr,
        dst: HostAddr,
    ) -> Self {
        Self {
            job_id,
            space_id,
            part_id,
            src,
            dst,
            status: BalanceTaskStatus::Start,
            result: BalanceTaskResult::InProgress,
            start_ms: 0,
            end_ms: 0,
        }
    }

    pub fn from_record(
        job_id: JobID,
        space_id: GraphSpaceID,
        part_id: PartitionID,
        record: TaskRecord,
    ) -> Self {
        Self {
            job_id,
            space_id,
            part_id,
            src: record.src,
            dst: record.dst,
            status: record.status,
            result: record.result,
            start_ms: record.start_ms,
            end_ms: record.end_ms,
        }
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            src: self.src.clone(),
            dst: self.dst.clone(),
            status: self.status,
            result: self.result,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }

    /// `[job, space:part, src->dst]`, for logs.
    pub fn task_id(&self) -> String {
        format!(
            "[{}, {}:{}, {}->{}]",
            self.job_id, self.space_id, self.part_id, self.src, self.dst
        )
    }

    fn next_status(status: BalanceTaskStatus) -> BalanceTaskStatus {
        match status {
            BalanceTaskStatus::Start => BalanceTaskStatus::ChangeLeader,
            BalanceTaskStatus::ChangeLeader => BalanceTaskStatus::AddPartAsLearner,
            BalanceTaskStatus::AddPartAsLearner => BalanceTaskStatus::CatchUpData,
            BalanceTaskStatus::CatchUpData => BalanceTaskStatus::MemberChangeAdd,
            BalanceTaskStatus::MemberChangeAdd => BalanceTaskStatus::MemberChangeRemove,
            BalanceTaskStatus::MemberChangeRemove => BalanceTaskStatus::UpdatePartInfo,
            BalanceTaskStatus::UpdatePartInfo => BalanceTaskStatus::RemovePart,
            BalanceTaskStatus::RemovePart => BalanceTaskStatus::End,
            BalanceTaskStatus::End => BalanceTaskStatus::End,
        }
    }

    async fn run_step(
        &self,
        step: BalanceTaskStatus,
        admin: &dyn AdminClient,
    ) -> Result<(), crate::admin::AdminError> {
        let space = self.space_id;
        let part = self.part_id;
        match step {
            BalanceTaskStatus::Start => admin.check_peers(space, part).await,
            // The client contract makes this a no-op when src is not the
            // leader, so no leadership pre-check is needed.
            BalanceTaskStatus::ChangeLeader => {
                admin
                    .trans_leader(space, part, &self.src, &HostAddr::any_follower())
                    .await
            }
            BalanceTaskStatus::AddPartAsLearner => {
                admin.add_part(space, part, &self.dst, true).await?;
                admin.add_learner(space, part, &self.dst).await
            }
            BalanceTaskStatus::CatchUpData => {
                admin.waiting_for_catch_up_data(space, part, &self.dst).await
            }
            BalanceTaskStatus::MemberChangeAdd => {
                admin.member_change(space, part, &self.dst, true).await
            }
            BalanceTaskStatus::MemberChangeRemove => {
                admin.member_change(space, part, &self.src, false).await
            }
            BalanceTaskStatus::UpdatePartInfo => {
                admin.update_meta(space, part, &self.src, &self.dst).await
            }
            BalanceTaskStatus::RemovePart => admin.remove_part(space, part, &self.src).await,
            BalanceTaskStatus::End => admin.check_peers(space, part).await,
        }
    }

    pub(crate) async fn persist(&self, store: &dyn MetaStore) -> bool {
        let key = keys::balance_task_key(self.job_id, self.space_id, self.part_id);
        let value = match serde_json::to_vec(&self.record()) {
            Ok(value) => value,
            Err(err) => {
                error!("balance task {} record encode failed: {}", self.task_id(), err);
                return false;
            }
        };
        match store.multi_put(vec![(key, value)]).await {
            Ok(()) => true,
            Err(err) => {
                error!("balance task {} persist failed: {}", self.task_id(), err);
                false
            }
        }
    }

    pub fn mark_invalid(&mut self) {
        self.result = BalanceTaskResult::Invalid;
        self.end_ms = Utc::now().timestamp_millis();
    }

    /// Drive the move to a terminal result, persisting every transition.
    ///
    /// Resumes from the persisted status; re-invoking a task already at
    /// `End`/`Succeeded` is a no-op.
    pub async fn invoke(
        &mut self,
        store: &dyn MetaStore,
        admin: &dyn AdminClient,
    ) -> BalanceTaskResult {
        if self.result == BalanceTaskResult::Succeeded && self.status == BalanceTaskStatus::End {
            return BalanceTaskResult::Succeeded;
        }
        if self.result == BalanceTaskResult::Invalid {
            return BalanceTaskResult::Invalid;
        }

        if self.start_ms == 0 {
            self.start_ms = Utc::now().timestamp_millis();
        }
        self.result = BalanceTaskResult::InProgress;

        // A move onto itself has nothing to do.
        if self.src == self.dst {
            self.status = BalanceTaskStatus::End;
            return self.finish_succeeded(store).await;
        }

        if self.status == BalanceTaskStatus::Start {
            self.fast_forward(store).await;
        }

        loop {
            let step = self.status;
            match self.run_step(step, admin).await {
                Ok(()) => {
                    if step == BalanceTaskStatus::End {
                        return self.finish_succeeded(store).await;
                    }
                    self.status = Self::next_status(step);
                    if !self.persist(store).await {
                        return self.finish_failed(store).await;
                    }
                }
                Err(err) => {
                    error!(
                        "balance task {} failed at {:?}: {}",
                        self.task_id(),
                        step,
                        err
                    );
                    return self.finish_failed(store).await;
                }
            }
        }
    }

    /// The replica set may already record the move (a restart after the
    /// member change completed); skip straight to the metadata update.
    async fn fast_forward(&mut self, store: &dyn MetaStore) {
        let key = keys::part_key(self.space_id, self.part_id);
        let Ok(value) = store.get(&key).await else {
            return;
        };
        let Ok(peers) = serde_json::from_slice::<Vec<HostAddr>>(&value) else {
            return;
        };
        if peers.contains(&self.dst) && !peers.contains(&self.src) {
            info!(
                "balance task {} replica set already moved, resuming at metadata update",
                self.task_id()
            );
            self.status = BalanceTaskStatus::UpdatePartInfo;
        }
    }

    async fn finish_succeeded(&mut self, store: &dyn MetaStore) -> BalanceTaskResult {
        self.result = BalanceTaskResult::Succeeded;
        self.end_ms = Utc::now().timestamp_millis();
        self.persist(store).await;
        let labels = [("space", self.space_id.to_string())];
        metrics::counter!("balance_tasks_succeeded", &labels).increment(1);
        info!("balance task {} finished", self.task_id());
        BalanceTaskResult::Succeeded
    }

    async fn finish_failed(&mut self, store: &dyn MetaStore) -> BalanceTaskResult {
        self.result = BalanceTaskResult::Failed;
        self.end_ms = Utc::now().timestamp_millis();
        self.persist(store).await;
        let labels = [("space", self.space_id.to_string())];
        metrics::counter!("balance_tasks_failed", &labels).increment(1);
        BalanceTaskResult::Failed
    }
}
