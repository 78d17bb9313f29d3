//! Data balance planning: turn the current placement of a space into a list
//! of moves that re-homes replicas from lost hosts and evens out per-host
//! partition counts.

use std::sync::Arc;

use tracing::{error, info};

use meta_common::error::MetaError;
use meta_common::store::{MetaStore, SpaceLock};
use meta_common::types::{GraphSpaceID, HostAddr, HostParts, JobID, PartitionID};

use crate::admin::AdminClient;
use crate::config::BalancerConfig;
use crate::plan::BalancePlan;
use crate::task::BalanceTask;
use crate::topology::{
    self, assemble_zone_parts, check_zone_legal, get_active_hosts, get_active_hosts_in_group,
    ZoneParts,
};

pub struct DataBalancer {
    config: BalancerConfig,
    store: Arc<dyn MetaStore>,
    admin: Arc<dyn AdminClient>,
    space_lock: Arc<SpaceLock>,
}

impl DataBalancer {
    pub fn new(
        config: BalancerConfig,
        store: Arc<dyn MetaStore>,
        admin: Arc<dyn AdminClient>,
        space_lock: Arc<SpaceLock>,
    ) -> Self {
        Self {
            config,
            store,
            admin,
            space_lock,
        }
    }

    /// Plan the moves for a space and wrap them into an executable plan.
    ///
    /// Returns [`MetaError::Balanced`] when there is nothing to do, and
    /// refuses to produce any plan at all when a required move would be
    /// quorum-unsafe.
    pub async fn build_plan(
        &self,
        job_id: JobID,
        space: GraphSpaceID,
        lost_hosts: Vec<HostAddr>,
    ) -> Result<BalancePlan, MetaError> {
        let had_lost_hosts = !lost_hosts.is_empty();
        let tasks = self.gen_tasks(job_id, space, lost_hosts).await?;
        if tasks.is_empty() && !had_lost_hosts {
            info!("space {} already balanced", space);
            return Err(MetaError::Balanced);
        }

        let mut plan = BalancePlan::new(
            job_id,
            space,
            self.config.task_concurrency,
            self.store.clone(),
            self.admin.clone(),
        );
        for task in tasks {
            plan.add_task(task);
        }
        plan.dispatch_tasks();
        Ok(plan)
    }

    /// Generate the move tasks for a space.
    pub async fn gen_tasks(
        &self,
        job_id: JobID,
        space: GraphSpaceID,
        lost_hosts: Vec<HostAddr>,
    ) -> Result<Vec<BalanceTask>, MetaError> {
        // The placement and topology snapshot must not race a schema change.
        let guard = self.space_lock.read().await;
        let props = topology::load_space_properties(self.store.as_ref(), space).await?;
        let (host_parts, distinct_parts) =
            topology::load_host_parts(self.store.as_ref(), space).await?;
        if distinct_parts == 0 || host_parts.is_empty() {
            error!("space {} has no partition records", space);
            return Err(MetaError::NotFound);
        }
        if distinct_parts != props.partition_num as usize {
            error!(
                "space {}: {} partition records but partition_num is {}",
                space, distinct_parts, props.partition_num
            );
            return Err(MetaError::NotFound);
        }

        let zone_parts = match &props.group_name {
            Some(group) => Some(assemble_zone_parts(self.store.as_ref(), group, &host_parts).await?),
            None => None,
        };
        drop(guard);

        let active_hosts = if props.group_name.is_some() {
            get_active_hosts_in_group(self.store.as_ref(), space, self.config.heartbeat_interval)
                .await?
        } else {
            get_active_hosts(self.store.as_ref(), self.config.heartbeat_interval).await?
        };

        let total_parts = distinct_parts * props.replica_factor as usize;
        let (expand, lost) = Self::cal_diff(&host_parts, &active_hosts, lost_hosts);

        // The placement we are steering towards: newly added hosts start
        // empty, lost hosts are gone.
        let mut confirmed = host_parts.clone();
        for host in &expand {
            info!("found new host {}", host);
            confirmed.entry(host.clone()).or_default();
        }
        for host in &lost {
            info!("lost host {}", host);
            confirmed.remove(host);
        }

        let mut tasks = Vec::new();
        for lost_host in &lost {
            let parts = host_parts.get(lost_host).cloned().unwrap_or_default();
            for part in parts {
                Self::check_replica(&host_parts, &active_hosts, props.replica_factor, part)?;
                let target = Self::host_with_minimal_parts(
                    &confirmed,
                    part,
                    zone_parts.as_ref().map(|zones| (zones, lost_host)),
                )?;
                confirmed
                    .get_mut(&target)
                    .ok_or_else(|| MetaError::BadBalancePlan(format!("target {target} vanished")))?
                    .push(part);
                tasks.push(BalanceTask::new(
                    job_id,
                    space,
                    part,
                    lost_host.clone(),
                    target,
                ));
            }
        }

        if confirmed.len() < 2 {
            return Err(MetaError::NoValidHost(
                "too few hosts left to balance".to_owned(),
            ));
        }

        Self::balance_parts(job_id, space, &mut confirmed, total_parts, &mut tasks)?;
        info!("space {}: {} balance tasks generated", space, tasks.len());
        Ok(tasks)
    }

    /// Split the difference between the recorded placement and the live host
    /// set: hosts that appeared, and hosts that are gone or explicitly
    /// removed (deduplicated, in first-seen order).
    fn cal_diff(
        host_parts: &HostParts,
        active_hosts: &[HostAddr],
        explicit_lost: Vec<HostAddr>,
    ) -> (Vec<HostAddr>, Vec<HostAddr>) {
        let mut lost: Vec<HostAddr> = Vec::new();
        for host in explicit_lost {
            if !lost.contains(&host) {
                lost.push(host);
            }
        }
        for host in host_parts.keys() {
            if !active_hosts.contains(host) && !lost.contains(host) {
                lost.push(host.clone());
            }
        }

        let mut expand = Vec::new();
        for host in active_hosts {
            if !host_parts.contains_key(host) {
                expand.push(host.clone());
            }
        }
        (expand, lost)
    }

    /// The write quorum of a partition must survive the move: enough of its
    /// replicas have to be alive before we touch it.
    fn check_replica(
        host_parts: &HostParts,
        active_hosts: &[HostAddr],
        replica_factor: i32,
        part: PartitionID,
    ) -> Result<(), MetaError> {
        let alive = host_parts
            .iter()
            .filter(|(host, parts)| parts.contains(&part) && active_hosts.contains(host))
            .count() as i32;
        if alive >= replica_factor / 2 + 1 {
            Ok(())
        } else {
            Err(MetaError::NoValidHost(format!(
                "not enough alive replicas of part {part}: {alive} of {replica_factor}"
            )))
        }
    }

    fn sorted_hosts_by_parts(host_parts: &HostParts) -> Vec<(HostAddr, usize)> {
        let mut hosts: Vec<(HostAddr, usize)> = host_parts
            .iter()
            .map(|(host, parts)| (host.clone(), parts.len()))
            .collect();
        hosts.sort_by_key(|(_, count)| *count);
        hosts
    }

    /// The least-loaded host that does not already hold the partition and,
    /// when zone context is given, would accept it legally.
    fn host_with_minimal_parts(
        confirmed: &HostParts,
        part: PartitionID,
        zone: Option<(&ZoneParts, &HostAddr)>,
    ) -> Result<HostAddr, MetaError> {
        for (host, _) in Self::sorted_hosts_by_parts(confirmed) {
            let holds_part = confirmed
                .get(&host)
                .map(|parts| parts.contains(&part))
                .unwrap_or(true);
            if holds_part {
                continue;
            }
            if let Some((zone_parts, src)) = zone {
                if !check_zone_legal(zone_parts, src, &host, part) {
                    continue;
                }
            }
            return Ok(host);
        }
        Err(MetaError::NoValidHost(format!(
            "no host is suitable for part {part}"
        )))
    }

    /// Even out per-host counts to within `floor(avg)..=ceil(avg)` by moving
    /// partitions from the fullest host to the emptiest.
    fn balance_parts(
        job_id: JobID,
        space: GraphSpaceID,
        confirmed: &mut HostParts,
        total_parts: usize,
        tasks: &mut Vec<BalanceTask>,
    ) -> Result<(), MetaError> {
        if confirmed.is_empty() {
            return Err(MetaError::BadBalancePlan("no hosts to balance".to_owned()));
        }
        let avg = total_parts as f64 / confirmed.len() as f64;
        let min_load = avg.floor() as usize;
        let max_load = avg.ceil() as usize;

        let mut sorted = Self::sorted_hosts_by_parts(confirmed);
        let mut min_host = sorted.first().cloned().expect("sorted hosts are not empty");
        let mut max_host = sorted.last().cloned().expect("sorted hosts are not empty");

        while max_host.1 > max_load || min_host.1 < min_load {
            let mut parts_from = confirmed[&max_host.0].clone();
            let mut parts_to = confirmed[&min_host.0].clone();
            parts_from.sort_unstable();
            parts_to.sort_unstable();
            let candidates: Vec<PartitionID> = parts_from
                .iter()
                .copied()
                .filter(|part| parts_to.binary_search(part).is_err())
                .collect();

            let mut moved = false;
            for part in candidates {
                let from_len = confirmed[&max_host.0].len();
                let to_len = confirmed[&min_host.0].len();
                // Stopping at a one-part gap is deliberate: chasing exact
                // equality here would make the outer loop oscillate.
                if from_len == to_len + 1 || from_len == min_load || to_len == max_load {
                    break;
                }

                let from = confirmed
                    .get_mut(&max_host.0)
                    .ok_or_else(|| MetaError::BadBalancePlan("source host vanished".to_owned()))?;
                let position = from.iter().position(|p| *p == part).ok_or_else(|| {
                    MetaError::BadBalancePlan(format!("part {part} missing from source"))
                })?;
                from.remove(position);

                let to = confirmed
                    .get_mut(&min_host.0)
                    .ok_or_else(|| MetaError::BadBalancePlan("target host vanished".to_owned()))?;
                if to.contains(&part) {
                    return Err(MetaError::BadBalancePlan(format!(
                        "part {part} already on target"
                    )));
                }
                to.push(part);

                info!(
                    "[space:{}, part:{}] {} -> {}",
                    space, part, max_host.0, min_host.0
                );
                tasks.push(BalanceTask::new(
                    job_id,
                    space,
                    part,
                    max_host.0.clone(),
                    min_host.0.clone(),
                ));
                moved = true;
            }

            if !moved {
                // No legal move between the extremes; any further pass would
                // pick the same pair again.
                info!("no further balance action possible");
                break;
            }
            sorted = Self::sorted_hosts_by_parts(confirmed);
            min_host = sorted.first().cloned().expect("sorted hosts are not empty");
            max_host = sorted.last().cloned().expect("sorted hosts are not empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(i: u16) -> HostAddr {
        HostAddr::new(i.to_string(), 0)
    }

    fn placement(assignments: &[(u16, &[PartitionID])]) -> HostParts {
        assignments
            .iter()
            .map(|(h, parts)| (host(*h), parts.to_vec()))
            .collect()
    }

    #[test]
    fn balance_fills_an_empty_host() {
        let mut confirmed = placement(&[
            (0, &[1, 2, 3, 4]),
            (1, &[1, 2, 3, 4]),
            (2, &[1, 2, 3, 4]),
            (3, &[]),
        ]);
        let mut tasks = Vec::new();

        DataBalancer::balance_parts(0, 1, &mut confirmed, 12, &mut tasks).unwrap();

        for parts in confirmed.values() {
            assert_eq!(parts.len(), 3);
        }
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            assert_eq!(task.dst, host(3));
            assert_ne!(task.src, task.dst);
        }
    }

    #[test]
    fn balance_spreads_over_doubled_host_count() {
        let mut confirmed = placement(&[
            (0, &[1, 2, 3, 4]),
            (1, &[1, 2, 3, 4]),
            (2, &[1, 2, 3, 4]),
            (3, &[]),
            (4, &[]),
            (5, &[]),
        ]);
        let mut tasks = Vec::new();

        DataBalancer::balance_parts(0, 1, &mut confirmed, 12, &mut tasks).unwrap();

        for parts in confirmed.values() {
            assert_eq!(parts.len(), 2);
        }
        assert_eq!(tasks.len(), 6);
    }

    #[test]
    fn balance_is_idempotent_once_within_bounds() {
        let mut confirmed = placement(&[(0, &[1, 2]), (1, &[3, 4]), (2, &[1, 3])]);
        let mut tasks = Vec::new();

        DataBalancer::balance_parts(0, 1, &mut confirmed, 6, &mut tasks).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn heavily_skewed_cluster_lands_near_the_bounds() {
        let all_parts: Vec<PartitionID> = (0..81).collect();
        let mut confirmed = HostParts::new();
        for i in 0..18u16 {
            if i == 10 || i == 12 || i == 14 {
                confirmed.insert(host(i), all_parts.clone());
            } else {
                confirmed.insert(host(i), Vec::new());
            }
        }
        let mut tasks = Vec::new();

        DataBalancer::balance_parts(0, 3, &mut confirmed, 243, &mut tasks).unwrap();

        // avg = 13.5; the one-part-gap stop rule can leave hosts one step
        // outside [13, 14].
        let mut total = 0;
        for parts in confirmed.values() {
            assert!(parts.len() >= 12, "host below 12: {}", parts.len());
            assert!(parts.len() <= 15, "host above 15: {}", parts.len());
            total += parts.len();
        }
        assert_eq!(total, 243);

        // No partition ends up twice on one host.
        for parts in confirmed.values() {
            let mut sorted = parts.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), parts.len());
        }
    }

    #[test]
    fn no_task_moves_a_part_onto_itself() {
        let mut confirmed = placement(&[(0, &[1, 2, 3, 4, 5, 6]), (1, &[1, 2]), (2, &[])]);
        let mut tasks = Vec::new();

        DataBalancer::balance_parts(0, 1, &mut confirmed, 8, &mut tasks).unwrap();
        for task in &tasks {
            assert_ne!(task.src, task.dst);
        }
    }

    #[test]
    fn diff_finds_expansion_and_loss() {
        let host_parts = placement(&[(0, &[1]), (1, &[1]), (2, &[1])]);
        let active = vec![host(0), host(1), host(3)];

        let (expand, lost) =
            DataBalancer::cal_diff(&host_parts, &active, vec![host(1), host(1)]);

        assert_eq!(expand, vec![host(3)]);
        // Explicit losses first, deduplicated, then the silent one.
        assert_eq!(lost, vec![host(1), host(2)]);
    }

    #[test]
    fn quorum_check_counts_only_alive_holders() {
        let host_parts = placement(&[(0, &[7]), (1, &[7]), (2, &[7])]);

        // Two of three replicas alive: the quorum survives.
        let active = vec![host(0), host(1)];
        assert!(DataBalancer::check_replica(&host_parts, &active, 3, 7).is_ok());

        // One alive replica cannot sustain a write quorum of two.
        let active = vec![host(0)];
        let err = DataBalancer::check_replica(&host_parts, &active, 3, 7).unwrap_err();
        assert!(matches!(err, MetaError::NoValidHost(_)));
    }

    #[test]
    fn minimal_parts_host_skips_existing_holders() {
        let confirmed = placement(&[(0, &[7, 8]), (1, &[7]), (2, &[7, 8, 9])]);

        let target = DataBalancer::host_with_minimal_parts(&confirmed, 8, None).unwrap();
        assert_eq!(target, host(1));

        // Every host already holds part 7.
        let err = DataBalancer::host_with_minimal_parts(&confirmed, 7, None).unwrap_err();
        assert!(matches!(err, MetaError::NoValidHost(_)));
    }
}
