//! Leader balance: even out Raft leadership across hosts without moving any
//! data. The output is purely advisory; executing it is one leadership
//! transfer per entry.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use meta_common::error::MetaError;
use meta_common::store::{MetaStore, SpaceLock};
use meta_common::types::{
    GraphSpaceID, HostAddr, HostLeaderMap, PartAllocation, PartitionID,
};

use crate::admin::AdminClient;
use crate::config::BalancerConfig;
use crate::topology::{
    self, assemble_zone_parts, get_active_hosts, get_active_hosts_in_group, ZoneParts,
};

/// `(space, part, from, to)` leadership handoffs.
pub type LeaderBalancePlan = Vec<(GraphSpaceID, PartitionID, HostAddr, HostAddr)>;

/// Inclusive per-host bounds on the acceptable leader count.
type HostBounds = HashMap<HostAddr, (usize, usize)>;

/// A single pass rarely converges when the deviation window is tight; give
/// the counts a few rounds to settle instead.
const MAX_PASSES: usize = 3;

pub struct LeaderBalancer {
    config: BalancerConfig,
    store: Arc<dyn MetaStore>,
    admin: Arc<dyn AdminClient>,
    space_lock: Arc<SpaceLock>,
}

impl LeaderBalancer {
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

    /// Gather the live leader distribution, plan the handoffs for a space
    /// and dispatch them. Failed transfers are logged and counted, never
    /// retried here; the next round will see the remaining imbalance.
    pub async fn leader_balance(&self, space: GraphSpaceID) -> Result<LeaderBalancePlan, MetaError> {
        let dist = self
            .admin
            .get_leader_dist()
            .await
            .map_err(|error| MetaError::Unknown(error.to_string()))?;

        let plan = self.build_leader_balance_plan(space, &dist, true).await?;
        if plan.is_empty() {
            return Err(MetaError::Balanced);
        }

        let transfers = plan.iter().map(|(space, part, from, to)| {
            self.admin.trans_leader(*space, *part, from, to)
        });
        let failures = join_all(transfers)
            .await
            .into_iter()
            .filter_map(Result::err)
            .inspect(|error| warn!("leader transfer failed: {}", error))
            .count();

        let labels = [("space", space.to_string())];
        metrics::counter!("leader_transfers_total", &labels).increment(plan.len() as u64);
        if failures > 0 {
            metrics::counter!("leader_transfers_failed", &labels).increment(failures as u64);
        }
        info!(
            "leader balance of space {}: {} transfers, {} failed",
            space,
            plan.len(),
            failures
        );
        Ok(plan)
    }

    /// Plan the handoffs that bring every host's leader count inside its
    /// deviation bounds, from a snapshot of the live leader distribution.
    pub async fn build_leader_balance_plan(
        &self,
        space: GraphSpaceID,
        host_leader_map: &HostLeaderMap,
        use_deviation: bool,
    ) -> Result<LeaderBalancePlan, MetaError> {
        let guard = self.space_lock.read().await;
        let props = topology::load_space_properties(self.store.as_ref(), space).await?;
        let (host_parts, distinct_parts) =
            topology::load_host_parts(self.store.as_ref(), space).await?;
        if distinct_parts == 0 || distinct_parts != props.partition_num as usize {
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
        if active_hosts.is_empty() {
            return Err(MetaError::NoValidHost("no active hosts".to_owned()));
        }

        let mut peers_map = PartAllocation::new();
        for (host, parts) in &host_parts {
            for part in parts {
                peers_map.entry(*part).or_default().push(host.clone());
            }
        }

        // Every active host participates, leaders or not.
        let mut leader_parts: HashMap<HostAddr, Vec<PartitionID>> = active_hosts
            .iter()
            .map(|host| {
                let leaders = host_leader_map
                    .get(host)
                    .and_then(|spaces| spaces.get(&space))
                    .cloned()
                    .unwrap_or_default();
                (host.clone(), leaders)
            })
            .collect();

        let bounds = Self::calculate_host_bounds(
            distinct_parts,
            &active_hosts,
            self.config.leader_balance_deviation,
            use_deviation,
        );

        let mut plan = LeaderBalancePlan::new();
        for _ in 0..MAX_PASSES {
            let mut moved = 0;
            moved += Self::give_up_leaders(
                &mut leader_parts,
                &peers_map,
                &bounds,
                zone_parts.as_ref(),
                space,
                &mut plan,
            );
            moved += Self::acquire_leaders(
                &mut leader_parts,
                &peers_map,
                &bounds,
                space,
                &mut plan,
            );

            let settled = leader_parts.iter().all(|(host, parts)| {
                bounds
                    .get(host)
                    .map(|&(lower, upper)| parts.len() >= lower && parts.len() <= upper)
                    .unwrap_or(true)
            });
            if settled || moved == 0 {
                break;
            }
        }

        Self::simplify(&mut plan);
        Ok(plan)
    }

    /// Ideal leader share per host, widened by the configured deviation (or
    /// by one when deviation is off).
    fn calculate_host_bounds(
        part_count: usize,
        hosts: &[HostAddr],
        deviation: f64,
        use_deviation: bool,
    ) -> HostBounds {
        let ideal = part_count as f64 / hosts.len() as f64;
        let dev = if use_deviation {
            (ideal * deviation).ceil() as i64
        } else {
            1
        };
        let lower = ((ideal.ceil() as i64) - dev).max(0) as usize;
        let upper = ((ideal.floor() as i64) + dev).max(0) as usize;
        hosts
            .iter()
            .map(|host| (host.clone(), (lower, upper)))
            .collect()
    }

    /// Hosts above their upper bound hand leaders to peers that are still
    /// below their lower bound.
    fn give_up_leaders(
        leader_parts: &mut HashMap<HostAddr, Vec<PartitionID>>,
        peers_map: &PartAllocation,
        bounds: &HostBounds,
        zone_parts: Option<&ZoneParts>,
        space: GraphSpaceID,
        plan: &mut LeaderBalancePlan,
    ) -> usize {
        let mut sources: Vec<HostAddr> = leader_parts.keys().cloned().collect();
        sources.sort_by_key(|host| std::cmp::Reverse(leader_parts[host].len()));

        let mut moved = 0;
        for source in sources {
            let Some(&(_, upper)) = bounds.get(&source) else {
                continue;
            };
            let parts = leader_parts[&source].clone();
            for part in parts {
                if leader_parts[&source].len() <= upper {
                    break;
                }

                let Some(peers) = peers_map.get(&part) else {
                    continue;
                };
                let mut target: Option<(HostAddr, usize)> = None;
                for peer in peers {
                    if *peer == source {
                        continue;
                    }
                    // Inactive peers carry no entry and are never targets.
                    let Some(count) = leader_parts.get(peer).map(Vec::len) else {
                        continue;
                    };
                    let Some(&(peer_lower, _)) = bounds.get(peer) else {
                        continue;
                    };
                    if count >= peer_lower {
                        continue;
                    }
                    if let Some(zones) = zone_parts {
                        if !zones.contains_key(peer) {
                            info!("peer {} has no zone record, skipping", peer);
                            continue;
                        }
                    }
                    if target.as_ref().map(|(_, best)| count < *best).unwrap_or(true) {
                        target = Some((peer.clone(), count));
                    }
                }

                if let Some((target, _)) = target {
                    Self::move_leader(leader_parts, part, &source, &target);
                    plan.push((space, part, source.clone(), target));
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Hosts below their lower bound pull leadership of partitions they
    /// already replicate from leaders that can afford the loss.
    fn acquire_leaders(
        leader_parts: &mut HashMap<HostAddr, Vec<PartitionID>>,
        peers_map: &PartAllocation,
        bounds: &HostBounds,
        space: GraphSpaceID,
        plan: &mut LeaderBalancePlan,
    ) -> usize {
        let mut targets: Vec<HostAddr> = leader_parts.keys().cloned().collect();
        targets.sort_by_key(|host| leader_parts[host].len());

        let mut moved = 0;
        for target in targets {
            let Some(&(lower, _)) = bounds.get(&target) else {
                continue;
            };

            let mut candidates: Vec<PartitionID> = peers_map
                .iter()
                .filter(|(part, peers)| {
                    peers.contains(&target) && !leader_parts[&target].contains(part)
                })
                .map(|(part, _)| *part)
                .collect();
            candidates.sort_unstable();

            for part in candidates {
                if leader_parts[&target].len() >= lower {
                    break;
                }

                let source = leader_parts
                    .iter()
                    .find(|(_, parts)| parts.contains(&part))
                    .map(|(host, _)| host.clone());
                // A partition whose leader is down has no one to take from.
                let Some(source) = source else {
                    continue;
                };
                if source == target {
                    continue;
                }
                let Some(&(source_lower, _)) = bounds.get(&source) else {
                    continue;
                };
                if leader_parts[&source].len() <= source_lower {
                    continue;
                }

                Self::move_leader(leader_parts, part, &source, &target);
                plan.push((space, part, source, target.clone()));
                moved += 1;
            }
        }
        moved
    }

    fn move_leader(
        leader_parts: &mut HashMap<HostAddr, Vec<PartitionID>>,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) {
        if let Some(parts) = leader_parts.get_mut(from) {
            parts.retain(|p| *p != part);
        }
        if let Some(parts) = leader_parts.get_mut(to) {
            parts.push(part);
        }
    }

    /// Drop handoffs that cancel out and compress `a->b, b->c` chains into
    /// `a->c`, per partition.
    fn simplify(plan: &mut LeaderBalancePlan) {
        loop {
            let mut changed = false;
            'scan: for i in 0..plan.len() {
                for j in (i + 1)..plan.len() {
                    let chains = plan[i].0 == plan[j].0
                        && plan[i].1 == plan[j].1
                        && plan[i].3 == plan[j].2;
                    if chains {
                        let merged_to = plan[j].3.clone();
                        plan.remove(j);
                        if plan[i].2 == merged_to {
                            plan.remove(i);
                        } else {
                            plan[i].3 = merged_to;
                        }
                        changed = true;
                        break 'scan;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }
}
