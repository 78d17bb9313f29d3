//! Topology reads: placement, zones, groups and the active-host set.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{info, warn};

use meta_common::error::MetaError;
use meta_common::keys;
use meta_common::store::MetaStore;
use meta_common::types::{GraphSpaceID, HostAddr, HostParts, PartitionID, SpaceProperties};

/// Per-host zone record: the zone name and every partition already placed
/// anywhere in that zone. Built once at plan start, consulted for zone
/// legality only.
pub type ZoneParts = HashMap<HostAddr, (String, Vec<PartitionID>)>;

pub async fn load_space_properties(
    store: &dyn MetaStore,
    space: GraphSpaceID,
) -> Result<SpaceProperties, MetaError> {
    let value = store.get(&keys::space_key(space)).await?;
    Ok(serde_json::from_slice(&value)?)
}

/// Scan the partition records of a space into a placement map. Also returns
/// the number of distinct partitions seen.
pub async fn load_host_parts(
    store: &dyn MetaStore,
    space: GraphSpaceID,
) -> Result<(HostParts, usize), MetaError> {
    let kvs = store.prefix(&keys::part_prefix(space)).await?;
    let mut host_parts = HostParts::new();
    let mut distinct = 0;
    for (key, value) in kvs {
        let Some(part) = keys::parse_part_key(space, &key) else {
            continue;
        };
        let peers: Vec<HostAddr> = serde_json::from_slice(&value)?;
        for peer in peers {
            host_parts.entry(peer).or_default().push(part);
        }
        distinct += 1;
    }
    Ok((host_parts, distinct))
}

/// Hosts whose last heartbeat is younger than twice the heartbeat interval,
/// in address order.
pub async fn get_active_hosts(
    store: &dyn MetaStore,
    heartbeat_interval: std::time::Duration,
) -> Result<Vec<HostAddr>, MetaError> {
    let kvs = store.prefix(&keys::host_prefix()).await?;
    let now = Utc::now().timestamp_millis();
    let ttl = 2 * heartbeat_interval.as_millis() as i64;

    let mut hosts = Vec::new();
    for (key, value) in kvs {
        let Some(host) = keys::parse_host_key(&key) else {
            continue;
        };
        let Ok(last_seen) = serde_json::from_slice::<i64>(&value) else {
            warn!("host {} has a corrupt heartbeat record", host);
            continue;
        };
        if now - last_seen < ttl {
            hosts.push(host);
        }
    }
    Ok(hosts)
}

/// Active hosts restricted to the members of the space's group. Falls back
/// to the global set when the space is not group-bound.
pub async fn get_active_hosts_in_group(
    store: &dyn MetaStore,
    space: GraphSpaceID,
    heartbeat_interval: std::time::Duration,
) -> Result<Vec<HostAddr>, MetaError> {
    let active = get_active_hosts(store, heartbeat_interval).await?;
    let props = load_space_properties(store, space).await?;
    let Some(group_name) = props.group_name else {
        return Ok(active);
    };

    let members = group_hosts(store, &group_name).await?;
    Ok(active
        .into_iter()
        .filter(|host| members.contains(host))
        .collect())
}

async fn zone_names(store: &dyn MetaStore, group: &str) -> Result<Vec<String>, MetaError> {
    let value = store.get(&keys::group_key(group)).await?;
    Ok(serde_json::from_slice(&value)?)
}

async fn zone_hosts(store: &dyn MetaStore, zone: &str) -> Result<Vec<HostAddr>, MetaError> {
    let value = store.get(&keys::zone_key(zone)).await?;
    Ok(serde_json::from_slice(&value)?)
}

/// All hosts across the group's zones.
pub async fn group_hosts(
    store: &dyn MetaStore,
    group: &str,
) -> Result<HashSet<HostAddr>, MetaError> {
    let mut members = HashSet::new();
    for zone in zone_names(store, group).await? {
        members.extend(zone_hosts(store, &zone).await?);
    }
    Ok(members)
}

/// For every host of the group's zones, record its zone and the partitions
/// held anywhere in that zone. Covering all zone members (not just hosts
/// already holding data) is what lets a freshly added host be a legal
/// target. Placement hosts missing from every zone simply get no record,
/// which makes any move involving them illegal.
pub async fn assemble_zone_parts(
    store: &dyn MetaStore,
    group: &str,
    host_parts: &HostParts,
) -> Result<ZoneParts, MetaError> {
    let mut zone_parts = ZoneParts::new();
    for zone in zone_names(store, group).await? {
        let members = zone_hosts(store, &zone).await?;
        let parts: Vec<PartitionID> = members
            .iter()
            .filter_map(|member| host_parts.get(member))
            .flatten()
            .copied()
            .collect();
        for member in members {
            zone_parts.insert(member, (zone.clone(), parts.clone()));
        }
    }

    for host in host_parts.keys() {
        if !zone_parts.contains_key(host) {
            info!("host {} belongs to no zone of group {}", host, group);
        }
    }
    Ok(zone_parts)
}

/// A move is zone-legal when both ends have zone records and either the move
/// stays inside one zone, or the target zone does not already hold the
/// partition.
pub fn check_zone_legal(
    zone_parts: &ZoneParts,
    src: &HostAddr,
    dst: &HostAddr,
    part: PartitionID,
) -> bool {
    let Some((src_zone, _)) = zone_parts.get(src) else {
        info!("source {} not found in any zone", src);
        return false;
    };
    let Some((dst_zone, dst_parts)) = zone_parts.get(dst) else {
        info!("target {} not found in any zone", dst);
        return false;
    };
    if src_zone == dst_zone {
        return true;
    }
    !dst_parts.contains(&part)
}
