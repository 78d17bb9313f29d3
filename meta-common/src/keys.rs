//! Key schema of the meta KV store.
//!
//! Keys are an ASCII tag followed by big-endian id bytes, so that all ids of
//! one kind sort contiguously under their tag and prefix scans return them in
//! id order.

use crate::types::{GraphSpaceID, HostAddr, JobID, PartitionID};

const SPACE: &[u8] = b"__space__";
const SPACE_NAME: &[u8] = b"__space_name__";
const PARTS: &[u8] = b"__parts__";
const HOSTS: &[u8] = b"__hosts__";
const ZONES: &[u8] = b"__zones__";
const GROUPS: &[u8] = b"__groups__";
const JOBS: &[u8] = b"__jobs__";
const BALANCE_PLAN: &[u8] = b"__balance_plan__";
const BALANCE_TASK: &[u8] = b"__balance_task__";
const LAST_UPDATE_TIME: &[u8] = b"__last_update_time__";

fn concat(tag: &[u8], rest: &[&[u8]]) -> Vec<u8> {
    let mut key = tag.to_vec();
    for part in rest {
        key.extend_from_slice(part);
    }
    key
}

pub fn space_key(space: GraphSpaceID) -> Vec<u8> {
    concat(SPACE, &[&space.to_be_bytes()])
}

pub fn space_name_key(name: &str) -> Vec<u8> {
    concat(SPACE_NAME, &[name.as_bytes()])
}

pub fn part_prefix(space: GraphSpaceID) -> Vec<u8> {
    concat(PARTS, &[&space.to_be_bytes()])
}

pub fn part_key(space: GraphSpaceID, part: PartitionID) -> Vec<u8> {
    concat(PARTS, &[&space.to_be_bytes(), &part.to_be_bytes()])
}

/// Recover the partition id from a key returned by a `part_prefix` scan.
pub fn parse_part_key(space: GraphSpaceID, key: &[u8]) -> Option<PartitionID> {
    let suffix = key.strip_prefix(part_prefix(space).as_slice())?;
    let bytes: [u8; 4] = suffix.try_into().ok()?;
    Some(PartitionID::from_be_bytes(bytes))
}

pub fn host_prefix() -> Vec<u8> {
    HOSTS.to_vec()
}

pub fn host_key(host: &HostAddr) -> Vec<u8> {
    concat(HOSTS, &[host.to_string().as_bytes()])
}

/// Recover the host address from a key returned by a `host_prefix` scan.
pub fn parse_host_key(key: &[u8]) -> Option<HostAddr> {
    let suffix = key.strip_prefix(HOSTS)?;
    std::str::from_utf8(suffix).ok()?.parse().ok()
}

pub fn zone_key(name: &str) -> Vec<u8> {
    concat(ZONES, &[name.as_bytes()])
}

pub fn group_key(name: &str) -> Vec<u8> {
    concat(GROUPS, &[name.as_bytes()])
}

pub fn job_prefix() -> Vec<u8> {
    JOBS.to_vec()
}

pub fn job_key(job: JobID) -> Vec<u8> {
    concat(JOBS, &[&job.to_be_bytes()])
}

/// Recover the job id from a key returned by a `job_prefix` scan.
pub fn parse_job_key(key: &[u8]) -> Option<JobID> {
    let suffix = key.strip_prefix(JOBS)?;
    let bytes: [u8; 4] = suffix.try_into().ok()?;
    Some(JobID::from_be_bytes(bytes))
}

pub fn balance_plan_key(job: JobID, space: GraphSpaceID) -> Vec<u8> {
    concat(BALANCE_PLAN, &[&job.to_be_bytes(), &space.to_be_bytes()])
}

pub fn balance_task_prefix(job: JobID, space: GraphSpaceID) -> Vec<u8> {
    concat(BALANCE_TASK, &[&job.to_be_bytes(), &space.to_be_bytes()])
}

pub fn balance_task_key(job: JobID, space: GraphSpaceID, part: PartitionID) -> Vec<u8> {
    concat(
        BALANCE_TASK,
        &[&job.to_be_bytes(), &space.to_be_bytes(), &part.to_be_bytes()],
    )
}

/// Recover the partition id from a key returned by a `balance_task_prefix`
/// scan.
pub fn parse_balance_task_key(
    job: JobID,
    space: GraphSpaceID,
    key: &[u8],
) -> Option<PartitionID> {
    let suffix = key.strip_prefix(balance_task_prefix(job, space).as_slice())?;
    let bytes: [u8; 4] = suffix.try_into().ok()?;
    Some(PartitionID::from_be_bytes(bytes))
}

pub fn last_update_time_key() -> Vec<u8> {
    LAST_UPDATE_TIME.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_keys_round_trip() {
        let key = part_key(7, 42);
        assert!(key.starts_with(&part_prefix(7)));
        assert_eq!(parse_part_key(7, &key), Some(42));
        assert_eq!(parse_part_key(8, &key), None);
    }

    #[test]
    fn part_keys_scan_in_id_order() {
        let mut keys = vec![part_key(1, 300), part_key(1, 2), part_key(1, 41)];
        keys.sort();
        let parts: Vec<_> = keys
            .iter()
            .map(|k| parse_part_key(1, k).unwrap())
            .collect();
        assert_eq!(parts, vec![2, 41, 300]);
    }

    #[test]
    fn host_keys_round_trip() {
        let host = HostAddr::new("192.168.8.5", 44500);
        assert_eq!(parse_host_key(&host_key(&host)), Some(host));
        assert_eq!(parse_host_key(b"__zones__z1"), None);
    }

    #[test]
    fn balance_task_keys_round_trip() {
        let key = balance_task_key(12, 3, 9);
        assert!(key.starts_with(&balance_task_prefix(12, 3)));
        assert_eq!(parse_balance_task_key(12, 3, &key), Some(9));
    }
}
