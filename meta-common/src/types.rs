use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type GraphSpaceID = i32;
pub type PartitionID = i32;
pub type JobID = i32;
pub type Port = u16;

/// Address of a storage host. Ordered lexicographically by `(ip, port)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    pub ip: String,
    pub port: Port,
}

impl HostAddr {
    pub fn new(ip: impl Into<String>, port: Port) -> Self {
        Self { ip: ip.into(), port }
    }

    /// The "any follower" target accepted by leadership transfers.
    pub fn any_follower() -> Self {
        Self {
            ip: String::new(),
            port: 0,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid host address, expected ip:port")]
pub struct ParseHostAddrError(pub String);

impl FromStr for HostAddr {
    type Err = ParseHostAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseHostAddrError(s.to_owned()))?;
        if ip.is_empty() {
            return Err(ParseHostAddrError(s.to_owned()));
        }
        let port = port
            .parse::<Port>()
            .map_err(|_| ParseHostAddrError(s.to_owned()))?;
        Ok(HostAddr::new(ip, port))
    }
}

/// Read-only snapshot of a space taken at the start of a balance run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceProperties {
    pub space_name: String,
    pub partition_num: i32,
    pub replica_factor: i32,
    pub group_name: Option<String>,
}

/// Current assignment of partitions to hosts.
pub type HostParts = HashMap<HostAddr, Vec<PartitionID>>;

/// Replica set per partition.
pub type PartAllocation = HashMap<PartitionID, Vec<HostAddr>>;

/// Host => space => partitions it currently leads.
pub type HostLeaderMap = HashMap<HostAddr, HashMap<GraphSpaceID, Vec<PartitionID>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Stopped,
}

/// Persisted record of a balance job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub status: JobStatus,
    pub start_ms: i64,
    pub end_ms: i64,
    pub paras: Vec<String>,
}
