//! Admin RPC surface of the storage hosts.
//!
//! The balancer drives partition moves exclusively through this trait, so
//! tests can swap the HTTP client for a mock. All methods are idempotent:
//! the task state machine retries by re-entering a step, never by looping
//! inside one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

use meta_common::keys;
use meta_common::store::MetaStore;
use meta_common::types::{GraphSpaceID, HostAddr, HostLeaderMap, PartitionID};

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("admin rpc {op} on {host} failed: {message}")]
    Rpc {
        op: String,
        host: HostAddr,
        message: String,
    },
    #[error("admin rpc {op} on {host} timed out")]
    Timeout { op: String, host: HostAddr },
    #[error("meta store failure during {op}: {message}")]
    Store { op: String, message: String },
}

#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Ask `from` to hand leadership of the partition to `to`. A `to` of
    /// [`HostAddr::any_follower`] leaves the choice to the Raft group. Must
    /// succeed when `from` is already not the leader.
    async fn trans_leader(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError>;

    /// Create a replica of the partition on `host`; a learner joins without
    /// voting rights.
    async fn add_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        as_learner: bool,
    ) -> Result<(), AdminError>;

    async fn add_learner(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError>;

    /// Resolve once `host`'s replica log is within a small lag of the
    /// leader. May legitimately take many seconds.
    async fn waiting_for_catch_up_data(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError>;

    /// Raft configuration change adding or removing `host`.
    async fn member_change(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        add: bool,
    ) -> Result<(), AdminError>;

    /// Atomically replace `from` by `to` in the partition's persisted
    /// replica-set record.
    async fn update_meta(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError>;

    async fn remove_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError>;

    /// Health-probe every replica of the partition.
    async fn check_peers(&self, space: GraphSpaceID, part: PartitionID) -> Result<(), AdminError>;

    /// Gather host => space => led partitions across the cluster.
    async fn get_leader_dist(&self) -> Result<HostLeaderMap, AdminError>;
}

/// `AdminClient` talking JSON over HTTP to the storage hosts' admin port.
pub struct HttpAdminClient {
    client: reqwest::Client,
    store: Arc<dyn MetaStore>,
}

impl HttpAdminClient {
    pub fn new(store: Arc<dyn MetaStore>, request_timeout: time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for admin rpc");

        Self { client, store }
    }

    async fn post(
        &self,
        host: &HostAddr,
        op: &str,
        body: serde_json::Value,
    ) -> Result<(), AdminError> {
        let url = format!("http://{}/admin/{}", host, op);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    AdminError::Timeout {
                        op: op.to_owned(),
                        host: host.clone(),
                    }
                } else {
                    AdminError::Rpc {
                        op: op.to_owned(),
                        host: host.clone(),
                        message: error.to_string(),
                    }
                }
            })?;

        match response.error_for_status() {
            Ok(_) => Ok(()),
            Err(error) => Err(AdminError::Rpc {
                op: op.to_owned(),
                host: host.clone(),
                message: error.to_string(),
            }),
        }
    }

    async fn replica_set(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        op: &str,
    ) -> Result<Vec<HostAddr>, AdminError> {
        let value = self
            .store
            .get(&keys::part_key(space, part))
            .await
            .map_err(|error| AdminError::Store {
                op: op.to_owned(),
                message: error.to_string(),
            })?;
        serde_json::from_slice(&value).map_err(|error| AdminError::Store {
            op: op.to_owned(),
            message: format!("corrupt replica set record: {error}"),
        })
    }
}

#[async_trait]
impl AdminClient for HttpAdminClient {
    async fn trans_leader(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError> {
        self.post(
            from,
            "trans_leader",
            json!({"space": space, "part": part, "to": to}),
        )
        .await
    }

    async fn add_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        as_learner: bool,
    ) -> Result<(), AdminError> {
        self.post(
            host,
            "add_part",
            json!({"space": space, "part": part, "as_learner": as_learner}),
        )
        .await
    }

    async fn add_learner(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.post(host, "add_learner", json!({"space": space, "part": part}))
            .await
    }

    async fn waiting_for_catch_up_data(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.post(host, "catch_up_data", json!({"space": space, "part": part}))
            .await
    }

    async fn member_change(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        add: bool,
    ) -> Result<(), AdminError> {
        self.post(
            host,
            "member_change",
            json!({"space": space, "part": part, "add": add}),
        )
        .await
    }

    async fn update_meta(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError> {
        let mut peers = self.replica_set(space, part, "update_meta").await?;
        peers.retain(|peer| peer != from);
        if !peers.contains(to) {
            peers.push(to.clone());
        }
        let record = serde_json::to_vec(&peers).map_err(|error| AdminError::Store {
            op: "update_meta".to_owned(),
            message: error.to_string(),
        })?;
        self.store
            .multi_put(vec![(keys::part_key(space, part), record)])
            .await
            .map_err(|error| AdminError::Store {
                op: "update_meta".to_owned(),
                message: error.to_string(),
            })
    }

    async fn remove_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.post(host, "remove_part", json!({"space": space, "part": part}))
            .await
    }

    async fn check_peers(&self, space: GraphSpaceID, part: PartitionID) -> Result<(), AdminError> {
        let peers = self.replica_set(space, part, "check_peers").await?;
        for peer in &peers {
            self.post(peer, "check_peers", json!({"space": space, "part": part}))
                .await?;
        }
        Ok(())
    }

    async fn get_leader_dist(&self) -> Result<HostLeaderMap, AdminError> {
        let kvs = self
            .store
            .prefix(&keys::host_prefix())
            .await
            .map_err(|error| AdminError::Store {
                op: "leader_dist".to_owned(),
                message: error.to_string(),
            })?;

        let mut dist = HostLeaderMap::new();
        for (key, _) in kvs {
            let Some(host) = keys::parse_host_key(&key) else {
                continue;
            };
            let url = format!("http://{}/admin/leader_dist", host);
            let leaders = match self.client.get(&url).send().await {
                Ok(response) => response
                    .json::<HashMap<GraphSpaceID, Vec<PartitionID>>>()
                    .await
                    .unwrap_or_default(),
                Err(error) => {
                    // A host that cannot report is simply absent from the map.
                    warn!("leader dist probe of {} failed: {}", host, error);
                    continue;
                }
            };
            dist.insert(host, leaders);
        }
        Ok(dist)
    }
}

/// Recording `AdminClient` for tests: every call is logged, individual
/// methods can be made to fail, and an optional delay simulates slow hosts.
#[derive(Default)]
pub struct MockAdminClient {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, String>>,
    part_failures: Mutex<HashMap<(String, PartitionID), String>>,
    leader_dist: Mutex<HostLeaderMap>,
    delay: Mutex<Option<time::Duration>>,
}

impl MockAdminClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `op` fail with `message`.
    pub fn fail_on(&self, op: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(op.to_owned(), message.to_owned());
    }

    /// Make calls to `op` fail only for one partition.
    pub fn fail_on_part(&self, op: &str, part: PartitionID, message: &str) {
        self.part_failures
            .lock()
            .unwrap()
            .insert((op.to_owned(), part), message.to_owned());
    }

    pub fn set_leader_dist(&self, dist: HostLeaderMap) {
        *self.leader_dist.lock().unwrap() = dist;
    }

    pub fn set_delay(&self, delay: time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Every observed call, rendered as `op space.part detail`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(op))
            .count()
    }

    async fn observe(
        &self,
        op: &str,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        detail: &str,
    ) -> Result<(), AdminError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op} {space}.{part} {detail}"));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self.failures.lock().unwrap().get(op) {
            return Err(AdminError::Rpc {
                op: op.to_owned(),
                host: host.clone(),
                message: message.clone(),
            });
        }
        if let Some(message) = self
            .part_failures
            .lock()
            .unwrap()
            .get(&(op.to_owned(), part))
        {
            return Err(AdminError::Rpc {
                op: op.to_owned(),
                host: host.clone(),
                message: message.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminClient for MockAdminClient {
    async fn trans_leader(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError> {
        self.observe("trans_leader", space, part, from, &format!("{from}->{to}"))
            .await
    }

    async fn add_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        as_learner: bool,
    ) -> Result<(), AdminError> {
        self.observe(
            "add_part",
            space,
            part,
            host,
            &format!("{host} learner={as_learner}"),
        )
        .await
    }

    async fn add_learner(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.observe("add_learner", space, part, host, &host.to_string())
            .await
    }

    async fn waiting_for_catch_up_data(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.observe("catch_up_data", space, part, host, &host.to_string())
            .await
    }

    async fn member_change(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
        add: bool,
    ) -> Result<(), AdminError> {
        self.observe(
            "member_change",
            space,
            part,
            host,
            &format!("{host} add={add}"),
        )
        .await
    }

    async fn update_meta(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        from: &HostAddr,
        to: &HostAddr,
    ) -> Result<(), AdminError> {
        self.observe("update_meta", space, part, from, &format!("{from}->{to}"))
            .await
    }

    async fn remove_part(
        &self,
        space: GraphSpaceID,
        part: PartitionID,
        host: &HostAddr,
    ) -> Result<(), AdminError> {
        self.observe("remove_part", space, part, host, &host.to_string())
            .await
    }

    async fn check_peers(&self, space: GraphSpaceID, part: PartitionID) -> Result<(), AdminError> {
        let host = HostAddr::any_follower();
        self.observe("check_peers", space, part, &host, "").await
    }

    async fn get_leader_dist(&self) -> Result<HostLeaderMap, AdminError> {
        Ok(self.leader_dist.lock().unwrap().clone())
    }
}
