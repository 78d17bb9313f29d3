//! End-to-end balance scenarios against the in-memory store and the mock
//! admin client.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use meta_balancer::{
    topology, BalanceTaskResult, BalancerConfig, DataBalancer, LeaderBalancer, MockAdminClient,
    PlanStatus,
};
use meta_common::keys;
use meta_common::store::{MemStore, MetaStore, SpaceLock};
use meta_common::types::{HostAddr, PartitionID, SpaceProperties};

fn host(i: u16) -> HostAddr {
    HostAddr::new(i.to_string(), i)
}

async fn put_json<T: serde::Serialize>(store: &MemStore, key: Vec<u8>, value: &T) {
    store
        .multi_put(vec![(key, serde_json::to_vec(value).unwrap())])
        .await
        .unwrap();
}

async fn register_heartbeats(store: &MemStore, hosts: &[HostAddr]) {
    let now = Utc::now().timestamp_millis();
    for host in hosts {
        put_json(store, keys::host_key(host), &now).await;
    }
}

async fn create_space(
    store: &MemStore,
    space: i32,
    partition_num: i32,
    replica_factor: i32,
    group_name: Option<&str>,
) {
    put_json(store, keys::space_name_key("default_space"), &space).await;
    put_json(
        store,
        keys::space_key(space),
        &SpaceProperties {
            space_name: "default_space".to_owned(),
            partition_num,
            replica_factor,
            group_name: group_name.map(str::to_owned),
        },
    )
    .await;
}

async fn assign_parts(store: &MemStore, space: i32, allocation: &[(PartitionID, Vec<HostAddr>)]) {
    for (part, peers) in allocation {
        put_json(store, keys::part_key(space, *part), peers).await;
    }
}

async fn create_zones(store: &MemStore, group: &str, zones: &[(&str, Vec<HostAddr>)]) {
    let names: Vec<String> = zones.iter().map(|(name, _)| (*name).to_owned()).collect();
    put_json(store, keys::group_key(group), &names).await;
    for (name, hosts) in zones {
        put_json(store, keys::zone_key(name), hosts).await;
    }
}

fn balancer(store: Arc<MemStore>, admin: Arc<MockAdminClient>) -> DataBalancer {
    DataBalancer::new(
        BalancerConfig::default(),
        store,
        admin,
        Arc::new(SpaceLock::new()),
    )
}

/// Replay generated moves onto a placement map to inspect the end state.
fn replay(
    allocation: &[(PartitionID, Vec<HostAddr>)],
    tasks: &[meta_balancer::BalanceTask],
) -> HashMap<HostAddr, Vec<PartitionID>> {
    let mut host_parts: HashMap<HostAddr, Vec<PartitionID>> = HashMap::new();
    for (part, peers) in allocation {
        for peer in peers {
            host_parts.entry(peer.clone()).or_default().push(*part);
        }
    }
    for task in tasks {
        if let Some(parts) = host_parts.get_mut(&task.src) {
            parts.retain(|part| *part != task.part_id);
        }
        host_parts
            .entry(task.dst.clone())
            .or_default()
            .push(task.part_id);
    }
    host_parts
}

fn three_replica_allocation() -> Vec<(PartitionID, Vec<HostAddr>)> {
    (1..=4)
        .map(|part| (part, vec![host(0), host(1), host(2)]))
        .collect()
}

#[tokio::test]
async fn empty_host_receives_an_even_share() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..4).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    let allocation = three_replica_allocation();
    assign_parts(&store, 1, &allocation).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store, admin);
    let tasks = balancer.gen_tasks(0, 1, vec![]).await.unwrap();

    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.dst, host(3));
        assert_ne!(task.src, task.dst);
    }

    let end_state = replay(&allocation, &tasks);
    for parts in end_state.values() {
        assert_eq!(parts.len(), 3);
    }
}

#[tokio::test]
async fn grouped_space_balances_zone_legally() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..4).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_zones(
        &store,
        "group_0",
        &[
            ("zone_0", vec![host(0)]),
            ("zone_1", vec![host(1)]),
            ("zone_2", vec![host(2)]),
            ("zone_3", vec![host(3)]),
        ],
    )
    .await;
    create_space(&store, 1, 4, 3, Some("group_0")).await;
    let allocation = three_replica_allocation();
    assign_parts(&store, 1, &allocation).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store.clone(), admin);
    let tasks = balancer.gen_tasks(0, 1, vec![]).await.unwrap();

    assert_eq!(tasks.len(), 3);
    let end_state = replay(&allocation, &tasks);
    for parts in end_state.values() {
        assert_eq!(parts.len(), 3);
    }

    // Every move respects zone placement.
    let (host_parts, _) = topology::load_host_parts(store.as_ref(), 1).await.unwrap();
    let zone_parts = topology::assemble_zone_parts(store.as_ref(), "group_0", &host_parts)
        .await
        .unwrap();
    for task in &tasks {
        assert!(topology::check_zone_legal(
            &zone_parts,
            &task.src,
            &task.dst,
            task.part_id
        ));
    }
}

#[tokio::test]
async fn doubling_the_hosts_halves_the_load() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..6).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    let allocation = three_replica_allocation();
    assign_parts(&store, 1, &allocation).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store, admin);
    let tasks = balancer.gen_tasks(0, 1, vec![]).await.unwrap();

    assert_eq!(tasks.len(), 6);
    let end_state = replay(&allocation, &tasks);
    assert_eq!(end_state.len(), 6);
    for parts in end_state.values() {
        assert_eq!(parts.len(), 2);
    }
}

#[tokio::test]
async fn quorum_unsafe_move_is_refused_without_a_partial_plan() {
    let store = Arc::new(MemStore::new());
    // Hosts 1 and 2 stopped heartbeating: every partition is down to one
    // alive replica out of three.
    register_heartbeats(&store, &[host(0)]).await;
    create_space(&store, 1, 4, 3, None).await;
    assign_parts(&store, 1, &three_replica_allocation()).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store.clone(), admin);
    let err = balancer.gen_tasks(0, 1, vec![]).await.unwrap_err();

    assert_eq!(err.code(), "E_NO_VALID_HOST");
    let persisted = store.prefix(&keys::balance_task_prefix(0, 1)).await.unwrap();
    assert!(persisted.is_empty());
}

#[tokio::test]
async fn losing_one_of_three_hosts_leaves_no_spare_target() {
    let store = Arc::new(MemStore::new());
    register_heartbeats(&store, &[host(0), host(1)]).await;
    create_space(&store, 1, 4, 3, None).await;
    assign_parts(&store, 1, &three_replica_allocation()).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store, admin);

    // The quorum survives with two replicas, but both survivors already
    // hold every partition, so there is nowhere to re-home host 2's data.
    let err = balancer.gen_tasks(0, 1, vec![]).await.unwrap_err();
    assert_eq!(err.code(), "E_NO_VALID_HOST");
}

#[tokio::test]
async fn balanced_space_produces_no_second_plan() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..4).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    assign_parts(
        &store,
        1,
        &[
            (1, vec![host(0), host(1), host(2)]),
            (2, vec![host(0), host(1), host(3)]),
            (3, vec![host(0), host(2), host(3)]),
            (4, vec![host(1), host(2), host(3)]),
        ],
    )
    .await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store, admin);

    let tasks = balancer.gen_tasks(0, 1, vec![]).await.unwrap();
    assert!(tasks.is_empty());

    let err = balancer.build_plan(0, 1, vec![]).await.unwrap_err();
    assert_eq!(err.code(), "E_BALANCED");
}

#[tokio::test]
async fn explicitly_removed_host_is_drained() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..4).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    let allocation = three_replica_allocation();
    assign_parts(&store, 1, &allocation).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store, admin);
    // Host 2 still heartbeats but the operator wants it gone.
    let tasks = balancer.gen_tasks(0, 1, vec![host(2)]).await.unwrap();

    let end_state = replay(&allocation, &tasks);
    assert!(end_state
        .get(&host(2))
        .map(Vec::is_empty)
        .unwrap_or(true));
    // All of host 2's partitions live somewhere, still at three replicas.
    let mut replica_count: HashMap<PartitionID, usize> = HashMap::new();
    for parts in end_state.values() {
        for part in parts {
            *replica_count.entry(*part).or_default() += 1;
        }
    }
    for part in 1..=4 {
        assert_eq!(replica_count[&part], 3);
    }
}

#[tokio::test]
async fn generated_plan_executes_to_completion() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..4).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    assign_parts(&store, 1, &three_replica_allocation()).await;

    let admin = Arc::new(MockAdminClient::new());
    let balancer = balancer(store.clone(), admin.clone());
    let plan = balancer.build_plan(7, 1, vec![]).await.unwrap();

    // Distinct partitions, so each bucket holds at most one group.
    assert!(!plan.buckets().is_empty());

    let outcome = plan.invoke().await.unwrap();
    assert_eq!(outcome.status, PlanStatus::Finished);
    assert_eq!(outcome.finished, 3);
    assert!(outcome
        .tasks
        .iter()
        .all(|task| task.result == BalanceTaskResult::Succeeded));

    // Every task left its record behind.
    let persisted = store.prefix(&keys::balance_task_prefix(7, 1)).await.unwrap();
    assert_eq!(persisted.len(), 3);
    assert!(store.get(&keys::last_update_time_key()).await.is_ok());
}

#[tokio::test]
async fn leader_balance_dispatches_the_planned_transfers() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..3).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 4, 3, None).await;
    assign_parts(&store, 1, &three_replica_allocation()).await;

    let admin = Arc::new(MockAdminClient::new());
    // Host 0 leads everything.
    admin.set_leader_dist(
        [(host(0), [(1, vec![1, 2, 3, 4])].into_iter().collect())]
            .into_iter()
            .collect(),
    );

    let leader = LeaderBalancer::new(
        BalancerConfig::default(),
        store,
        admin.clone(),
        Arc::new(SpaceLock::new()),
    );
    let plan = leader.leader_balance(1).await.unwrap();

    assert!(!plan.is_empty());
    assert_eq!(admin.call_count("trans_leader"), plan.len());
    for (_, _, from, to) in &plan {
        assert_ne!(from, to);
        assert_eq!(*from, host(0));
    }
}

#[tokio::test]
async fn leader_balance_of_an_even_distribution_is_a_no_op() {
    let store = Arc::new(MemStore::new());
    let hosts: Vec<HostAddr> = (0..3).map(host).collect();
    register_heartbeats(&store, &hosts).await;
    create_space(&store, 1, 3, 3, None).await;
    assign_parts(
        &store,
        1,
        &[
            (1, vec![host(0), host(1), host(2)]),
            (2, vec![host(0), host(1), host(2)]),
            (3, vec![host(0), host(1), host(2)]),
        ],
    )
    .await;

    let admin = Arc::new(MockAdminClient::new());
    admin.set_leader_dist(
        [
            (host(0), [(1, vec![1])].into_iter().collect()),
            (host(1), [(1, vec![2])].into_iter().collect()),
            (host(2), [(1, vec![3])].into_iter().collect()),
        ]
        .into_iter()
        .collect(),
    );

    let leader = LeaderBalancer::new(
        BalancerConfig::default(),
        store,
        admin,
        Arc::new(SpaceLock::new()),
    );
    let err = leader.leader_balance(1).await.unwrap_err();
    assert_eq!(err.code(), "E_BALANCED");
}
