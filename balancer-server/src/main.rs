//! Serve the partition balancer: a job API over the data balancer, the
//! leader balance endpoint, and the usual probes and metrics.

use std::sync::Arc;

use envconfig::Envconfig;

use health::HealthRegistry;
use meta_balancer::{DataBalancer, HttpAdminClient, LeaderBalancer};
use meta_common::metrics::{serve, setup_metrics_routes};
use meta_common::store::{MemStore, SpaceLock};

use crate::config::Config;
use crate::handlers::AppState;
use crate::jobs::JobManager;

mod config;
mod handlers;
mod jobs;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let runner_liveness = liveness
        .register("job_runner".to_string(), time::Duration::seconds(60))
        .await;

    // Local runs balance against the in-memory store; a deployment swaps in
    // the replicated one behind the same trait.
    let store = Arc::new(MemStore::new());
    let space_lock = Arc::new(SpaceLock::new());
    let admin = Arc::new(HttpAdminClient::new(
        store.clone(),
        config.request_timeout.0,
    ));

    let balancer_config = config.balancer();
    let balancer = DataBalancer::new(
        balancer_config.clone(),
        store.clone(),
        admin.clone(),
        space_lock.clone(),
    );
    let leader = LeaderBalancer::new(balancer_config, store.clone(), admin, space_lock);

    let (manager, queue) = JobManager::new(store, balancer, leader)
        .await
        .expect("failed to initialize job manager");
    let manager = Arc::new(manager);
    tokio::spawn(jobs::run(manager.clone(), queue, runner_liveness));

    let router = handlers::router(AppState { jobs: manager }, liveness);
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    serve(router, &bind)
        .await
        .expect("failed to start balancer server");
}
