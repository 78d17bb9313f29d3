//! Partition balancer for the meta service.
//!
//! The data balancer computes a plan of per-partition moves that restores the
//! replica invariant after hosts are lost or added, then executes it through
//! the storage admin API with per-partition serialization. The leader
//! balancer is the parallel path that only shifts Raft leadership.

pub mod admin;
pub mod balance;
pub mod config;
pub mod leader;
pub mod plan;
pub mod task;
pub mod topology;

pub use admin::{AdminClient, AdminError, HttpAdminClient, MockAdminClient};
pub use balance::DataBalancer;
pub use config::BalancerConfig;
pub use leader::{LeaderBalancePlan, LeaderBalancer};
pub use plan::{BalancePlan, PlanOutcome, PlanStatus, PlanStopHandle};
pub use task::{BalanceTask, BalanceTaskResult, BalanceTaskStatus};
