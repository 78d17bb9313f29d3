use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the long-running loops of the meta service.
///
/// The balancer service runs several asynchronous loops (the job runner, the
/// heartbeat sweeper, a running balance plan). The process can only be
/// trusted to make placement decisions if all of them are alive, so each loop
/// registers a `HealthHandle` and reports in within its deadline. The
/// aggregate status is what `/_liveness` serves:
///   - any component reporting unhealthy makes the process unhealthy,
///   - a component that missed its deadline is considered stalled,
///   - the process is healthy only when every component recently reported.
///
/// Liveness and readiness are deliberately kept as separate registries; a
/// single merged state invites confusion between "restart me" and "stop
/// routing to me".
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthReport>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Reported healthy, valid until the contained deadline.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

struct HealthReport {
    component: String,
    status: ComponentStatus,
}

/// Handed to a component so it can report its own health. Reports must come
/// in more often than the deadline given at registration.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthReport>,
}

impl HealthHandle {
    pub async fn report_healthy(&self) {
        let until = time::OffsetDateTime::now_utc().add(self.deadline);
        self.report_status(ComponentStatus::HealthyUntil(until)).await;
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let report = HealthReport {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(report).await {
            warn!("failed to report health status: {}", err);
        }
    }
}

/// Aggregate status over all registered components.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthReport>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        map.insert(report.component, report.status);
                    }
                    // Poisoned lock: the probes will fail and the process restart.
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component. The returned handle goes to the component so it
    /// can keep reporting within `deadline`.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Compute the aggregate status. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let now = time::OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            // Unhealthy until at least one component has registered.
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                    status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    status.healthy = false;
                    status.components.insert(name.clone(), component.clone());
                }
            }
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
