//! Health reporting for the long-running component loops.
//!
//! Both binaries contain loops (worker poll loop, controller scheduler) that
//! the process can only be trusted with if they are actually running. Each
//! loop registers itself with a deadline and reports in periodically; a
//! component that goes quiet past its deadline marks the whole process
//! unhealthy, which is what the orchestrator's liveness probe sees.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered.
    Starting,
    /// Recently reported healthy; must report again before the deadline.
    HealthyUntil(DateTime<Utc>),
    /// Reported unhealthy.
    Unhealthy,
    /// The component missed its reporting deadline.
    Stalled,
}

#[derive(Debug, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy; must be called more frequently than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {err}")
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Register a component; hand the returned handle to its loop so it can
    /// report in.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// The overall process status: healthy only if every registered
    /// component reported recently enough.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::new(),
        };
        let now = Utc::now();

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    _ = status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    _ = status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    status.healthy = false;
                    _ = status.components.insert(name.clone(), other.clone());
                }
            }
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
