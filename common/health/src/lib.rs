use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the asynchronous loops of a pipeline process.
///
/// Both pipeline roles run several consumption and delivery loops, and the
/// process can only be trusted with traffic if all of them are attached and
/// making progress. HealthRegistry lets each loop register itself and report:
///   - if any registered loop is unhealthy, the process is unhealthy
///   - if all loops recently reported healthy, the process is healthy
///   - a loop that missed its reporting deadline is considered stalled,
///     and the check fails.
///
/// Loops that commit offsets additionally report the instant of their last
/// successful commit, which is surfaced in the readiness body for operators.
///
/// Liveness and readiness probes should each use their own registry instance,
/// merging the two k8s concepts into one state is a trap.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all registered components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentReport>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component report in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

/// Status of one registered component, plus the last offset commit it
/// reported, if it ever did.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ComponentReport {
    pub status: ComponentStatus,
    pub last_commit: Option<time::OffsetDateTime>,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
    last_commit: Option<time::OffsetDateTime>,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report(ComponentStatus::HealthyUntil(self.next_deadline()), None)
            .await
    }

    /// Report healthy and record a successful offset commit at the current
    /// instant. Called by consumption loops right after they commit a unit.
    pub async fn report_commit(&self) {
        self.report(
            ComponentStatus::HealthyUntil(self.next_deadline()),
            Some(time::OffsetDateTime::now_utc()),
        )
        .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        self.report(status, None).await
    }

    /// Synchronously report as healthy, for use in sync callbacks.
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy_blocking(&self) {
        let message = HealthMessage {
            component: self.component.clone(),
            status: ComponentStatus::HealthyUntil(self.next_deadline()),
            last_commit: None,
        };
        // Don't panic if we're called from within an async context,
        // just spawn instead
        if let Ok(h) = runtime::Handle::try_current() {
            let m = self.clone();
            h.spawn(async move { m.report_healthy().await });
        } else if let Err(err) = self.sender.blocking_send(message) {
            warn!("failed to report health status: {}", err)
        }
    }

    async fn report(&self, status: ComponentStatus, last_commit: Option<time::OffsetDateTime>) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
            last_commit,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    fn next_deadline(&self) -> time::OffsetDateTime {
        time::OffsetDateTime::now_utc().add(self.deadline)
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentReport>>>,
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
                    let previous_commit = map
                        .get(&message.component)
                        .and_then(|report| report.last_commit);
                    _ = map.insert(
                        message.component,
                        ComponentReport {
                            status: message.status,
                            last_commit: message.last_commit.or(previous_commit),
                        },
                    );
                } else {
                    // Poisoned mutex: Just warn, the probes will fail and the process restart
                    warn!("poisoned HealthRegistry mutex")
                }
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all the
    /// components currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry mutex");

        // Unhealthy until at least one component registered and none failed
        let result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        let result = components
            .iter()
            .fold(result, |mut result, (name, report)| {
                let status = match &report.status {
                    ComponentStatus::HealthyUntil(until) if until.gt(&now) => {
                        ComponentStatus::HealthyUntil(*until)
                    }
                    ComponentStatus::HealthyUntil(_) => {
                        result.healthy = false;
                        ComponentStatus::Stalled
                    }
                    other => {
                        result.healthy = false;
                        other.clone()
                    }
                };
                _ = result.components.insert(
                    name.clone(),
                    ComponentReport {
                        status,
                        last_commit: report.last_commit,
                    },
                );
                result
            });
        if !result.healthy {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{ComponentStatus, HealthRegistry, HealthStatus};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::{Add, Sub};
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(time::Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn one_component() {
        let registry = HealthRegistry::new("liveness");

        // New components are registered in Starting
        let handle = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        let mut status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("one").map(|r| r.status.clone()),
            Some(ComponentStatus::Starting)
        );

        // Status goes healthy once the component reports
        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
        status = registry.get_status();
        assert_eq!(status.components.len(), 1);

        // Status goes unhealthy if the component says so
        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        status = registry.get_status();
        assert_eq!(
            status.components.get("one").map(|r| r.status.clone()),
            Some(ComponentStatus::Unhealthy)
        );
    }

    #[tokio::test]
    async fn staleness_check() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        // If the component's ping is too old, it is considered stalled and the healthcheck fails
        // FIXME: we should mock the time instead
        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        let status = registry.get_status();
        assert_eq!(
            status.components.get("one").map(|r| r.status.clone()),
            Some(ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn commit_instant_is_kept_across_reports() {
        let registry = HealthRegistry::new("readiness");
        let handle = registry
            .register("batch".to_string(), Duration::from_secs(30))
            .await;

        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry
                .get_status()
                .components
                .get("batch")
                .unwrap()
                .last_commit,
            None
        );

        handle.report_commit().await;
        assert_or_retry(|| {
            registry
                .get_status()
                .components
                .get("batch")
                .unwrap()
                .last_commit
                .is_some()
        })
        .await;
        let committed_at = registry
            .get_status()
            .components
            .get("batch")
            .unwrap()
            .last_commit;

        // A plain healthy report must not erase the recorded commit instant
        handle.report_healthy().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            registry
                .get_status()
                .components
                .get("batch")
                .unwrap()
                .last_commit,
            committed_at
        );
    }

    #[tokio::test]
    async fn several_components() {
        let registry = HealthRegistry::new("liveness");
        let handle1 = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let handle2 = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;

        // First component going healthy is not enough
        handle1.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("one").unwrap().status
                != ComponentStatus::Starting
        })
        .await;
        assert!(!registry.get_status().healthy);

        // Second component going healthy brings the health to green
        handle2.report_healthy().await;
        assert_or_retry(|| {
            registry.get_status().components.get("two").unwrap().status
                != ComponentStatus::Starting
        })
        .await;
        assert!(registry.get_status().healthy);

        // First component going unhealthy takes down the health to red
        handle1.report_status(ComponentStatus::Unhealthy).await;
        assert_or_retry(|| !registry.get_status().healthy).await;

        // First component recovering returns the health to green
        handle1.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
