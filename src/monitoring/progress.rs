use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Lifecycle of one instance within a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Requested,
    Provisioning,
    WaitingReady,
    Ready,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Failed)
    }

    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Requested, Provisioning) => true,
            (Provisioning, WaitingReady) => true,
            // fleets without a readiness gate
            (Provisioning, Ready) => true,
            (WaitingReady, Ready) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            InstanceState::Requested => "requested",
            InstanceState::Provisioning => "provisioning",
            InstanceState::WaitingReady => "waiting-ready",
            InstanceState::Ready => "ready",
            InstanceState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub state: InstanceState,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("instance {instance}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub instance: String,
    pub from: InstanceState,
    pub to: InstanceState,
}

/// Shared view of every instance's state during a deployment.
#[derive(Debug, Clone, Default)]
pub struct DeploymentProgress {
    instances: Arc<Mutex<BTreeMap<String, StateRecord>>>,
}

impl DeploymentProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, instance: &str) {
        self.instances.lock().await.insert(
            instance.to_string(),
            StateRecord {
                state: InstanceState::Requested,
                since: Utc::now(),
            },
        );
    }

    pub async fn transition(&self, instance: &str, next: InstanceState) -> Result<(), TransitionError> {
        let mut instances = self.instances.lock().await;
        let record = instances.entry(instance.to_string()).or_insert(StateRecord {
            state: InstanceState::Requested,
            since: Utc::now(),
        });

        if !record.state.can_transition_to(next) {
            warn!(instance, from = %record.state, to = %next, "rejected state transition");
            return Err(TransitionError {
                instance: instance.to_string(),
                from: record.state,
                to: next,
            });
        }

        debug!(instance, from = %record.state, to = %next, "instance state changed");
        record.state = next;
        record.since = Utc::now();
        Ok(())
    }

    pub async fn state(&self, instance: &str) -> Option<InstanceState> {
        self.instances.lock().await.get(instance).map(|r| r.state)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, StateRecord> {
        self.instances.lock().await.clone()
    }

    pub async fn count(&self, state: InstanceState) -> usize {
        self.instances
            .lock()
            .await
            .values()
            .filter(|r| r.state == state)
            .count()
    }
}
