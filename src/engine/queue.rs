//! Per-service FIFO of pending deployment requests.
//!
//! Each service has one slot holding its pending requests and, at most, the
//! request currently running. Claiming the run slot and popping the head of
//! the queue happen under the same per-service entry lock, so two callers can
//! never both start a deployment for one service. Unrelated services live in
//! different entries and never contend on the same lock for long.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use crate::db::DeploymentTrigger;

/// A pending request to deploy a service
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRequest {
    /// ID of the deployment record created for this request
    pub deployment_id: String,
    pub service_id: String,
    pub trigger: DeploymentTrigger,
    pub requested_at: DateTime<Utc>,
    /// Cooperative cancellation, observed between pipeline stages
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl DeploymentRequest {
    pub fn new(deployment_id: String, service_id: String, trigger: DeploymentTrigger) -> Self {
        Self {
            deployment_id,
            service_id,
            trigger,
            requested_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
struct RunningJob {
    deployment_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ServiceSlot {
    pending: VecDeque<DeploymentRequest>,
    running: Option<RunningJob>,
}

/// Outcome of trying to start the next request for a service
#[derive(Debug)]
pub enum Claim {
    Started(DeploymentRequest),
    /// Another deployment holds the slot
    Busy { running: String },
    Empty,
}

/// What a bulk cancellation touched
#[derive(Debug, Default)]
pub struct CancelOutcome {
    /// Requests removed before they started
    pub removed: Vec<DeploymentRequest>,
    /// Running deployment that was asked to stop at its next checkpoint
    pub signalled: Option<String>,
}

#[derive(Debug, Default)]
pub struct DeploymentQueue {
    slots: DashMap<String, ServiceSlot>,
}

impl DeploymentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request; never rejects on depth
    pub fn push(&self, request: DeploymentRequest) {
        self.slots
            .entry(request.service_id.clone())
            .or_default()
            .pending
            .push_back(request);
    }

    /// Pop the head and take the run slot in one step
    pub fn claim(&self, service_id: &str) -> Claim {
        let Some(mut slot) = self.slots.get_mut(service_id) else {
            return Claim::Empty;
        };
        if let Some(running) = &slot.running {
            return Claim::Busy {
                running: running.deployment_id.clone(),
            };
        }
        match slot.pending.pop_front() {
            Some(request) => {
                slot.running = Some(RunningJob {
                    deployment_id: request.deployment_id.clone(),
                    cancel: request.cancel.clone(),
                });
                Claim::Started(request)
            }
            None => Claim::Empty,
        }
    }

    /// The next request to run, if the service is free to run one
    pub fn next(&self, service_id: &str) -> Option<DeploymentRequest> {
        match self.claim(service_id) {
            Claim::Started(request) => Some(request),
            Claim::Busy { .. } | Claim::Empty => None,
        }
    }

    /// Release the run slot held by `deployment_id`
    pub fn finish(&self, service_id: &str, deployment_id: &str) -> bool {
        let released = match self.slots.get_mut(service_id) {
            Some(mut slot) => {
                let holds = slot
                    .running
                    .as_ref()
                    .is_some_and(|r| r.deployment_id == deployment_id);
                if holds {
                    slot.running = None;
                }
                holds
            }
            None => false,
        };
        self.slots
            .remove_if(service_id, |_, s| s.running.is_none() && s.pending.is_empty());
        released
    }

    /// Drop every pending request and signal the running one, if any
    pub fn cancel_all(&self, service_id: &str) -> CancelOutcome {
        let outcome = match self.slots.get_mut(service_id) {
            Some(mut slot) => {
                let removed: Vec<DeploymentRequest> = slot.pending.drain(..).collect();
                for request in &removed {
                    request.cancel.cancel();
                }
                let signalled = slot.running.as_ref().map(|r| {
                    r.cancel.cancel();
                    r.deployment_id.clone()
                });
                CancelOutcome { removed, signalled }
            }
            None => CancelOutcome::default(),
        };
        self.slots
            .remove_if(service_id, |_, s| s.running.is_none() && s.pending.is_empty());
        outcome
    }

    /// Drop a service's slot unless a deployment is running in it.
    ///
    /// On success the pending requests are returned cancelled and no later
    /// claim can start them. `Err` carries the running deployment's ID.
    pub fn retire(&self, service_id: &str) -> Result<Vec<DeploymentRequest>, String> {
        let mut blocked = None;
        let removed = self.slots.remove_if(service_id, |_, slot| match &slot.running {
            Some(running) => {
                blocked = Some(running.deployment_id.clone());
                false
            }
            None => true,
        });
        if let Some(running) = blocked {
            return Err(running);
        }

        let pending: Vec<DeploymentRequest> = removed
            .map(|(_, slot)| slot.pending.into_iter().collect())
            .unwrap_or_default();
        for request in &pending {
            request.cancel.cancel();
        }
        Ok(pending)
    }

    pub fn running(&self, service_id: &str) -> Option<String> {
        self.slots
            .get(service_id)
            .and_then(|s| s.running.as_ref().map(|r| r.deployment_id.clone()))
    }

    pub fn is_running(&self, service_id: &str) -> bool {
        self.running(service_id).is_some()
    }

    pub fn pending_len(&self, service_id: &str) -> usize {
        self.slots
            .get(service_id)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }
}
