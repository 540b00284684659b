//! Finite state machine for the application lifecycle

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Application status, the only user-facing deployment signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationStatus {
    /// Record persisted, remote work not started yet
    Creating,

    /// Remote pipeline in progress
    Deploying,

    /// Release installed and healthy
    Running,

    /// Upgrade in progress
    Updating,

    /// Last create or upgrade failed
    Failed,

    /// No release found on the cluster
    #[serde(rename = "Not Deployed")]
    NotDeployed,

    /// Teardown in progress, the record is about to be removed
    Deleting,

    /// Release status could not be read
    Unknown,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Creating => "Creating",
            ApplicationStatus::Deploying => "Deploying",
            ApplicationStatus::Running => "Running",
            ApplicationStatus::Updating => "Updating",
            ApplicationStatus::Failed => "Failed",
            ApplicationStatus::NotDeployed => "Not Deployed",
            ApplicationStatus::Deleting => "Deleting",
            ApplicationStatus::Unknown => "Unknown",
        }
    }

    /// True while a pipeline owns the record
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Creating | ApplicationStatus::Deploying | ApplicationStatus::Updating
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Remote work started
    Deploy,

    /// Install completed successfully
    DeploySuccess,

    /// A create step failed
    DeployFailed(String),

    /// Explicit new create attempt on a failed application
    Retry,

    /// Start an upgrade
    Upgrade,

    /// Upgrade completed successfully
    UpgradeSuccess,

    /// Upgrade failed
    UpgradeFailed(String),

    /// Start teardown
    Delete,
}

/// Compute the next status for an event, rejecting invalid transitions
pub fn next_status(
    current: &ApplicationStatus,
    event: &LifecycleEvent,
) -> Result<ApplicationStatus, EngineError> {
    use ApplicationStatus as S;
    use LifecycleEvent as E;

    let next = match (current, event) {
        (S::Creating, E::Deploy) => S::Deploying,
        (S::Deploying, E::DeploySuccess) => S::Running,
        (S::Creating | S::Deploying, E::DeployFailed(_)) => S::Failed,

        (S::Failed, E::Retry) => S::Creating,

        (S::Running | S::Failed | S::NotDeployed | S::Unknown, E::Upgrade) => S::Updating,
        (S::Updating, E::UpgradeSuccess) => S::Running,
        (S::Updating, E::UpgradeFailed(_)) => S::Failed,

        (_, E::Delete) => S::Deleting,

        (state, event) => {
            return Err(EngineError::InvalidTransition(format!(
                "{:?} -> {:?}",
                state, event
            )));
        }
    };

    Ok(next)
}

/// Lifecycle FSM for one application run
#[derive(Debug, Clone)]
pub struct ApplicationFsm {
    state: ApplicationStatus,
    error: Option<String>,
}

impl ApplicationFsm {
    /// Create a new FSM in the creating state
    pub fn new() -> Self {
        Self::from_status(ApplicationStatus::Creating)
    }

    /// Resume from a persisted status
    pub fn from_status(state: ApplicationStatus) -> Self {
        Self { state, error: None }
    }

    pub fn state(&self) -> &ApplicationStatus {
        &self.state
    }

    /// Error message of the last failure, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: LifecycleEvent) -> Result<&ApplicationStatus, EngineError> {
        let next = next_status(&self.state, &event)?;

        match event {
            LifecycleEvent::DeployFailed(err) | LifecycleEvent::UpgradeFailed(err) => {
                self.error = Some(err);
            }
            LifecycleEvent::Retry | LifecycleEvent::Upgrade => {
                self.error = None;
            }
            _ => {}
        }

        self.state = next;
        Ok(&self.state)
    }
}

impl Default for ApplicationFsm {
    fn default() -> Self {
        Self::new()
    }
}
