use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PermissionError, ReceiveError, ReceiveResult};
use crate::permission::{PermissionBackend, ProjectPermission};
use crate::project::{ProjectState, UserIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Authorized,
    Denied { reason: String },
}

impl PermissionDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, PermissionDecision::Authorized)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityState {
    Unchecked,
    Authorized,
    Denied(String),
}

/// Decides once per push session whether the user may push at all.
pub struct CapabilityChecker {
    permissions: Arc<dyn PermissionBackend>,
    project: ProjectState,
    user: UserIdentity,
    state: Mutex<CapabilityState>,
}

impl CapabilityChecker {
    pub fn new(
        permissions: Arc<dyn PermissionBackend>,
        project: ProjectState,
        user: UserIdentity,
    ) -> Self {
        Self {
            permissions,
            project,
            user,
            state: Mutex::new(CapabilityState::Unchecked),
        }
    }

    /// Returns the cached decision, asking the backend on first use.
    /// Backend failures are not cached.
    pub fn check(&self) -> ReceiveResult<PermissionDecision> {
        let mut state = self.state.lock();
        match &*state {
            CapabilityState::Authorized => return Ok(PermissionDecision::Authorized),
            CapabilityState::Denied(reason) => {
                return Ok(PermissionDecision::Denied {
                    reason: reason.clone(),
                })
            }
            CapabilityState::Unchecked => {}
        }

        let decision = match self.permissions.check(
            &self.user,
            &self.project,
            ProjectPermission::PushAtLeastOneRef,
        ) {
            Ok(()) => PermissionDecision::Authorized,
            Err(PermissionError::Denied(detail)) => {
                debug!(
                    project = %self.project.name,
                    user = %self.user,
                    detail = %detail,
                    "push capability denied"
                );
                PermissionDecision::Denied {
                    reason: format!("push denied for project '{}'", self.project.name),
                }
            }
            Err(PermissionError::Backend(msg)) => return Err(ReceiveError::Permission(msg)),
        };

        *state = match &decision {
            PermissionDecision::Authorized => CapabilityState::Authorized,
            PermissionDecision::Denied { reason } => CapabilityState::Denied(reason.clone()),
        };
        Ok(decision)
    }

    pub fn state(&self) -> CapabilityState {
        self.state.lock().clone()
    }
}
