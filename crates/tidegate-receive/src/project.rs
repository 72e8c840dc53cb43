use std::fmt;

use crate::error::PermissionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Active,
    ReadOnly,
    Hidden,
}

/// Snapshot of the project configuration relevant to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectState {
    pub name: String,
    pub status: ProjectStatus,
    pub max_object_size_limit: Option<u64>,
    pub check_received_objects: bool,
}

impl ProjectState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProjectStatus::Active,
            max_object_size_limit: None,
            check_received_objects: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check_state_permits_read(&self) -> Result<(), PermissionError> {
        match self.status {
            ProjectStatus::Hidden => Err(PermissionError::Denied(format!(
                "project state does not permit read: {}",
                self.name
            ))),
            ProjectStatus::Active | ProjectStatus::ReadOnly => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub account_id: u32,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn new(account_id: u32) -> Self {
        Self {
            account_id,
            username: None,
            full_name: None,
            email: None,
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Identity written into reflog entries for this push.
    pub fn ref_log_ident(&self) -> String {
        let name = self
            .full_name
            .clone()
            .or_else(|| self.username.clone())
            .unwrap_or_else(|| format!("account-{}", self.account_id));
        let email = self
            .email
            .clone()
            .unwrap_or_else(|| format!("{}@unknown", self.account_id));
        format!("{name} <{email}>")
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.username {
            Some(username) => write!(f, "{username} ({})", self.account_id),
            None => write!(f, "account {}", self.account_id),
        }
    }
}
