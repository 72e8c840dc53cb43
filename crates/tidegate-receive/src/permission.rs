//! Authorization boundary consumed by the receive layer.
//!
//! The permission engine itself lives elsewhere; this module only names the
//! questions the receive path asks it.

use crate::error::PermissionError;
use crate::object::Ref;
use crate::project::{ProjectState, UserIdentity};
use crate::repository::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectPermission {
    Read,
    PushAtLeastOneRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefFilterOptions {
    /// Also hide metadata-only refs (review metadata, sequences, ...).
    pub filter_meta: bool,
}

pub trait PermissionBackend: Send + Sync {
    fn check(
        &self,
        user: &UserIdentity,
        project: &ProjectState,
        permission: ProjectPermission,
    ) -> Result<(), PermissionError>;

    /// Returns the subset of `refs` the user may see.
    fn filter_refs(
        &self,
        user: &UserIdentity,
        project: &ProjectState,
        repo: &dyn Repository,
        refs: Vec<Ref>,
        options: RefFilterOptions,
    ) -> Result<Vec<Ref>, PermissionError>;
}

/// Contributor agreement gate. `Denied` carries the message shown to the
/// user (which agreement is missing and where to sign it).
pub trait ContributorAgreements: Send + Sync {
    fn check(&self, project: &ProjectState, user: &UserIdentity) -> Result<(), PermissionError>;
}

/// Agreement checker for servers that do not require agreements.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAgreementsRequired;

impl ContributorAgreements for NoAgreementsRequired {
    fn check(&self, _project: &ProjectState, _user: &UserIdentity) -> Result<(), PermissionError> {
        Ok(())
    }
}
