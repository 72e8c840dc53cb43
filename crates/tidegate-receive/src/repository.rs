use crate::error::RepositoryError;
use crate::object::{ObjectId, Ref};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: ObjectId,
    pub parent_count: usize,
}

pub type HistoryWalk<'a> = Box<dyn Iterator<Item = Result<CommitInfo, RepositoryError>> + 'a>;

/// Request-scoped handle on the repository being pushed to.
pub trait Repository: Send + Sync {
    fn all_refs(&self) -> Result<Vec<Ref>, RepositoryError>;

    fn refs_by_prefix(&self, prefix: &str) -> Result<Vec<Ref>, RepositoryError> {
        Ok(self
            .all_refs()?
            .into_iter()
            .filter(|r| r.name.starts_with(prefix))
            .collect())
    }

    /// Walks commits reachable from `starts`, newest first.
    fn walk_history(&self, starts: &[ObjectId]) -> Result<HistoryWalk<'_>, RepositoryError>;
}
