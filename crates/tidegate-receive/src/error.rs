use thiserror::Error;

/// Outcome of a permission or agreement check that did not grant access.
///
/// `Denied` is an ordinary answer ("you may not"); `Backend` means the
/// answer could not be determined and must not be shown as a denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("{0}")]
    Denied(String),
    #[error("permission backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("cannot read refs: {0}")]
    RefDatabase(String),
    #[error("missing object {0}")]
    MissingObject(String),
    #[error("history walk failed: {0}")]
    Walk(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("unknown time unit '{unit}' in '{value}'")]
    UnknownUnit { value: String, unit: String },
    #[error("invalid boolean '{0}'")]
    InvalidBool(String),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("permission backend failure: {0}")]
    Permission(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("receive executor unavailable: {0}")]
    Executor(String),
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type ReceiveResult<T> = Result<T, ReceiveError>;
