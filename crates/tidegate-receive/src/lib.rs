//! Tidegate receive: the push-acceptance layer of the Tidegate review server.
//!
//! Responsibilities:
//! - deciding whether a pushing user may upload to a project
//! - advertising a permission-filtered view of the project's refs
//! - running commit processing on a bounded pool under a deadline
//! - streaming progress to the client and recording push metrics

pub mod advertise;
pub mod capability;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod object;
pub mod permission;
pub mod progress;
pub mod project;
pub mod repository;
pub mod result;
pub mod telemetry;

pub use advertise::{AdvertiseChain, Advertisement, AllRefsWatcher, OpenChangeQuery};
pub use capability::{CapabilityChecker, CapabilityState, PermissionDecision};
pub use command::{command_set, CommandResult, CommandSet, CommandType, ReceiveCommand};
pub use config::ReceiveConfig;
pub use coordinator::{
    CommitProcessor, PostReceiveHook, PushContext, PushCoordinator, ReceivePackSettings,
    ReceiveServices,
};
pub use error::{ReceiveError, ReceiveResult};
pub use executor::{ReceiveExecutor, RequestScope};
pub use metrics::ReceiveMetrics;
pub use object::{ObjectId, Ref};
pub use permission::{ContributorAgreements, PermissionBackend};
pub use progress::{MessageSender, ProgressMonitor, ProtocolSession};
pub use project::{ProjectState, ProjectStatus, UserIdentity};
pub use result::{ChangeId, ResultChangeIds, ResultKey};
pub use telemetry::Telemetry;
