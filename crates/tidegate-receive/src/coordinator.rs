//! Per-push coordination between the protocol session and the commit
//! worker.
//!
//! A [`PushCoordinator`] lives for one receive-pack session. It answers the
//! protocol layer's questions (which refs to advertise, may this user push)
//! and runs the commit processor on the shared [`ReceiveExecutor`] with a
//! deadline, streaming progress to the client meanwhile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Span};

use crate::advertise::{
    open_change_haves, permission_filter, push_negotiation_haves, AdvertiseChain, Advertisement,
    AllRefsWatcher, NoOpenChanges, OpenChangeQuery,
};
use crate::capability::{CapabilityChecker, PermissionDecision};
use crate::command::{reject_unattempted, CommandResult, CommandSet, ReceiveCommand};
use crate::config::ReceiveConfig;
use crate::error::{PermissionError, ReceiveError, ReceiveResult};
use crate::executor::{ReceiveExecutor, RequestScope};
use crate::metrics::ReceiveMetrics;
use crate::object::ref_names;
use crate::permission::{
    ContributorAgreements, NoAgreementsRequired, PermissionBackend, ProjectPermission,
};
use crate::progress::{
    MessageChannel, MessageSender, ProgressMonitor, ProgressWriter, ProtocolSession,
    SessionMessageSender, WaitError,
};
use crate::project::{ProjectState, UserIdentity};
use crate::repository::Repository;
use crate::result::ResultChangeIds;

pub const PROGRESS_TITLE: &str = "Processing changes";
pub const CLIENT_ERROR: &str = "internal error while processing changes";
pub const COMMAND_ERROR: &str = "internal error";
pub const MAGIC_REFS_EXIST: &str = "One or more refs/for/ names blocks change upload";

/// Creates and updates changes for the commands of one push.
///
/// Runs on a pool thread. It may outlive the push if the deadline passes:
/// results it writes after that are refused and its output is dropped.
pub trait CommitProcessor: Send + Sync {
    fn process_commands(&self, ctx: &PushContext) -> anyhow::Result<()>;
}

/// Notified after the refs have been updated.
pub trait PostReceiveHook: Send + Sync {
    fn on_post_receive(
        &self,
        project: &ProjectState,
        user: &UserIdentity,
        commands: &[&ReceiveCommand],
    );
}

/// Process-wide collaborators shared by every push.
#[derive(Clone)]
pub struct ReceiveServices {
    pub config: ReceiveConfig,
    pub executor: Arc<ReceiveExecutor>,
    pub metrics: ReceiveMetrics,
    pub processor: Arc<dyn CommitProcessor>,
    pub permissions: Arc<dyn PermissionBackend>,
    pub agreements: Arc<dyn ContributorAgreements>,
    pub open_changes: Arc<dyn OpenChangeQuery>,
    pub post_receive_hooks: Vec<Arc<dyn PostReceiveHook>>,
}

impl ReceiveServices {
    pub fn new(
        config: ReceiveConfig,
        executor: Arc<ReceiveExecutor>,
        metrics: ReceiveMetrics,
        processor: Arc<dyn CommitProcessor>,
        permissions: Arc<dyn PermissionBackend>,
    ) -> Self {
        Self {
            config,
            executor,
            metrics,
            processor,
            permissions,
            agreements: Arc::new(NoAgreementsRequired),
            open_changes: Arc::new(NoOpenChanges),
            post_receive_hooks: Vec::new(),
        }
    }

    pub fn with_agreements(mut self, agreements: Arc<dyn ContributorAgreements>) -> Self {
        self.agreements = agreements;
        self
    }

    pub fn with_open_changes(mut self, open_changes: Arc<dyn OpenChangeQuery>) -> Self {
        self.open_changes = open_changes;
        self
    }

    pub fn with_post_receive_hook(mut self, hook: Arc<dyn PostReceiveHook>) -> Self {
        self.post_receive_hooks.push(hook);
        self
    }
}

/// Settings handed to the receive-pack protocol codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivePackSettings {
    pub allow_creates: bool,
    pub allow_deletes: bool,
    pub allow_non_fast_forwards: bool,
    pub allow_push_options: bool,
    pub ref_log_ident: String,
    pub transfer_timeout: Duration,
    pub max_object_size_limit: Option<u64>,
    pub check_received_objects: bool,
    pub check_referenced_objects_are_reachable: bool,
}

/// What the commit processor gets to see of the push.
pub struct PushContext {
    commands: CommandSet,
    progress: ProgressMonitor,
    results: Arc<ResultChangeIds>,
    scope: RequestScope,
    all_refs: AllRefsWatcher,
    repo: Arc<dyn Repository>,
    cancellation: CancellationToken,
}

impl PushContext {
    pub fn commands(&self) -> &[ReceiveCommand] {
        &self.commands
    }

    pub fn progress(&self) -> &ProgressMonitor {
        &self.progress
    }

    pub fn writer(&self) -> ProgressWriter {
        self.progress.writer()
    }

    pub fn results(&self) -> &ResultChangeIds {
        &self.results
    }

    /// Queues a message for the client, sent once processing ends.
    pub fn add_message(&self, message: impl Into<String>) {
        self.progress.channel().queue_message(message);
    }

    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    pub fn project(&self) -> &ProjectState {
        self.scope.project()
    }

    pub fn user(&self) -> &UserIdentity {
        self.scope.user()
    }

    pub fn all_refs(&self) -> &AllRefsWatcher {
        &self.all_refs
    }

    pub fn repo(&self) -> &dyn Repository {
        self.repo.as_ref()
    }

    /// Set once the coordinator stopped waiting for this push.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

pub struct PushCoordinator {
    services: ReceiveServices,
    project: ProjectState,
    user: UserIdentity,
    repo: Arc<dyn Repository>,
    session: Arc<dyn ProtocolSession>,
    message_sender: Arc<dyn MessageSender>,
    settings: ReceivePackSettings,
    capability: CapabilityChecker,
    chain: AdvertiseChain,
    all_refs: AllRefsWatcher,
    results: Mutex<Arc<ResultChangeIds>>,
    span: Span,
}

impl PushCoordinator {
    pub fn new(
        services: ReceiveServices,
        project: ProjectState,
        user: UserIdentity,
        repo: Arc<dyn Repository>,
        session: Arc<dyn ProtocolSession>,
        message_sender: Option<Arc<dyn MessageSender>>,
    ) -> ReceiveResult<Self> {
        let span = info_span!("receive", project = %project.name, user = %user);
        let can_read = can_read_project(services.permissions.as_ref(), &project, &user)?;
        let config = &services.config;
        let settings = ReceivePackSettings {
            allow_creates: true,
            allow_deletes: true,
            allow_non_fast_forwards: true,
            allow_push_options: true,
            ref_log_ident: user.ref_log_ident(),
            transfer_timeout: config.transfer_timeout,
            max_object_size_limit: project.max_object_size_limit,
            check_received_objects: project.check_received_objects,
            check_referenced_objects_are_reachable: !can_read
                && config.check_referenced_objects_are_reachable,
        };

        let all_refs = AllRefsWatcher::new();
        let chain = AdvertiseChain::new()
            .with(all_refs.observer())
            .with(permission_filter(
                Arc::clone(&services.permissions),
                user.clone(),
                project.clone(),
                Arc::clone(&repo),
            ))
            .with(open_change_haves(
                Arc::clone(&services.open_changes),
                user.clone(),
                project.clone(),
            ))
            .with(push_negotiation_haves(Arc::clone(&repo)));

        let capability =
            CapabilityChecker::new(Arc::clone(&services.permissions), project.clone(), user.clone());
        let message_sender: Arc<dyn MessageSender> = match message_sender {
            Some(sender) => sender,
            None => Arc::new(SessionMessageSender::new(Arc::clone(&session))),
        };

        Ok(Self {
            services,
            project,
            user,
            repo,
            session,
            message_sender,
            settings,
            capability,
            chain,
            all_refs,
            results: Mutex::new(Arc::new(ResultChangeIds::new())),
            span,
        })
    }

    pub fn advertise_refs(&self) -> ReceiveResult<Advertisement> {
        let _entered = self.span.enter();
        let refs = self.repo.all_refs()?;
        let advertisement = self.chain.advertise(Advertisement::from_refs(refs))?;
        debug!(
            refs = advertisement.len(),
            haves = advertisement.haves().len(),
            "advertising refs"
        );
        Ok(advertisement)
    }

    /// Decides whether the session may upload at all.
    pub fn can_upload(&self) -> ReceiveResult<PermissionDecision> {
        let _entered = self.span.enter();
        let decision = self.capability.check()?;
        if !decision.is_authorized() {
            return Ok(decision);
        }

        match self.services.agreements.check(&self.project, &self.user) {
            Ok(()) => {}
            Err(PermissionError::Denied(reason)) => {
                return Ok(PermissionDecision::Denied { reason })
            }
            Err(PermissionError::Backend(msg)) => return Err(ReceiveError::Permission(msg)),
        }

        if self.services.config.check_magic_refs {
            match self.repo.refs_by_prefix(ref_names::NEW_CHANGE) {
                Ok(refs) if !refs.is_empty() => {
                    warn!(
                        count = refs.len(),
                        "project contains refs under {}", ref_names::NEW_CHANGE
                    );
                    return Ok(PermissionDecision::Denied {
                        reason: MAGIC_REFS_EXIST.to_string(),
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "cannot scan refs under {}", ref_names::NEW_CHANGE);
                    return Ok(PermissionDecision::Denied {
                        reason: format!("Server process cannot read '{}'", self.project.name),
                    });
                }
            }
        }

        Ok(PermissionDecision::Authorized)
    }

    /// Processes the pushed commands. Every command carries a result when
    /// this returns.
    pub fn on_pre_receive(&self, commands: &CommandSet) {
        let _entered = self.span.enter();
        if commands.is_empty() {
            return;
        }
        if commands.iter().any(|c| c.result().is_terminal()) {
            debug!("commands already processed by an earlier hook");
            return;
        }

        match self.capability.check() {
            Ok(PermissionDecision::Authorized) => {}
            Ok(PermissionDecision::Denied { reason }) => {
                let rejected = reject_unattempted(commands, &reason);
                debug!(rejected, "push rejected before processing");
                return;
            }
            Err(err) => {
                warn!(error = %err, "cannot decide push capability");
                self.session.send_error(CLIENT_ERROR);
                reject_unattempted(commands, COMMAND_ERROR);
                return;
            }
        }

        let results = Arc::new(ResultChangeIds::new());
        *self.results.lock() = Arc::clone(&results);

        let channel = MessageChannel::new(Arc::clone(&self.message_sender));
        let progress = ProgressMonitor::new(
            channel,
            PROGRESS_TITLE,
            self.services.config.progress_interval,
        );
        let cancellation = CancellationToken::new();
        let scope = RequestScope::new(self.project.clone(), self.user.clone(), self.span.clone());
        let ctx = PushContext {
            commands: Arc::clone(commands),
            progress: progress.clone(),
            results: Arc::clone(&results),
            scope: scope.clone(),
            all_refs: self.all_refs.clone(),
            repo: Arc::clone(&self.repo),
            cancellation: cancellation.clone(),
        };
        let processor = Arc::clone(&self.services.processor);

        let started = Instant::now();
        let outcome = self
            .services
            .executor
            .submit(scope.wrap(move || {
                processor
                    .process_commands(&ctx)
                    .map_err(|err| format!("{err:#}"))
            }))
            .map_err(|err| WaitError::Failed(err.to_string()))
            .and_then(|handle| {
                progress.wait_for(handle.completion(), self.services.config.deadline())
            });

        if let Err(err) = outcome {
            self.services.metrics.record_timeout();
            warn!(
                stage = %progress.stage(),
                error = %err,
                "error in receive commits while processing changes"
            );
            self.session.send_error(CLIENT_ERROR);
            reject_unattempted(commands, COMMAND_ERROR);
            cancellation.cancel();
        } else {
            let leftover = reject_unattempted(commands, COMMAND_ERROR);
            if leftover > 0 {
                warn!(leftover, "commit processor left commands without a result");
            }
        }
        progress.finish();

        self.services.metrics.record_push(&results, started.elapsed());
    }

    /// Hands the successfully applied commands to the post-receive hooks.
    pub fn on_post_receive(&self, commands: &[ReceiveCommand]) {
        let _entered = self.span.enter();
        let applied: Vec<&ReceiveCommand> = commands
            .iter()
            .filter(|c| c.result() == CommandResult::Ok)
            .collect();
        if applied.is_empty() {
            return;
        }
        for hook in &self.services.post_receive_hooks {
            hook.on_post_receive(&self.project, &self.user, &applied);
        }
    }

    /// Change ids of the most recently processed push.
    pub fn result_change_ids(&self) -> Arc<ResultChangeIds> {
        self.results.lock().clone()
    }

    pub fn settings(&self) -> &ReceivePackSettings {
        &self.settings
    }

    pub fn all_refs(&self) -> &AllRefsWatcher {
        &self.all_refs
    }

    pub fn project(&self) -> &ProjectState {
        &self.project
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }
}

fn can_read_project(
    permissions: &dyn PermissionBackend,
    project: &ProjectState,
    user: &UserIdentity,
) -> ReceiveResult<bool> {
    if let Err(err) = project.check_state_permits_read() {
        debug!(project = %project.name, error = %err, "project state hides contents");
        return Ok(false);
    }
    match permissions.check(user, project, ProjectPermission::Read) {
        Ok(()) => Ok(true),
        Err(PermissionError::Denied(_)) => Ok(false),
        Err(PermissionError::Backend(msg)) => Err(ReceiveError::Permission(msg)),
    }
}
